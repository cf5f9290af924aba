//! The Transparent Mode (TM) entity.
//!
//! TM adds no header, no segmentation and no reordering: SDUs pass through
//! one-to-one, whole or not at all. It exists for channels (BCCH/PCCH) whose
//! payloads must hit the air unmodified.

use crate::entity::{PduKind, RlcEntity};
use crate::sdu::TxQueue;
use crate::Error;
use alloc::vec::Vec;

/// A transparent-mode entity.
pub struct TmEntity {
    queue: TxQueue,
}

impl TmEntity {
    /// Creates an empty TM entity.
    pub fn new() -> Self {
        TmEntity {
            queue: TxQueue::new(),
        }
    }
}

impl Default for TmEntity {
    fn default() -> Self {
        Self::new()
    }
}

impl RlcEntity for TmEntity {
    fn tx_enqueue(&mut self, sdu: Vec<u8>) -> Result<(), Error> {
        self.queue.enqueue(sdu)
    }

    /// Size of the head SDU: TM transmits it whole or not at all.
    fn tx_pending_size(&self) -> usize {
        self.queue.head_size().unwrap_or(0)
    }

    fn tx_build_pdu(&mut self, out: &mut [u8]) -> Result<Option<(usize, PduKind)>, Error> {
        if out.is_empty() {
            return Err(Error::InvalidValue);
        }
        let size = match self.queue.head_size() {
            Some(size) => size,
            None => return Ok(None),
        };
        if size > out.len() {
            // no segmentation in TM
            return Ok(None);
        }
        let sdu = self.queue.pop_front().unwrap();
        out[..size].copy_from_slice(&sdu);
        Ok(Some((size, PduKind::Fresh)))
    }

    /// TM has no receive-side processing; the PDU is the SDU.
    fn rx_process_pdu(&mut self, _pdu: Vec<u8>) -> Result<(), Error> {
        Ok(())
    }

    fn reestablish(&mut self) {
        info!("TM re-establishment: flushing {} SDUs", self.queue.len());
        self.queue.clear();
    }

    fn advance_time(&mut self, _ticks: u32) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec;

    #[test]
    fn passthrough() {
        let mut tm = TmEntity::new();
        tm.tx_enqueue(vec![1, 2, 3]).unwrap();
        tm.tx_enqueue(vec![4; 100]).unwrap();
        assert_eq!(tm.tx_pending_size(), 3);

        let mut buf = [0u8; 64];
        let (n, kind) = tm.tx_build_pdu(&mut buf).unwrap().unwrap();
        assert_eq!((n, kind), (3, PduKind::Fresh));
        assert_eq!(&buf[..3], &[1, 2, 3]);

        // 100-byte SDU does not fit in 64 bytes and TM cannot segment
        assert_eq!(tm.tx_build_pdu(&mut buf).unwrap(), None);
        let mut big = [0u8; 128];
        let (n, _) = tm.tx_build_pdu(&mut big).unwrap().unwrap();
        assert_eq!(n, 100);
        assert_eq!(tm.tx_build_pdu(&mut big).unwrap(), None);
    }

    #[test]
    fn rejects_empty() {
        let mut tm = TmEntity::new();
        assert_eq!(tm.tx_enqueue(Vec::new()), Err(Error::InvalidValue));
        tm.tx_enqueue(vec![1]).unwrap();
        assert_eq!(tm.tx_build_pdu(&mut []), Err(Error::InvalidValue));
    }

    #[test]
    fn reestablish_flushes() {
        let mut tm = TmEntity::new();
        tm.tx_enqueue(vec![1, 2]).unwrap();
        tm.reestablish();
        assert_eq!(tm.tx_pending_size(), 0);
    }
}
