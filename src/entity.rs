//! The surface shared by all three entity kinds.
//!
//! A host (typically the MAC scheduler on one side and PDCP on the other)
//! talks to every RLC entity the same way: SDUs go in with [`tx_enqueue`],
//! PDUs come out with [`tx_build_pdu`] against a byte budget, received PDUs
//! go back in with [`rx_process_pdu`], and time only moves when the host
//! pushes it with [`advance_time`]. The [`Entity`] enum packages the three
//! modes behind one type for hosts that configure bearers at runtime.
//!
//! [`tx_enqueue`]: trait.RlcEntity.html#tymethod.tx_enqueue
//! [`tx_build_pdu`]: trait.RlcEntity.html#tymethod.tx_build_pdu
//! [`rx_process_pdu`]: trait.RlcEntity.html#tymethod.rx_process_pdu
//! [`advance_time`]: trait.RlcEntity.html#tymethod.advance_time
//! [`Entity`]: enum.Entity.html

use crate::am::AmEntity;
use crate::sdu::Sdu;
use crate::tm::TmEntity;
use crate::um::UmEntity;
use crate::Error;
use alloc::boxed::Box;
use alloc::vec::Vec;

/// Callback handing a reassembled SDU to the upper layer.
///
/// Runs synchronously from within `rx_process_pdu`, `advance_time` or
/// `reestablish`; it must not call back into the same entity.
pub type DeliverFn = Box<dyn FnMut(Sdu)>;

/// What the upper layer wants done when a PDU reaches `maxRetxThreshold`.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum MaxRetxAction {
    /// Keep retransmitting.
    Continue,
    /// Abort the current build; the caller usually tears the bearer down.
    Abort,
}

/// Callback run with `(sn, retx_count)` when a PDU reaches
/// `maxRetxThreshold`.
pub type MaxRetxFn = Box<dyn FnMut(u16, u32) -> MaxRetxAction>;

/// What kind of PDU a call to `tx_build_pdu` produced.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum PduKind {
    /// An AM STATUS (control) PDU.
    Status,
    /// A retransmitted PDU or PDU segment.
    Retx,
    /// A PDU carrying fresh data.
    Fresh,
}

/// Operations common to TM, UM and AM entities.
pub trait RlcEntity {
    /// Hands an upper-layer SDU to the entity for transmission.
    ///
    /// The entity owns the buffer from here on; it is dropped once every
    /// byte went out (TM/UM) or was acknowledged (AM).
    fn tx_enqueue(&mut self, sdu: Vec<u8>) -> Result<(), Error>;

    /// Bytes the entity would like to transmit, including headers.
    ///
    /// A MAC scheduler uses this to size its grants; 0 means the entity
    /// has nothing to send.
    fn tx_pending_size(&self) -> usize;

    /// Builds at most one PDU of at most `out.len()` bytes into `out`.
    ///
    /// Returns the PDU's size and kind, or `None` when there is nothing to
    /// send (or nothing that fits the budget).
    fn tx_build_pdu(&mut self, out: &mut [u8]) -> Result<Option<(usize, PduKind)>, Error>;

    /// Processes one PDU received from the lower layer.
    ///
    /// Reassembled SDUs are handed to the deliver callback before this
    /// returns. The entity takes the buffer; for AM and UM it stays alive
    /// as long as reassembled SDUs still reference it.
    fn rx_process_pdu(&mut self, pdu: Vec<u8>) -> Result<(), Error>;

    /// RRC re-establishment: salvage what the receive window allows,
    /// discard everything else, reset all state and stop all timers.
    fn reestablish(&mut self);

    /// Advances the entity's notion of time by `ticks` units, firing any
    /// timers that expire along the way.
    fn advance_time(&mut self, ticks: u32);
}

/// An RLC entity of any mode.
pub enum Entity {
    Tm(TmEntity),
    Um(UmEntity),
    Am(Box<AmEntity>),
}

impl Entity {
    /// Installs the callback receiving reassembled SDUs (TM delivers
    /// nothing and ignores it).
    pub fn set_deliver_fn(&mut self, f: DeliverFn) {
        match self {
            Entity::Tm(_) => {}
            Entity::Um(um) => um.set_deliver_fn(f),
            Entity::Am(am) => am.set_deliver_fn(f),
        }
    }
}

impl RlcEntity for Entity {
    fn tx_enqueue(&mut self, sdu: Vec<u8>) -> Result<(), Error> {
        match self {
            Entity::Tm(tm) => tm.tx_enqueue(sdu),
            Entity::Um(um) => um.tx_enqueue(sdu),
            Entity::Am(am) => am.tx_enqueue(sdu),
        }
    }

    fn tx_pending_size(&self) -> usize {
        match self {
            Entity::Tm(tm) => tm.tx_pending_size(),
            Entity::Um(um) => um.tx_pending_size(),
            Entity::Am(am) => am.tx_pending_size(),
        }
    }

    fn tx_build_pdu(&mut self, out: &mut [u8]) -> Result<Option<(usize, PduKind)>, Error> {
        match self {
            Entity::Tm(tm) => tm.tx_build_pdu(out),
            Entity::Um(um) => um.tx_build_pdu(out),
            Entity::Am(am) => am.tx_build_pdu(out),
        }
    }

    fn rx_process_pdu(&mut self, pdu: Vec<u8>) -> Result<(), Error> {
        match self {
            Entity::Tm(tm) => tm.rx_process_pdu(pdu),
            Entity::Um(um) => um.rx_process_pdu(pdu),
            Entity::Am(am) => am.rx_process_pdu(pdu),
        }
    }

    fn reestablish(&mut self) {
        match self {
            Entity::Tm(tm) => tm.reestablish(),
            Entity::Um(um) => um.reestablish(),
            Entity::Am(am) => am.reestablish(),
        }
    }

    fn advance_time(&mut self, ticks: u32) {
        match self {
            Entity::Tm(tm) => tm.advance_time(ticks),
            Entity::Um(um) => um.advance_time(ticks),
            Entity::Am(am) => am.advance_time(ticks),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::am::AmConfig;
    use crate::um::UmConfig;
    use alloc::vec;

    #[test]
    fn enum_dispatch() {
        let mut entities = vec![
            Entity::Tm(TmEntity::new()),
            Entity::Um(UmEntity::new(UmConfig {
                sn_bits: 10,
                window_size: 512,
                t_reordering: 35,
            })),
            Entity::Am(Box::new(AmEntity::new(AmConfig {
                t_reordering: 35,
                t_status_pdu: 60,
                t_status_prohibit: 8,
                t_poll_retransmit: 45,
                max_retx_threshold: 4,
                poll_pdu: 16,
                poll_byte: 65536,
            }))),
        ];

        for entity in &mut entities {
            entity.tx_enqueue(vec![1, 2, 3, 4]).unwrap();
            assert!(entity.tx_pending_size() >= 4);
            let mut buf = [0u8; 32];
            let (n, kind) = entity.tx_build_pdu(&mut buf).unwrap().unwrap();
            assert_eq!(kind, PduKind::Fresh);
            assert!(n >= 4);
            entity.reestablish();
            assert_eq!(entity.tx_pending_size(), 0);
            entity.advance_time(100);
        }
    }
}
