//! SDU containers and the segmentation/reassembly engines shared by all
//! entity kinds.
//!
//! On the transmit side, upper-layer SDUs queue up in a [`TxQueue`] and are
//! cut into length-indicator (LI) lists against a MAC byte budget: one PDU
//! carries the tail of a previously started SDU, any number of whole SDUs,
//! and optionally the head of the last one.
//!
//! On the receive side, a PDU's backing buffer is shared (`Rc<[u8]>`) and
//! every reassembled [`Sdu`] holds views into the buffers its bytes came
//! from, so a buffer is released exactly when the last SDU touching it is
//! dropped. The [`AssemblyQueue`] applies the framing-info rules that decide
//! whether the first LI of a PDU continues the SDU left unfinished by the
//! previous one.
//!
//! [`TxQueue`]: struct.TxQueue.html
//! [`Sdu`]: struct.Sdu.html
//! [`AssemblyQueue`]: struct.AssemblyQueue.html

use crate::pdu::{FramingInfo, LiList, LI_VALUE_MAX};
use crate::Error;
use alloc::collections::VecDeque;
use alloc::rc::Rc;
use alloc::vec::Vec;

/// Most segments a reassembled SDU can be scattered over.
pub const SDU_SEGMENT_MAX: usize = 32;

/// A contiguous byte range inside a shared receive buffer.
struct SduSegment {
    buf: Rc<[u8]>,
    start: usize,
    len: usize,
}

impl SduSegment {
    fn as_slice(&self) -> &[u8] {
        &self.buf[self.start..self.start + self.len]
    }
}

/// A reassembled upper-layer datagram.
///
/// The payload may be scattered over several receive buffers; use
/// [`slices`](#method.slices) to walk it without copying, or
/// [`to_vec`](#method.to_vec) to flatten it.
pub struct Sdu {
    segments: heapless::Vec<SduSegment, SDU_SEGMENT_MAX>,
    size: usize,
    intact: bool,
}

impl Sdu {
    fn new() -> Self {
        Sdu {
            segments: heapless::Vec::new(),
            size: 0,
            intact: false,
        }
    }

    /// Total payload length in bytes.
    pub fn len(&self) -> usize {
        self.size
    }

    /// Whether the SDU carries no bytes.
    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    pub(crate) fn is_intact(&self) -> bool {
        self.intact
    }

    /// Iterates over the payload as a sequence of byte slices.
    pub fn slices(&self) -> impl Iterator<Item = &[u8]> {
        self.segments.iter().map(SduSegment::as_slice)
    }

    /// Copies the payload into a single contiguous vector.
    pub fn to_vec(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.size);
        for slice in self.slices() {
            out.extend_from_slice(slice);
        }
        out
    }

    /// Appends a byte range of `buf`; fails when the segment limit is hit.
    fn push_segment(&mut self, buf: &Rc<[u8]>, start: usize, len: usize) -> bool {
        debug_assert!(start + len <= buf.len());
        let seg = SduSegment {
            buf: buf.clone(),
            start,
            len,
        };
        if self.segments.push(seg).is_err() {
            return false;
        }
        self.size += len;
        true
    }
}

/// A transmit-side SDU: one owned buffer plus a read cursor.
pub(crate) struct TxSdu {
    data: Vec<u8>,
    offset: usize,
}

impl TxSdu {
    fn remaining(&self) -> usize {
        self.data.len() - self.offset
    }
}

/// FIFO of SDUs awaiting transmission, with the LI construction engine.
pub(crate) struct TxQueue {
    queue: VecDeque<TxSdu>,
    /// Unsent bytes over all queued SDUs.
    total: usize,
}

impl TxQueue {
    pub fn new() -> Self {
        TxQueue {
            queue: VecDeque::new(),
            total: 0,
        }
    }

    pub fn enqueue(&mut self, data: Vec<u8>) -> Result<(), Error> {
        if data.is_empty() {
            return Err(Error::InvalidValue);
        }
        self.total += data.len();
        self.queue.push_back(TxSdu { data, offset: 0 });
        Ok(())
    }

    /// Number of queued SDUs.
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Unsent bytes over all queued SDUs.
    pub fn total_bytes(&self) -> usize {
        self.total
    }

    /// Read cursor of the head SDU; non-zero when its first bytes already
    /// left in an earlier PDU.
    pub fn head_offset(&self) -> Option<usize> {
        self.queue.front().map(|sdu| sdu.offset)
    }

    /// Size of the head SDU, if any.
    pub fn head_size(&self) -> Option<usize> {
        self.queue.front().map(|sdu| sdu.data.len())
    }

    /// Removes and returns the whole head SDU (TM only).
    pub fn pop_front(&mut self) -> Option<Vec<u8>> {
        let sdu = self.queue.pop_front()?;
        debug_assert_eq!(sdu.offset, 0);
        self.total -= sdu.data.len();
        Some(sdu.data)
    }

    pub fn clear(&mut self) {
        self.queue.clear();
        self.total = 0;
    }

    /// Builds the LI list for a PDU of at most `budget` bytes with a
    /// `header_len`-byte header.
    ///
    /// The first LI resumes the head SDU at its read cursor; subsequent LIs
    /// take whole SDUs while budget remains, where growing the list by one LI
    /// costs 2 header bytes for an odd entry and 1 for an even one. The final
    /// LI is never encoded (its length is implied by the PDU size), so it is
    /// the only one allowed to exceed the 11-bit maximum; if an oversized
    /// value lands in the list, it terminates it.
    pub fn build_li(&self, budget: usize, header_len: usize) -> LiList {
        let mut lis = LiList::new();
        let mut remain = budget.saturating_sub(header_len);
        if remain == 0 {
            warn!("PDU budget {} leaves no room for data", budget);
            return lis;
        }

        for sdu in self.queue.iter() {
            if !lis.is_empty() {
                let cost = if lis.len() % 2 == 1 { 2 } else { 1 };
                if remain <= cost {
                    break;
                }
                remain -= cost;
            }
            let avail = sdu.remaining();
            debug_assert!(avail > 0);
            let take = avail.min(remain);
            if take > LI_VALUE_MAX as usize && !lis.is_empty() {
                break;
            }
            if lis.push(take as u16).is_err() {
                break;
            }
            remain -= take;
            if take > LI_VALUE_MAX as usize || take < avail || remain == 0 {
                break;
            }
            if lis.len() == lis.capacity() {
                break;
            }
        }
        lis
    }

    /// Copies the bytes described by `lis` into `out`, consuming queued SDUs.
    ///
    /// Returns the number of data bytes written.
    pub fn consume(&mut self, lis: &[u16], out: &mut [u8]) -> usize {
        let mut off = 0;
        for &li in lis {
            let li = li as usize;
            let sdu = self.queue.front_mut().expect("LI list longer than queue");
            out[off..off + li].copy_from_slice(&sdu.data[sdu.offset..sdu.offset + li]);
            sdu.offset += li;
            off += li;
            self.total -= li;
            if sdu.offset == sdu.data.len() {
                self.queue.pop_front();
            }
        }
        off
    }
}

/// In-progress SDUs on the receive side, oldest first.
///
/// Only the tail SDU may be incomplete; intact SDUs are handed to the
/// delivery callback in arrival order.
pub(crate) struct AssemblyQueue {
    queue: VecDeque<Sdu>,
}

impl AssemblyQueue {
    pub fn new() -> Self {
        AssemblyQueue {
            queue: VecDeque::new(),
        }
    }

    /// Feeds one PDU (or PDU segment) worth of data into the queue.
    ///
    /// `lis` describes how `buf[data_off..]` splits into SDU fragments. The
    /// framing info decides what happens at the boundaries: the first
    /// fragment extends the unfinished tail SDU iff the PDU says its data
    /// does not start an SDU, and the last fragment leaves the tail
    /// unfinished iff the data does not end one.
    pub fn feed(&mut self, fi: FramingInfo, lis: &[u16], buf: &Rc<[u8]>, data_off: usize) {
        let is_first = !fi.contains(FramingInfo::NOT_FIRST);
        let is_last = !fi.contains(FramingInfo::NOT_LAST);
        let mut li_idx = 0;
        let mut off = data_off;

        if is_first {
            // A stray unfinished SDU means its continuation was lost.
            if let Some(tail) = self.queue.back() {
                if !tail.intact {
                    warn!("dropping unfinished SDU: next PDU restarts framing");
                    self.queue.pop_back();
                }
            }
        } else {
            // First fragment continues the tail SDU.
            match self.queue.back_mut() {
                Some(tail) if !tail.intact => {
                    if tail.push_segment(buf, off, lis[0] as usize) {
                        tail.intact = true;
                    } else {
                        warn!("SDU exceeds {} segments, dropped", SDU_SEGMENT_MAX);
                        self.queue.pop_back();
                    }
                    off += lis[0] as usize;
                    li_idx = 1;
                }
                _ => {
                    // Continuation of an SDU whose head was never received.
                    warn!("orphan SDU continuation of {} bytes dropped", lis[0]);
                    off += lis[0] as usize;
                    li_idx = 1;
                }
            }
        }

        // Every remaining fragment starts a fresh SDU.
        while li_idx < lis.len() {
            let len = lis[li_idx] as usize;
            let mut sdu = Sdu::new();
            let ok = sdu.push_segment(buf, off, len);
            debug_assert!(ok);
            sdu.intact = true;
            self.queue.push_back(sdu);
            off += len;
            li_idx += 1;
        }

        if !is_last {
            if let Some(tail) = self.queue.back_mut() {
                tail.intact = false;
            }
        }
    }

    /// Hands every leading intact SDU to `deliver` (or drops it when no
    /// callback is installed).
    pub fn deliver(&mut self, deliver: &mut Option<crate::entity::DeliverFn>) {
        while self.queue.front().map_or(false, Sdu::is_intact) {
            let sdu = self.queue.pop_front().unwrap();
            debug!("delivering SDU of {} bytes", sdu.len());
            if let Some(f) = deliver.as_mut() {
                f(sdu);
            }
        }
    }

    /// Drops an unfinished SDU left at the tail (re-establishment).
    pub fn drop_partial_tail(&mut self) {
        if self.queue.back().map_or(false, |sdu| !sdu.intact) {
            self.queue.pop_back();
        }
    }

    pub fn clear(&mut self) {
        self.queue.clear();
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.queue.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec;

    fn queue_of(sizes: &[usize]) -> TxQueue {
        let mut q = TxQueue::new();
        for (i, &size) in sizes.iter().enumerate() {
            q.enqueue(vec![i as u8; size]).unwrap();
        }
        q
    }

    #[test]
    fn li_concatenates_whole_sdus() {
        let q = queue_of(&[100, 50, 200]);
        let lis = q.build_li(400, 2);
        assert_eq!(&lis[..], &[100, 50, 200]);
    }

    #[test]
    fn li_respects_budget() {
        let q = queue_of(&[100, 50, 200]);
        // 2 header + 100 + 50 + 2 LI bytes + partial tail
        let lis = q.build_li(200, 2);
        assert_eq!(&lis[..], &[100, 50, 45]);
    }

    #[test]
    fn li_cost_alternates() {
        let q = queue_of(&[10, 10, 10, 10]);
        // budget exactly covers 10+10 plus the 2-byte cost of the second LI
        let lis = q.build_li(24, 2);
        assert_eq!(&lis[..], &[10, 10]);
        // one byte less and the second LI no longer pays for itself
        let lis = q.build_li(23, 2);
        assert_eq!(&lis[..], &[10, 9]);
    }

    #[test]
    fn oversized_first_li_stays_implicit() {
        let q = queue_of(&[3000, 10]);
        let lis = q.build_li(5000, 2);
        assert_eq!(&lis[..], &[3000]);
    }

    #[test]
    fn consume_advances_and_pops() {
        let mut q = queue_of(&[100, 50, 200]);
        let mut out = [0u8; 195];
        let n = q.consume(&[100, 50, 45], &mut out);
        assert_eq!(n, 195);
        assert_eq!(q.len(), 1);
        assert_eq!(q.head_offset(), Some(45));
        assert_eq!(q.total_bytes(), 155);
        assert_eq!(out[0], 0);
        assert_eq!(out[100], 1);
        assert_eq!(out[150], 2);

        let lis = q.build_li(400, 2);
        assert_eq!(&lis[..], &[155]);
        let mut out = [0u8; 155];
        q.consume(&lis, &mut out);
        assert!(q.is_empty());
        assert_eq!(q.total_bytes(), 0);
    }

    fn rc(data: Vec<u8>) -> Rc<[u8]> {
        data.into()
    }

    fn drain(asm: &mut AssemblyQueue) -> Vec<Vec<u8>> {
        let collected: Rc<core::cell::RefCell<Vec<Vec<u8>>>> = Rc::default();
        let c2 = collected.clone();
        let mut cb: Option<crate::entity::DeliverFn> =
            Some(alloc::boxed::Box::new(move |sdu: Sdu| {
                c2.borrow_mut().push(sdu.to_vec());
            }));
        asm.deliver(&mut cb);
        let out = collected.borrow().clone();
        out
    }

    #[test]
    fn reassembly_across_pdus() {
        let mut asm = AssemblyQueue::new();

        // SDU [1; 8] split over two PDUs, then a whole SDU [2; 4].
        let a = rc(vec![1, 1, 1, 1, 1]);
        let b = rc(vec![1, 1, 1, 2, 2, 2, 2]);
        asm.feed(FramingInfo::NOT_LAST, &[5], &a, 0);
        asm.feed(FramingInfo::NOT_FIRST, &[3, 4], &b, 0);

        assert_eq!(drain(&mut asm), vec![vec![1; 8], vec![2; 4]]);
        assert_eq!(asm.len(), 0);
    }

    #[test]
    fn orphan_continuation_is_dropped() {
        let mut asm = AssemblyQueue::new();
        let buf = rc(vec![9, 9, 5, 5]);
        // Claims to continue an SDU, but nothing is in progress.
        asm.feed(FramingInfo::NOT_FIRST, &[2, 2], &buf, 0);
        assert_eq!(drain(&mut asm), vec![vec![5, 5]]);
    }

    #[test]
    fn restarted_framing_discards_unfinished_tail() {
        let mut asm = AssemblyQueue::new();
        let a = rc(vec![1, 1]);
        let b = rc(vec![2, 2]);
        asm.feed(FramingInfo::NOT_LAST, &[2], &a, 0); // unfinished SDU
        asm.feed(FramingInfo::empty(), &[2], &b, 0); // restart
        assert_eq!(drain(&mut asm), vec![vec![2, 2]]);
    }
}
