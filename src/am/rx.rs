//! Receive half of the AM entity.
//!
//! Every window slot accumulates the byte segments of one PDU, kept sorted
//! by start offset and strictly non-overlapping (an arrival that overlaps
//! anything already held is dropped whole). A slot is *intact* once its
//! segments tile the data field from offset 0 up to a segment flagged as
//! last.
//!
//! Reassembly consumes a slot's segments in order through a
//! `delivery_offset` cursor, so a partially received PDU can contribute its
//! leading segments early (during re-establishment and window advances) and
//! continue later without duplicating bytes.

use crate::entity::DeliverFn;
use crate::pdu::{parse_li, AmHeader, FramingInfo, LiList, SegmentInfo};
use crate::sdu::AssemblyQueue;
use crate::seq::SnSpace;
use crate::Error;
use alloc::rc::Rc;
use alloc::vec::Vec;

use super::status::{Nack, StatusPdu, HEADER_BITS, NACK_BITS, SO_BITS, SO_END};

/// One received byte segment of a PDU (a whole PDU is a single segment
/// covering its data field).
pub(crate) struct RxSegment {
    pub start: usize,
    pub end: usize,
    pub lsf: bool,
    pub fi: FramingInfo,
    pub lis: LiList,
    pub buf: Rc<[u8]>,
    pub data_off: usize,
}

/// Per-SN reception state.
pub(crate) struct RxPdu {
    /// Bytes already handed to reassembly.
    pub delivery_offset: usize,
    pub intact: bool,
    /// Sorted, non-overlapping.
    pub segs: Vec<RxSegment>,
}

impl RxPdu {
    /// Missing byte ranges, in order; an open tail is reported up to
    /// [`SO_END`].
    ///
    /// [`SO_END`]: ../status/constant.SO_END.html
    pub fn missing_ranges(&self, out: &mut Vec<(u16, u16)>) {
        let mut offset = 0;
        for seg in &self.segs {
            if seg.start != offset {
                out.push((offset as u16, seg.start as u16));
            }
            offset = seg.end;
        }
        if !self.segs.last().map_or(false, |seg| seg.lsf) {
            out.push((offset as u16, SO_END));
        }
    }
}

pub(crate) struct AmRx {
    space: SnSpace,
    window_size: u16,

    /// VR(R): oldest SN not yet fully reassembled.
    pub vr_r: u16,
    /// VR(X): VR(H) snapshot at t-Reordering start.
    pub vr_x: u16,
    /// VR(H): highest received SN plus one.
    pub vr_h: u16,
    /// VR(MS): highest SN usable as STATUS ACK_SN.
    pub vr_ms: u16,
    /// VR(MR): first SN past the receiving window.
    pub vr_mr: u16,

    slots: Vec<Option<RxPdu>>,
    pub assembly: AssemblyQueue,
    pub deliver: Option<DeliverFn>,
    pub n_good_pdu: u32,
    pub n_discard_pdu: u32,
}

impl AmRx {
    pub fn new() -> Self {
        let space = SnSpace::AM;
        let window_size = space.size() / 2;
        AmRx {
            space,
            window_size,
            vr_r: 0,
            vr_x: 0,
            vr_h: 0,
            vr_ms: 0,
            vr_mr: window_size,
            slots: (0..space.size()).map(|_| None).collect(),
            assembly: AssemblyQueue::new(),
            deliver: None,
            n_good_pdu: 0,
            n_discard_pdu: 0,
        }
    }

    pub fn in_window(&self, sn: u16) -> bool {
        self.space.contains(sn, self.vr_r, self.vr_mr)
    }

    #[cfg(test)]
    pub fn slot(&self, sn: u16) -> Option<&RxPdu> {
        self.slots[usize::from(sn)].as_ref()
    }

    /// Parses the PDU body and stores it in the window slot for its SN.
    ///
    /// Duplicate PDUs, overlapping segments and malformed LI lists are all
    /// rejected without touching the slot.
    pub fn place(&mut self, header: AmHeader, pdu: &Rc<[u8]>) -> Result<(), Error> {
        let sn = header.sn();
        let (so, lsf, head_len) = if header.is_resegment() {
            let info = SegmentInfo::parse(&pdu[AmHeader::SIZE..])?;
            (
                usize::from(info.so),
                info.lsf,
                AmHeader::SIZE + SegmentInfo::SIZE,
            )
        } else {
            (0, true, AmHeader::SIZE)
        };
        if pdu.len() <= head_len {
            return Err(Error::Eof);
        }
        let (lis, li_bytes) = parse_li(header.e(), &pdu[head_len..])?;
        let data_off = head_len + li_bytes;
        let seg = RxSegment {
            start: so,
            end: so + (pdu.len() - data_off),
            lsf,
            fi: header.fi(),
            lis,
            buf: pdu.clone(),
            data_off,
        };

        let slot = &mut self.slots[usize::from(sn)];
        match slot {
            None => {
                *slot = Some(RxPdu {
                    delivery_offset: 0,
                    intact: seg.start == 0 && seg.lsf,
                    segs: alloc::vec![seg],
                });
                Ok(())
            }
            Some(_) if !header.is_resegment() => {
                warn!("duplicate AM PDU: sn={}", sn);
                Err(Error::Duplicate)
            }
            Some(ctrl) => {
                if ctrl.intact {
                    warn!("segment for already complete PDU: sn={}", sn);
                    return Err(Error::Duplicate);
                }
                // Find the insertion point; any overlap drops the arrival.
                let mut insert_at = ctrl.segs.len();
                for (i, existing) in ctrl.segs.iter().enumerate() {
                    if existing.start <= seg.start && existing.end > seg.start {
                        warn!(
                            "overlapping segment: sn={} so=({}, {})",
                            sn, seg.start, seg.end
                        );
                        return Err(Error::Duplicate);
                    }
                    if existing.start > seg.start {
                        if existing.start < seg.end {
                            warn!(
                                "overlapping segment: sn={} so=({}, {})",
                                sn, seg.start, seg.end
                            );
                            return Err(Error::Duplicate);
                        }
                        insert_at = i;
                        break;
                    }
                }
                ctrl.segs.insert(insert_at, seg);

                // Intact once the segments tile up to a last-segment flag.
                let mut offset = 0;
                for existing in &ctrl.segs {
                    if existing.start != offset {
                        break;
                    }
                    offset = existing.end;
                    if existing.lsf {
                        ctrl.intact = true;
                        break;
                    }
                }
                Ok(())
            }
        }
    }

    fn feed_slot(assembly: &mut AssemblyQueue, ctrl: &mut RxPdu) {
        for seg in &ctrl.segs {
            if seg.start < ctrl.delivery_offset {
                continue;
            }
            if seg.start != ctrl.delivery_offset {
                break;
            }
            assembly.feed(seg.fi, &seg.lis, &seg.buf, seg.data_off);
            ctrl.delivery_offset += seg.end - seg.start;
        }
    }

    /// State-variable updates after a PDU landed in slot `sn`.
    pub fn on_placed(&mut self, sn: u16) {
        let space = self.space;

        if space.less_eq(self.vr_h, sn) {
            self.vr_h = space.next(sn);
        }

        if sn == self.vr_ms && self.slots[usize::from(sn)].as_ref().map_or(false, |c| c.intact) {
            let mut cur = sn;
            loop {
                cur = space.next(cur);
                match &self.slots[usize::from(cur)] {
                    Some(ctrl) if ctrl.intact => continue,
                    _ => break,
                }
            }
            self.vr_ms = cur;
        }

        if sn == self.vr_r {
            let mut cur = sn;
            loop {
                let mut ctrl = match self.slots[usize::from(cur)].take() {
                    Some(ctrl) => ctrl,
                    None => break,
                };
                Self::feed_slot(&mut self.assembly, &mut ctrl);
                if ctrl.intact {
                    cur = space.next(cur);
                } else {
                    // keep the partial PDU; it continues from its
                    // delivery offset when more segments arrive
                    self.slots[usize::from(cur)] = Some(ctrl);
                    break;
                }
            }
            self.vr_r = cur;
            self.vr_mr = space.add(cur, self.window_size);
        }
    }

    /// Delivers every leading intact SDU of the assembly queue.
    pub fn deliver_ready(&mut self) {
        self.assembly.deliver(&mut self.deliver);
    }

    /// t-Reordering ran out: give up waiting below VR(X).
    ///
    /// Returns whether VR(H) is still ahead (the caller restarts the timer).
    pub fn on_reordering_expired(&mut self) -> bool {
        let space = self.space;
        let mut sn = self.vr_x;
        while self.slots[usize::from(sn)].as_ref().map_or(false, |c| c.intact) {
            sn = space.next(sn);
        }
        self.vr_ms = sn;
        debug!(
            "t-Reordering expired: VR(MS)={} VR(H)={} VR(R)={}",
            self.vr_ms, self.vr_h, self.vr_r
        );
        space.less(self.vr_ms, self.vr_h)
    }

    /// Builds the STATUS report for the current window, biggest prefix that
    /// fits `budget` bytes.
    ///
    /// Walks `VR(R)..VR(MS)`, NACKing empty slots whole and partial slots
    /// range by range; when a slot's entries no longer fit, ACK_SN falls
    /// back to that slot's SN.
    pub fn collect_status(&self, budget: usize) -> StatusPdu {
        let space = self.space;
        let mut ack_sn = self.vr_ms;
        let mut nacks = Vec::new();
        let mut bits = HEADER_BITS;
        let mut ranges = Vec::new();

        let mut sn = self.vr_r;
        while sn != self.vr_ms {
            match &self.slots[usize::from(sn)] {
                None => {
                    if (bits + NACK_BITS + 7) / 8 <= budget {
                        bits += NACK_BITS;
                        nacks.push(Nack { sn, so: None });
                    } else {
                        ack_sn = sn;
                        break;
                    }
                }
                Some(ctrl) if !ctrl.intact => {
                    ranges.clear();
                    ctrl.missing_ranges(&mut ranges);
                    let need = ranges.len() * (NACK_BITS + SO_BITS);
                    if (bits + need + 7) / 8 <= budget {
                        bits += need;
                        for &(start, end) in &ranges {
                            nacks.push(Nack {
                                sn,
                                so: Some((start, end)),
                            });
                        }
                    } else {
                        ack_sn = sn;
                        break;
                    }
                }
                Some(_) => {}
            }
            sn = space.next(sn);
        }

        StatusPdu { ack_sn, nacks }
    }

    /// Byte size the STATUS report would need without a budget limit.
    pub fn status_size(&self) -> usize {
        let space = self.space;
        let mut bits = HEADER_BITS;
        let mut ranges = Vec::new();
        let mut sn = self.vr_r;
        while sn != self.vr_ms {
            match &self.slots[usize::from(sn)] {
                None => bits += NACK_BITS,
                Some(ctrl) if !ctrl.intact => {
                    ranges.clear();
                    ctrl.missing_ranges(&mut ranges);
                    bits += ranges.len() * (NACK_BITS + SO_BITS);
                }
                Some(_) => {}
            }
            sn = space.next(sn);
        }
        (bits + 7) / 8
    }

    /// Salvages everything still in the window (re-establishment).
    pub fn flush_all(&mut self) {
        let space = self.space;
        let mut sn = self.vr_r;
        for _ in 0..self.window_size {
            if let Some(mut ctrl) = self.slots[usize::from(sn)].take() {
                Self::feed_slot(&mut self.assembly, &mut ctrl);
            }
            sn = space.next(sn);
        }
        self.deliver_ready();
        self.assembly.drop_partial_tail();
        self.assembly.clear();
    }

    pub fn clear(&mut self) {
        for slot in self.slots.iter_mut() {
            *slot = None;
        }
        self.vr_r = 0;
        self.vr_x = 0;
        self.vr_h = 0;
        self.vr_ms = 0;
        self.vr_mr = self.window_size;
        self.n_good_pdu = 0;
        self.n_discard_pdu = 0;
    }
}
