//! Transmit half of the AM entity.
//!
//! Every fresh PDU is kept (as the exact bytes that went to the MAC) in the
//! SN-indexed transmit window until the peer acknowledges it. A STATUS PDU
//! from the peer either frees a window slot or turns it into pending
//! retransmission work: a ring of byte ranges of the original PDU, each of
//! which is re-emitted either as the original PDU verbatim or as a
//! resegmented PDU cut to whatever budget the MAC offers.
//!
//! Window slots and the retransmission queue both refer to PDU records
//! through pool handles, so a record can be a member of both without any
//! linked-list plumbing; the `queued` flag keeps the queue free of
//! duplicates.

use super::status::{StatusPdu, SO_END};
use super::AmTimer;
use crate::entity::{MaxRetxAction, MaxRetxFn};
use crate::pdu::{encode_li, li_len, AmHeader, FramingInfo, LiList, SegmentInfo};
use crate::pool::{Handle, Pool};
use crate::sdu::TxQueue;
use crate::seq::SnSpace;
use crate::wheel::TimerWheel;
use crate::Error;
use alloc::collections::VecDeque;
use alloc::vec;
use alloc::vec::Vec;

/// Most retransmission byte ranges a PDU can hold at once.
pub const RETX_SEG_MAX: usize = 32;

/// Fixed header size of a resegmented PDU.
const SEG_HEADER_SIZE: usize = AmHeader::SIZE + SegmentInfo::SIZE;

/// One pending retransmission range of a PDU's data field.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) struct RetxSeg {
    pub start: usize,
    pub end: usize,
    /// This range reaches the last byte of the PDU.
    pub lsf: bool,
}

/// A sent PDU awaiting acknowledgement.
pub(crate) struct TxPdu {
    /// The PDU exactly as first handed to the MAC.
    pub buf: Vec<u8>,
    /// Offset of the data field within `buf`.
    pub data_off: usize,
    pub fi: FramingInfo,
    pub sn: u16,
    pub lis: LiList,
    pub retx_count: u32,
    /// RETX_COUNT was already bumped for the current retransmission round.
    retx_counted: bool,
    /// Member of the retransmission queue.
    queued: bool,
    pub segs: heapless::Vec<RetxSeg, RETX_SEG_MAX>,
    /// Ring index of the next range to transmit.
    pub next_seg: usize,
}

impl TxPdu {
    fn data(&self) -> &[u8] {
        &self.buf[self.data_off..]
    }

    fn data_len(&self) -> usize {
        self.buf.len() - self.data_off
    }
}

pub(crate) struct AmTx {
    space: SnSpace,
    window_size: u16,

    /// VT(A): oldest SN awaiting acknowledgement.
    pub vt_a: u16,
    /// VT(S): SN for the next fresh PDU.
    pub vt_s: u16,
    /// VT(MS): first SN past the transmitting window.
    pub vt_ms: u16,
    /// SN of the latest PDU that carried a poll.
    pub poll_sn: u16,

    pdu_without_poll: u16,
    byte_without_poll: u32,
    poll_bit: bool,
    pub status_triggered: bool,

    max_retx_threshold: u16,
    poll_pdu: u16,
    poll_byte: u32,
    t_poll_retransmit: u32,

    pub queue: TxQueue,
    pool: Pool<TxPdu>,
    slots: Vec<Option<Handle>>,
    retx_q: VecDeque<Handle>,
    pub max_retx: Option<MaxRetxFn>,
}

impl AmTx {
    pub fn new(
        max_retx_threshold: u16,
        poll_pdu: u16,
        poll_byte: u32,
        t_poll_retransmit: u32,
    ) -> Self {
        let space = SnSpace::AM;
        let window_size = space.size() / 2;
        AmTx {
            space,
            window_size,
            vt_a: 0,
            vt_s: 0,
            vt_ms: window_size,
            poll_sn: 0,
            pdu_without_poll: 0,
            byte_without_poll: 0,
            poll_bit: false,
            status_triggered: false,
            max_retx_threshold,
            poll_pdu,
            poll_byte,
            t_poll_retransmit,
            queue: TxQueue::new(),
            pool: Pool::with_capacity(usize::from(window_size)),
            slots: (0..space.size()).map(|_| None).collect(),
            retx_q: VecDeque::new(),
            max_retx: None,
        }
    }

    /// Whether any PDU waits on the retransmission queue.
    pub fn has_retx(&self) -> bool {
        !self.retx_q.is_empty()
    }

    #[cfg(test)]
    pub fn retx_sns(&self) -> Vec<u16> {
        self.retx_q
            .iter()
            .filter_map(|&h| self.pool.get(h).map(|p| p.sn))
            .collect()
    }

    #[cfg(test)]
    pub fn slot(&self, sn: u16) -> Option<&TxPdu> {
        self.slots[usize::from(sn)].and_then(|h| self.pool.get(h))
    }

    /// On-air size of the next pending retransmission, 0 when none.
    pub fn retx_pdu_size(&self) -> usize {
        let handle = match self.retx_q.front() {
            Some(&h) => h,
            None => return 0,
        };
        let pdu = match self.pool.get(handle) {
            Some(p) => p,
            None => return 0,
        };
        let seg = match pdu.segs.get(pdu.next_seg) {
            Some(&s) => s,
            None => return 0,
        };
        if seg.start == 0 && seg.lsf {
            return pdu.buf.len();
        }

        // count the LIs overlapping [seg.start, seg.end)
        let mut n_li = 0;
        let mut off = 0;
        let mut i = 0;
        while i < pdu.lis.len() && off < seg.start {
            off += usize::from(pdu.lis[i]);
            i += 1;
        }
        if off > seg.start {
            n_li += 1;
        }
        while i < pdu.lis.len() && off < seg.end {
            off += usize::from(pdu.lis[i]);
            n_li += 1;
            i += 1;
        }
        SEG_HEADER_SIZE + li_len(n_li.max(1)) + (seg.end - seg.start)
    }

    /// Estimated on-air size of everything in the SDU queue, 0 when the
    /// window is stalled.
    pub fn fresh_pdu_size(&self) -> usize {
        if self.queue.total_bytes() == 0 {
            return 0;
        }
        if !self.space.contains(self.vt_s, self.vt_a, self.vt_ms) {
            return 0;
        }
        let size = self.queue.total_bytes() + AmHeader::SIZE + li_len(self.queue.len());
        size.min(0xFFF0)
    }

    fn update_poll(&mut self, is_retx: bool, data_size: usize) {
        if !is_retx {
            self.pdu_without_poll = self.pdu_without_poll.saturating_add(1);
            self.byte_without_poll = self.byte_without_poll.saturating_add(data_size as u32);
            if self.pdu_without_poll >= self.poll_pdu || self.byte_without_poll > self.poll_byte {
                self.poll_bit = true;
            }
        }
        if (self.queue.is_empty() && self.retx_q.is_empty()) || self.vt_s == self.vt_ms {
            self.poll_bit = true;
        }
    }

    /// Emits a pending poll onto the PDU being built, resetting the poll
    /// counters and (re)starting t-PollRetransmit.
    fn deliver_poll(&mut self, timers: &mut TimerWheel<AmTimer>) -> bool {
        if !self.poll_bit {
            return false;
        }
        self.poll_bit = false;
        self.pdu_without_poll = 0;
        self.byte_without_poll = 0;
        self.poll_sn = self.space.sub(self.vt_s, 1);
        timers.stop(AmTimer::PollRetransmit);
        timers.start(AmTimer::PollRetransmit, self.t_poll_retransmit);
        true
    }

    /// Bumps RETX_COUNT once per retransmission round and runs the
    /// max-retransmission callback at the threshold.
    fn bump_retx(&mut self, handle: Handle) -> Result<(), Error> {
        let (sn, count) = {
            let pdu = match self.pool.get_mut(handle) {
                Some(p) => p,
                None => return Ok(()),
            };
            if pdu.retx_counted {
                return Ok(());
            }
            pdu.retx_count += 1;
            pdu.retx_counted = true;
            (pdu.sn, pdu.retx_count)
        };
        if count >= u32::from(self.max_retx_threshold) {
            warn!(
                "sn={} RETX_COUNT={} reached maxRetxThreshold={}",
                sn, count, self.max_retx_threshold
            );
            if let Some(notify) = self.max_retx.as_mut() {
                if let MaxRetxAction::Abort = notify(sn, count) {
                    return Err(Error::MaxRetx);
                }
            }
        }
        Ok(())
    }

    /// Inserts `handle` into the retransmission queue, ascending by SN.
    fn insert_retx(&mut self, handle: Handle) {
        let sn = match self.pool.get(handle) {
            Some(p) => p.sn,
            None => return,
        };
        let pool = &self.pool;
        let space = self.space;
        let pos = self
            .retx_q
            .iter()
            .position(|&h| pool.get(h).map_or(true, |p| !space.less(p.sn, sn)))
            .unwrap_or_else(|| self.retx_q.len());
        self.retx_q.insert(pos, handle);
    }

    pub fn build_fresh(
        &mut self,
        out: &mut [u8],
        timers: &mut TimerWheel<AmTimer>,
    ) -> Result<Option<usize>, Error> {
        if out.len() <= AmHeader::SIZE {
            return Ok(None);
        }
        if self.queue.total_bytes() == 0 {
            return Ok(None);
        }
        if !self.space.contains(self.vt_s, self.vt_a, self.vt_ms) {
            debug!(
                "transmitting window stalled: VT(A)={} VT(S)={} VT(MS)={}",
                self.vt_a, self.vt_s, self.vt_ms
            );
            return Ok(None);
        }
        if self.pool.is_full() {
            error!("out of transmit PDU records");
            return Err(Error::Exhausted);
        }

        let mut fi = FramingInfo::empty();
        if self.queue.head_offset().unwrap_or(0) > 0 {
            fi |= FramingInfo::NOT_FIRST;
        }
        let lis = self.queue.build_li(out.len(), AmHeader::SIZE);
        if lis.is_empty() {
            warn!("AM PDU build produced no LIs (budget {})", out.len());
            return Ok(None);
        }
        let li_bytes = li_len(lis.len());
        let data_off = AmHeader::SIZE + li_bytes;
        let data_len: usize = lis.iter().map(|&li| usize::from(li)).sum();
        let pdu_len = data_off + data_len;

        let mut buf = vec![0u8; pdu_len];
        encode_li(&lis, &mut buf[AmHeader::SIZE..data_off]);
        let consumed = self.queue.consume(&lis, &mut buf[data_off..]);
        debug_assert_eq!(consumed, data_len);
        if self.queue.head_offset().unwrap_or(0) > 0 {
            fi |= FramingInfo::NOT_LAST;
        }

        let sn = self.vt_s;
        self.vt_s = self.space.next(self.vt_s);

        self.update_poll(false, data_len);
        let poll = self.deliver_poll(timers);

        let mut header = AmHeader::new_data();
        header.set_fi(fi);
        header.set_e(lis.len() > 1);
        header.set_sn(sn);
        header.set_poll(poll);
        header.encode(&mut buf[..AmHeader::SIZE]);

        out[..pdu_len].copy_from_slice(&buf);

        let record = TxPdu {
            buf,
            data_off,
            fi,
            sn,
            lis,
            retx_count: 0,
            retx_counted: false,
            queued: false,
            segs: heapless::Vec::new(),
            next_seg: 0,
        };
        let handle = self.pool.insert(record).map_err(|_| Error::Exhausted)?;
        self.slots[usize::from(sn)] = Some(handle);

        debug!(
            "fresh PDU: sn={} fi={:?} len={} poll={} VT(A)={} VT(S)={}",
            sn, fi, pdu_len, poll, self.vt_a, self.vt_s
        );
        Ok(Some(pdu_len))
    }

    pub fn build_retx(
        &mut self,
        out: &mut [u8],
        timers: &mut TimerWheel<AmTimer>,
    ) -> Result<Option<usize>, Error> {
        let handle = match self.retx_q.front() {
            Some(&h) => h,
            None => return Ok(None),
        };
        let snapshot = self.pool.get(handle).and_then(|pdu| {
            debug_assert!(!pdu.segs.is_empty());
            let seg = pdu.segs.get(pdu.next_seg)?;
            Some((pdu.sn, pdu.fi, pdu.buf.len(), *seg, pdu.lis.clone()))
        });
        let (sn, pdu_fi, pdu_len, seg, lis) = match snapshot {
            Some(s) => s,
            None => {
                self.retx_q.pop_front();
                return Ok(None);
            }
        };

        // A never-segmented PDU that fits whole goes out verbatim.
        if seg.start == 0 && seg.lsf && out.len() >= pdu_len {
            self.bump_retx(handle)?;
            let pdu = match self.pool.get_mut(handle) {
                Some(p) => p,
                None => return Ok(None),
            };
            out[..pdu_len].copy_from_slice(&pdu.buf);
            pdu.segs.clear();
            pdu.next_seg = 0;
            pdu.queued = false;
            self.retx_q.pop_front();
            debug!("retx PDU whole: sn={} len={}", sn, pdu_len);
            return Ok(Some(pdu_len));
        }

        if out.len() <= SEG_HEADER_SIZE {
            return Ok(None);
        }
        self.bump_retx(handle)?;

        let mut remain = out.len() - SEG_HEADER_SIZE;
        let so = seg.start;
        let mut seg_lis = LiList::new();
        let mut data_size = 0;

        // Find the LI containing the first byte of the range.
        let mut i_li = 0;
        let mut li_offset = 0;
        while li_offset < so && i_li < lis.len() {
            li_offset += usize::from(lis[i_li]);
            i_li += 1;
        }

        let fi_first;
        let mut fi_last;
        if li_offset > so {
            // The range opens mid-SDU.
            let take = remain.min(li_offset.min(seg.end) - so);
            seg_lis.push(take as u16).ok();
            remain -= take;
            data_size += take;
            fi_first = true;
            fi_last = li_offset != so + data_size;
        } else {
            fi_first = if i_li == 0 {
                pdu_fi.contains(FramingInfo::NOT_FIRST)
            } else {
                false
            };
            fi_last = false;
        }

        // Take whole (or budget-cut) SDU fragments until range or budget end.
        while remain > 0 && i_li < lis.len() && seg.start + data_size < seg.end {
            if !seg_lis.is_empty() {
                let cost = if seg_lis.len() % 2 == 1 { 2 } else { 1 };
                if remain <= cost {
                    break;
                }
                remain -= cost;
            }
            let take = remain
                .min(usize::from(lis[i_li]))
                .min(seg.end - li_offset);
            if seg_lis.push(take as u16).is_err() {
                break;
            }
            remain -= take;
            data_size += take;
            li_offset += usize::from(lis[i_li]);
            fi_last = li_offset != seg.start + data_size;
            i_li += 1;
        }
        debug_assert!(!seg_lis.is_empty());
        if seg_lis.is_empty() {
            return Ok(None);
        }

        let li_bytes = li_len(seg_lis.len());
        let data_off = SEG_HEADER_SIZE + li_bytes;
        encode_li(&seg_lis, &mut out[SEG_HEADER_SIZE..data_off]);
        {
            let pdu = match self.pool.get(handle) {
                Some(p) => p,
                None => return Ok(None),
            };
            out[data_off..data_off + data_size]
                .copy_from_slice(&pdu.data()[seg.start..seg.start + data_size]);
        }

        self.update_poll(true, data_size);
        let poll = self.deliver_poll(timers);

        let mut lsf_flag = false;
        if seg.start + data_size == seg.end {
            // Range fully drained: move the ring on.
            lsf_flag = seg.lsf;
            if seg.lsf {
                fi_last = pdu_fi.contains(FramingInfo::NOT_LAST);
            }
            if let Some(pdu) = self.pool.get_mut(handle) {
                pdu.next_seg += 1;
                if pdu.next_seg >= pdu.segs.len() {
                    pdu.segs.clear();
                    pdu.next_seg = 0;
                    pdu.queued = false;
                    self.retx_q.pop_front();
                }
            }
        } else if let Some(pdu) = self.pool.get_mut(handle) {
            pdu.segs[pdu.next_seg].start += data_size;
        }

        let mut fi = FramingInfo::empty();
        if fi_first {
            fi |= FramingInfo::NOT_FIRST;
        }
        if fi_last {
            fi |= FramingInfo::NOT_LAST;
        }
        let mut header = AmHeader::new_data();
        header.set_resegment(true);
        header.set_sn(sn);
        header.set_fi(fi);
        header.set_e(seg_lis.len() > 1);
        header.set_poll(poll);
        header.encode(&mut out[..AmHeader::SIZE]);
        SegmentInfo {
            lsf: lsf_flag,
            so: so as u16,
        }
        .encode(&mut out[AmHeader::SIZE..SEG_HEADER_SIZE]);

        debug!(
            "retx segment: sn={} so={} len={} lsf={} n_li={}",
            sn,
            so,
            data_off + data_size,
            lsf_flag,
            seg_lis.len()
        );
        Ok(Some(data_off + data_size))
    }

    /// Applies a validated STATUS PDU from the peer.
    ///
    /// The whole PDU is checked before anything changes; a single bad field
    /// rejects it without side effects.
    pub fn process_status(
        &mut self,
        status: &StatusPdu,
        timers: &mut TimerWheel<AmTimer>,
    ) -> Result<(), Error> {
        let space = self.space;
        let ack_sn = status.ack_sn;

        if space.less(self.vt_s, ack_sn) {
            warn!("STATUS ACK_SN={} beyond VT(S)={}", ack_sn, self.vt_s);
            return Err(Error::Protocol);
        }
        if space.less(ack_sn, self.vt_a) {
            warn!("STATUS ACK_SN={} below VT(A)={}", ack_sn, self.vt_a);
            return Err(Error::Protocol);
        }
        let mut prev: Option<u16> = None;
        for nack in &status.nacks {
            if !space.contains(nack.sn, self.vt_a, self.vt_s) {
                warn!(
                    "NACK_SN={} outside [VT(A)={}, VT(S)={})",
                    nack.sn, self.vt_a, self.vt_s
                );
                return Err(Error::Protocol);
            }
            let handle = match self.slots[usize::from(nack.sn)] {
                Some(h) => h,
                None => {
                    warn!("NACK_SN={} does not match a pending PDU", nack.sn);
                    return Err(Error::Protocol);
                }
            };
            if let Some((start, end)) = nack.so {
                let maxso = self.pool.get(handle).map_or(0, TxPdu::data_len);
                if usize::from(start) >= maxso
                    || (end != SO_END && usize::from(end) > maxso)
                    || end <= start
                {
                    warn!(
                        "bad segment offsets ({}, {}) for NACK_SN={} (data {} bytes)",
                        start, end, nack.sn, maxso
                    );
                    return Err(Error::Protocol);
                }
            }
            if let Some(p) = prev {
                if !space.less_eq(p, nack.sn) {
                    warn!("NACK_SNs not ascending: {} then {}", p, nack.sn);
                    return Err(Error::Protocol);
                }
            }
            prev = Some(nack.sn);
        }

        debug!("STATUS: ACK_SN={} with {} NACKs", ack_sn, status.nacks.len());

        let mut sn = self.vt_a;
        let mut i = 0;
        while sn != ack_sn {
            if i < status.nacks.len() && status.nacks[i].sn == sn {
                if let Some(handle) = self.slots[usize::from(sn)] {
                    let mut newly_queued = false;
                    if let Some(pdu) = self.pool.get_mut(handle) {
                        pdu.segs.clear();
                        pdu.next_seg = 0;
                        pdu.retx_counted = false;
                        let maxso = pdu.data_len();
                        while i < status.nacks.len() && status.nacks[i].sn == sn {
                            match status.nacks[i].so {
                                None => {
                                    pdu.segs.clear();
                                    let _ = pdu.segs.push(RetxSeg {
                                        start: 0,
                                        end: maxso,
                                        lsf: true,
                                    });
                                }
                                Some((start, end)) => {
                                    let lsf = usize::from(end) >= maxso;
                                    let end = if lsf { maxso } else { usize::from(end) };
                                    let seg = RetxSeg {
                                        start: usize::from(start),
                                        end,
                                        lsf,
                                    };
                                    if pdu.segs.push(seg).is_err() {
                                        warn!("sn={} has over {} NACK ranges, rest dropped", sn, RETX_SEG_MAX);
                                    }
                                }
                            }
                            i += 1;
                        }
                        if !pdu.queued {
                            pdu.queued = true;
                            newly_queued = true;
                        }
                    }
                    if newly_queued {
                        self.insert_retx(handle);
                    }
                } else {
                    debug_assert!(false, "NACK_SN resolved to a live PDU during validation");
                    while i < status.nacks.len() && status.nacks[i].sn == sn {
                        i += 1;
                    }
                }
            } else if let Some(handle) = self.slots[usize::from(sn)].take() {
                self.pool.remove(handle);
            }
            sn = space.next(sn);
        }

        self.vt_a = status.nacks.first().map_or(ack_sn, |n| n.sn);
        self.vt_ms = space.add(self.vt_a, self.window_size);

        if space.less(self.poll_sn, ack_sn) {
            timers.stop(AmTimer::PollRetransmit);
        }
        Ok(())
    }

    /// t-PollRetransmit ran out: poll again and, with nothing else to send,
    /// push the oldest unacknowledged PDU back onto the queue.
    pub fn on_poll_retransmit_expired(&mut self) {
        debug!("t-PollRetransmit expired: VT(A)={} VT(S)={}", self.vt_a, self.vt_s);
        self.poll_bit = true;
        if !(self.queue.is_empty() && self.retx_q.is_empty()) && self.vt_s != self.vt_ms {
            return;
        }
        let mut sn = self.vt_a;
        while sn != self.vt_s {
            if let Some(handle) = self.slots[usize::from(sn)] {
                let mut newly_queued = false;
                if let Some(pdu) = self.pool.get_mut(handle) {
                    if !pdu.queued {
                        let maxso = pdu.data_len();
                        pdu.segs.clear();
                        let _ = pdu.segs.push(RetxSeg {
                            start: 0,
                            end: maxso,
                            lsf: true,
                        });
                        pdu.next_seg = 0;
                        pdu.retx_counted = false;
                        pdu.queued = true;
                        newly_queued = true;
                    }
                }
                if newly_queued {
                    self.insert_retx(handle);
                }
                break;
            }
            sn = self.space.next(sn);
        }
    }

    /// Drops all transmit state (re-establishment).
    pub fn clear(&mut self) {
        self.queue.clear();
        self.retx_q.clear();
        self.pool.clear();
        for slot in self.slots.iter_mut() {
            *slot = None;
        }
        self.vt_a = 0;
        self.vt_s = 0;
        self.vt_ms = self.window_size;
        self.poll_sn = 0;
        self.pdu_without_poll = 0;
        self.byte_without_poll = 0;
        self.poll_bit = false;
        self.status_triggered = false;
    }
}
