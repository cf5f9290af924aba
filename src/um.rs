//! The Unacknowledged Mode (UM) entity.
//!
//! UM segments and concatenates on the way down and reorders on the way up,
//! but never retransmits: a hole that t-Reordering gives up on is simply
//! skipped. The receive side keeps one sliding reordering window of
//! `UM_Window_Size` SNs ending just below `VR(UH)`, the highest SN seen so
//! far plus one.

use crate::entity::{DeliverFn, PduKind, RlcEntity};
use crate::pdu::{encode_li, li_len, parse_li, FramingInfo, LiList, UmHeader};
use crate::sdu::{AssemblyQueue, TxQueue};
use crate::seq::SnSpace;
use crate::wheel::TimerWheel;
use crate::Error;
use alloc::rc::Rc;
use alloc::vec::Vec;

/// UM entity configuration.
///
/// All timer values are in the tick units fed to
/// [`advance_time`](struct.UmEntity.html#method.advance_time).
#[derive(Debug, Copy, Clone)]
pub struct UmConfig {
    /// SN field width: 5 or 10 bits.
    pub sn_bits: u8,
    /// Reordering window size, typically half the SN space.
    pub window_size: u16,
    /// t-Reordering duration.
    pub t_reordering: u32,
}

#[derive(Debug, Copy, Clone, PartialEq)]
enum UmTimer {
    Reordering,
}

/// A received UM PDU parked in the reordering window.
struct UmPdu {
    fi: FramingInfo,
    lis: LiList,
    buf: Rc<[u8]>,
    data_off: usize,
}

struct UmTx {
    space: SnSpace,
    sn_bits: u8,
    /// VT(US): SN for the next fresh PDU.
    vt_us: u16,
    queue: TxQueue,
}

struct UmRx {
    space: SnSpace,
    window_size: u16,
    /// VR(UR): earliest SN still considered for reordering.
    vr_ur: u16,
    /// VR(UX): the VR(UH) snapshot taken when t-Reordering started.
    vr_ux: u16,
    /// VR(UH): highest received SN plus one.
    vr_uh: u16,
    slots: Vec<Option<UmPdu>>,
    assembly: AssemblyQueue,
    deliver: Option<DeliverFn>,
    n_good_pdu: u32,
    n_discard_pdu: u32,
}

/// An unacknowledged-mode entity (transmit and receive halves).
pub struct UmEntity {
    tx: UmTx,
    rx: UmRx,
    timers: TimerWheel<UmTimer>,
    t_reordering: u32,
}

impl UmEntity {
    /// Creates a UM entity. `sn_bits` values other than 5 are treated as 10.
    pub fn new(config: UmConfig) -> Self {
        let sn_bits = if config.sn_bits == 5 { 5 } else { 10 };
        let space = SnSpace::new(sn_bits);
        UmEntity {
            tx: UmTx {
                space,
                sn_bits,
                vt_us: 0,
                queue: TxQueue::new(),
            },
            rx: UmRx {
                space,
                window_size: config.window_size,
                vr_ur: 0,
                vr_ux: 0,
                vr_uh: 0,
                slots: (0..space.size()).map(|_| None).collect(),
                assembly: AssemblyQueue::new(),
                deliver: None,
                n_good_pdu: 0,
                n_discard_pdu: 0,
            },
            timers: TimerWheel::new(config.t_reordering as usize),
            t_reordering: config.t_reordering,
        }
    }

    /// Installs the callback receiving reassembled SDUs.
    pub fn set_deliver_fn(&mut self, f: DeliverFn) {
        self.rx.deliver = Some(f);
    }

    /// Received PDUs accepted into the reordering window so far.
    pub fn good_pdus(&self) -> u32 {
        self.rx.n_good_pdu
    }

    /// Received PDUs dropped (duplicate, stale or malformed) so far.
    pub fn discarded_pdus(&self) -> u32 {
        self.rx.n_discard_pdu
    }

    fn process_data_pdu(&mut self, pdu: Vec<u8>) -> Result<(), Error> {
        let rx = &mut self.rx;
        let space = rx.space;
        let header = UmHeader::parse(&pdu, self.tx.sn_bits)?;
        let head_len = UmHeader::size(self.tx.sn_bits);
        let sn = header.sn;

        debug!(
            "UM rx PDU: sn={} fi={:?} len={} VR(UR)={} VR(UX)={} VR(UH)={}",
            sn,
            header.fi,
            pdu.len(),
            rx.vr_ur,
            rx.vr_ux,
            rx.vr_uh
        );

        // A duplicate inside (VR(UR), VR(UH)) or anything at or below the
        // lower window edge is discarded.
        let in_pending_span = space.sub(sn, rx.vr_ur) > 0
            && space.sub(sn, rx.vr_ur) < space.sub(rx.vr_uh, rx.vr_ur);
        if in_pending_span && rx.slots[usize::from(sn)].is_some() {
            rx.n_discard_pdu += 1;
            warn!("UM PDU duplicated: sn={} VR(UR)={} VR(UH)={}", sn, rx.vr_ur, rx.vr_uh);
            return Err(Error::Duplicate);
        }
        // Everything behind VR(UR) was delivered or given up on. An SN far
        // ahead of VR(UH) is indistinguishable from an old one in modular
        // arithmetic; anything within a quarter space behind VR(UR) counts
        // as stale, anything further counts as a forward jump.
        let mut window_low = space.sub(rx.vr_uh, rx.window_size);
        if space.less(sn, rx.vr_ur) {
            rx.n_discard_pdu += 1;
            warn!("UM PDU below window: sn={} VR(UR)={} VR(UH)={}", sn, rx.vr_ur, rx.vr_uh);
            return Err(Error::OutOfWindow);
        }

        // Place the PDU in the reception buffer.
        let (lis, li_bytes) = match parse_li(header.e, &pdu[head_len..]) {
            Ok(parsed) => parsed,
            Err(e) => {
                rx.n_discard_pdu += 1;
                warn!("malformed UM PDU: sn={} len={}", sn, pdu.len());
                return Err(e);
            }
        };
        let buf: Rc<[u8]> = pdu.into();
        debug_assert!(rx.slots[usize::from(sn)].is_none());
        rx.slots[usize::from(sn)] = Some(UmPdu {
            fi: header.fi,
            lis,
            buf,
            data_off: head_len + li_bytes,
        });
        rx.n_good_pdu += 1;

        // An arrival that is neither stale nor pending is a forward jump:
        // it advances the window, and everything the new window pushed out
        // is reassembled now.
        if !space.contains(sn, rx.vr_ur, rx.vr_uh) {
            rx.vr_uh = space.next(sn);
            window_low = space.sub(rx.vr_uh, rx.window_size);

            let mut flush_sn = rx.vr_ur;
            while !space.contains(flush_sn, window_low, rx.vr_uh) {
                if let Some(p) = rx.slots[usize::from(flush_sn)].take() {
                    rx.assembly.feed(p.fi, &p.lis, &p.buf, p.data_off);
                }
                flush_sn = space.next(flush_sn);
            }
            if !space.contains(rx.vr_ur, window_low, rx.vr_uh) {
                rx.vr_ur = window_low;
            }
        }

        // In-order run starting at VR(UR) is reassembled immediately.
        if sn == rx.vr_ur {
            let mut cur = rx.vr_ur;
            while let Some(p) = rx.slots[usize::from(cur)].take() {
                rx.assembly.feed(p.fi, &p.lis, &p.buf, p.data_off);
                cur = space.next(cur);
            }
            rx.vr_ur = cur;
        }

        if self.timers.is_running(UmTimer::Reordering) {
            let ux_out = !space.contains(rx.vr_ux, window_low, rx.vr_uh);
            if space.less_eq(rx.vr_ux, rx.vr_ur) || (ux_out && rx.vr_ux != rx.vr_uh) {
                self.timers.stop(UmTimer::Reordering);
            }
        }
        if !self.timers.is_running(UmTimer::Reordering) && space.less(rx.vr_ur, rx.vr_uh) {
            self.timers.start(UmTimer::Reordering, self.t_reordering);
            rx.vr_ux = rx.vr_uh;
        }

        debug!(
            "UM rx done: VR(UR)={} VR(UX)={} VR(UH)={}",
            rx.vr_ur, rx.vr_ux, rx.vr_uh
        );

        rx.assembly.deliver(&mut rx.deliver);
        Ok(())
    }

    fn on_reordering_expired(&mut self) {
        let rx = &mut self.rx;
        let space = rx.space;
        debug!("UM t-Reordering expired: VR(UR)={} VR(UX)={}", rx.vr_ur, rx.vr_ux);

        // Advance VR(UR) to the first missing SN at or above VR(UX),
        // reassembling everything on the way.
        let mut sn = rx.vr_ur;
        while space.less(sn, rx.vr_ux) || rx.slots[usize::from(sn)].is_some() {
            if let Some(p) = rx.slots[usize::from(sn)].take() {
                rx.assembly.feed(p.fi, &p.lis, &p.buf, p.data_off);
            }
            sn = space.next(sn);
        }
        rx.vr_ur = sn;

        if space.less(rx.vr_ur, rx.vr_uh) {
            self.timers.start(UmTimer::Reordering, self.t_reordering);
            rx.vr_ux = rx.vr_uh;
        }

        rx.assembly.deliver(&mut rx.deliver);
    }
}

impl RlcEntity for UmEntity {
    fn tx_enqueue(&mut self, sdu: Vec<u8>) -> Result<(), Error> {
        self.tx.queue.enqueue(sdu)
    }

    fn tx_pending_size(&self) -> usize {
        if self.tx.queue.is_empty() {
            return 0;
        }
        let head_len = UmHeader::size(self.tx.sn_bits);
        self.tx.queue.total_bytes() + head_len + li_len(self.tx.queue.len())
    }

    fn tx_build_pdu(&mut self, out: &mut [u8]) -> Result<Option<(usize, PduKind)>, Error> {
        if out.is_empty() {
            return Err(Error::InvalidValue);
        }
        let tx = &mut self.tx;
        if tx.queue.is_empty() {
            return Ok(None);
        }
        let head_len = UmHeader::size(tx.sn_bits);
        if out.len() <= head_len {
            return Ok(None);
        }

        let mut fi = FramingInfo::empty();
        if tx.queue.head_offset().unwrap_or(0) > 0 {
            fi |= FramingInfo::NOT_FIRST;
        }

        let lis = tx.queue.build_li(out.len(), head_len);
        if lis.is_empty() {
            warn!("UM PDU build produced no LIs (budget {})", out.len());
            return Ok(None);
        }
        let li_bytes = li_len(lis.len());
        let data_off = head_len + li_bytes;
        encode_li(&lis, &mut out[head_len..data_off]);
        let data_len = tx.queue.consume(&lis, &mut out[data_off..]);
        if tx.queue.head_offset().unwrap_or(0) > 0 {
            fi |= FramingInfo::NOT_LAST;
        }

        let header = UmHeader {
            fi,
            e: lis.len() > 1,
            sn: tx.vt_us,
        };
        header.encode(out, tx.sn_bits)?;
        tx.vt_us = tx.space.next(tx.vt_us);

        debug!(
            "UM tx PDU: sn={} fi={:?} n_li={} len={}",
            header.sn,
            fi,
            lis.len(),
            data_off + data_len
        );
        Ok(Some((data_off + data_len, PduKind::Fresh)))
    }

    fn rx_process_pdu(&mut self, pdu: Vec<u8>) -> Result<(), Error> {
        if pdu.is_empty() {
            return Err(Error::Eof);
        }
        self.process_data_pdu(pdu)
    }

    fn reestablish(&mut self) {
        info!("UM re-establishment");
        let rx = &mut self.rx;
        let space = rx.space;

        // Reassemble and deliver whatever the window still holds, in SN
        // order starting at VR(UR).
        let mut sn = rx.vr_ur;
        for _ in 0..space.size() {
            if let Some(p) = rx.slots[usize::from(sn)].take() {
                rx.assembly.feed(p.fi, &p.lis, &p.buf, p.data_off);
            }
            sn = space.next(sn);
        }
        rx.assembly.deliver(&mut rx.deliver);
        rx.assembly.drop_partial_tail();
        rx.assembly.clear();

        self.tx.queue.clear();
        self.timers.stop(UmTimer::Reordering);

        rx.vr_ur = 0;
        rx.vr_ux = 0;
        rx.vr_uh = 0;
        rx.n_good_pdu = 0;
        rx.n_discard_pdu = 0;
        self.tx.vt_us = 0;
    }

    fn advance_time(&mut self, ticks: u32) {
        for _ in 0..ticks {
            for timer in self.timers.tick() {
                match timer {
                    UmTimer::Reordering => self.on_reordering_expired(),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec;
    use core::cell::RefCell;

    fn entity(sn_bits: u8, window: u16) -> (UmEntity, Rc<RefCell<Vec<Vec<u8>>>>) {
        let mut um = UmEntity::new(UmConfig {
            sn_bits,
            window_size: window,
            t_reordering: 35,
        });
        let delivered: Rc<RefCell<Vec<Vec<u8>>>> = Rc::default();
        let d = delivered.clone();
        um.set_deliver_fn(alloc::boxed::Box::new(move |sdu| {
            d.borrow_mut().push(sdu.to_vec());
        }));
        (um, delivered)
    }

    fn build(um: &mut UmEntity, budget: usize) -> Vec<u8> {
        let mut buf = vec![0u8; budget];
        let (n, kind) = um.tx_build_pdu(&mut buf).unwrap().expect("no PDU built");
        assert_eq!(kind, PduKind::Fresh);
        buf.truncate(n);
        buf
    }

    #[test]
    fn concatenation_header() {
        let (mut um, _) = entity(10, 512);
        um.tx_enqueue(vec![1; 100]).unwrap();
        um.tx_enqueue(vec![2; 50]).unwrap();
        assert_eq!(um.tx_pending_size(), 150 + 2 + 2);

        let pdu = build(&mut um, 400);
        assert_eq!(pdu.len(), 2 + 2 + 150);
        let header = UmHeader::parse(&pdu, 10).unwrap();
        assert_eq!(header.sn, 0);
        assert_eq!(header.fi, FramingInfo::empty());
        assert!(header.e);
    }

    #[test]
    fn segmentation_sets_framing() {
        let (mut um, _) = entity(10, 512);
        um.tx_enqueue(vec![7; 100]).unwrap();

        let first = build(&mut um, 52); // 2 header + 50 data
        let h1 = UmHeader::parse(&first, 10).unwrap();
        assert_eq!(h1.fi, FramingInfo::NOT_LAST);
        assert!(!h1.e);

        let second = build(&mut um, 100);
        let h2 = UmHeader::parse(&second, 10).unwrap();
        assert_eq!(h2.fi, FramingInfo::NOT_FIRST);
        assert_eq!(h2.sn, 1);
    }

    #[test]
    fn lossless_roundtrip() {
        let (mut tx, _) = entity(10, 512);
        let (mut rx, delivered) = entity(10, 512);

        let sdus: Vec<Vec<u8>> = (0..10u8).map(|i| vec![i; 30 + usize::from(i) * 7]).collect();
        for sdu in &sdus {
            tx.tx_enqueue(sdu.clone()).unwrap();
        }
        while tx.tx_pending_size() > 0 {
            let pdu = build(&mut tx, 60);
            rx.rx_process_pdu(pdu).unwrap();
        }
        assert_eq!(*delivered.borrow(), sdus);
        assert_eq!(rx.discarded_pdus(), 0);
    }

    #[test]
    fn five_bit_sn_wraps() {
        let (mut tx, _) = entity(5, 16);
        let (mut rx, delivered) = entity(5, 16);
        for i in 0..80u8 {
            tx.tx_enqueue(vec![i; 5]).unwrap();
            let pdu = build(&mut tx, 16);
            rx.rx_process_pdu(pdu).unwrap();
        }
        assert_eq!(delivered.borrow().len(), 80);
    }

    #[test]
    fn out_of_window_discard() {
        // the S4 scenario: 10-bit SN, window 512
        let (mut rx, _) = entity(10, 512);
        let mk = |sn: u16| {
            let mut pdu = vec![0u8; 2 + 4];
            UmHeader {
                fi: FramingInfo::empty(),
                e: false,
                sn,
            }
            .encode(&mut pdu, 10)
            .unwrap();
            pdu
        };
        rx.rx_process_pdu(mk(0)).unwrap();
        rx.rx_process_pdu(mk(1)).unwrap();
        rx.rx_process_pdu(mk(600)).unwrap();
        rx.rx_process_pdu(mk(601)).unwrap();
        assert_eq!(rx.rx.vr_uh, 602);
        assert_eq!(rx.rx.vr_ur, 90);

        assert_eq!(rx.rx_process_pdu(mk(89)), Err(Error::OutOfWindow));
        assert_eq!(rx.discarded_pdus(), 1);

        // duplicate of a pending PDU inside the window
        rx.rx_process_pdu(mk(300)).unwrap();
        assert_eq!(rx.rx_process_pdu(mk(300)), Err(Error::Duplicate));
    }

    #[test]
    fn reordering_timer_flushes_gap() {
        let (mut tx, _) = entity(10, 512);
        let (mut rx, delivered) = entity(10, 512);

        for i in 0..4u8 {
            tx.tx_enqueue(vec![i; 10]).unwrap();
        }
        let p0 = build(&mut tx, 12);
        let p1 = build(&mut tx, 12);
        let p2 = build(&mut tx, 12);
        let p3 = build(&mut tx, 12);

        rx.rx_process_pdu(p0).unwrap();
        rx.rx_process_pdu(p2).unwrap(); // p1 lost
        rx.rx_process_pdu(p3).unwrap();
        assert_eq!(delivered.borrow().len(), 1);

        rx.advance_time(35);
        // SN 1 was skipped; 2 and 3 delivered
        assert_eq!(delivered.borrow().len(), 3);
        assert_eq!(rx.rx.vr_ur, 4);
        drop(p1);
    }

    #[test]
    fn reestablish_resets() {
        let (mut rx, _) = entity(10, 512);
        let mut pdu = vec![0u8; 8];
        UmHeader {
            fi: FramingInfo::empty(),
            e: false,
            sn: 3,
        }
        .encode(&mut pdu, 10)
        .unwrap();
        rx.rx_process_pdu(pdu).unwrap();
        rx.reestablish();
        assert_eq!(rx.rx.vr_uh, 0);
        assert_eq!(rx.rx.vr_ur, 0);
        assert!(rx.rx.slots.iter().all(Option::is_none));
    }
}
