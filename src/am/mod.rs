//! The Acknowledged Mode (AM) entity.
//!
//! AM is the full ARQ mode of the RLC layer: the transmit half keeps every
//! PDU until the peer confirms it, the receive half reports what it saw via
//! STATUS PDUs, and lost data comes back as retransmissions, resegmented as
//! small as the MAC's byte budgets demand.
//!
//! One `AmEntity` bundles both halves and their four timers. The halves
//! interact constantly — a received poll makes the transmit half owe the
//! peer a STATUS PDU, a received STATUS PDU drives the transmit window —
//! so they live side by side in one struct and the entity's methods borrow
//! across them directly.
//!
//! The MAC drives the entity with [`tx_build_pdu`], which serves pending
//! work in fixed priority order: STATUS first, then retransmissions, then
//! fresh data.
//!
//! [`tx_build_pdu`]: struct.AmEntity.html#method.tx_build_pdu

pub(crate) mod rx;
pub(crate) mod status;
pub(crate) mod tx;

use crate::entity::{DeliverFn, MaxRetxFn, PduKind, RlcEntity};
use crate::pdu::AmHeader;
use crate::seq::SnSpace;
use crate::wheel::TimerWheel;
use crate::Error;
use alloc::rc::Rc;
use alloc::vec::Vec;

use self::rx::AmRx;
use self::status::StatusPdu;
use self::tx::AmTx;

/// AM entity configuration.
///
/// All timer values are in the tick units fed to
/// [`advance_time`](struct.AmEntity.html#method.advance_time); all must be
/// positive.
#[derive(Debug, Copy, Clone)]
pub struct AmConfig {
    /// How long the receive side waits for a gap to fill before reporting
    /// it.
    pub t_reordering: u32,
    /// Backstop making sure a delayed STATUS trigger eventually fires even
    /// if the condition it waits for never comes.
    pub t_status_pdu: u32,
    /// Minimum spacing between two transmitted STATUS PDUs.
    pub t_status_prohibit: u32,
    /// How long the transmit side waits for the answer to a poll.
    pub t_poll_retransmit: u32,
    /// Retransmissions per PDU before the max-retransmission callback runs.
    pub max_retx_threshold: u16,
    /// Poll after this many PDUs without one.
    pub poll_pdu: u16,
    /// Poll after this many data bytes without one.
    pub poll_byte: u32,
}

#[derive(Debug, Copy, Clone, PartialEq)]
pub(crate) enum AmTimer {
    Reordering,
    StatusPdu,
    StatusProhibit,
    PollRetransmit,
}

/// An acknowledged-mode entity (transmit and receive halves plus timers).
pub struct AmEntity {
    config: AmConfig,
    tx: AmTx,
    rx: AmRx,
    timers: TimerWheel<AmTimer>,
}

impl AmEntity {
    /// Creates an AM entity.
    pub fn new(config: AmConfig) -> Self {
        let longest = config
            .t_reordering
            .max(config.t_status_pdu)
            .max(config.t_status_prohibit)
            .max(config.t_poll_retransmit);
        AmEntity {
            tx: AmTx::new(
                config.max_retx_threshold,
                config.poll_pdu,
                config.poll_byte,
                config.t_poll_retransmit,
            ),
            rx: AmRx::new(),
            timers: TimerWheel::new(longest as usize + 1),
            config,
        }
    }

    /// Installs the callback receiving reassembled SDUs.
    pub fn set_deliver_fn(&mut self, f: DeliverFn) {
        self.rx.deliver = Some(f);
    }

    /// Installs the callback run when a PDU hits `maxRetxThreshold`.
    pub fn set_max_retx_fn(&mut self, f: MaxRetxFn) {
        self.tx.max_retx = Some(f);
    }

    /// Received data PDUs accepted into the window so far.
    pub fn good_pdus(&self) -> u32 {
        self.rx.n_good_pdu
    }

    /// Received data PDUs dropped (out of window, duplicate, malformed).
    pub fn discarded_pdus(&self) -> u32 {
        self.rx.n_discard_pdu
    }

    /// Flags that a STATUS report is owed to the peer.
    ///
    /// Unsolicited triggers (timer expiries, discarded polled PDUs) are
    /// `forced`; a poll on a healthy PDU only triggers once its SN leaves
    /// the span still being reordered, so the report reflects a settled
    /// window.
    fn trigger_status_report(&mut self, sn: u16, forced: bool) {
        if !forced {
            let space = SnSpace::AM;
            if !space.less(sn, self.rx.vr_ms) && !space.less_eq(self.rx.vr_mr, sn) {
                return;
            }
        }
        self.tx.status_triggered = true;
    }

    fn build_status_pdu(&mut self, out: &mut [u8]) -> Result<Option<usize>, Error> {
        if !self.tx.status_triggered
            || self.timers.is_running(AmTimer::StatusProhibit)
            || out.len() < status::MIN_SIZE
        {
            return Ok(None);
        }
        let report = self.rx.collect_status(out.len());
        let n = report.encode(out)?;
        self.tx.status_triggered = false;
        self.timers.stop(AmTimer::StatusPdu);
        self.timers
            .start(AmTimer::StatusProhibit, self.config.t_status_prohibit);
        debug!(
            "STATUS sent: ACK_SN={} n_nack={} len={}",
            report.ack_sn,
            report.nacks.len(),
            n
        );
        Ok(Some(n))
    }

    fn process_data_pdu(&mut self, header: AmHeader, pdu: Vec<u8>) -> Result<(), Error> {
        let space = SnSpace::AM;
        let sn = header.sn();
        debug!(
            "AM rx PDU: sn={} rf={} p={} VR(R)={} VR(H)={} VR(MS)={} VR(MR)={}",
            sn,
            header.is_resegment(),
            header.poll(),
            self.rx.vr_r,
            self.rx.vr_h,
            self.rx.vr_ms,
            self.rx.vr_mr
        );

        let buf: Rc<[u8]> = pdu.into();
        let mut discarded = None;
        if !self.rx.in_window(sn) {
            warn!(
                "sn outside receiving window: sn={} VR(R)={} VR(MR)={}",
                sn, self.rx.vr_r, self.rx.vr_mr
            );
            discarded = Some(Error::OutOfWindow);
        } else if let Err(e) = self.rx.place(header, &buf) {
            discarded = Some(e);
        }

        // Poll handling applies even to PDUs the window rejected.
        if header.poll() {
            self.trigger_status_report(sn, discarded.is_some());
            self.timers.stop(AmTimer::StatusPdu);
            if !self.tx.status_triggered {
                self.timers
                    .start(AmTimer::StatusPdu, self.config.t_status_pdu);
            }
        }

        if let Some(e) = discarded {
            self.rx.n_discard_pdu += 1;
            return Err(e);
        }
        self.rx.n_good_pdu += 1;

        self.rx.on_placed(sn);

        if self.timers.is_running(AmTimer::Reordering) {
            let x_out = !space.contains(self.rx.vr_x, self.rx.vr_r, self.rx.vr_mr);
            if self.rx.vr_x == self.rx.vr_r || (x_out && self.rx.vr_x != self.rx.vr_mr) {
                self.timers.stop(AmTimer::Reordering);
            }
        }
        if !self.timers.is_running(AmTimer::Reordering)
            && space.less(self.rx.vr_r, self.rx.vr_h)
        {
            self.timers
                .start(AmTimer::Reordering, self.config.t_reordering);
            self.rx.vr_x = self.rx.vr_h;
        }

        self.rx.deliver_ready();
        Ok(())
    }
}

impl RlcEntity for AmEntity {
    fn tx_enqueue(&mut self, sdu: Vec<u8>) -> Result<(), Error> {
        self.tx.queue.enqueue(sdu)
    }

    /// Bytes the entity could hand to the MAC right now, highest-priority
    /// source first: a pending STATUS report, then the head retransmission,
    /// then the whole fresh queue.
    fn tx_pending_size(&self) -> usize {
        if self.tx.status_triggered && !self.timers.is_running(AmTimer::StatusProhibit) {
            return self.rx.status_size();
        }
        let retx = self.tx.retx_pdu_size();
        if retx > 0 {
            return retx;
        }
        self.tx.fresh_pdu_size()
    }

    fn tx_build_pdu(&mut self, out: &mut [u8]) -> Result<Option<(usize, PduKind)>, Error> {
        if out.is_empty() {
            return Err(Error::InvalidValue);
        }
        if let Some(n) = self.build_status_pdu(out)? {
            return Ok(Some((n, PduKind::Status)));
        }
        if let Some(n) = self.tx.build_retx(out, &mut self.timers)? {
            return Ok(Some((n, PduKind::Retx)));
        }
        if let Some(n) = self.tx.build_fresh(out, &mut self.timers)? {
            return Ok(Some((n, PduKind::Fresh)));
        }
        Ok(None)
    }

    fn rx_process_pdu(&mut self, pdu: Vec<u8>) -> Result<(), Error> {
        let header = AmHeader::parse(&pdu)?;
        if header.is_control() {
            let report = StatusPdu::decode(&pdu)?;
            return self.tx.process_status(&report, &mut self.timers);
        }
        self.process_data_pdu(header, pdu)
    }

    fn reestablish(&mut self) {
        info!("AM re-establishment");
        self.rx.flush_all();
        self.rx.clear();
        self.tx.clear();
        self.timers.stop(AmTimer::Reordering);
        self.timers.stop(AmTimer::StatusPdu);
        self.timers.stop(AmTimer::StatusProhibit);
        self.timers.stop(AmTimer::PollRetransmit);
    }

    fn advance_time(&mut self, ticks: u32) {
        for _ in 0..ticks {
            for timer in self.timers.tick() {
                match timer {
                    AmTimer::Reordering => {
                        if self.rx.on_reordering_expired() {
                            self.timers
                                .start(AmTimer::Reordering, self.config.t_reordering);
                            self.rx.vr_x = self.rx.vr_h;
                        }
                        self.trigger_status_report(0, true);
                    }
                    AmTimer::StatusPdu => {
                        debug!("t-StatusPdu expired");
                        self.trigger_status_report(0, true);
                    }
                    AmTimer::StatusProhibit => {
                        debug!("t-StatusProhibit expired");
                    }
                    AmTimer::PollRetransmit => {
                        self.tx.on_poll_retransmit_expired();
                    }
                }
            }
        }
    }
}
