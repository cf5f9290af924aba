//! An LTE Radio Link Control (RLC) layer, after *3GPP TS 36.322*.
//!
//! The RLC layer sits between PDCP above and MAC below and turns
//! upper-layer datagrams (SDUs) into radio-sized frames (PDUs) and back.
//! This crate implements all three of its transmission modes:
//!
//! * **TM** ([`TmEntity`]) passes SDUs through untouched.
//! * **UM** ([`UmEntity`]) segments, concatenates and reorders, but never
//!   retransmits.
//! * **AM** ([`AmEntity`]) adds full ARQ on top: a sliding transmit window
//!   of unacknowledged PDUs, ACK/NACK STATUS reports with byte-range
//!   precision, polling, and retransmission with resegmentation down to
//!   whatever byte budget the MAC offers.
//!
//! # Using the stack
//!
//! The crate is `no_std` (plus `alloc`), runtime-agnostic and has no clock
//! of its own. The host drives each entity from exactly one thread:
//!
//! * the upper layer pushes SDUs with `tx_enqueue` and receives them from
//!   the deliver callback;
//! * the MAC asks for `tx_pending_size`, then pulls PDUs with
//!   `tx_build_pdu` and pushes received ones with `rx_process_pdu`;
//! * a tick source calls `advance_time`, which fires the 36.322 timers
//!   (t-Reordering, t-StatusProhibit, t-PollRetransmit) synchronously.
//!
//! The common entity surface lives in the [`RlcEntity`] trait; [`Entity`]
//! wraps the three modes into one type.
//!
//! [`TmEntity`]: tm/struct.TmEntity.html
//! [`UmEntity`]: um/struct.UmEntity.html
//! [`AmEntity`]: am/struct.AmEntity.html
//! [`RlcEntity`]: entity/trait.RlcEntity.html
//! [`Entity`]: entity/enum.Entity.html

#![no_std]

extern crate alloc;

#[macro_use]
mod log;

pub mod am;
pub mod bits;
mod entity;
pub mod pdu;
pub mod pool;
mod sdu;
pub mod seq;
pub mod tm;
pub mod um;
pub mod wheel;

mod error;

pub use self::entity::{DeliverFn, Entity, MaxRetxAction, MaxRetxFn, PduKind, RlcEntity};
pub use self::error::Error;
pub use self::sdu::Sdu;

/// Version of the 3GPP TS 36.322 specification this crate tracks.
pub const SPEC_VERSION: &str = "36.322 v9.3.0";
