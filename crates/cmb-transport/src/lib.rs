//! # cmb-transport
//!
//! CMB pure-Rust transport core: Concurrent Multipath Bulk retrieval of a
//! single byte-addressable resource over unreliable datagrams.
//!
//! A fetch opens one or two unidirectional flows against provider
//! endpoints — one walking the resource's blocks forward from 1, one
//! backward from the last block — and the flows converge at a shifting
//! meeting point. Blocks are RaptorQ-coded so a flow never retransmits a
//! specific packet, only fresh symbols. Rate control is TFRC (RFC 5348).
//!
//! ## Crate structure
//!
//! - [`wire`] — fixed-layout packet encode/decode (7 kinds)
//! - [`seqnum`], [`timestamp`] — 24-bit wrap-safe ordering and timing
//! - [`resource`] — resource identity (MD5 ‖ length) and block math
//! - [`range`] — directed half-open block ranges
//! - [`coding`] — RaptorQ block encoder/decoder
//! - [`tfrc`] — TFRC sender: throughput equation, paced credits
//! - [`loss`] — TFRC receiver: loss-event history, feedback generation
//! - [`provider`] — provider per-flow state machine and symbol generator
//! - [`fetcher`] — fetcher per-flow state machine
//!
//! Everything here is pure logic: the runtime crate owns sockets, timers
//! and the clock, and drives these state machines with decoded packets and
//! explicit timestamps.

use std::time::Duration;

pub mod coding;
pub mod fetcher;
pub mod loss;
pub mod provider;
pub mod range;
pub mod resource;
pub mod seqnum;
pub mod timestamp;
pub mod tfrc;
pub mod wire;

/// Payload bytes per FEC symbol, and the segment size used for pacing.
pub const MAX_TRANSMISSION_UNIT: usize = 512;

/// FEC symbols per full block.
pub const SYMBOLS_PER_BLOCK: usize = 100;

/// Bytes per block: `MTU × SYMBOLS_PER_BLOCK`.
pub const BLOCK_SIZE: usize = MAX_TRANSMISSION_UNIT * SYMBOLS_PER_BLOCK;

/// Ceiling on the keep-alive period.
pub const MAX_HEARTBEAT_INTERVAL: Duration = Duration::from_millis(250);

/// Cooperative scheduling quantum for pacing loops.
pub const SCHEDULING_GRANULARITY: Duration = Duration::from_millis(1);

/// Default requested sending rate: 2 Mbit/s in bytes per second.
pub const DEFAULT_SENDING_RATE: u32 = 250_000;

/// Receive buffer size; comfortably above the largest emitted datagram.
pub const MAX_DATAGRAM_SIZE: usize = 2048;
