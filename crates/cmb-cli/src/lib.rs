//! # cmb-cli
//!
//! Runtime half of the CMB transfer tool: tokio event loop, UDP socket
//! plumbing, the reusable timer, the provider server and the fetch
//! coordinator. The `cmb` binary is a thin CLI over this crate; the
//! protocol state machines live in `cmb-transport`.

pub mod client;
pub mod server;
pub mod timer;
