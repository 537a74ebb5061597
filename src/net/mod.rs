//! Wire format and the two replica managers
//!
//! `bitstream` and `protocol` define how replication state travels;
//! `transport` is the seam to whatever carries the bytes; `server` and
//! `client` are the tick-driven managers on each peer.

pub mod bitstream;
pub mod client;
pub mod protocol;
pub mod server;
pub mod transport;
