//! Ferryd library
//!
//! Peer-to-peer one-way file synchronization: an encrypted length-framed
//! transport, a per-peer outbound tunnel that turns filesystem events into
//! mirroring requests, and an inbound server that applies requests from
//! other peers to the local tree.

pub mod config;
pub mod crypto;
pub mod fs_enum;
pub mod paths;
pub mod protocol;
pub mod server;
pub mod tombstone;
pub mod tunnel;
pub mod watch;
pub mod wire;
