//! # pointgraph
//!
//! The node binary's library half: configuration, the CLI and the TCP
//! replication transport. Exposed as a library so integration tests can
//! drive the transport without spawning the binary.

pub mod cli;
pub mod config;
pub mod transport;
