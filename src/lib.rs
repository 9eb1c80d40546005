//! Abyss replication library
//!
//! Building blocks for a simulation that runs as a child process and
//! replicates its world to a supervising host.
//!
//! - [`net::sequence`] - wraparound-safe 16-bit sequence ids
//! - [`net::codec`] - schema-driven bit-packed record serialization
//! - [`net::relay`] - length-prefixed frame relay over a local stream
//! - [`game`] - spawn/removal queue, reconciliation buffers and tick ordering

pub mod config;
pub mod game;
pub mod host;
pub mod metrics;
pub mod net;
pub mod util;
