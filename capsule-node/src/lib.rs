//! capsule-node library surface
//!
//! The binary in `main.rs` is a thin CLI over this; configuration loading
//! lives here so it can be driven directly from integration tests.

pub mod config;

pub use config::{Config, NodeConfig};
