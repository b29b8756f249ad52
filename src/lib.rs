//! alphaloop: alpha formula forward-testing engine.
//!
//! Compiles a small formula language into trading signals and drives them
//! against a sandbox brokerage account on a daily cadence.
//!
//! Hexagonal architecture: domain logic in [`domain`], port traits in
//! [`ports`], concrete implementations in [`adapters`], and the per-run
//! state machine plus polling driver in [`scheduler`].

pub mod adapters;
#[cfg(feature = "sqlite")]
pub mod cli;
pub mod domain;
pub mod ports;
pub mod scheduler;
