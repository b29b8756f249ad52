//! Forward-test scheduling: per-run services, order sequencing, and the
//! polling driver.

pub mod driver;
pub mod sequencer;
pub mod service;
