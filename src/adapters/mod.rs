//! Concrete implementations of the port traits.

pub mod client_cache;
pub mod csv_candles;
pub mod file_config_adapter;
pub mod memory_run_store;
pub mod paper_broker;
#[cfg(feature = "sqlite")]
pub mod sqlite_run_store;
