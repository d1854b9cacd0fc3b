//! I/O adapters for the orchestrator.

pub mod config;
pub mod cycle_log;
pub mod discovery;
pub mod events;
pub mod http_oracle;
pub mod init;
pub mod oracle;
pub mod process;
pub mod state_store;
pub mod test_runner;
pub mod versioning;
