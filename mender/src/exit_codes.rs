//! Stable exit codes for mender CLI commands.

/// Command succeeded (a cycle that records failing units still succeeds).
pub const OK: i32 = 0;
/// Runtime failure: state store, discovery, unhealthy `health` report.
pub const FAILURE: i32 = 1;
/// Configuration could not be parsed or failed validation.
pub const CONFIG: i32 = 2;
