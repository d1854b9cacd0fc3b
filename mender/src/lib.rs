//! Self-healing test-and-repair orchestrator.
//!
//! Each cycle discovers test units, runs them with a hard timeout, asks a
//! repair oracle for candidate fixes to failing sources, and keeps a
//! candidate only if the test then passes. Progress lives in a durable state
//! record under `.mender/`.
//!
//! - **[`core`]**: pure logic (backoff, the unit state machine, metrics,
//!   drift). No I/O.
//! - **[`io`]**: side effects (processes, files, the oracle, state storage),
//!   behind traits so orchestration can be tested with scripted doubles.
//!
//! Orchestration modules ([`repair`], [`cycle`], [`looping`]) combine the two;
//! [`status`] and [`health`] back the read-only CLI commands.

pub mod core;
pub mod cycle;
pub mod error;
pub mod exit_codes;
pub mod health;
pub mod io;
pub mod logging;
pub mod looping;
pub mod repair;
pub mod retry;
pub mod shutdown;
pub mod state;
pub mod status;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
