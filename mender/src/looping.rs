//! Single-shot and continuous scheduling for `mender run`.

use std::time::Duration;

use anyhow::Result;
use tracing::{error, info};

use crate::cycle::{Pipeline, run_cycle};
use crate::error::is_fatal;
use crate::io::state_store::{StateStore, load_or_recover};
use crate::state::{CycleSummary, PipelineState};

/// Reason why `run_continuous` stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopStop {
    /// `max_cycles` cycles were attempted.
    MaxCycles,
    /// Shutdown was requested.
    Shutdown,
}

/// Summary of a continuous run.
#[derive(Debug, Clone, PartialEq)]
pub struct LoopOutcome {
    /// Cycles attempted, including ones that ended in a non-fatal error.
    pub cycles_run: u64,
    pub stop: LoopStop,
    pub state: PipelineState,
}

/// Run exactly one cycle.
///
/// A non-fatal cycle error is counted in `total_errors` and persisted before
/// it is returned.
pub fn run_single<S: StateStore + ?Sized>(
    pipeline: &Pipeline,
    store: &S,
) -> Result<CycleSummary> {
    let mut state = load_or_recover(store)?;
    info!(state = %state.headline(), "single-shot run");
    match run_cycle(pipeline, store, &mut state) {
        Ok(summary) => Ok(summary),
        Err(err) => {
            if !is_fatal(&err) {
                record_cycle_error(store, &mut state)?;
            }
            Err(err)
        }
    }
}

/// Repeat cycles every `interval` until shutdown or `max_cycles`.
///
/// Non-fatal cycle errors are counted, persisted and survived; a store
/// failure stops the loop with an error. `on_cycle` sees each finished cycle.
pub fn run_continuous<S, F>(
    pipeline: &Pipeline,
    store: &S,
    interval: Duration,
    max_cycles: Option<u64>,
    mut on_cycle: F,
) -> Result<LoopOutcome>
where
    S: StateStore + ?Sized,
    F: FnMut(&CycleSummary),
{
    let mut state = load_or_recover(store)?;
    info!(
        interval_secs = interval.as_secs(),
        ?max_cycles,
        state = %state.headline(),
        "continuous run"
    );
    let mut cycles_run = 0u64;
    loop {
        if pipeline.shutdown.is_requested() {
            return Ok(finish(cycles_run, LoopStop::Shutdown, state));
        }
        match run_cycle(pipeline, store, &mut state) {
            Ok(summary) => on_cycle(&summary),
            Err(err) if is_fatal(&err) => {
                error!(err = %format!("{err:#}"), "state store failed, stopping");
                return Err(err);
            }
            Err(err) => {
                error!(err = %format!("{err:#}"), "cycle failed, continuing");
                record_cycle_error(store, &mut state)?;
            }
        }
        cycles_run += 1;
        if max_cycles.is_some_and(|max| cycles_run >= max) {
            return Ok(finish(cycles_run, LoopStop::MaxCycles, state));
        }
        info!(seconds = interval.as_secs(), "sleeping until next cycle");
        if !pipeline.shutdown.sleep(interval) {
            return Ok(finish(cycles_run, LoopStop::Shutdown, state));
        }
    }
}

fn record_cycle_error<S>(store: &S, state: &mut PipelineState) -> Result<()>
where
    S: StateStore + ?Sized,
{
    state.total_errors += 1;
    store.save(state)
}

fn finish(cycles_run: u64, stop: LoopStop, state: PipelineState) -> LoopOutcome {
    info!(cycles_run, ?stop, state = %state.headline(), "run finished");
    LoopOutcome {
        cycles_run,
        stop,
        state,
    }
}
