//! Per-unit repair state machine.
//!
//! ```text
//! Pending -> Running -> Passed
//!                   \-> Failed -> Repairing -> Running ...
//!                             \-> FailedPermanent (attempts exhausted)
//! ```
//!
//! The machine owns the attempt ceiling: `Failed` can only enter `Repairing`
//! while attempts remain, so no caller can exceed `max_attempts` oracle calls.

use thiserror::Error;

use crate::core::types::{FailureReason, TestStatus, UnitState};

/// Inputs that drive a unit between states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitEvent {
    /// Start (or restart after a candidate was applied) a test execution.
    Run,
    /// A test execution finished.
    Tested(TestStatus),
    /// Ask for another repair attempt.
    Repair,
    /// The oracle produced nothing usable; the attempt is spent.
    NoCandidate,
    /// Give up on the unit for this cycle.
    Abandon(FailureReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("illegal transition from {from:?} on {event:?}")]
pub struct TransitionError {
    pub from: UnitState,
    pub event: UnitEvent,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitMachine {
    state: UnitState,
    attempts: u32,
    max_attempts: u32,
    reason: Option<FailureReason>,
}

impl UnitMachine {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            state: UnitState::Pending,
            attempts: 0,
            max_attempts,
            reason: None,
        }
    }

    pub fn state(&self) -> UnitState {
        self.state
    }

    /// Repair attempts in the current failure streak (reset by a pass).
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn reason(&self) -> Option<FailureReason> {
        self.reason
    }

    pub fn attempts_remaining(&self) -> u32 {
        self.max_attempts.saturating_sub(self.attempts)
    }

    /// Apply `event` and return the resulting state.
    pub fn apply(&mut self, event: UnitEvent) -> Result<UnitState, TransitionError> {
        let next = match (self.state, event) {
            (UnitState::Pending | UnitState::Repairing, UnitEvent::Run) => UnitState::Running,
            (UnitState::Running, UnitEvent::Tested(TestStatus::Passed)) => {
                self.attempts = 0;
                UnitState::Passed
            }
            (UnitState::Running, UnitEvent::Tested(_)) => UnitState::Failed,
            (UnitState::Failed, UnitEvent::Repair) => {
                if self.attempts < self.max_attempts {
                    self.attempts += 1;
                    UnitState::Repairing
                } else {
                    self.reason = Some(FailureReason::AttemptsExhausted);
                    UnitState::FailedPermanent
                }
            }
            (UnitState::Repairing, UnitEvent::NoCandidate) => UnitState::Failed,
            (
                UnitState::Pending | UnitState::Running | UnitState::Failed | UnitState::Repairing,
                UnitEvent::Abandon(reason),
            ) => {
                self.reason = Some(reason);
                UnitState::FailedPermanent
            }
            (from, event) => return Err(TransitionError { from, event }),
        };
        self.state = next;
        Ok(next)
    }
}
