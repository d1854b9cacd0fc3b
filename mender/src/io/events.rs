//! Notification boundary.
//!
//! The orchestrator emits events; delivering them anywhere beyond the log
//! (webhooks, mail) is the job of an external [`EventSink`].

use std::sync::Mutex;

use serde::Serialize;
use tracing::{info, warn};

use crate::core::types::{Drift, FailureReason};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum PipelineEvent {
    RepairSucceeded {
        unit: String,
        attempts: u32,
    },
    FailedPermanent {
        unit: String,
        reason: FailureReason,
        attempts: u32,
    },
    DriftDetected {
        drift: Vec<Drift>,
    },
    CycleFinished {
        cycle: u64,
        complete: bool,
        passed: usize,
        failed: usize,
    },
}

pub trait EventSink: Send + Sync {
    fn emit(&self, event: &PipelineEvent);
}

/// Writes events to the structured log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

impl EventSink for LogSink {
    fn emit(&self, event: &PipelineEvent) {
        match event {
            PipelineEvent::RepairSucceeded { unit, attempts } => {
                info!(unit, attempts, "repair succeeded");
            }
            PipelineEvent::FailedPermanent {
                unit,
                reason,
                attempts,
            } => {
                warn!(unit, ?reason, attempts, "unit failed permanently");
            }
            PipelineEvent::DriftDetected { drift } => {
                for item in drift {
                    warn!(path = %item.path, expected = %item.expected, actual = ?item.actual, "source drift");
                }
            }
            PipelineEvent::CycleFinished {
                cycle,
                complete,
                passed,
                failed,
            } => {
                info!(cycle, complete, passed, failed, "cycle finished");
            }
        }
    }
}

/// Keeps every event in memory; handy for embedding and tests.
#[derive(Debug, Default)]
pub struct RecordingSink {
    events: Mutex<Vec<PipelineEvent>>,
}

impl RecordingSink {
    pub fn events(&self) -> Vec<PipelineEvent> {
        self.events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_default()
    }
}

impl EventSink for RecordingSink {
    fn emit(&self, event: &PipelineEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event.clone());
        }
    }
}
