//! Process-wide run status, published as a whole value

use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;

use crate::retention::SweepReport;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunPhase {
    #[default]
    Idle,
    Running,
    Completed,
    Failed,
}

impl fmt::Display for RunPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RunPhase::Idle => "idle",
            RunPhase::Running => "running",
            RunPhase::Completed => "completed",
            RunPhase::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// What started a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TriggerSource {
    Schedule,
    Manual,
}

impl fmt::Display for TriggerSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TriggerSource::Schedule => f.write_str("schedule"),
            TriggerSource::Manual => f.write_str("manual"),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunStatus {
    pub phase: RunPhase,
    pub trigger: Option<TriggerSource>,
    pub last_run_started_at: Option<DateTime<Utc>>,
    pub last_run_finished_at: Option<DateTime<Utc>>,
    pub repositories_processed: usize,
    pub repositories_failed: usize,
    pub last_error: Option<String>,
    pub last_sweep: Option<SweepReport>,
}

impl RunStatus {
    /// Fresh `running` status: counts and error reset, previous sweep kept
    pub fn started(&self, trigger: TriggerSource, at: DateTime<Utc>) -> Self {
        Self {
            phase: RunPhase::Running,
            trigger: Some(trigger),
            last_run_started_at: Some(at),
            last_run_finished_at: self.last_run_finished_at,
            repositories_processed: 0,
            repositories_failed: 0,
            last_error: None,
            last_sweep: self.last_sweep.clone(),
        }
    }
}

/// Shared handle to the single status value
#[derive(Clone, Default)]
pub struct StatusHandle(Arc<ArcSwap<RunStatus>>);

impl StatusHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> Arc<RunStatus> {
        self.0.load_full()
    }

    pub fn publish(&self, status: RunStatus) {
        self.0.store(Arc::new(status));
    }

    /// Apply `f` to a copy of the current value and publish the result
    pub fn update(&self, f: impl FnOnce(&mut RunStatus)) {
        let mut next = (*self.snapshot()).clone();
        f(&mut next);
        self.publish(next);
    }
}
