//! Structured lane and run reports.

use crate::aggregator::MarkerVerdict;
use crate::outcome::{TestOutcome, TestStatus};
use crate::readiness::ReadinessReport;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use uuid::Uuid;

/// Final status of a lane.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LaneStatus {
    Passed,
    Failed,
    TimedOut,
}

/// Result of running the test command for one lane.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LaneReport {
    pub lane: usize,
    pub connectors: Vec<String>,
    pub status: LaneStatus,

    /// Exit code of the test command (-1 when killed or unavailable).
    pub exit_code: i32,

    pub outcomes: Vec<TestOutcome>,
    pub log_path: PathBuf,
    pub duration_ms: u64,
}

impl LaneReport {
    pub fn passed(&self) -> bool {
        self.status == LaneStatus::Passed
    }

    pub fn passed_count(&self) -> usize {
        self.outcomes.iter().filter(|o| o.passed()).count()
    }

    pub fn failed_count(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|o| o.status == TestStatus::Failed)
            .count()
    }

    pub fn failed_tests(&self) -> impl Iterator<Item = &TestOutcome> {
        self.outcomes
            .iter()
            .filter(|o| o.status == TestStatus::Failed)
    }
}

/// Complete record of one harness run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,

    /// Digest of the lane layout.
    pub matrix_digest: String,

    pub readiness: ReadinessReport,
    pub lanes: Vec<LaneReport>,

    /// Verdict of the failure-marker scan over the results log.
    pub marker: MarkerVerdict,

    pub results_log: PathBuf,
    pub success: bool,
}

impl RunReport {
    pub fn total_duration_ms(&self) -> u64 {
        (self.finished_at - self.started_at)
            .num_milliseconds()
            .max(0) as u64
    }

    pub fn passed_count(&self) -> usize {
        self.lanes.iter().map(LaneReport::passed_count).sum()
    }

    pub fn failed_count(&self) -> usize {
        self.lanes.iter().map(LaneReport::failed_count).sum()
    }

    pub fn failed_lanes(&self) -> impl Iterator<Item = &LaneReport> {
        self.lanes.iter().filter(|l| !l.passed())
    }
}
