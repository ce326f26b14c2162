//! Result aggregation: merges lane logs and decides the run verdict.
//!
//! Two independent signals are combined:
//! - a textual scan of the merged results log for the failure marker
//! - the structured [`LaneReport`]s collected by the invoker
//!
//! Any single failure in either signal fails the run.

use crate::error::{HarnessError, HarnessResult};
use crate::report::{LaneReport, LaneStatus};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

/// Marker libtest prints when any test in a binary failed.
pub const DEFAULT_FAILURE_MARKER: &str = "test result: FAILED";

/// How the failure marker is matched against log lines.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MarkerMatch {
    /// Marker anywhere in a line.
    #[default]
    Substring,

    /// Marker at the start of the trimmed line.
    LineStart,
}

/// Outcome of scanning a log for the failure marker.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MarkerVerdict {
    pub passed: bool,
    pub occurrences: usize,

    /// 1-based line numbers containing the marker.
    pub lines: Vec<usize>,
}

impl Default for MarkerVerdict {
    fn default() -> Self {
        Self {
            passed: true,
            occurrences: 0,
            lines: Vec::new(),
        }
    }
}

/// Combined verdict over structured results and the marker scan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateVerdict {
    pub passed: bool,

    /// Reasons for failure (empty if passed).
    pub violations: Vec<String>,

    pub message: String,
}

/// Scans results logs and evaluates lane reports.
#[derive(Debug, Clone)]
pub struct ResultAggregator {
    marker: String,
    mode: MarkerMatch,
}

impl Default for ResultAggregator {
    fn default() -> Self {
        Self::new(DEFAULT_FAILURE_MARKER)
    }
}

impl ResultAggregator {
    pub fn new(marker: impl Into<String>) -> Self {
        Self {
            marker: marker.into(),
            mode: MarkerMatch::default(),
        }
    }

    pub fn with_mode(mut self, mode: MarkerMatch) -> Self {
        self.mode = mode;
        self
    }

    /// Scan text for the failure marker. Pure: the same input always yields
    /// the same verdict.
    pub fn scan_text(&self, text: &str) -> MarkerVerdict {
        let lines: Vec<usize> = text
            .lines()
            .enumerate()
            .filter(|(_, line)| self.matches(line))
            .map(|(idx, _)| idx + 1)
            .collect();

        MarkerVerdict {
            passed: lines.is_empty(),
            occurrences: lines.len(),
            lines,
        }
    }

    /// Scan the whole log file at `path`.
    pub async fn scan_log(&self, path: &Path) -> HarnessResult<MarkerVerdict> {
        self.scan_log_from(path, 0).await
    }

    /// Scan only the bytes of `path` from `offset` on. Line numbers stay
    /// relative to the start of the file.
    pub async fn scan_log_from(&self, path: &Path, offset: u64) -> HarnessResult<MarkerVerdict> {
        let bytes = tokio::fs::read(path)
            .await
            .map_err(|e| HarnessError::io(path, e))?;
        let start = usize::try_from(offset).unwrap_or(usize::MAX).min(bytes.len());
        let (before, section) = bytes.split_at(start);
        let skipped = before.iter().filter(|b| **b == b'\n').count();

        let mut verdict = self.scan_text(&String::from_utf8_lossy(section));
        for line in &mut verdict.lines {
            *line += skipped;
        }

        if verdict.passed {
            debug!(log = %path.display(), offset, "No failure marker found");
        } else {
            warn!(
                log = %path.display(),
                offset,
                occurrences = verdict.occurrences,
                marker = %self.marker,
                "Failure marker found in results log"
            );
        }
        Ok(verdict)
    }

    fn matches(&self, line: &str) -> bool {
        if self.marker.is_empty() {
            return false;
        }
        match self.mode {
            MarkerMatch::Substring => line.contains(self.marker.as_str()),
            MarkerMatch::LineStart => line.trim_start().starts_with(self.marker.as_str()),
        }
    }

    /// Combine lane reports with the marker scan.
    ///
    /// Rules:
    /// - every failed test is a violation
    /// - a timed-out lane is a violation
    /// - a failed lane with no failed test recorded (e.g. build error) is a violation
    /// - every marker occurrence in the results log is a violation
    pub fn evaluate(&self, lanes: &[LaneReport], marker: &MarkerVerdict) -> GateVerdict {
        let mut violations = Vec::new();

        for lane in lanes {
            for test in lane.failed_tests() {
                violations.push(format!("Lane {}: test '{}' failed", lane.lane, test.name));
            }
            match lane.status {
                LaneStatus::TimedOut => {
                    violations.push(format!("Lane {} timed out", lane.lane));
                }
                LaneStatus::Failed if lane.failed_count() == 0 => {
                    violations.push(format!(
                        "Lane {} exited with code {}",
                        lane.lane, lane.exit_code
                    ));
                }
                _ => {}
            }
        }

        for line in &marker.lines {
            violations.push(format!(
                "Results log line {} contains '{}'",
                line, self.marker
            ));
        }

        let passed = violations.is_empty();
        let message = if passed {
            "All lanes passed".to_string()
        } else {
            format!("Run failed with {} violation(s)", violations.len())
        };

        GateVerdict {
            passed,
            violations,
            message,
        }
    }
}

/// Current length of the results log, 0 if it does not exist yet.
pub async fn results_log_len(results_log: &Path) -> HarnessResult<u64> {
    match tokio::fs::metadata(results_log).await {
        Ok(meta) => Ok(meta.len()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(0),
        Err(e) => Err(HarnessError::io(results_log, e)),
    }
}

/// Append each lane log to the shared results log, in lane order.
///
/// Lanes only ever write their own files; merging afterwards keeps the
/// results log free of interleaved output.
pub async fn append_lane_logs(lanes: &[LaneReport], results_log: &Path) -> HarnessResult<()> {
    if let Some(parent) = results_log.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| HarnessError::io(parent, e))?;
    }

    let mut out = OpenOptions::new()
        .create(true)
        .append(true)
        .open(results_log)
        .await
        .map_err(|e| HarnessError::io(results_log, e))?;

    let mut ordered: Vec<&LaneReport> = lanes.iter().collect();
    ordered.sort_by_key(|l| l.lane);

    for lane in ordered {
        let contents = tokio::fs::read(&lane.log_path)
            .await
            .map_err(|e| HarnessError::io(&lane.log_path, e))?;

        let header = format!("==> lane {} [{}] <==\n", lane.lane, lane.connectors.join(","));
        out.write_all(header.as_bytes())
            .await
            .map_err(|e| HarnessError::io(results_log, e))?;
        out.write_all(&contents)
            .await
            .map_err(|e| HarnessError::io(results_log, e))?;
        if !contents.ends_with(b"\n") && !contents.is_empty() {
            out.write_all(b"\n")
                .await
                .map_err(|e| HarnessError::io(results_log, e))?;
        }
    }

    out.flush()
        .await
        .map_err(|e| HarnessError::io(results_log, e))?;
    info!(lanes = lanes.len(), log = %results_log.display(), "Merged lane logs");
    Ok(())
}
