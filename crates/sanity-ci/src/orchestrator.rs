//! Harness orchestration: trigger → readiness → matrix → lanes → verdict.

use crate::aggregator::{append_lane_logs, results_log_len, GateVerdict, ResultAggregator};
use crate::config::HarnessConfig;
use crate::error::{HarnessError, HarnessResult};
use crate::invoker::LaneInvoker;
use crate::matrix::{ConnectorGroup, Matrix, MatrixPartitioner};
use crate::readiness::{ReadinessGate, ReadinessReport};
use crate::report::{LaneReport, LaneStatus, RunReport};
use crate::trigger::TriggerEvent;
use chrono::Utc;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use uuid::Uuid;

/// What a harness invocation did.
#[derive(Debug, Clone)]
pub enum RunOutcome {
    /// The trigger did not match; nothing was executed.
    Skipped { event: String },

    Completed {
        report: RunReport,
        verdict: GateVerdict,
    },
}

impl RunOutcome {
    /// Whether the process should exit successfully.
    pub fn success(&self) -> bool {
        match self {
            Self::Skipped { .. } => true,
            Self::Completed { report, .. } => report.success,
        }
    }
}

/// Drives a complete connector sanity run.
pub struct Harness {
    config: HarnessConfig,
}

impl Harness {
    pub fn new(config: HarnessConfig) -> Self {
        Self { config }
    }

    fn aggregator(&self) -> ResultAggregator {
        ResultAggregator::new(&self.config.failure_marker).with_mode(self.config.marker_match)
    }

    /// Compute the lane layout without running anything.
    pub fn plan(&self) -> HarnessResult<Matrix> {
        MatrixPartitioner::new(self.config.strategy)
            .with_weights(self.config.weights.clone())
            .partition(&self.config.connectors, self.config.lanes)
    }

    /// Run only the readiness gate, reporting every service's health.
    /// An unavailable service is part of the report, not an error.
    pub async fn check_services(&self) -> HarnessResult<ReadinessReport> {
        ReadinessGate::from_specs(&self.config.services)?
            .poll()
            .await
    }

    /// Run the readiness gate; an unavailable service is an error.
    pub async fn wait_for_services(&self) -> HarnessResult<ReadinessReport> {
        self.check_services().await?.into_result()
    }

    /// Execute the full run for `trigger`.
    ///
    /// Pre-test failures (unavailable dependency, missing command, bad
    /// configuration) are returned as errors. Test failures are not errors:
    /// they show up in the returned report.
    pub async fn run(&self, trigger: &TriggerEvent) -> HarnessResult<RunOutcome> {
        if !trigger.should_run() {
            info!(event = %trigger.name(), "Trigger does not match, skipping run");
            return Ok(RunOutcome::Skipped {
                event: trigger.name().to_string(),
            });
        }

        self.config.validate()?;
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        info!(run_id = %run_id, event = %trigger.name(), "Starting connector sanity run");

        let readiness = self.wait_for_services().await?;

        let matrix = self.plan()?;
        info!(
            run_id = %run_id,
            lanes = matrix.lane_count(),
            connectors = matrix.connector_count(),
            digest = %&matrix.digest[..12],
            "Connector matrix ready"
        );

        tokio::fs::create_dir_all(&self.config.log_dir)
            .await
            .map_err(|e| HarnessError::io(&self.config.log_dir, e))?;

        let invoker = Arc::new(LaneInvoker::new(
            self.config.command.clone(),
            self.config.env.clone(),
            &self.config.log_dir,
        ));
        let exe = invoker.preflight()?;
        info!(command = %exe.display(), "Test command resolved");

        let lanes = run_lanes(Arc::clone(&invoker), &matrix.groups).await?;

        // Earlier runs stay in the results log; only this run's section counts.
        let offset = results_log_len(&self.config.results_log).await?;
        append_lane_logs(&lanes, &self.config.results_log).await?;

        let aggregator = self.aggregator();
        let marker = aggregator
            .scan_log_from(&self.config.results_log, offset)
            .await?;
        let verdict = aggregator.evaluate(&lanes, &marker);

        let report = RunReport {
            run_id,
            started_at,
            finished_at: Utc::now(),
            matrix_digest: matrix.digest.clone(),
            readiness,
            lanes,
            marker,
            results_log: self.config.results_log.clone(),
            success: verdict.passed,
        };

        if let Some(path) = &self.config.report_path {
            write_report(&report, path).await?;
        }

        if report.success {
            info!(run_id = %run_id, passed = report.passed_count(), "Connector sanity run passed");
        } else {
            warn!(
                run_id = %run_id,
                failed = report.failed_count(),
                violations = verdict.violations.len(),
                "Connector sanity run failed"
            );
        }

        Ok(RunOutcome::Completed { report, verdict })
    }
}

/// Run every lane as its own task and wait for all of them.
///
/// A failing lane never cancels its siblings. Lane-level errors become
/// failed lane reports, except a missing test command, which is fatal.
async fn run_lanes(
    invoker: Arc<LaneInvoker>,
    groups: &[ConnectorGroup],
) -> HarnessResult<Vec<LaneReport>> {
    let handles: Vec<JoinHandle<HarnessResult<LaneReport>>> = groups
        .iter()
        .cloned()
        .map(|group| {
            let invoker = Arc::clone(&invoker);
            tokio::spawn(async move { invoker.run_lane(&group).await })
        })
        .collect();

    let results = futures::future::join_all(handles).await;

    let mut reports = Vec::with_capacity(groups.len());
    let mut fatal = None;

    for (group, joined) in groups.iter().zip(results) {
        let failure = match joined {
            Ok(Ok(report)) => {
                reports.push(report);
                continue;
            }
            Ok(Err(e @ HarnessError::ScriptInvocation { .. })) => {
                error!(lane = group.lane, error = %e, "Test command could not be invoked");
                fatal.get_or_insert(e);
                continue;
            }
            Ok(Err(e)) => e.to_string(),
            Err(join_err) => format!("lane task aborted: {}", join_err),
        };

        error!(lane = group.lane, error = %failure, "Lane errored");
        reports.push(errored_lane(&invoker, group, &failure).await);
    }

    match fatal {
        Some(e) => Err(e),
        None => Ok(reports),
    }
}

/// Failed lane report for a lane that could not complete. The error is
/// written to the lane log so the results log still explains it.
async fn errored_lane(invoker: &LaneInvoker, group: &ConnectorGroup, failure: &str) -> LaneReport {
    let log_path = invoker.lane_log_path(group.lane);
    if let Err(e) = tokio::fs::write(&log_path, format!("lane {} errored: {}\n", group.lane, failure)).await {
        warn!(lane = group.lane, error = %e, "Could not write lane error to log");
    }
    LaneReport {
        lane: group.lane,
        connectors: group.connectors().to_vec(),
        status: LaneStatus::Failed,
        exit_code: -1,
        outcomes: Vec::new(),
        log_path,
        duration_ms: 0,
    }
}

async fn write_report(report: &RunReport, path: &std::path::Path) -> HarnessResult<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| HarnessError::io(parent, e))?;
    }
    let json = serde_json::to_vec_pretty(report)?;
    tokio::fs::write(path, json)
        .await
        .map_err(|e| HarnessError::io(path, e))?;
    info!(path = %path.display(), "Wrote run report");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lane::LaneCommand;

    fn config_in(dir: &std::path::Path, script: &str) -> HarnessConfig {
        HarnessConfig {
            connectors: vec!["stripe".to_string(), "payme".to_string()],
            lanes: 2,
            command: LaneCommand::new(vec![
                "sh".to_string(),
                "-c".to_string(),
                script.to_string(),
            ]),
            log_dir: dir.join("lanes"),
            results_log: dir.join("test_results.log"),
            ..HarnessConfig::default()
        }
    }

    #[tokio::test]
    async fn test_non_matching_trigger_is_noop() {
        let dir = tempfile::tempdir().expect("tempdir");
        let harness = Harness::new(config_in(dir.path(), "exit 1"));

        let outcome = harness
            .run(&TriggerEvent::from_event("push", None))
            .await
            .expect("skip");

        assert!(matches!(outcome, RunOutcome::Skipped { .. }));
        assert!(outcome.success());
        assert!(!dir.path().join("test_results.log").exists());
    }

    #[tokio::test]
    async fn test_plan_matches_config() {
        let dir = tempfile::tempdir().expect("tempdir");
        let matrix = Harness::new(config_in(dir.path(), "true"))
            .plan()
            .expect("plan");
        assert_eq!(matrix.lane_count(), 2);
        assert_eq!(matrix.lane_of("payme"), Some(1));
    }

    #[tokio::test]
    async fn test_invalid_config_rejected_before_work() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut config = config_in(dir.path(), "true");
        config.connectors.clear();

        let err = Harness::new(config)
            .run(&TriggerEvent::default())
            .await
            .unwrap_err();
        assert!(matches!(err, HarnessError::Config(_)));
        assert!(!dir.path().join("lanes").exists());
    }

    #[tokio::test]
    async fn test_report_written_as_json() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut config = config_in(dir.path(), "echo \"test ${SANITY_CONNECTORS}_ui::a ... ok\"");
        config.report_path = Some(dir.path().join("out/report.json"));

        let outcome = Harness::new(config)
            .run(&TriggerEvent::default())
            .await
            .expect("run");
        assert!(outcome.success());

        let raw = std::fs::read_to_string(dir.path().join("out/report.json")).expect("report");
        let json: serde_json::Value = serde_json::from_str(&raw).expect("json");
        assert_eq!(json["success"], true);
        assert_eq!(json["lanes"].as_array().map(Vec::len), Some(2));
    }
}
