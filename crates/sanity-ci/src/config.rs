//! Harness configuration.
//!
//! Configuration comes from an optional JSON harness file, then explicit
//! overrides (CLI flags backed by `INPUT`, `CONNECTOR_AUTH_FILE_PATH`,
//! `CONNECTOR_TESTS_FILE_PATH` and `DATABASE_URL`).

use crate::aggregator::{MarkerMatch, DEFAULT_FAILURE_MARKER};
use crate::error::{HarnessError, HarnessResult};
use crate::lane::{LaneCommand, LaneEnvironment};
use crate::matrix::{parse_connector_list, PartitionStrategy};
use crate::readiness::ServiceSpec;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Full harness configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct HarnessConfig {
    /// Connectors to test.
    pub connectors: Vec<String>,

    /// Number of parallel lanes.
    pub lanes: usize,

    pub strategy: PartitionStrategy,

    /// Relative cost per connector, used by the balanced strategy.
    pub weights: HashMap<String, u64>,

    /// Services the readiness gate waits for.
    pub services: Vec<ServiceSpec>,

    pub command: LaneCommand,
    pub env: LaneEnvironment,

    /// Directory for per-lane logs.
    pub log_dir: PathBuf,

    /// Shared append-only results log.
    pub results_log: PathBuf,

    pub failure_marker: String,
    pub marker_match: MarkerMatch,

    /// Where to write the JSON run report, if anywhere.
    pub report_path: Option<PathBuf>,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            connectors: Vec::new(),
            lanes: 2,
            strategy: PartitionStrategy::default(),
            weights: HashMap::new(),
            services: Vec::new(),
            command: LaneCommand::default(),
            env: LaneEnvironment::default(),
            log_dir: PathBuf::from("tests/lanes"),
            results_log: PathBuf::from("tests/test_results.log"),
            failure_marker: DEFAULT_FAILURE_MARKER.to_string(),
            marker_match: MarkerMatch::default(),
            report_path: None,
        }
    }
}

/// Values that take precedence over the harness file.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    /// Raw connector selection (comma or whitespace separated).
    pub connectors: Option<String>,
    pub lanes: Option<usize>,
    pub strategy: Option<PartitionStrategy>,
    pub auth_file: Option<PathBuf>,
    pub tests_file: Option<PathBuf>,
    pub database_url: Option<String>,
    pub services: Vec<ServiceSpec>,
    pub command: Option<Vec<String>>,
    pub timeout_secs: Option<u64>,
    pub log_dir: Option<PathBuf>,
    pub results_log: Option<PathBuf>,
    pub report_path: Option<PathBuf>,
    pub feature_flags: Vec<(String, String)>,
}

impl HarnessConfig {
    /// Load a JSON harness file.
    pub fn load(path: &Path) -> HarnessResult<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| HarnessError::io(path, e))?;
        let config: Self = serde_json::from_str(&raw)?;
        debug!(path = %path.display(), "Loaded harness config");
        Ok(config)
    }

    /// Load `path` if given, otherwise start from defaults.
    pub fn load_or_default(path: Option<&Path>) -> HarnessResult<Self> {
        match path {
            Some(path) => Self::load(path),
            None => Ok(Self::default()),
        }
    }

    pub fn apply(&mut self, overrides: Overrides) {
        if let Some(raw) = overrides.connectors {
            self.connectors = parse_connector_list(&raw);
        }
        if let Some(lanes) = overrides.lanes {
            self.lanes = lanes;
        }
        if let Some(strategy) = overrides.strategy {
            self.strategy = strategy;
        }
        if overrides.auth_file.is_some() {
            self.env.auth_file = overrides.auth_file;
        }
        if overrides.tests_file.is_some() {
            self.env.tests_file = overrides.tests_file;
        }
        if overrides.database_url.is_some() {
            self.env.database_url = overrides.database_url;
        }
        if !overrides.services.is_empty() {
            self.services = overrides.services;
        }
        if let Some(program) = overrides.command {
            self.command.program = program;
        }
        if let Some(timeout) = overrides.timeout_secs {
            self.command.timeout_secs = timeout;
        }
        if let Some(dir) = overrides.log_dir {
            self.log_dir = dir;
        }
        if let Some(path) = overrides.results_log {
            self.results_log = path;
        }
        if overrides.report_path.is_some() {
            self.report_path = overrides.report_path;
        }
        self.env.feature_flags.extend(overrides.feature_flags);
    }

    /// Reject configurations that cannot produce a run.
    pub fn validate(&self) -> HarnessResult<()> {
        if self.connectors.iter().all(|c| c.trim().is_empty()) {
            return Err(HarnessError::Config("no connectors selected".to_string()));
        }
        if self.lanes == 0 {
            return Err(HarnessError::Config("lanes must be at least 1".to_string()));
        }
        if self.command.program.is_empty() {
            return Err(HarnessError::Config("test command is empty".to_string()));
        }
        if self.failure_marker.is_empty() {
            return Err(HarnessError::Config("failure marker is empty".to_string()));
        }
        for service in &self.services {
            if service.max_retries == 0 {
                return Err(HarnessError::Config(format!(
                    "service '{}' must allow at least one probe",
                    service.name
                )));
            }
        }
        Ok(())
    }
}

/// Parse `KEY=VALUE` into a feature flag pair.
pub fn parse_feature_flag(raw: &str) -> HarnessResult<(String, String)> {
    match raw.split_once('=') {
        Some((key, value)) if !key.trim().is_empty() => {
            Ok((key.trim().to_string(), value.to_string()))
        }
        _ => Err(HarnessError::Config(format!(
            "feature flag must be KEY=VALUE, got '{}'",
            raw
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::readiness::ProbeSpec;

    #[test]
    fn test_defaults() {
        let config = HarnessConfig::default();
        assert_eq!(config.lanes, 2);
        assert_eq!(config.failure_marker, "test result: FAILED");
        assert_eq!(config.results_log, PathBuf::from("tests/test_results.log"));
        assert!(config.validate().is_err(), "no connectors selected");
    }

    #[test]
    fn test_load_partial_json() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("harness.json");
        std::fs::write(
            &path,
            r#"{
                "connectors": ["stripe", "payme"],
                "lanes": 3,
                "strategy": "round_robin",
                "services": [
                    {"name": "redis", "probe": {"kind": "tcp", "address": "localhost:6379"}, "max_retries": 3}
                ],
                "command": {"program": ["./scripts/ui_tests.sh", "{connectors}"], "timeout_secs": 600}
            }"#,
        )
        .expect("write config");

        let config = HarnessConfig::load(&path).expect("load");
        assert_eq!(config.connectors, vec!["stripe", "payme"]);
        assert_eq!(config.lanes, 3);
        assert_eq!(config.strategy, PartitionStrategy::RoundRobin);
        assert_eq!(config.services[0].max_retries, 3);
        assert_eq!(config.services[0].interval_ms, 10_000);
        assert_eq!(
            config.services[0].probe,
            ProbeSpec::Tcp {
                address: "localhost:6379".to_string()
            }
        );
        assert_eq!(config.command.timeout_secs, 600);
        assert_eq!(config.failure_marker, DEFAULT_FAILURE_MARKER);
        config.validate().expect("valid");
    }

    #[test]
    fn test_load_invalid_json() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("harness.json");
        std::fs::write(&path, "{ not json").expect("write");
        assert!(matches!(
            HarnessConfig::load(&path),
            Err(HarnessError::Json(_))
        ));
    }

    #[test]
    fn test_overrides_take_precedence() {
        let mut config = HarnessConfig {
            connectors: vec!["adyen".to_string()],
            ..HarnessConfig::default()
        };
        config.apply(Overrides {
            connectors: Some("stripe,payme nuvei".to_string()),
            lanes: Some(4),
            auth_file: Some(PathBuf::from("/tmp/auth.toml")),
            database_url: Some("postgres://localhost/db".to_string()),
            feature_flags: vec![("UI_TESTING".to_string(), "true".to_string())],
            ..Overrides::default()
        });

        assert_eq!(config.connectors, vec!["stripe", "payme", "nuvei"]);
        assert_eq!(config.lanes, 4);
        assert_eq!(config.env.auth_file, Some(PathBuf::from("/tmp/auth.toml")));
        assert_eq!(config.env.tests_file, None);
        assert_eq!(
            config.env.feature_flags.get("UI_TESTING").map(String::as_str),
            Some("true")
        );
    }

    #[test]
    fn test_validate_rejects_zero_lanes_and_empty_command() {
        let mut config = HarnessConfig {
            connectors: vec!["stripe".to_string()],
            lanes: 0,
            ..HarnessConfig::default()
        };
        assert!(config.validate().is_err());
        config.lanes = 1;
        config.command.program.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_parse_feature_flag() {
        assert_eq!(
            parse_feature_flag("UI_TESTING=1").expect("parse"),
            ("UI_TESTING".to_string(), "1".to_string())
        );
        assert!(parse_feature_flag("=1").is_err());
        assert!(parse_feature_flag("UI_TESTING").is_err());
    }
}
