//! Lane command and environment definitions.

use crate::matrix::ConnectorGroup;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Placeholder replaced by the comma-joined lane connectors.
pub const CONNECTORS_PLACEHOLDER: &str = "{connectors}";

/// Placeholder expanded to one `<connector>_ui::` test filter per connector.
pub const FILTER_PLACEHOLDER: &str = "{filter}";

/// Placeholder replaced by the lane index.
pub const LANE_PLACEHOLDER: &str = "{lane}";

/// The external test command run once per lane.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LaneCommand {
    /// Argument vector; first element is the executable.
    pub program: Vec<String>,

    /// Working directory for the child process.
    #[serde(default)]
    pub working_dir: Option<PathBuf>,

    /// Per-lane timeout in seconds (0 = none).
    #[serde(default)]
    pub timeout_secs: u64,
}

impl LaneCommand {
    pub fn new(program: Vec<String>) -> Self {
        Self {
            program,
            working_dir: None,
            timeout_secs: 0,
        }
    }

    /// `cargo test` over the connector UI test target, one test thread.
    pub fn cargo_ui_tests() -> Self {
        Self::new(
            [
                "cargo",
                "test",
                "--package",
                "test_utils",
                "--test",
                "connectors",
                "--",
                FILTER_PLACEHOLDER,
                "--test-threads=1",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
        )
    }

    pub fn with_timeout(mut self, timeout_secs: u64) -> Self {
        self.timeout_secs = timeout_secs;
        self
    }

    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn executable(&self) -> Option<&str> {
        self.program.first().map(String::as_str)
    }

    /// Substitute lane placeholders into the argument vector.
    ///
    /// A `{filter}` argument expands into one argument per connector; the
    /// other placeholders are replaced inside arguments.
    pub fn render(&self, group: &ConnectorGroup) -> Vec<String> {
        let joined = group.joined();
        let lane = group.lane.to_string();

        let mut out = Vec::with_capacity(self.program.len() + group.len());
        for arg in &self.program {
            if arg == FILTER_PLACEHOLDER {
                out.extend(group.connectors().iter().map(|c| format!("{}_ui::", c)));
                continue;
            }
            out.push(
                arg.replace(CONNECTORS_PLACEHOLDER, &joined)
                    .replace(LANE_PLACEHOLDER, &lane),
            );
        }
        out
    }
}

impl Default for LaneCommand {
    fn default() -> Self {
        Self::cargo_ui_tests()
    }
}

/// Environment shared by every lane.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct LaneEnvironment {
    /// Decrypted connector credentials.
    #[serde(default)]
    pub auth_file: Option<PathBuf>,

    /// Test case definitions.
    #[serde(default)]
    pub tests_file: Option<PathBuf>,

    #[serde(default)]
    pub database_url: Option<String>,

    /// Extra variables (feature toggles, browser selection, ...).
    #[serde(default)]
    pub feature_flags: BTreeMap<String, String>,
}

impl LaneEnvironment {
    /// Variables exported to the child process of `group`'s lane.
    pub fn vars_for(&self, group: &ConnectorGroup) -> Vec<(String, String)> {
        let mut vars = Vec::new();
        if let Some(path) = &self.auth_file {
            vars.push((
                "CONNECTOR_AUTH_FILE_PATH".to_string(),
                path.to_string_lossy().into_owned(),
            ));
        }
        if let Some(path) = &self.tests_file {
            vars.push((
                "CONNECTOR_TESTS_FILE_PATH".to_string(),
                path.to_string_lossy().into_owned(),
            ));
        }
        if let Some(url) = &self.database_url {
            vars.push(("DATABASE_URL".to_string(), url.clone()));
        }
        for (key, value) in &self.feature_flags {
            vars.push((key.clone(), value.clone()));
        }
        vars.push(("SANITY_LANE".to_string(), group.lane.to_string()));
        vars.push(("SANITY_CONNECTORS".to_string(), group.joined()));
        vars
    }
}
