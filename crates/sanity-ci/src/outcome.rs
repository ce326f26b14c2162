//! Per-test outcomes parsed from libtest output.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;

/// Status of a single test case.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TestStatus {
    Passed,
    Failed,
}

/// One executed test case.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TestOutcome {
    pub name: String,
    pub status: TestStatus,
    pub duration_ms: u64,
}

impl TestOutcome {
    pub fn passed(&self) -> bool {
        self.status == TestStatus::Passed
    }
}

/// A recognised libtest result line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResultLine {
    Outcome { name: String, status: TestStatus },
    Ignored { name: String },
}

fn result_line_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^test (\S.*?) \.\.\. (ok|FAILED|ignored)\b").expect("valid result line regex")
    })
}

/// Parse a `test <name> ... ok|FAILED|ignored` line.
pub fn parse_result_line(line: &str) -> Option<ResultLine> {
    let caps = result_line_regex().captures(line.trim_end())?;
    let name = caps[1].to_string();
    match &caps[2] {
        "ok" => Some(ResultLine::Outcome {
            name,
            status: TestStatus::Passed,
        }),
        "FAILED" => Some(ResultLine::Outcome {
            name,
            status: TestStatus::Failed,
        }),
        _ => Some(ResultLine::Ignored { name }),
    }
}
