//! CI trigger filtering.
//!
//! Only manual dispatches, approved reviews and merge-queue events start a
//! run. Everything else is a no-op.

use serde::{Deserialize, Serialize};

/// The CI event that invoked the harness.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum TriggerEvent {
    WorkflowDispatch,
    PullRequestReview { state: Option<String> },
    MergeGroup,
    Other { name: String },
}

impl TriggerEvent {
    /// Build from a GitHub-style event name and optional review state.
    pub fn from_event(name: &str, review_state: Option<&str>) -> Self {
        match name.trim() {
            "workflow_dispatch" => Self::WorkflowDispatch,
            "pull_request_review" => Self::PullRequestReview {
                state: review_state.map(|s| s.trim().to_string()),
            },
            "merge_group" => Self::MergeGroup,
            other => Self::Other {
                name: other.to_string(),
            },
        }
    }

    /// Whether this event should start a run.
    pub fn should_run(&self) -> bool {
        match self {
            Self::WorkflowDispatch | Self::MergeGroup => true,
            Self::PullRequestReview { state } => state
                .as_deref()
                .is_some_and(|s| s.eq_ignore_ascii_case("approved")),
            Self::Other { .. } => false,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Self::WorkflowDispatch => "workflow_dispatch",
            Self::PullRequestReview { .. } => "pull_request_review",
            Self::MergeGroup => "merge_group",
            Self::Other { name } => name,
        }
    }
}

impl Default for TriggerEvent {
    /// Local invocations behave like a manual dispatch.
    fn default() -> Self {
        Self::WorkflowDispatch
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dispatch_and_merge_group_run() {
        assert!(TriggerEvent::from_event("workflow_dispatch", None).should_run());
        assert!(TriggerEvent::from_event("merge_group", None).should_run());
        assert!(TriggerEvent::default().should_run());
    }

    #[test]
    fn test_review_runs_only_when_approved() {
        assert!(TriggerEvent::from_event("pull_request_review", Some("APPROVED")).should_run());
        assert!(TriggerEvent::from_event("pull_request_review", Some("approved")).should_run());
        assert!(!TriggerEvent::from_event("pull_request_review", Some("commented")).should_run());
        assert!(!TriggerEvent::from_event("pull_request_review", Some("changes_requested"))
            .should_run());
        assert!(!TriggerEvent::from_event("pull_request_review", None).should_run());
    }

    #[test]
    fn test_other_events_are_noop() {
        let event = TriggerEvent::from_event("push", None);
        assert!(!event.should_run());
        assert_eq!(event.name(), "push");
        assert!(!TriggerEvent::from_event("pull_request", None).should_run());
    }
}
