//! Status and step enums shared by the engine and the host protocol.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle status of the test and of each phase.
///
/// Variants are ordered so the nominal chain compares meaningfully:
/// `Ready < Waiting < Starting < Running < Done`. `Aborted` and `Failed`
/// are terminal and sort after the nominal chain; guards should only use
/// ordering comparisons against nominal states.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize,
    Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    /// Configuration resolved, engine idle
    Ready,
    /// Nothing measured yet
    Waiting,
    /// Delay elapsed; progress is counting
    Starting,
    /// Grace period elapsed; samples are measured
    Running,
    /// Completed normally
    Done,
    /// Cancelled by the host
    Aborted,
    /// Stopped on an error
    Failed,
}

impl Status {
    /// Returns true for statuses a run can end in.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Status::Done | Status::Aborted | Status::Failed)
    }

    /// Returns true if this status has reached `other` on the nominal
    /// chain. Terminal failure statuses never count as progress.
    pub fn is_at_least(&self, other: Status) -> bool {
        !matches!(self, Status::Aborted | Status::Failed) && *self >= other
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Ready => "ready",
            Status::Waiting => "waiting",
            Status::Starting => "starting",
            Status::Running => "running",
            Status::Done => "done",
            Status::Aborted => "aborted",
            Status::Failed => "failed",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The measurement phases, in the order they run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Step {
    Ip,
    Latency,
    Download,
    Upload,
}

impl Step {
    pub const SEQUENCE: [Step; 4] =
        [Step::Ip, Step::Latency, Step::Download, Step::Upload];

    pub fn as_str(&self) -> &'static str {
        match self {
            Step::Ip => "ip",
            Step::Latency => "latency",
            Step::Download => "download",
            Step::Upload => "upload",
        }
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nominal_chain_is_ordered() {
        assert!(Status::Ready < Status::Waiting);
        assert!(Status::Waiting < Status::Starting);
        assert!(Status::Starting < Status::Running);
        assert!(Status::Running < Status::Done);
    }

    #[test]
    fn test_is_at_least_ignores_failure_statuses() {
        assert!(Status::Running.is_at_least(Status::Starting));
        assert!(Status::Done.is_at_least(Status::Running));
        assert!(!Status::Starting.is_at_least(Status::Running));
        assert!(!Status::Aborted.is_at_least(Status::Running));
        assert!(!Status::Failed.is_at_least(Status::Waiting));
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(Status::Done.is_terminal());
        assert!(Status::Aborted.is_terminal());
        assert!(Status::Failed.is_terminal());
        assert!(!Status::Running.is_terminal());
    }

    #[test]
    fn test_serialized_names() {
        assert_eq!(
            serde_json::to_string(&Status::Running).unwrap(),
            "\"running\""
        );
        assert_eq!(
            serde_json::to_string(&Step::Download).unwrap(),
            "\"download\""
        );
    }
}
