//! Job lifecycle state machine.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Lifecycle state of a training job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Stored but not yet handed to a provider.
    Created,
    /// The provider's `submit` call is in flight.
    Initializing,
    /// Accepted by the provider (or running in-process).
    Running,
    /// Local training loop suspended.
    Paused,
    /// Finished successfully.
    Completed,
    /// Finished with an error.
    Failed,
    /// Cancelled by a caller.
    Stopped,
}

impl JobState {
    /// Terminal states never transition again.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Stopped)
    }

    /// Checks if a job can move from `self` to `to`.
    #[must_use]
    #[allow(clippy::match_same_arms)] // Each arm is a distinct edge of the state machine
    pub const fn can_transition_to(self, to: Self) -> bool {
        match (self, to) {
            (Self::Created, Self::Initializing) => true,
            (Self::Initializing, Self::Running | Self::Failed) => true,
            (Self::Running, Self::Completed | Self::Failed | Self::Stopped | Self::Paused) => true,
            (Self::Paused, Self::Running | Self::Stopped | Self::Failed) => true,
            _ => false,
        }
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Initializing => "initializing",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Stopped => "stopped",
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "created" => Ok(Self::Created),
            "initializing" => Ok(Self::Initializing),
            "running" => Ok(Self::Running),
            "paused" => Ok(Self::Paused),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "stopped" => Ok(Self::Stopped),
            other => Err(format!("unknown job state: {other}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [JobState; 7] = [
        JobState::Created,
        JobState::Initializing,
        JobState::Running,
        JobState::Paused,
        JobState::Completed,
        JobState::Failed,
        JobState::Stopped,
    ];

    #[test]
    fn test_terminal_states_never_transition() {
        for from in ALL.iter().copied().filter(|s| s.is_terminal()) {
            for to in ALL {
                assert!(!from.can_transition_to(to), "{from} -> {to} must be rejected");
            }
        }
    }

    #[test]
    fn test_submission_path() {
        assert!(JobState::Created.can_transition_to(JobState::Initializing));
        assert!(JobState::Initializing.can_transition_to(JobState::Running));
        assert!(JobState::Initializing.can_transition_to(JobState::Failed));
        assert!(!JobState::Created.can_transition_to(JobState::Running));
        assert!(!JobState::Initializing.can_transition_to(JobState::Stopped));
    }

    #[test]
    fn test_pause_resume_edges() {
        assert!(JobState::Running.can_transition_to(JobState::Paused));
        assert!(JobState::Paused.can_transition_to(JobState::Running));
        assert!(JobState::Paused.can_transition_to(JobState::Stopped));
        assert!(!JobState::Paused.can_transition_to(JobState::Completed));
    }

    #[test]
    fn test_parse_roundtrip_display() {
        for state in ALL {
            assert_eq!(state.as_str().parse::<JobState>().unwrap(), state);
        }
        assert!("bogus".parse::<JobState>().is_err());
    }
}
