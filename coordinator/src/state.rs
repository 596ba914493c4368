//! Service lifecycle state.

use serde::Serialize;

/// Coordinator operational state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CoordinatorState {
    /// Coordinator is starting up.
    Starting,
    /// Coordinator is running and accepting requests.
    Running,
    /// Coordinator is shutting down, not accepting new requests.
    ShuttingDown,
    /// Coordinator is stopped.
    Stopped,
}

impl CoordinatorState {
    /// Check if the coordinator is accepting new requests.
    pub fn accepts_requests(&self) -> bool {
        matches!(self, CoordinatorState::Running)
    }

    /// Check if the coordinator is in a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, CoordinatorState::Stopped)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CoordinatorState::Starting => "starting",
            CoordinatorState::Running => "running",
            CoordinatorState::ShuttingDown => "shutting_down",
            CoordinatorState::Stopped => "stopped",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_running_accepts_requests() {
        assert!(CoordinatorState::Running.accepts_requests());
        assert!(!CoordinatorState::Starting.accepts_requests());
        assert!(!CoordinatorState::ShuttingDown.accepts_requests());
        assert!(CoordinatorState::Stopped.is_terminal());
    }
}
