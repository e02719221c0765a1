//! Run lifecycle status and its wire encoding.
//!
//! The router and every site exchange statuses as bare integers `0..=8`.
//! The numeric values are part of the protocol and must never be reordered.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Raised when a status code or name does not map to a known lifecycle state.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StatusCodeError {
    #[error("Unknown run status code {0}")]
    UnknownCode(u8),

    #[error("Unknown run status '{0}'")]
    UnknownName(String),
}

/// Lifecycle state of a run at one site.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
#[serde(try_from = "u8", into = "u8")]
pub enum RunStatus {
    /// Terminal: the run failed at this site or across the batch
    Failed = 0,
    /// Local failure recorded, diagnostics not yet uploaded
    PendingFailed = 1,
    /// Waiting to validate the current round
    #[default]
    Standby = 2,
    /// Validated, waiting for every site to be ready
    Preparing = 3,
    /// Executing the current round's work
    Running = 4,
    /// Work done, results not yet uploaded
    PendingSuccess = 5,
    /// Results uploaded, waiting for the coordinator to gather them
    PendingAggregating = 6,
    /// Coordinator is combining the round's results
    Aggregating = 7,
    /// Terminal: every round of every step completed
    Success = 8,
}

impl RunStatus {
    /// Every status in code order.
    pub const ALL: [RunStatus; 9] = [
        RunStatus::Failed,
        RunStatus::PendingFailed,
        RunStatus::Standby,
        RunStatus::Preparing,
        RunStatus::Running,
        RunStatus::PendingSuccess,
        RunStatus::PendingAggregating,
        RunStatus::Aggregating,
        RunStatus::Success,
    ];

    /// Integer code used on the wire.
    pub fn code(self) -> u8 {
        self as u8
    }

    pub fn from_code(code: u8) -> Result<Self, StatusCodeError> {
        Self::ALL
            .get(code as usize)
            .copied()
            .ok_or(StatusCodeError::UnknownCode(code))
    }

    /// snake_case name, as used in logs and on the command line.
    pub fn name(self) -> &'static str {
        match self {
            RunStatus::Failed => "failed",
            RunStatus::PendingFailed => "pending_failed",
            RunStatus::Standby => "standby",
            RunStatus::Preparing => "preparing",
            RunStatus::Running => "running",
            RunStatus::PendingSuccess => "pending_success",
            RunStatus::PendingAggregating => "pending_aggregating",
            RunStatus::Aggregating => "aggregating",
            RunStatus::Success => "success",
        }
    }

    /// No outgoing transitions are issued from a terminal status.
    pub fn is_terminal(self) -> bool {
        matches!(self, RunStatus::Failed | RunStatus::Success)
    }

    /// True for the two statuses that block a coordinator from proceeding.
    pub fn is_failure(self) -> bool {
        matches!(self, RunStatus::Failed | RunStatus::PendingFailed)
    }

    /// Statuses in which a coordinator waits on its siblings.
    pub fn is_coordinator_wait(self) -> bool {
        matches!(
            self,
            RunStatus::Preparing | RunStatus::PendingAggregating | RunStatus::Aggregating
        )
    }
}

impl TryFrom<u8> for RunStatus {
    type Error = StatusCodeError;

    fn try_from(code: u8) -> Result<Self, Self::Error> {
        Self::from_code(code)
    }
}

impl From<RunStatus> for u8 {
    fn from(status: RunStatus) -> Self {
        status.code()
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl std::str::FromStr for RunStatus {
    type Err = StatusCodeError;

    /// Accepts either the snake_case name or the numeric code.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if let Ok(code) = trimmed.parse::<u8>() {
            return Self::from_code(code);
        }
        let lowered = trimmed.to_lowercase().replace(['-', ' '], "_");
        Self::ALL
            .iter()
            .copied()
            .find(|status| status.name() == lowered)
            .ok_or_else(|| StatusCodeError::UnknownName(s.to_string()))
    }
}
