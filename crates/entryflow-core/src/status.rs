//! Entry processing status as an explicit state machine.
//!
//! ```text
//!             claim                complete
//!  PENDING ----------> PROCESSING ----------> PROCESSED
//!     ^                  |    |
//!     |  defer / stale   |    | fail
//!     +------------------+    +-------------> ERROR
//!
//!  invalidation resets any status back to PENDING
//! ```
//!
//! The store never writes a status directly: it asks
//! [`EntryStatus::legal_sources`] which current statuses may move to the
//! target and restricts its `UPDATE` to those rows.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// Processing state of a node entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EntryStatus {
    Pending,
    Processing,
    Processed,
    Error,
}

/// Why an entry is moving to a new status. Invalidation is the only reason
/// that may leave a terminal status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionCause {
    /// Regular forward progress inside a processing pass.
    Processing,
    /// Upstream change or explicit invalidation.
    Invalidation,
}

impl EntryStatus {
    pub const ALL: [EntryStatus; 4] = [
        EntryStatus::Pending,
        EntryStatus::Processing,
        EntryStatus::Processed,
        EntryStatus::Error,
    ];

    /// The persisted representation.
    pub fn as_str(self) -> &'static str {
        match self {
            EntryStatus::Pending => "PENDING",
            EntryStatus::Processing => "PROCESSING",
            EntryStatus::Processed => "PROCESSED",
            EntryStatus::Error => "ERROR",
        }
    }

    /// Returns true if `self -> to` is allowed for the given cause.
    pub fn can_transition_to(self, to: EntryStatus, cause: TransitionCause) -> bool {
        use EntryStatus::*;
        match cause {
            TransitionCause::Invalidation => to == Pending,
            TransitionCause::Processing => matches!(
                (self, to),
                (Pending, Processing)
                    | (Processing, Processed)
                    | (Processing, Error)
                    | (Processing, Pending)
            ),
        }
    }

    /// Validates `self -> to`, returning the new status.
    pub fn transition(self, to: EntryStatus, cause: TransitionCause) -> Result<EntryStatus, CoreError> {
        if self.can_transition_to(to, cause) {
            Ok(to)
        } else {
            Err(CoreError::IllegalTransition { from: self, to })
        }
    }

    /// All statuses from which `to` is reachable in one step.
    pub fn legal_sources(to: EntryStatus, cause: TransitionCause) -> Vec<EntryStatus> {
        Self::ALL
            .into_iter()
            .filter(|from| from.can_transition_to(to, cause))
            .collect()
    }
}

impl fmt::Display for EntryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntryStatus {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(EntryStatus::Pending),
            "PROCESSING" => Ok(EntryStatus::Processing),
            "PROCESSED" => Ok(EntryStatus::Processed),
            "ERROR" => Ok(EntryStatus::Error),
            other => Err(CoreError::UnknownStatus {
                value: other.to_string(),
            }),
        }
    }
}
