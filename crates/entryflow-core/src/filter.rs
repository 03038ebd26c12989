//! Filter predicates and outcomes.
//!
//! A predicate tests one top-level field of an entry payload (or a dotted
//! path into it) against a string value. Predicates on a filter node are
//! combined with AND. They are evaluated by the store in a single SQL
//! statement, so a predicate only carries data; the SQL rendering lives next
//! to the query in `entryflow-storage`.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// Comparison applied to the textual value of the field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterComparator {
    Equals,
    NotEquals,
    /// Case-sensitive substring match.
    Contains,
    NotContains,
    /// SQL `LIKE` pattern (`%` and `_` wildcards, ASCII case-insensitive).
    Like,
    NotLike,
}

/// One filter condition: `field <comparator> value`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FilterPredicate {
    /// Payload field, e.g. `content`, `output`, or `metadata.source`.
    pub field: String,
    pub comparator: FilterComparator,
    pub value: String,
}

impl FilterPredicate {
    pub fn new(field: impl Into<String>, comparator: FilterComparator, value: impl Into<String>) -> Self {
        FilterPredicate {
            field: field.into(),
            comparator,
            value: value.into(),
        }
    }

    /// Field names are dotted identifiers; anything else is rejected before
    /// it reaches the store.
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.field.is_empty() {
            return Err(CoreError::InvalidFilter {
                reason: "field must not be empty".to_string(),
            });
        }
        let valid_segment = |segment: &str| {
            !segment.is_empty()
                && segment
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        };
        if !self.field.split('.').all(valid_segment) {
            return Err(CoreError::InvalidFilter {
                reason: format!("invalid field path '{}'", self.field),
            });
        }
        Ok(())
    }

    /// SQLite JSON path for the field.
    pub fn json_path(&self) -> String {
        format!("$.{}", self.field)
    }
}

/// Result of running an entry through a filter node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FilterOutcome {
    Passed,
    Failed,
}

impl FilterOutcome {
    /// The persisted representation.
    pub fn as_str(self) -> &'static str {
        match self {
            FilterOutcome::Passed => "PASSED",
            FilterOutcome::Failed => "FAILED",
        }
    }

    /// Label of the node output this outcome is routed to.
    pub fn output_label(self) -> &'static str {
        match self {
            FilterOutcome::Passed => crate::node::labels::PASSED,
            FilterOutcome::Failed => crate::node::labels::FAILED,
        }
    }
}

impl fmt::Display for FilterOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FilterOutcome {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PASSED" => Ok(FilterOutcome::Passed),
            "FAILED" => Ok(FilterOutcome::Failed),
            other => Err(CoreError::UnknownOutcome {
                value: other.to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_dotted_identifiers() {
        FilterPredicate::new("content", FilterComparator::Contains, "X")
            .validate()
            .unwrap();
        FilterPredicate::new("metadata.source_id", FilterComparator::Equals, "a")
            .validate()
            .unwrap();
    }

    #[test]
    fn rejects_path_injection() {
        for field in ["", "a..b", "content') OR 1=1 --", "$.content", "a b"] {
            let pred = FilterPredicate::new(field, FilterComparator::Equals, "x");
            assert!(pred.validate().is_err(), "field {:?} should be rejected", field);
        }
    }

    #[test]
    fn json_path_prefixes_root() {
        let pred = FilterPredicate::new("metadata.source", FilterComparator::Like, "%a%");
        assert_eq!(pred.json_path(), "$.metadata.source");
    }

    #[test]
    fn outcome_routes_to_output_labels() {
        assert_eq!(FilterOutcome::Passed.output_label(), "Passed");
        assert_eq!(FilterOutcome::Failed.output_label(), "Failed");
        assert_eq!("PASSED".parse::<FilterOutcome>().unwrap(), FilterOutcome::Passed);
        assert!("MAYBE".parse::<FilterOutcome>().is_err());
    }

    #[test]
    fn comparator_serde_names() {
        let json = serde_json::to_string(&FilterComparator::NotContains).unwrap();
        assert_eq!(json, "\"not_contains\"");
    }
}
