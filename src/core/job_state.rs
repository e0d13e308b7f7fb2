//! Job state management.
//!
//! This module defines the states a job can be in throughout its lifecycle.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use tracing::warn;

use crate::error::QueueError;

/// Represents the states a job can be in during its lifecycle.
///
/// ```text
/// delayed → pending → active → complete
///    ↑                   ↓
///    └──── (retry) ── failed
/// ```
///
/// Every state has a global and a per-type ordered collection in the store;
/// a saved job is a member of exactly one of each.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    /// Not yet eligible for processing
    Delayed,
    /// Eligible and waiting for a worker
    Pending,
    /// Claimed by a worker
    Active,
    /// Finished successfully
    Complete,
    /// Failed; may re-enter `Delayed` while attempts remain
    Failed,
}

impl JobState {
    /// All states, in lifecycle order.
    pub const ALL: [JobState; 5] = [
        JobState::Delayed,
        JobState::Pending,
        JobState::Active,
        JobState::Complete,
        JobState::Failed,
    ];

    /// Returns the name used for this state in store keys and records.
    pub fn name(&self) -> &'static str {
        match self {
            JobState::Delayed => "delayed",
            JobState::Pending => "pending",
            JobState::Active => "active",
            JobState::Complete => "complete",
            JobState::Failed => "failed",
        }
    }

    /// Checks if the state ends a processing attempt.
    pub fn is_final(&self) -> bool {
        matches!(self, JobState::Complete | JobState::Failed)
    }

    /// Parses a state name, substituting `Delayed` for anything unrecognized.
    ///
    /// Use [`FromStr`] when an unknown name should be an error instead.
    pub fn parse_or_delayed(name: &str) -> Self {
        name.parse().unwrap_or_else(|_| {
            warn!(
                "'{}' is not a valid job state, defaulting to '{}'",
                name,
                JobState::Delayed
            );
            JobState::Delayed
        })
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for JobState {
    type Err = QueueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobState::ALL
            .into_iter()
            .find(|state| state.name() == s)
            .ok_or_else(|| QueueError::InvalidJobData {
                message: format!("unknown job state '{}'", s),
            })
    }
}
