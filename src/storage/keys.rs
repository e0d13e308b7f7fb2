//! Namespaced key scheme shared by every process using the same store.

use crate::core::{JobId, JobState};

/// Builds store keys under a common prefix.
///
/// ```rust
/// use prioq::storage::KeySpace;
/// use prioq::JobState;
///
/// let keys = KeySpace::new("prioq");
/// assert_eq!(keys.job(7), "prioq:job:7");
/// assert_eq!(keys.type_state("email", JobState::Pending), "prioq:jobs:email:pending");
/// assert_eq!(keys.notify("email"), "prioq:email:jobs");
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeySpace {
    prefix: String,
}

impl KeySpace {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    fn key(&self, suffix: &str) -> String {
        format!("{}:{}", self.prefix, suffix)
    }

    /// Hash holding a job record
    pub fn job(&self, id: JobId) -> String {
        self.key(&format!("job:{}", id))
    }

    /// Ordered collection of every job, scored by priority
    pub fn all_jobs(&self) -> String {
        self.key("jobs")
    }

    /// Global ordered collection for one state
    pub fn state(&self, state: JobState) -> String {
        self.key(&format!("jobs:{}", state.name()))
    }

    /// Per-type ordered collection for one state
    pub fn type_state(&self, job_type: &str, state: JobState) -> String {
        self.key(&format!("jobs:{}:{}", job_type, state.name()))
    }

    /// Blocking notification list for one type
    pub fn notify(&self, job_type: &str) -> String {
        self.key(&format!("{}:jobs", job_type))
    }

    /// Monotonic id counter
    pub fn ids(&self) -> String {
        self.key("ids")
    }

    /// Set of known job types
    pub fn types(&self) -> String {
        self.key("job:types")
    }

    /// Pub/sub channel for lifecycle events
    pub fn events(&self) -> String {
        self.key("events")
    }

    /// Delayed jobs scored by the time they become due, in milliseconds
    pub fn delayed_due(&self) -> String {
        self.key("jobs:delayed:due")
    }

    /// Key guarding a distributed lock
    pub fn lock(&self, name: &str) -> String {
        self.key(&format!("{}:lock", name))
    }
}

impl Default for KeySpace {
    fn default() -> Self {
        Self::new("prioq")
    }
}
