//! Job definition and persisted record schema.
//!
//! This module contains the [`Job`] struct: the field set of a unit of work,
//! its priority scale, and the fixed rules used to turn it into a store hash
//! and back. Store-facing operations (save, state transitions, removal) live
//! on [`JobHandle`](crate::queue::JobHandle), which wraps a `Job`.
//!
//! ## Examples
//!
//! ### Creating a job
//! ```rust
//! use prioq::{Job, Priority};
//! use serde_json::json;
//!
//! let mut job = Job::new("email", json!(["user@example.com"]));
//! job.set_priority(Priority::HIGH.value() as i64);
//! job.set_max_attempts(3);
//!
//! assert!(job.id.is_none());
//! assert_eq!(job.priority, Priority::HIGH);
//! ```
//!
//! ### Record round trip
//! ```rust
//! use prioq::Job;
//! use serde_json::json;
//! use std::collections::HashMap;
//!
//! let mut job = Job::new("report", json!({"month": 4}));
//! job.id = Some(7);
//!
//! let record: HashMap<String, String> = job
//!     .to_fields()
//!     .into_iter()
//!     .map(|(k, v)| (k.to_string(), v))
//!     .collect();
//! let restored = Job::from_fields(7, &record).unwrap();
//! assert_eq!(job, restored);
//! ```

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use tracing::warn;

use crate::core::JobState;
use crate::error::{QueueError, Result};

/// Store-assigned job identifier.
pub type JobId = u64;

/// Field names of the persisted job hash.
pub mod fields {
    pub const ID: &str = "id";
    pub const TYPE: &str = "type";
    pub const DATA: &str = "data";
    pub const RESULT: &str = "result";
    pub const PRIORITY: &str = "priority";
    pub const STATE: &str = "state";
    pub const CREATED: &str = "created";
    pub const FINISHED: &str = "finished";
    pub const REMOVE_ON_COMPLETE: &str = "removeOnComplete";
    pub const WORKER_ID: &str = "workerId";
    pub const ATTEMPTS: &str = "attempts";
    pub const MAX_ATTEMPTS: &str = "maxAttempts";
    pub const TIMEOUT: &str = "timeout";
    pub const DELAY: &str = "delay";
}

/// Job priority on a fixed 1–5 scale; higher is more urgent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub struct Priority(u8);

impl Priority {
    pub const NONE: Priority = Priority(1);
    pub const LOW: Priority = Priority(2);
    pub const NORMAL: Priority = Priority(3);
    pub const MEDIUM: Priority = Priority(4);
    pub const HIGH: Priority = Priority(5);

    /// Clips an arbitrary level into the 1–5 range.
    pub fn clamp(level: i64) -> Self {
        Priority(level.clamp(1, 5) as u8)
    }

    /// Resolves a named priority, falling back to `normal` for unknown names.
    pub fn from_name(name: &str) -> Self {
        match name {
            "high" => Priority::HIGH,
            "medium" => Priority::MEDIUM,
            "normal" => Priority::NORMAL,
            "low" => Priority::LOW,
            "none" => Priority::NONE,
            _ => Priority::NORMAL,
        }
    }

    /// The numeric level, always in 1–5.
    pub fn value(self) -> u8 {
        self.0
    }

    /// The score used in the store's ordered collections.
    pub fn score(self) -> f64 {
        f64::from(self.0)
    }
}

impl Default for Priority {
    fn default() -> Self {
        Priority::NORMAL
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl TryFrom<u8> for Priority {
    type Error = QueueError;

    fn try_from(value: u8) -> Result<Self> {
        if (1..=5).contains(&value) {
            Ok(Priority(value))
        } else {
            Err(QueueError::InvalidJobData {
                message: format!("priority {} outside range 1-5", value),
            })
        }
    }
}

impl From<Priority> for u8 {
    fn from(priority: Priority) -> Self {
        priority.0
    }
}

/// Input accepted by [`Job::set_priority`]: a numeric level or a name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PriorityInput {
    Level(i64),
    Name(String),
}

impl From<i64> for PriorityInput {
    fn from(level: i64) -> Self {
        PriorityInput::Level(level)
    }
}

impl From<i32> for PriorityInput {
    fn from(level: i32) -> Self {
        PriorityInput::Level(level.into())
    }
}

impl From<Priority> for PriorityInput {
    fn from(priority: Priority) -> Self {
        PriorityInput::Level(priority.value().into())
    }
}

impl From<&str> for PriorityInput {
    fn from(name: &str) -> Self {
        PriorityInput::Name(name.to_string())
    }
}

impl From<String> for PriorityInput {
    fn from(name: String) -> Self {
        PriorityInput::Name(name)
    }
}

/// Settings applied to jobs created through a queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobDefaults {
    pub priority: Priority,
    pub remove_on_complete: bool,
    pub max_attempts: u32,
    /// Retry delay in milliseconds
    pub timeout: u64,
}

impl Default for JobDefaults {
    fn default() -> Self {
        Self {
            priority: Priority::NORMAL,
            remove_on_complete: true,
            max_attempts: 1,
            timeout: 1000,
        }
    }
}

/// A unit of work and everything persisted about it.
///
/// `Job` is also the snapshot view of a job: serializing it yields every
/// field, and reloading a saved job from the store reproduces the same value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    /// Store-assigned id; `None` until the first save
    pub id: Option<JobId>,
    /// Groups jobs for worker affinity
    #[serde(rename = "type")]
    pub job_type: String,
    /// Application payload
    pub data: Value,
    /// Set on completion
    pub result: Value,
    pub priority: Priority,
    pub state: JobState,
    pub created: DateTime<Utc>,
    pub finished: Option<DateTime<Utc>>,
    /// Delete the job as soon as it completes
    pub remove_on_complete: bool,
    /// Identity of the last worker to hold the job
    pub worker_id: Option<String>,
    pub attempts: u32,
    pub max_attempts: u32,
    /// Retry delay in milliseconds
    pub timeout: u64,
    /// Milliseconds before the job becomes eligible
    pub delay: u64,
}

impl Job {
    /// Creates an unsaved job with default settings.
    pub fn new(job_type: impl Into<String>, data: Value) -> Self {
        Self::with_defaults(job_type, data, &JobDefaults::default())
    }

    /// Creates an unsaved job using the given defaults.
    pub fn with_defaults(job_type: impl Into<String>, data: Value, defaults: &JobDefaults) -> Self {
        Self {
            id: None,
            job_type: job_type.into(),
            data,
            result: Value::Object(Default::default()),
            priority: defaults.priority,
            state: JobState::Pending,
            created: now(),
            finished: None,
            remove_on_complete: defaults.remove_on_complete,
            worker_id: None,
            attempts: 0,
            max_attempts: defaults.max_attempts.max(1),
            timeout: defaults.timeout,
            delay: 0,
        }
    }

    /// Sets the priority from a level or a name and returns the stored value.
    ///
    /// Levels outside 1–5 are clipped; unknown names resolve to `normal`.
    /// Either substitution is logged as a warning.
    pub fn set_priority(&mut self, input: impl Into<PriorityInput>) -> Priority {
        let input = input.into();
        let priority = match &input {
            PriorityInput::Level(level) => {
                let clipped = Priority::clamp(*level);
                if i64::from(clipped.value()) != *level {
                    warn!(
                        "Priority was clipped for job {:?}, outside range 1-5 ({})",
                        self.id, level
                    );
                }
                clipped
            }
            PriorityInput::Name(name) => {
                let resolved = Priority::from_name(name);
                if resolved == Priority::NORMAL && name != "normal" {
                    warn!(
                        "Unknown priority '{}' for job {:?}, using normal",
                        name, self.id
                    );
                }
                resolved
            }
        };
        self.priority = priority;
        priority
    }

    /// Sets the retry delay in milliseconds.
    pub fn set_timeout(&mut self, timeout_ms: u64) -> &mut Self {
        self.timeout = timeout_ms;
        self
    }

    /// Sets the total number of attempts; at least one attempt is always made.
    pub fn set_max_attempts(&mut self, max_attempts: u32) -> &mut Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    /// Sets the delay in milliseconds before the job becomes eligible.
    pub fn set_delay(&mut self, delay_ms: u64) -> &mut Self {
        self.delay = delay_ms;
        self
    }

    pub fn set_remove_on_complete(&mut self, remove: bool) -> &mut Self {
        self.remove_on_complete = remove;
        self
    }

    /// Whether a failed attempt can still be retried.
    pub fn has_attempts_left(&self) -> bool {
        self.attempts < self.max_attempts
    }

    /// Returns the id, or [`QueueError::Unsaved`] for a job that was never saved.
    pub fn require_id(&self) -> Result<JobId> {
        self.id.ok_or(QueueError::Unsaved)
    }

    /// Encodes every field as a store hash entry.
    pub fn to_fields(&self) -> Vec<(&'static str, String)> {
        let mut out = self.immutable_fields();
        out.extend(self.mutable_fields());
        out.push((fields::STATE, self.state.name().to_string()));
        out.push((fields::RESULT, self.result.to_string()));
        out.push((fields::ATTEMPTS, self.attempts.to_string()));
        if let Some(finished) = self.finished {
            out.push((fields::FINISHED, finished.timestamp_millis().to_string()));
        }
        if let Some(worker_id) = &self.worker_id {
            out.push((fields::WORKER_ID, worker_id.clone()));
        }
        out
    }

    /// Fields written once, when the job first receives its id.
    pub(crate) fn immutable_fields(&self) -> Vec<(&'static str, String)> {
        let mut out = vec![
            (fields::MAX_ATTEMPTS, self.max_attempts.to_string()),
            (fields::TYPE, self.job_type.clone()),
            (fields::CREATED, self.created.timestamp_millis().to_string()),
        ];
        if let Some(id) = self.id {
            out.push((fields::ID, id.to_string()));
        }
        out
    }

    /// Fields rewritten by every `apply`.
    pub(crate) fn mutable_fields(&self) -> Vec<(&'static str, String)> {
        vec![
            (fields::DELAY, self.delay.to_string()),
            (fields::TIMEOUT, self.timeout.to_string()),
            (fields::PRIORITY, self.priority.to_string()),
            (
                fields::REMOVE_ON_COMPLETE,
                self.remove_on_complete.to_string(),
            ),
            (fields::DATA, self.data.to_string()),
        ]
    }

    /// Decodes a job from its store hash.
    ///
    /// An empty record is [`QueueError::JobNotFound`], a record without a type
    /// is [`QueueError::HalfBaked`]. A missing state or creation time, or any
    /// field that does not follow its decode rule, is
    /// [`QueueError::InvalidJobData`].
    pub fn from_fields(id: JobId, record: &HashMap<String, String>) -> Result<Self> {
        if record.is_empty() {
            return Err(QueueError::JobNotFound { job_id: id });
        }
        let job_type = match record.get(fields::TYPE) {
            Some(t) if !t.is_empty() => t.clone(),
            _ => return Err(QueueError::HalfBaked { job_id: id }),
        };
        if let Some(stored) = record.get(fields::ID) {
            let stored: JobId = parse_field(fields::ID, stored)?;
            if stored != id {
                return Err(QueueError::InvalidJobData {
                    message: format!("record for job {} carries id {}", id, stored),
                });
            }
        }

        let defaults = JobDefaults::default();
        let priority = match record.get(fields::PRIORITY) {
            Some(raw) => Priority::clamp(parse_field(fields::PRIORITY, raw)?),
            None => defaults.priority,
        };
        let state = match record.get(fields::STATE) {
            Some(raw) => raw.parse()?,
            None => return Err(missing(fields::STATE)),
        };
        let created = match record.get(fields::CREATED) {
            Some(raw) => parse_timestamp(fields::CREATED, raw)?,
            None => return Err(missing(fields::CREATED)),
        };
        let finished = record
            .get(fields::FINISHED)
            .map(|raw| parse_timestamp(fields::FINISHED, raw))
            .transpose()?;
        let remove_on_complete = match record.get(fields::REMOVE_ON_COMPLETE) {
            Some(raw) => parse_bool(fields::REMOVE_ON_COMPLETE, raw)?,
            None => defaults.remove_on_complete,
        };

        Ok(Self {
            id: Some(id),
            job_type,
            data: parse_json(record, fields::DATA, Value::Object(Default::default()))?,
            result: parse_json(record, fields::RESULT, Value::Object(Default::default()))?,
            priority,
            state,
            created,
            finished,
            remove_on_complete,
            worker_id: record.get(fields::WORKER_ID).cloned(),
            attempts: parse_or(record, fields::ATTEMPTS, 0)?,
            max_attempts: parse_or(record, fields::MAX_ATTEMPTS, defaults.max_attempts)?,
            timeout: parse_or(record, fields::TIMEOUT, defaults.timeout)?,
            delay: parse_or(record, fields::DELAY, 0)?,
        })
    }
}

/// Parses a job id the way it arrives from callers and index entries.
pub fn parse_job_id(raw: &str) -> Result<JobId> {
    raw.trim()
        .parse::<JobId>()
        .ok()
        .filter(|id| *id > 0)
        .ok_or_else(|| QueueError::InvalidJobId {
            value: raw.to_string(),
        })
}

/// Current time truncated to the millisecond precision the store keeps.
pub(crate) fn now() -> DateTime<Utc> {
    from_millis(Utc::now().timestamp_millis()).unwrap_or_else(Utc::now)
}

fn from_millis(ms: i64) -> Option<DateTime<Utc>> {
    Utc.timestamp_millis_opt(ms).single()
}

fn invalid(field: &str, raw: &str) -> QueueError {
    QueueError::InvalidJobData {
        message: format!("field '{}' has malformed value '{}'", field, raw),
    }
}

fn missing(field: &str) -> QueueError {
    QueueError::InvalidJobData {
        message: format!("field '{}' is missing", field),
    }
}

fn parse_field<T: FromStr>(field: &str, raw: &str) -> Result<T> {
    raw.parse().map_err(|_| invalid(field, raw))
}

fn parse_or<T: FromStr>(record: &HashMap<String, String>, field: &str, default: T) -> Result<T> {
    match record.get(field) {
        Some(raw) => parse_field(field, raw),
        None => Ok(default),
    }
}

fn parse_bool(field: &str, raw: &str) -> Result<bool> {
    match raw {
        "true" => Ok(true),
        "false" => Ok(false),
        _ => Err(invalid(field, raw)),
    }
}

fn parse_timestamp(field: &str, raw: &str) -> Result<DateTime<Utc>> {
    let ms: i64 = parse_field(field, raw)?;
    from_millis(ms).ok_or_else(|| invalid(field, raw))
}

fn parse_json(record: &HashMap<String, String>, field: &str, default: Value) -> Result<Value> {
    match record.get(field) {
        Some(raw) => serde_json::from_str(raw).map_err(|_| invalid(field, raw)),
        None => Ok(default),
    }
}
