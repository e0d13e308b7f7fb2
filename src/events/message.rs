//! Wire format and typed lifecycle events.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

use crate::core::JobId;
use crate::error::{QueueError, Result};

/// Message published on the shared events channel.
///
/// `args` starts with the event name and is followed by the event's own
/// arguments, so `{"id":3,"event":"complete","args":["complete","a b"]}`
/// carries a `complete` event with result `"a b"` for job 3.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventMessage {
    pub id: JobId,
    pub event: String,
    pub args: Vec<Value>,
}

impl EventMessage {
    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn decode(payload: &str) -> Result<Self> {
        Ok(serde_json::from_str(payload)?)
    }

    /// Arguments after the leading event name
    fn payload_args(&self) -> &[Value] {
        match self.args.first() {
            Some(Value::String(name)) if *name == self.event => &self.args[1..],
            _ => &self.args,
        }
    }
}

/// Lifecycle event of a single job.
#[derive(Debug, Clone, PartialEq)]
pub enum JobEvent {
    /// The job became pending
    Enqueue { job_type: String },
    /// A worker claimed the job
    Start { job_type: String },
    Complete { result: Value },
    /// The job failed and has no attempts left
    Failed { error: String },
    /// The job failed and will be retried
    FailedAttempt { error: String, attempts: u32 },
    Remove { job_type: String },
    Error { message: String },
}

impl JobEvent {
    pub const ENQUEUE: &'static str = "enqueue";
    pub const START: &'static str = "start";
    pub const COMPLETE: &'static str = "complete";
    pub const FAILED: &'static str = "failed";
    pub const FAILED_ATTEMPT: &'static str = "failed attempt";
    pub const REMOVE: &'static str = "remove";
    pub const ERROR: &'static str = "error";

    pub fn name(&self) -> &'static str {
        match self {
            JobEvent::Enqueue { .. } => Self::ENQUEUE,
            JobEvent::Start { .. } => Self::START,
            JobEvent::Complete { .. } => Self::COMPLETE,
            JobEvent::Failed { .. } => Self::FAILED,
            JobEvent::FailedAttempt { .. } => Self::FAILED_ATTEMPT,
            JobEvent::Remove { .. } => Self::REMOVE,
            JobEvent::Error { .. } => Self::ERROR,
        }
    }

    /// `complete` and `failed` end a job's event stream.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobEvent::Complete { .. } | JobEvent::Failed { .. })
    }

    fn args(&self) -> Vec<Value> {
        match self {
            JobEvent::Enqueue { job_type }
            | JobEvent::Start { job_type }
            | JobEvent::Remove { job_type } => vec![Value::from(job_type.as_str())],
            JobEvent::Complete { result } => vec![result.clone()],
            JobEvent::Failed { error } => vec![Value::from(error.as_str())],
            JobEvent::FailedAttempt { error, attempts } => {
                vec![Value::from(error.as_str()), Value::from(*attempts)]
            }
            JobEvent::Error { message } => vec![Value::from(message.as_str())],
        }
    }

    /// Wraps the event for publication.
    pub fn to_message(&self, id: JobId) -> EventMessage {
        let mut args = vec![Value::from(self.name())];
        args.extend(self.args());
        EventMessage {
            id,
            event: self.name().to_string(),
            args,
        }
    }

    /// Decodes the event carried by a message.
    pub fn from_message(message: &EventMessage) -> Result<Self> {
        let args = message.payload_args();
        let text = |index: usize| -> Result<String> {
            match args.get(index) {
                Some(Value::String(s)) => Ok(s.clone()),
                Some(other) => Ok(other.to_string()),
                None => Err(QueueError::InvalidJobData {
                    message: format!(
                        "event '{}' for job {} is missing argument {}",
                        message.event, message.id, index
                    ),
                }),
            }
        };

        let event = match message.event.as_str() {
            Self::ENQUEUE => JobEvent::Enqueue { job_type: text(0)? },
            Self::START => JobEvent::Start { job_type: text(0)? },
            Self::COMPLETE => JobEvent::Complete {
                result: args.first().cloned().unwrap_or(Value::Null),
            },
            Self::FAILED => JobEvent::Failed { error: text(0)? },
            Self::FAILED_ATTEMPT => JobEvent::FailedAttempt {
                error: text(0)?,
                attempts: args
                    .get(1)
                    .and_then(Value::as_u64)
                    .map(|n| n.min(u64::from(u32::MAX)) as u32)
                    .unwrap_or_default(),
            },
            Self::REMOVE => JobEvent::Remove { job_type: text(0)? },
            Self::ERROR => JobEvent::Error { message: text(0)? },
            other => {
                return Err(QueueError::InvalidJobData {
                    message: format!("unknown event '{}' for job {}", other, message.id),
                })
            }
        };
        Ok(event)
    }
}

impl fmt::Display for JobEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Event observed at the queue level.
#[derive(Debug, Clone, PartialEq)]
pub enum QueueEvent {
    /// A job event, named `job <event>` on the queue
    Job { id: JobId, event: JobEvent },
    /// An error not tied to a particular job
    Error { message: String },
}

impl QueueEvent {
    /// `job complete`, `job failed attempt`, `error`, ...
    pub fn name(&self) -> String {
        match self {
            QueueEvent::Job { event, .. } => format!("job {}", event.name()),
            QueueEvent::Error { .. } => JobEvent::ERROR.to_string(),
        }
    }

    pub fn job_id(&self) -> Option<JobId> {
        match self {
            QueueEvent::Job { id, .. } => Some(*id),
            QueueEvent::Error { .. } => None,
        }
    }

    /// Whether this event reports an error, for a job or for the queue.
    pub fn is_error(&self) -> bool {
        matches!(
            self,
            QueueEvent::Error { .. }
                | QueueEvent::Job {
                    event: JobEvent::Error { .. },
                    ..
                }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_wire_shape_leads_with_event_name() {
        let message = JobEvent::Complete {
            result: json!("a b"),
        }
        .to_message(3);

        assert_eq!(message.event, "complete");
        assert_eq!(message.args, vec![json!("complete"), json!("a b")]);

        let encoded: Value = serde_json::from_str(&message.encode().unwrap()).unwrap();
        assert_eq!(
            encoded,
            json!({"id": 3, "event": "complete", "args": ["complete", "a b"]})
        );
    }

    #[test]
    fn test_decode_every_event() {
        let events = vec![
            JobEvent::Enqueue {
                job_type: "email".into(),
            },
            JobEvent::Start {
                job_type: "email".into(),
            },
            JobEvent::Complete {
                result: json!({"sent": true}),
            },
            JobEvent::Failed {
                error: "boom".into(),
            },
            JobEvent::FailedAttempt {
                error: "boom".into(),
                attempts: 1,
            },
            JobEvent::Remove {
                job_type: "email".into(),
            },
            JobEvent::Error {
                message: "store down".into(),
            },
        ];

        for event in events {
            let payload = event.to_message(9).encode().unwrap();
            let message = EventMessage::decode(&payload).unwrap();
            assert_eq!(JobEvent::from_message(&message).unwrap(), event);
        }
    }

    #[test]
    fn test_decode_without_leading_name() {
        let message = EventMessage {
            id: 1,
            event: "failed".into(),
            args: vec![json!("timeout")],
        };
        assert_eq!(
            JobEvent::from_message(&message).unwrap(),
            JobEvent::Failed {
                error: "timeout".into()
            }
        );
    }

    #[test]
    fn test_unknown_event_is_rejected() {
        let message = EventMessage {
            id: 1,
            event: "progress".into(),
            args: vec![],
        };
        assert!(matches!(
            JobEvent::from_message(&message),
            Err(QueueError::InvalidJobData { .. })
        ));
    }

    #[test]
    fn test_queue_event_names() {
        let event = QueueEvent::Job {
            id: 4,
            event: JobEvent::FailedAttempt {
                error: "x".into(),
                attempts: 1,
            },
        };
        assert_eq!(event.name(), "job failed attempt");
        assert_eq!(event.job_id(), Some(4));
        assert!(!event.is_error());
        assert!(QueueEvent::Error {
            message: "x".into()
        }
        .is_error());
    }
}
