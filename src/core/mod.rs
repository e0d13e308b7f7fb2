//! Core types for prioq.
//!
//! This module contains the fundamental job types: the job record itself,
//! its priority scale and its lifecycle states.

pub mod job;
pub mod job_state;

pub use job::{parse_job_id, Job, JobDefaults, JobId, Priority, PriorityInput};
pub use job_state::JobState;
