//! Core domain types and traits for the BuildFleet CI scheduler.
//!
//! This crate contains:
//! - Composite keys, worker identities and version stamps
//! - Projects, builds, jobs and the job state machine
//! - Workers (controlled and external) and maintenance records
//! - Output sections and connect credentials
//! - Collaborator traits (artifacts, secrets, worker control, cloud, notifications)

pub mod artifact;
pub mod cloud;
pub mod control;
pub mod credential;
pub mod error;
pub mod event;
pub mod id;
pub mod job;
pub mod maintenance;
pub mod output;
pub mod project;
pub mod secret;
pub mod worker;

pub use error::{Error, Result};
pub use id::{BuildKey, JobKey, ResourceId, Version, WorkerId, WorkerKind};
