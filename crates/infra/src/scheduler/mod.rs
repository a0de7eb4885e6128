//! Durable time-based job scheduler.
//!
//! Jobs are stored through a [`JobStore`] so they survive restarts; the
//! engine polls the store every tick and hands due jobs to a single
//! [`JobHandler`].

pub mod engine;
pub mod job;
pub mod sqlite;
pub mod store;

pub use engine::{Scheduler, SchedulerConfig, TickReport};
pub use job::{FiredJob, JobError, JobHandler, JobListener, JobOutcome, ScheduledJob, Trigger};
pub use sqlite::SqliteJobStore;
pub use store::{InMemoryJobStore, JobStore, SchedulerError};
