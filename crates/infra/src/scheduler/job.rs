//! Scheduled job records and the callbacks the engine drives.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use postline_core::next_daily_at;

use super::store::SchedulerError;

/// When a job fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Trigger {
    Once { run_at: DateTime<Utc> },
    Daily { hour: u8, minute: u8 },
}

/// A persisted job, keyed by a caller-chosen id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduledJob {
    pub id: String,
    pub trigger: Trigger,
    pub payload: serde_json::Value,
    pub next_run_at: DateTime<Utc>,
    /// How late a fire may still happen; later than this the job is missed.
    pub misfire_grace: Duration,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ScheduledJob {
    pub fn once(
        id: impl Into<String>,
        run_at: DateTime<Utc>,
        payload: serde_json::Value,
        misfire_grace: Duration,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            trigger: Trigger::Once { run_at },
            payload,
            next_run_at: run_at,
            misfire_grace,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn daily(
        id: impl Into<String>,
        hour: u8,
        minute: u8,
        payload: serde_json::Value,
        misfire_grace: Duration,
        now: DateTime<Utc>,
    ) -> Result<Self, SchedulerError> {
        if hour > 23 || minute > 59 {
            return Err(SchedulerError::InvalidTrigger(format!(
                "daily {hour:02}:{minute:02}"
            )));
        }
        let next_run_at = next_daily_at(hour, minute, now).ok_or_else(|| {
            SchedulerError::InvalidTrigger(format!("daily {hour:02}:{minute:02}"))
        })?;
        Ok(Self {
            id: id.into(),
            trigger: Trigger::Daily { hour, minute },
            payload,
            next_run_at,
            misfire_grace,
            created_at: now,
            updated_at: now,
        })
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.next_run_at <= now
    }

    /// Due, but later than the misfire grace allows.
    pub fn is_missed(&self, now: DateTime<Utc>) -> bool {
        let grace = chrono::Duration::from_std(self.misfire_grace).unwrap_or(chrono::Duration::MAX);
        now - self.next_run_at > grace
    }

    /// Next fire time after `now`; `None` for one-off jobs.
    pub fn following_run(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self.trigger {
            Trigger::Once { .. } => None,
            Trigger::Daily { hour, minute } => next_daily_at(hour, minute, now),
        }
    }
}

/// What the handler receives when a job fires.
#[derive(Debug, Clone, PartialEq)]
pub struct FiredJob {
    pub id: String,
    pub payload: serde_json::Value,
    /// The occurrence this fire stands for (not the wall-clock fire time).
    pub scheduled_for: DateTime<Utc>,
}

/// Handler verdict on the job's future.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    /// Keep the job (recurring jobs fire again).
    Continue,
    /// Remove the job from the store.
    Finished,
}

#[derive(Debug, Error)]
#[error("job {job_id} failed: {message}")]
pub struct JobError {
    pub job_id: String,
    pub message: String,
}

impl JobError {
    pub fn new(job_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            job_id: job_id.into(),
            message: message.into(),
        }
    }
}

/// Work performed when a job fires.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn run(&self, job: FiredJob) -> Result<JobOutcome, JobError>;
}

/// Observer of jobs that did not run normally.
#[async_trait]
pub trait JobListener: Send + Sync {
    /// The job was due longer ago than its misfire grace and was not fired.
    async fn on_missed(&self, _job: &ScheduledJob, _now: DateTime<Utc>) {}

    /// The handler returned an error for `job`.
    async fn on_error(&self, _job: &FiredJob, _error: &JobError) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn missed_only_beyond_grace() {
        let run_at = Utc.with_ymd_and_hms(2026, 1, 1, 12, 0, 0).unwrap();
        let job = ScheduledJob::once("j", run_at, serde_json::Value::Null, Duration::from_secs(60));

        assert!(!job.is_due(run_at - chrono::Duration::seconds(1)));
        assert!(job.is_due(run_at));
        assert!(!job.is_missed(run_at + chrono::Duration::seconds(60)));
        assert!(job.is_missed(run_at + chrono::Duration::seconds(61)));
    }

    #[test]
    fn daily_job_advances_past_now() {
        let now = Utc.with_ymd_and_hms(2026, 1, 1, 9, 30, 0).unwrap();
        let job = ScheduledJob::daily("d", 9, 0, serde_json::Value::Null, Duration::from_secs(60), now)
            .unwrap();
        assert_eq!(job.next_run_at, Utc.with_ymd_and_hms(2026, 1, 2, 9, 0, 0).unwrap());

        let later = Utc.with_ymd_and_hms(2026, 1, 5, 10, 0, 0).unwrap();
        assert_eq!(
            job.following_run(later),
            Some(Utc.with_ymd_and_hms(2026, 1, 6, 9, 0, 0).unwrap())
        );
    }

    #[test]
    fn invalid_daily_time_is_rejected() {
        let err = ScheduledJob::daily("d", 25, 0, serde_json::Value::Null, Duration::ZERO, Utc::now());
        assert!(matches!(err, Err(SchedulerError::InvalidTrigger(_))));
    }
}
