//! SQLite-backed job store. Jobs survive scheduler restarts.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use tracing::instrument;

use super::job::{ScheduledJob, Trigger};
use super::store::{JobStore, SchedulerError};

const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS scheduler_jobs (
    id TEXT PRIMARY KEY NOT NULL,
    trigger TEXT NOT NULL,
    payload TEXT NOT NULL,
    next_run_at INTEGER NOT NULL,
    misfire_grace_ms INTEGER NOT NULL,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL
)";

const INDEX: &str =
    "CREATE INDEX IF NOT EXISTS idx_scheduler_jobs_next_run ON scheduler_jobs (next_run_at)";

const COLUMNS: &str = "id, trigger, payload, next_run_at, misfire_grace_ms, created_at, updated_at";

#[derive(Debug, Clone)]
pub struct SqliteJobStore {
    pool: SqlitePool,
}

impl SqliteJobStore {
    /// Open (or create) the database file and ensure the schema exists.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, SchedulerError> {
        let options = SqliteConnectOptions::new()
            .filename(path.as_ref())
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .map_err(map_sqlx_error)?;
        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    /// A private in-memory database, gone when the store is dropped.
    pub async fn in_memory() -> Result<Self, SchedulerError> {
        // One connection: every `:memory:` connection is its own database.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .map_err(map_sqlx_error)?;
        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    #[instrument(skip(self), err)]
    pub async fn migrate(&self) -> Result<(), SchedulerError> {
        sqlx::query(SCHEMA)
            .execute(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
        sqlx::query(INDEX)
            .execute(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
        Ok(())
    }
}

fn map_sqlx_error(err: sqlx::Error) -> SchedulerError {
    SchedulerError::Store(err.to_string())
}

fn millis_to_datetime(ms: i64) -> Result<DateTime<Utc>, SchedulerError> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .ok_or_else(|| SchedulerError::Store(format!("timestamp out of range: {ms}")))
}

fn job_from_row(row: &SqliteRow) -> Result<ScheduledJob, SchedulerError> {
    let trigger: String = row.try_get("trigger").map_err(map_sqlx_error)?;
    let payload: String = row.try_get("payload").map_err(map_sqlx_error)?;
    let next_run_at: i64 = row.try_get("next_run_at").map_err(map_sqlx_error)?;
    let grace_ms: i64 = row.try_get("misfire_grace_ms").map_err(map_sqlx_error)?;
    let created_at: i64 = row.try_get("created_at").map_err(map_sqlx_error)?;
    let updated_at: i64 = row.try_get("updated_at").map_err(map_sqlx_error)?;

    Ok(ScheduledJob {
        id: row.try_get("id").map_err(map_sqlx_error)?,
        trigger: serde_json::from_str::<Trigger>(&trigger)
            .map_err(|e| SchedulerError::Store(format!("bad trigger column: {e}")))?,
        payload: serde_json::from_str(&payload)
            .map_err(|e| SchedulerError::Payload(e.to_string()))?,
        next_run_at: millis_to_datetime(next_run_at)?,
        misfire_grace: Duration::from_millis(u64::try_from(grace_ms).unwrap_or(0)),
        created_at: millis_to_datetime(created_at)?,
        updated_at: millis_to_datetime(updated_at)?,
    })
}

#[async_trait]
impl JobStore for SqliteJobStore {
    #[instrument(skip(self, job), fields(job_id = %job.id), err)]
    async fn upsert(&self, job: &ScheduledJob) -> Result<(), SchedulerError> {
        let trigger = serde_json::to_string(&job.trigger)
            .map_err(|e| SchedulerError::Payload(e.to_string()))?;
        let payload = serde_json::to_string(&job.payload)
            .map_err(|e| SchedulerError::Payload(e.to_string()))?;
        let grace_ms = i64::try_from(job.misfire_grace.as_millis()).unwrap_or(i64::MAX);

        sqlx::query(
            "INSERT INTO scheduler_jobs (id, trigger, payload, next_run_at, misfire_grace_ms, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(id) DO UPDATE SET
                trigger = excluded.trigger,
                payload = excluded.payload,
                next_run_at = excluded.next_run_at,
                misfire_grace_ms = excluded.misfire_grace_ms,
                updated_at = excluded.updated_at",
        )
        .bind(&job.id)
        .bind(trigger)
        .bind(payload)
        .bind(job.next_run_at.timestamp_millis())
        .bind(grace_ms)
        .bind(job.created_at.timestamp_millis())
        .bind(job.updated_at.timestamp_millis())
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_error)?;
        Ok(())
    }

    async fn remove(&self, id: &str) -> Result<bool, SchedulerError> {
        let result = sqlx::query("DELETE FROM scheduler_jobs WHERE id = ?1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
        Ok(result.rows_affected() > 0)
    }

    async fn get(&self, id: &str) -> Result<Option<ScheduledJob>, SchedulerError> {
        let row = sqlx::query(&format!("SELECT {COLUMNS} FROM scheduler_jobs WHERE id = ?1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
        row.as_ref().map(job_from_row).transpose()
    }

    async fn list(&self) -> Result<Vec<ScheduledJob>, SchedulerError> {
        let rows = sqlx::query(&format!(
            "SELECT {COLUMNS} FROM scheduler_jobs ORDER BY next_run_at, id"
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx_error)?;
        rows.iter().map(job_from_row).collect()
    }

    async fn due(&self, now: DateTime<Utc>) -> Result<Vec<ScheduledJob>, SchedulerError> {
        let rows = sqlx::query(&format!(
            "SELECT {COLUMNS} FROM scheduler_jobs WHERE next_run_at <= ?1 ORDER BY next_run_at, id"
        ))
        .bind(now.timestamp_millis())
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx_error)?;
        rows.iter().map(job_from_row).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn sample(id: &str, at: DateTime<Utc>) -> ScheduledJob {
        ScheduledJob::once(
            id,
            at,
            serde_json::json!({ "publication_id": id }),
            Duration::from_secs(60),
        )
    }

    #[tokio::test]
    async fn jobs_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("jobs.sqlite");
        let at = Utc.with_ymd_and_hms(2026, 3, 1, 8, 0, 0).unwrap();

        {
            let store = SqliteJobStore::open(&path).await.unwrap();
            store.upsert(&sample("post_a", at)).await.unwrap();
            let daily = ScheduledJob::daily(
                "post_daily_b",
                7,
                30,
                serde_json::Value::Null,
                Duration::from_secs(60),
                at,
            )
            .unwrap();
            store.upsert(&daily).await.unwrap();
            store.pool.close().await;
        }

        let reopened = SqliteJobStore::open(&path).await.unwrap();
        let jobs = reopened.list().await.unwrap();
        assert_eq!(jobs.len(), 2);

        let single = reopened.get("post_a").await.unwrap().unwrap();
        assert_eq!(single.next_run_at, at);
        assert_eq!(single.trigger, Trigger::Once { run_at: at });
        assert_eq!(single.payload["publication_id"], "post_a");
        assert_eq!(single.misfire_grace, Duration::from_secs(60));
    }

    #[tokio::test]
    async fn upsert_replaces_and_due_filters() {
        let store = SqliteJobStore::in_memory().await.unwrap();
        let at = Utc.with_ymd_and_hms(2026, 3, 1, 8, 0, 0).unwrap();

        store.upsert(&sample("a", at)).await.unwrap();
        store
            .upsert(&sample("a", at + chrono::Duration::hours(1)))
            .await
            .unwrap();
        store
            .upsert(&sample("b", at + chrono::Duration::hours(3)))
            .await
            .unwrap();

        assert_eq!(store.list().await.unwrap().len(), 2);
        let due = store.due(at + chrono::Duration::hours(2)).await.unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].id, "a");

        assert!(store.remove("a").await.unwrap());
        assert!(!store.remove("a").await.unwrap());
    }
}
