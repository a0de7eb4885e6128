//! Postgres-backed durable store.
//!
//! ## Queue semantics
//!
//! Every `claim_*` is a single `UPDATE ... WHERE id = (SELECT ... FOR UPDATE
//! SKIP LOCKED LIMIT 1) RETURNING ...`. Concurrent consumers skip rows another
//! transaction is claiming instead of blocking on them, and a row is handed
//! out once.
//!
//! ## Conditional status writes
//!
//! Status updates carry `WHERE status = ANY($n)` with the allowed predecessor
//! states computed from the domain state machine. Zero affected rows means the
//! transition was refused.
//!
//! ## Error Mapping
//!
//! | SQLx Error | StoreError |
//! |------------|------------|
//! | Database / Io / Tls / PoolTimedOut / PoolClosed | `Unavailable` |
//! | ColumnDecode / Decode / ColumnNotFound | `Decode` |
//! | anything else | `Unavailable` |

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::types::Json;
use sqlx::{PgPool, Row};
use tracing::instrument;
use uuid::Uuid;

use postline_core::{
    ChatId, ChatTarget, Content, CycleOutcome, FormattingEntity, MediaRef, MessageKind,
    MessageStatus, Publication, PublicationId, PublicationStatus, RequestKind, RequestStatus,
    Schedule, SendRequest, SendRequestId, Status, Tenant, TenantCredentials, TenantId,
    WorkerMessage, WorkerMessageId,
};

use super::{
    CycleCreation, PublicationStore, SendRequestStore, StoreError, StoreResult, TenantRegistry,
    WorkerMessageStore,
};

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS tenants (
        id          UUID PRIMARY KEY,
        name        TEXT NOT NULL,
        credentials JSONB NULL,
        proxy       TEXT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS publications (
        id          UUID PRIMARY KEY,
        tenant_id   UUID NOT NULL,
        creator_id  UUID NULL,
        template_id UUID NULL,
        content     JSONB NOT NULL,
        schedule    JSONB NOT NULL,
        chats       JSONB NOT NULL,
        status      TEXT NOT NULL,
        last_cycle  JSONB NULL,
        deleted_at  TIMESTAMPTZ NULL,
        created_at  TIMESTAMPTZ NOT NULL,
        updated_at  TIMESTAMPTZ NOT NULL
    )
    "#,
    "ALTER TABLE publications ADD COLUMN IF NOT EXISTS template_id UUID NULL",
    "CREATE INDEX IF NOT EXISTS publications_status_created_idx ON publications (status, created_at)",
    r#"
    CREATE TABLE IF NOT EXISTS send_requests (
        id             UUID PRIMARY KEY,
        publication_id UUID NOT NULL REFERENCES publications (id),
        tenant_id      UUID NOT NULL,
        chat_id        BIGINT NOT NULL,
        chat_title     TEXT NULL,
        kind           TEXT NOT NULL,
        cycle_at       TIMESTAMPTZ NOT NULL,
        status         TEXT NOT NULL,
        sent_at        TIMESTAMPTZ NULL,
        created_at     TIMESTAMPTZ NOT NULL,
        updated_at     TIMESTAMPTZ NOT NULL,
        UNIQUE (publication_id, cycle_at, chat_id)
    )
    "#,
    "CREATE INDEX IF NOT EXISTS send_requests_status_created_idx ON send_requests (status, created_at)",
    r#"
    CREATE TABLE IF NOT EXISTS worker_messages (
        id          UUID PRIMARY KEY,
        request_id  UUID NOT NULL REFERENCES send_requests (id),
        tenant_id   UUID NOT NULL,
        chat_id     BIGINT NOT NULL,
        kind        TEXT NOT NULL,
        text        TEXT NOT NULL,
        entities    JSONB NOT NULL,
        media       JSONB NULL,
        status      TEXT NOT NULL,
        attempts    INTEGER NOT NULL DEFAULT 0,
        last_error  TEXT NULL,
        sent_at     TIMESTAMPTZ NULL,
        created_at  TIMESTAMPTZ NOT NULL,
        updated_at  TIMESTAMPTZ NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS worker_messages_tenant_status_idx ON worker_messages (tenant_id, status, created_at)",
    "CREATE INDEX IF NOT EXISTS worker_messages_request_idx ON worker_messages (request_id)",
];

const PUBLICATION_COLUMNS: &str = "id, tenant_id, creator_id, template_id, content, schedule, chats, status, \
     last_cycle, deleted_at, created_at, updated_at";

const REQUEST_COLUMNS: &str = "id, publication_id, tenant_id, chat_id, chat_title, kind, cycle_at, \
     status, sent_at, created_at, updated_at";

const MESSAGE_COLUMNS: &str = "id, request_id, tenant_id, chat_id, kind, text, entities, media, \
     status, attempts, last_error, sent_at, created_at, updated_at";

/// Durable store on PostgreSQL.
///
/// `Send + Sync`; clones share one connection pool.
#[derive(Debug, Clone)]
pub struct PostgresStore {
    pool: Arc<PgPool>,
}

impl PostgresStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    /// Connect with a small pool sized for one polling service.
    pub async fn connect(database_url: &str) -> StoreResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await
            .map_err(|e| map_sqlx_error("connect", e))?;
        Ok(Self::new(pool))
    }

    /// Create tables and indexes if missing.
    #[instrument(skip(self), err)]
    pub async fn migrate(&self) -> StoreResult<()> {
        for statement in SCHEMA {
            sqlx::query(statement)
                .execute(&*self.pool)
                .await
                .map_err(|e| map_sqlx_error("migrate", e))?;
        }
        Ok(())
    }
}

fn status_names<S: Status>(states: &[S]) -> Vec<String> {
    states.iter().map(|s| s.as_str().to_string()).collect()
}

fn parse_status<S>(raw: &str) -> StoreResult<S>
where
    S: core::str::FromStr<Err = postline_core::DomainError>,
{
    raw.parse::<S>()
        .map_err(|e| StoreError::Decode(e.to_string()))
}

fn decode<T>(result: Result<T, sqlx::Error>) -> StoreResult<T> {
    result.map_err(|e| map_sqlx_error("decode", e))
}

fn publication_from_row(row: &PgRow) -> StoreResult<Publication> {
    let status: String = decode(row.try_get("status"))?;
    let content: Json<Content> = decode(row.try_get("content"))?;
    let schedule: Json<Schedule> = decode(row.try_get("schedule"))?;
    let chats: Json<Vec<ChatTarget>> = decode(row.try_get("chats"))?;
    let last_cycle: Option<Json<CycleOutcome>> = decode(row.try_get("last_cycle"))?;

    Ok(Publication {
        id: PublicationId::from_uuid(decode(row.try_get("id"))?),
        tenant_id: TenantId::from_uuid(decode(row.try_get("tenant_id"))?),
        creator_id: decode(row.try_get("creator_id"))?,
        template_id: decode(row.try_get("template_id"))?,
        content: content.0,
        schedule: schedule.0,
        chats: chats.0,
        status: parse_status(&status)?,
        last_cycle: last_cycle.map(|j| j.0),
        deleted_at: decode(row.try_get("deleted_at"))?,
        created_at: decode(row.try_get("created_at"))?,
        updated_at: decode(row.try_get("updated_at"))?,
    })
}

fn request_from_row(row: &PgRow) -> StoreResult<SendRequest> {
    let id: Uuid = decode(row.try_get("id"))?;
    let kind: String = decode(row.try_get("kind"))?;
    let kind = kind
        .parse::<RequestKind>()
        .map_err(|_| StoreError::UnsupportedKind {
            entity: "send request",
            id: id.to_string(),
            kind,
        })?;
    let status: String = decode(row.try_get("status"))?;

    Ok(SendRequest {
        id: SendRequestId::from_uuid(id),
        publication_id: PublicationId::from_uuid(decode(row.try_get("publication_id"))?),
        tenant_id: TenantId::from_uuid(decode(row.try_get("tenant_id"))?),
        chat: ChatTarget {
            id: ChatId(decode(row.try_get("chat_id"))?),
            title: decode(row.try_get("chat_title"))?,
        },
        kind,
        cycle_at: decode(row.try_get("cycle_at"))?,
        status: parse_status(&status)?,
        sent_at: decode(row.try_get("sent_at"))?,
        created_at: decode(row.try_get("created_at"))?,
        updated_at: decode(row.try_get("updated_at"))?,
    })
}

fn message_from_row(row: &PgRow) -> StoreResult<WorkerMessage> {
    let id: Uuid = decode(row.try_get("id"))?;
    let kind: String = decode(row.try_get("kind"))?;
    let kind = kind
        .parse::<MessageKind>()
        .map_err(|_| StoreError::UnsupportedKind {
            entity: "worker message",
            id: id.to_string(),
            kind,
        })?;
    let status: String = decode(row.try_get("status"))?;
    let entities: Json<Vec<FormattingEntity>> = decode(row.try_get("entities"))?;
    let media: Option<Json<MediaRef>> = decode(row.try_get("media"))?;
    let attempts: i32 = decode(row.try_get("attempts"))?;

    Ok(WorkerMessage {
        id: WorkerMessageId::from_uuid(id),
        request_id: SendRequestId::from_uuid(decode(row.try_get("request_id"))?),
        tenant_id: TenantId::from_uuid(decode(row.try_get("tenant_id"))?),
        chat_id: ChatId(decode(row.try_get("chat_id"))?),
        kind,
        text: decode(row.try_get("text"))?,
        entities: entities.0,
        media: media.map(|j| j.0),
        status: parse_status(&status)?,
        attempts: attempts.max(0) as u32,
        last_error: decode(row.try_get("last_error"))?,
        sent_at: decode(row.try_get("sent_at"))?,
        created_at: decode(row.try_get("created_at"))?,
        updated_at: decode(row.try_get("updated_at"))?,
    })
}

#[async_trait]
impl PublicationStore for PostgresStore {
    #[instrument(skip(self, publication), fields(publication_id = %publication.id), err)]
    async fn insert_publication(&self, publication: &Publication) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO publications
                (id, tenant_id, creator_id, template_id, content, schedule, chats,
                 status, last_cycle, deleted_at, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            "#,
        )
        .bind(publication.id.as_uuid())
        .bind(publication.tenant_id.as_uuid())
        .bind(publication.creator_id)
        .bind(publication.template_id)
        .bind(Json(&publication.content))
        .bind(Json(&publication.schedule))
        .bind(Json(&publication.chats))
        .bind(publication.status.as_str())
        .bind(publication.last_cycle.as_ref().map(Json))
        .bind(publication.deleted_at)
        .bind(publication.created_at)
        .bind(publication.updated_at)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("insert_publication", e))?;
        Ok(())
    }

    async fn get_publication(&self, id: PublicationId) -> StoreResult<Option<Publication>> {
        let row = sqlx::query(&format!(
            "SELECT {PUBLICATION_COLUMNS} FROM publications WHERE id = $1"
        ))
        .bind(id.as_uuid())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("get_publication", e))?;
        row.as_ref().map(publication_from_row).transpose()
    }

    #[instrument(skip(self), err)]
    async fn claim_pending_publication(&self) -> StoreResult<Option<Publication>> {
        let row = sqlx::query(&format!(
            r#"
            UPDATE publications
            SET status = $1, updated_at = now()
            WHERE id = (
                SELECT id FROM publications
                WHERE status = $2
                ORDER BY created_at, id
                FOR UPDATE SKIP LOCKED
                LIMIT 1
            )
            RETURNING {PUBLICATION_COLUMNS}
            "#
        ))
        .bind(PublicationStatus::Scheduling.as_str())
        .bind(PublicationStatus::Pending.as_str())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("claim_pending_publication", e))?;
        row.as_ref().map(publication_from_row).transpose()
    }

    #[instrument(skip(self), fields(publication_id = %id, status = %status), err)]
    async fn set_publication_status(
        &self,
        id: PublicationId,
        status: PublicationStatus,
    ) -> StoreResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE publications
            SET status = $2, updated_at = now()
            WHERE id = $1 AND status = ANY($3)
            "#,
        )
        .bind(id.as_uuid())
        .bind(status.as_str())
        .bind(status_names(&PublicationStatus::predecessors(status)))
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("set_publication_status", e))?;
        Ok(result.rows_affected() == 1)
    }

    async fn record_cycle_outcome(
        &self,
        id: PublicationId,
        outcome: CycleOutcome,
    ) -> StoreResult<()> {
        let result = sqlx::query(
            "UPDATE publications SET last_cycle = $2, updated_at = now() WHERE id = $1",
        )
        .bind(id.as_uuid())
        .bind(Json(outcome))
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("record_cycle_outcome", e))?;
        if result.rows_affected() == 0 {
            return Err(StoreError::not_found("publication", id));
        }
        Ok(())
    }

    async fn list_publications(
        &self,
        statuses: &[PublicationStatus],
    ) -> StoreResult<Vec<Publication>> {
        let rows = sqlx::query(&format!(
            "SELECT {PUBLICATION_COLUMNS} FROM publications WHERE status = ANY($1) ORDER BY created_at, id"
        ))
        .bind(status_names(statuses))
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_publications", e))?;
        rows.iter().map(publication_from_row).collect()
    }

    async fn soft_delete_publication(
        &self,
        id: PublicationId,
        at: DateTime<Utc>,
    ) -> StoreResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE publications
            SET deleted_at = $2, updated_at = now()
            WHERE id = $1 AND deleted_at IS NULL
            "#,
        )
        .bind(id.as_uuid())
        .bind(at)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("soft_delete_publication", e))?;
        Ok(result.rows_affected() == 1)
    }
}

#[async_trait]
impl SendRequestStore for PostgresStore {
    #[instrument(
        skip(self, requests),
        fields(publication_id = %publication_id, cycle_at = %cycle_at, request_count = requests.len()),
        err
    )]
    async fn create_cycle(
        &self,
        publication_id: PublicationId,
        cycle_at: DateTime<Utc>,
        requests: &[SendRequest],
        publication_status: Option<PublicationStatus>,
    ) -> StoreResult<CycleCreation> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        // Row lock on the publication serializes concurrent fan-outs of it.
        let locked = sqlx::query("SELECT id FROM publications WHERE id = $1 FOR UPDATE")
            .bind(publication_id.as_uuid())
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("lock_publication", e))?;
        if locked.is_none() {
            return Err(StoreError::not_found("publication", publication_id));
        }

        let existing: i64 = sqlx::query(
            "SELECT COUNT(*) AS n FROM send_requests WHERE publication_id = $1 AND cycle_at = $2",
        )
        .bind(publication_id.as_uuid())
        .bind(cycle_at)
        .fetch_one(&mut *tx)
        .await
        .and_then(|row| row.try_get("n"))
        .map_err(|e| map_sqlx_error("count_cycle", e))?;
        if existing > 0 {
            tx.rollback()
                .await
                .map_err(|e| map_sqlx_error("rollback", e))?;
            return Ok(CycleCreation::AlreadyExists(existing as usize));
        }

        for request in requests {
            sqlx::query(&format!(
                "INSERT INTO send_requests ({REQUEST_COLUMNS}) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)"
            ))
            .bind(request.id.as_uuid())
            .bind(request.publication_id.as_uuid())
            .bind(request.tenant_id.as_uuid())
            .bind(request.chat.id.0)
            .bind(request.chat.title.as_deref())
            .bind(request.kind.as_str())
            .bind(request.cycle_at)
            .bind(request.status.as_str())
            .bind(request.sent_at)
            .bind(request.created_at)
            .bind(request.updated_at)
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("insert_send_request", e))?;
        }

        if let Some(status) = publication_status {
            sqlx::query(
                "UPDATE publications SET status = $2, updated_at = now() \
                 WHERE id = $1 AND status = ANY($3)",
            )
            .bind(publication_id.as_uuid())
            .bind(status.as_str())
            .bind(status_names(&PublicationStatus::predecessors(status)))
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("advance_publication", e))?;
        }

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;
        Ok(CycleCreation::Created(requests.len()))
    }

    async fn get_request(&self, id: SendRequestId) -> StoreResult<Option<SendRequest>> {
        let row = sqlx::query(&format!(
            "SELECT {REQUEST_COLUMNS} FROM send_requests WHERE id = $1"
        ))
        .bind(id.as_uuid())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("get_request", e))?;
        row.as_ref().map(request_from_row).transpose()
    }

    #[instrument(skip(self), err)]
    async fn claim_planned_request(&self) -> StoreResult<Option<SendRequest>> {
        let row = sqlx::query(&format!(
            r#"
            UPDATE send_requests
            SET status = $1, updated_at = now()
            WHERE id = (
                SELECT id FROM send_requests
                WHERE status = $2
                ORDER BY created_at, id
                FOR UPDATE SKIP LOCKED
                LIMIT 1
            )
            RETURNING {REQUEST_COLUMNS}
            "#
        ))
        .bind(RequestStatus::InProgress.as_str())
        .bind(RequestStatus::Planned.as_str())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("claim_planned_request", e))?;
        row.as_ref().map(request_from_row).transpose()
    }

    #[instrument(skip(self), fields(request_id = %id, status = %status), err)]
    async fn set_request_status(
        &self,
        id: SendRequestId,
        status: RequestStatus,
        sent_at: Option<DateTime<Utc>>,
    ) -> StoreResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE send_requests
            SET status = $2, sent_at = COALESCE($3, sent_at), updated_at = now()
            WHERE id = $1 AND status = ANY($4)
            "#,
        )
        .bind(id.as_uuid())
        .bind(status.as_str())
        .bind(sent_at)
        .bind(status_names(&RequestStatus::predecessors(status)))
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("set_request_status", e))?;
        Ok(result.rows_affected() == 1)
    }

    async fn requests_for_cycle(
        &self,
        publication_id: PublicationId,
        cycle_at: DateTime<Utc>,
    ) -> StoreResult<Vec<SendRequest>> {
        let rows = sqlx::query(&format!(
            "SELECT {REQUEST_COLUMNS} FROM send_requests \
             WHERE publication_id = $1 AND cycle_at = $2 ORDER BY created_at, id"
        ))
        .bind(publication_id.as_uuid())
        .bind(cycle_at)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("requests_for_cycle", e))?;
        rows.iter().map(request_from_row).collect()
    }

    async fn requests_for_publication(
        &self,
        publication_id: PublicationId,
    ) -> StoreResult<Vec<SendRequest>> {
        let rows = sqlx::query(&format!(
            "SELECT {REQUEST_COLUMNS} FROM send_requests \
             WHERE publication_id = $1 ORDER BY created_at, id"
        ))
        .bind(publication_id.as_uuid())
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("requests_for_publication", e))?;
        rows.iter().map(request_from_row).collect()
    }
}

#[async_trait]
impl WorkerMessageStore for PostgresStore {
    #[instrument(skip(self, messages), fields(message_count = messages.len()), err)]
    async fn insert_messages(&self, messages: &[WorkerMessage]) -> StoreResult<()> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;
        for message in messages {
            sqlx::query(&format!(
                "INSERT INTO worker_messages ({MESSAGE_COLUMNS}) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)"
            ))
            .bind(message.id.as_uuid())
            .bind(message.request_id.as_uuid())
            .bind(message.tenant_id.as_uuid())
            .bind(message.chat_id.0)
            .bind(message.kind.as_str())
            .bind(&message.text)
            .bind(Json(&message.entities))
            .bind(message.media.as_ref().map(Json))
            .bind(message.status.as_str())
            .bind(i32::try_from(message.attempts).unwrap_or(i32::MAX))
            .bind(message.last_error.as_deref())
            .bind(message.sent_at)
            .bind(message.created_at)
            .bind(message.updated_at)
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("insert_worker_message", e))?;
        }
        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;
        Ok(())
    }

    async fn get_message(&self, id: WorkerMessageId) -> StoreResult<Option<WorkerMessage>> {
        let row = sqlx::query(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM worker_messages WHERE id = $1"
        ))
        .bind(id.as_uuid())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("get_message", e))?;
        row.as_ref().map(message_from_row).transpose()
    }

    #[instrument(skip(self), fields(tenant = %tenant_id), err)]
    async fn claim_pending_message(
        &self,
        tenant_id: TenantId,
    ) -> StoreResult<Option<WorkerMessage>> {
        let row = sqlx::query(&format!(
            r#"
            UPDATE worker_messages
            SET status = $1, attempts = attempts + 1, updated_at = now()
            WHERE id = (
                SELECT id FROM worker_messages
                WHERE tenant_id = $2 AND status = $3
                ORDER BY created_at, id
                FOR UPDATE SKIP LOCKED
                LIMIT 1
            )
            RETURNING {MESSAGE_COLUMNS}
            "#
        ))
        .bind(MessageStatus::InProgress.as_str())
        .bind(tenant_id.as_uuid())
        .bind(MessageStatus::Pending.as_str())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("claim_pending_message", e))?;
        row.as_ref().map(message_from_row).transpose()
    }

    async fn mark_message_sent(
        &self,
        id: WorkerMessageId,
        at: DateTime<Utc>,
    ) -> StoreResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE worker_messages
            SET status = $2, sent_at = $3, last_error = NULL, updated_at = now()
            WHERE id = $1 AND status = ANY($4)
            "#,
        )
        .bind(id.as_uuid())
        .bind(MessageStatus::Sent.as_str())
        .bind(at)
        .bind(status_names(&MessageStatus::predecessors(MessageStatus::Sent)))
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("mark_message_sent", e))?;
        Ok(result.rows_affected() == 1)
    }

    async fn mark_message_failed(&self, id: WorkerMessageId, error: &str) -> StoreResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE worker_messages
            SET status = $2, last_error = $3, updated_at = now()
            WHERE id = $1 AND status = ANY($4)
            "#,
        )
        .bind(id.as_uuid())
        .bind(MessageStatus::Failed.as_str())
        .bind(error)
        .bind(status_names(&MessageStatus::predecessors(MessageStatus::Failed)))
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("mark_message_failed", e))?;
        Ok(result.rows_affected() == 1)
    }

    async fn messages_for_request(
        &self,
        request_id: SendRequestId,
    ) -> StoreResult<Vec<WorkerMessage>> {
        let rows = sqlx::query(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM worker_messages \
             WHERE request_id = $1 ORDER BY created_at, id"
        ))
        .bind(request_id.as_uuid())
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("messages_for_request", e))?;
        rows.iter().map(message_from_row).collect()
    }
}

#[async_trait]
impl TenantRegistry for PostgresStore {
    async fn upsert_tenant(&self, tenant: &Tenant) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO tenants (id, name, credentials, proxy)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (id) DO UPDATE
            SET name = EXCLUDED.name, credentials = EXCLUDED.credentials, proxy = EXCLUDED.proxy
            "#,
        )
        .bind(tenant.id.as_uuid())
        .bind(&tenant.name)
        .bind(tenant.credentials.as_ref().map(Json))
        .bind(tenant.proxy.as_deref())
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("upsert_tenant", e))?;
        Ok(())
    }

    async fn get_tenant(&self, id: TenantId) -> StoreResult<Option<Tenant>> {
        let row = sqlx::query("SELECT id, name, credentials, proxy FROM tenants WHERE id = $1")
            .bind(id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get_tenant", e))?;

        let Some(row) = row else {
            return Ok(None);
        };
        let credentials: Option<Json<TenantCredentials>> = decode(row.try_get("credentials"))?;
        Ok(Some(Tenant {
            id: TenantId::from_uuid(decode(row.try_get("id"))?),
            name: decode(row.try_get("name"))?,
            credentials: credentials.map(|j| j.0),
            proxy: decode(row.try_get("proxy"))?,
        }))
    }
}

/// Map SQLx errors to `StoreError` with operation context.
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::ColumnDecode { .. }
        | sqlx::Error::Decode(_)
        | sqlx::Error::ColumnNotFound(_) => {
            StoreError::Decode(format!("{operation}: {err}"))
        }
        sqlx::Error::Database(db_err) => {
            StoreError::Unavailable(format!("database error in {operation}: {}", db_err.message()))
        }
        sqlx::Error::PoolClosed => {
            StoreError::Unavailable(format!("connection pool closed in {operation}"))
        }
        _ => StoreError::Unavailable(format!("sqlx error in {operation}: {err}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn predecessor_lists_feed_conditional_updates() {
        let names = status_names(&RequestStatus::predecessors(RequestStatus::Sent));
        assert_eq!(names, vec!["planned".to_string(), "in_progress".to_string()]);
    }

    #[test]
    fn decode_errors_are_classified() {
        let err = map_sqlx_error("get", sqlx::Error::ColumnNotFound("status".into()));
        assert!(matches!(err, StoreError::Decode(_)));
        let err = map_sqlx_error("get", sqlx::Error::PoolClosed);
        assert!(matches!(err, StoreError::Unavailable(_)));
    }
}
