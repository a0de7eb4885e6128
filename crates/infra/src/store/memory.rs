//! In-memory store for tests and local runs.

use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use postline_core::{
    CycleOutcome, MessageStatus, Publication, PublicationId, PublicationStatus, RequestStatus,
    SendRequest, SendRequestId, Status, Tenant, TenantId, WorkerMessage, WorkerMessageId,
};

use super::{
    CycleCreation, PublicationStore, SendRequestStore, StoreError, StoreResult, TenantRegistry,
    WorkerMessageStore,
};

#[derive(Debug, Default)]
struct State {
    publications: HashMap<PublicationId, Publication>,
    requests: HashMap<SendRequestId, SendRequest>,
    messages: HashMap<WorkerMessageId, WorkerMessage>,
    tenants: HashMap<TenantId, Tenant>,
}

/// Store backed by a single `RwLock`; every operation is atomic.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    state: RwLock<State>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> StoreResult<RwLockReadGuard<'_, State>> {
        self.state
            .read()
            .map_err(|_| StoreError::Unavailable("in-memory store lock poisoned".into()))
    }

    fn write(&self) -> StoreResult<RwLockWriteGuard<'_, State>> {
        self.state
            .write()
            .map_err(|_| StoreError::Unavailable("in-memory store lock poisoned".into()))
    }

    /// Every send request, oldest first.
    pub fn all_requests(&self) -> Vec<SendRequest> {
        let Ok(state) = self.read() else {
            return Vec::new();
        };
        let mut out: Vec<_> = state.requests.values().cloned().collect();
        out.sort_by_key(|r| (r.created_at, r.id));
        out
    }

    /// Every worker message, oldest first.
    pub fn all_messages(&self) -> Vec<WorkerMessage> {
        let Ok(state) = self.read() else {
            return Vec::new();
        };
        let mut out: Vec<_> = state.messages.values().cloned().collect();
        out.sort_by_key(|m| (m.created_at, m.id));
        out
    }
}

#[async_trait]
impl PublicationStore for InMemoryStore {
    async fn insert_publication(&self, publication: &Publication) -> StoreResult<()> {
        self.write()?
            .publications
            .insert(publication.id, publication.clone());
        Ok(())
    }

    async fn get_publication(&self, id: PublicationId) -> StoreResult<Option<Publication>> {
        Ok(self.read()?.publications.get(&id).cloned())
    }

    async fn claim_pending_publication(&self) -> StoreResult<Option<Publication>> {
        let mut state = self.write()?;
        let Some(id) = state
            .publications
            .values()
            .filter(|p| p.status == PublicationStatus::Pending)
            .min_by_key(|p| (p.created_at, p.id))
            .map(|p| p.id)
        else {
            return Ok(None);
        };

        let Some(publication) = state.publications.get_mut(&id) else {
            return Ok(None);
        };
        publication.status = PublicationStatus::Scheduling;
        publication.updated_at = Utc::now();
        Ok(Some(publication.clone()))
    }

    async fn set_publication_status(
        &self,
        id: PublicationId,
        status: PublicationStatus,
    ) -> StoreResult<bool> {
        let mut state = self.write()?;
        let publication = state
            .publications
            .get_mut(&id)
            .ok_or_else(|| StoreError::not_found("publication", id))?;
        if !publication.status.can_transition_to(status) {
            return Ok(false);
        }
        publication.status = status;
        publication.updated_at = Utc::now();
        Ok(true)
    }

    async fn record_cycle_outcome(
        &self,
        id: PublicationId,
        outcome: CycleOutcome,
    ) -> StoreResult<()> {
        let mut state = self.write()?;
        let publication = state
            .publications
            .get_mut(&id)
            .ok_or_else(|| StoreError::not_found("publication", id))?;
        publication.last_cycle = Some(outcome);
        publication.updated_at = Utc::now();
        Ok(())
    }

    async fn list_publications(
        &self,
        statuses: &[PublicationStatus],
    ) -> StoreResult<Vec<Publication>> {
        let state = self.read()?;
        let mut out: Vec<_> = state
            .publications
            .values()
            .filter(|p| statuses.contains(&p.status))
            .cloned()
            .collect();
        out.sort_by_key(|p| (p.created_at, p.id));
        Ok(out)
    }

    async fn soft_delete_publication(
        &self,
        id: PublicationId,
        at: DateTime<Utc>,
    ) -> StoreResult<bool> {
        let mut state = self.write()?;
        let publication = state
            .publications
            .get_mut(&id)
            .ok_or_else(|| StoreError::not_found("publication", id))?;
        if publication.deleted_at.is_some() {
            return Ok(false);
        }
        publication.deleted_at = Some(at);
        publication.updated_at = Utc::now();
        Ok(true)
    }
}

#[async_trait]
impl SendRequestStore for InMemoryStore {
    async fn create_cycle(
        &self,
        publication_id: PublicationId,
        cycle_at: DateTime<Utc>,
        requests: &[SendRequest],
        publication_status: Option<PublicationStatus>,
    ) -> StoreResult<CycleCreation> {
        let mut state = self.write()?;
        if !state.publications.contains_key(&publication_id) {
            return Err(StoreError::not_found("publication", publication_id));
        }

        let existing = state
            .requests
            .values()
            .filter(|r| r.publication_id == publication_id && r.cycle_at == cycle_at)
            .count();
        if existing > 0 {
            return Ok(CycleCreation::AlreadyExists(existing));
        }

        for request in requests {
            state.requests.insert(request.id, request.clone());
        }
        if let Some(status) = publication_status {
            if let Some(publication) = state.publications.get_mut(&publication_id) {
                if publication.status.can_transition_to(status) {
                    publication.status = status;
                    publication.updated_at = Utc::now();
                }
            }
        }
        Ok(CycleCreation::Created(requests.len()))
    }

    async fn get_request(&self, id: SendRequestId) -> StoreResult<Option<SendRequest>> {
        Ok(self.read()?.requests.get(&id).cloned())
    }

    async fn claim_planned_request(&self) -> StoreResult<Option<SendRequest>> {
        let mut state = self.write()?;
        let Some(id) = state
            .requests
            .values()
            .filter(|r| r.status == RequestStatus::Planned)
            .min_by_key(|r| (r.created_at, r.id))
            .map(|r| r.id)
        else {
            return Ok(None);
        };

        let Some(request) = state.requests.get_mut(&id) else {
            return Ok(None);
        };
        request.status = RequestStatus::InProgress;
        request.updated_at = Utc::now();
        Ok(Some(request.clone()))
    }

    async fn set_request_status(
        &self,
        id: SendRequestId,
        status: RequestStatus,
        sent_at: Option<DateTime<Utc>>,
    ) -> StoreResult<bool> {
        let mut state = self.write()?;
        let request = state
            .requests
            .get_mut(&id)
            .ok_or_else(|| StoreError::not_found("send request", id))?;
        if !request.status.can_transition_to(status) {
            return Ok(false);
        }
        request.status = status;
        if sent_at.is_some() {
            request.sent_at = sent_at;
        }
        request.updated_at = Utc::now();
        Ok(true)
    }

    async fn requests_for_cycle(
        &self,
        publication_id: PublicationId,
        cycle_at: DateTime<Utc>,
    ) -> StoreResult<Vec<SendRequest>> {
        let state = self.read()?;
        let mut out: Vec<_> = state
            .requests
            .values()
            .filter(|r| r.publication_id == publication_id && r.cycle_at == cycle_at)
            .cloned()
            .collect();
        out.sort_by_key(|r| (r.created_at, r.id));
        Ok(out)
    }

    async fn requests_for_publication(
        &self,
        publication_id: PublicationId,
    ) -> StoreResult<Vec<SendRequest>> {
        let state = self.read()?;
        let mut out: Vec<_> = state
            .requests
            .values()
            .filter(|r| r.publication_id == publication_id)
            .cloned()
            .collect();
        out.sort_by_key(|r| (r.created_at, r.id));
        Ok(out)
    }
}

#[async_trait]
impl WorkerMessageStore for InMemoryStore {
    async fn insert_messages(&self, messages: &[WorkerMessage]) -> StoreResult<()> {
        let mut state = self.write()?;
        for message in messages {
            state.messages.insert(message.id, message.clone());
        }
        Ok(())
    }

    async fn get_message(&self, id: WorkerMessageId) -> StoreResult<Option<WorkerMessage>> {
        Ok(self.read()?.messages.get(&id).cloned())
    }

    async fn claim_pending_message(
        &self,
        tenant_id: TenantId,
    ) -> StoreResult<Option<WorkerMessage>> {
        let mut state = self.write()?;
        let Some(id) = state
            .messages
            .values()
            .filter(|m| m.tenant_id == tenant_id && m.status == MessageStatus::Pending)
            .min_by_key(|m| (m.created_at, m.id))
            .map(|m| m.id)
        else {
            return Ok(None);
        };

        let Some(message) = state.messages.get_mut(&id) else {
            return Ok(None);
        };
        message.status = MessageStatus::InProgress;
        message.attempts += 1;
        message.updated_at = Utc::now();
        Ok(Some(message.clone()))
    }

    async fn mark_message_sent(
        &self,
        id: WorkerMessageId,
        at: DateTime<Utc>,
    ) -> StoreResult<bool> {
        let mut state = self.write()?;
        let message = state
            .messages
            .get_mut(&id)
            .ok_or_else(|| StoreError::not_found("worker message", id))?;
        if !message.status.can_transition_to(MessageStatus::Sent) {
            return Ok(false);
        }
        message.status = MessageStatus::Sent;
        message.sent_at = Some(at);
        message.last_error = None;
        message.updated_at = Utc::now();
        Ok(true)
    }

    async fn mark_message_failed(&self, id: WorkerMessageId, error: &str) -> StoreResult<bool> {
        let mut state = self.write()?;
        let message = state
            .messages
            .get_mut(&id)
            .ok_or_else(|| StoreError::not_found("worker message", id))?;
        if !message.status.can_transition_to(MessageStatus::Failed) {
            return Ok(false);
        }
        message.status = MessageStatus::Failed;
        message.last_error = Some(error.to_string());
        message.updated_at = Utc::now();
        Ok(true)
    }

    async fn messages_for_request(
        &self,
        request_id: SendRequestId,
    ) -> StoreResult<Vec<WorkerMessage>> {
        let state = self.read()?;
        let mut out: Vec<_> = state
            .messages
            .values()
            .filter(|m| m.request_id == request_id)
            .cloned()
            .collect();
        out.sort_by_key(|m| (m.created_at, m.id));
        Ok(out)
    }
}

#[async_trait]
impl TenantRegistry for InMemoryStore {
    async fn upsert_tenant(&self, tenant: &Tenant) -> StoreResult<()> {
        self.write()?.tenants.insert(tenant.id, tenant.clone());
        Ok(())
    }

    async fn get_tenant(&self, id: TenantId) -> StoreResult<Option<Tenant>> {
        Ok(self.read()?.tenants.get(&id).cloned())
    }
}
