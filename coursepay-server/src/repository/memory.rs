//! In-memory implementation of `Repository`.
//!
//! Used by tests and available as a throwaway backend. All state is held
//! behind a single async mutex so that the multi-table operations
//! (`commit_transition`, `requeue_dead_letter`) are atomic, matching the
//! SQLite backend's transactional behavior.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{Duration, Utc};
use tokio::sync::Mutex;
use uuid::Uuid;

use super::{
    ActivationOutcome, CommitEffects, CommitReceipt, DeadLetterRecord, EnrollmentRecord,
    EventClaim, EventStatus, IngestOutcome, NewEvent, Repository, RepositoryError, StoredEvent,
    TransactionRecord,
};
use crate::state_machine::state::{CourseId, PaymentIntent, ProviderEventId, ProviderIntentId, UserId};

#[derive(Default)]
struct Inner {
    /// Keyed by provider event id - the uniqueness that backs the dedup gate.
    events: HashMap<String, StoredEvent>,
    /// Keyed by provider intent id.
    intents: HashMap<String, PaymentIntent>,
    transactions: Vec<TransactionRecord>,
    /// Keyed by (user_id, course_id) - the uniqueness that backs activation.
    enrollments: HashMap<(String, String), EnrollmentRecord>,
    dead_letters: HashMap<String, DeadLetterRecord>,
}

/// In-memory repository. All state is lost on restart.
pub struct InMemoryRepository {
    inner: Mutex<Inner>,
}

impl InMemoryRepository {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
        }
    }
}

impl Default for InMemoryRepository {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Repository for InMemoryRepository {
    async fn ingest_event(&self, event: NewEvent) -> Result<IngestOutcome, RepositoryError> {
        let mut inner = self.inner.lock().await;
        match inner.events.get(&event.provider_event_id.0) {
            Some(existing) => Ok(match existing.status {
                EventStatus::Received | EventStatus::Processing => IngestOutcome::AlreadyInFlight,
                EventStatus::Applied | EventStatus::Rejected => IngestOutcome::AlreadyProcessed,
            }),
            None => {
                let stored = StoredEvent {
                    provider_event_id: event.provider_event_id.clone(),
                    kind: event.kind,
                    payload: event.payload,
                    payload_hash: event.payload_hash,
                    received_at: event.received_at,
                    processed_at: None,
                    status: EventStatus::Received,
                };
                inner.events.insert(event.provider_event_id.0, stored);
                Ok(IngestOutcome::Fresh)
            }
        }
    }

    async fn load_event(
        &self,
        id: &ProviderEventId,
    ) -> Result<Option<StoredEvent>, RepositoryError> {
        let inner = self.inner.lock().await;
        Ok(inner.events.get(&id.0).cloned())
    }

    async fn claim_event(&self, id: &ProviderEventId) -> Result<EventClaim, RepositoryError> {
        let mut inner = self.inner.lock().await;
        match inner.events.get_mut(&id.0) {
            Some(event) => match event.status {
                EventStatus::Received => {
                    event.status = EventStatus::Processing;
                    Ok(EventClaim::Claimed)
                }
                EventStatus::Processing => Ok(EventClaim::Busy),
                EventStatus::Applied | EventStatus::Rejected => Ok(EventClaim::Done),
            },
            None => Ok(EventClaim::Done),
        }
    }

    async fn release_event(&self, id: &ProviderEventId) -> Result<(), RepositoryError> {
        let mut inner = self.inner.lock().await;
        if let Some(event) = inner.events.get_mut(&id.0) {
            if event.status == EventStatus::Processing {
                event.status = EventStatus::Received;
            }
        }
        Ok(())
    }

    async fn mark_event_applied(&self, id: &ProviderEventId) -> Result<(), RepositoryError> {
        let mut inner = self.inner.lock().await;
        if let Some(event) = inner.events.get_mut(&id.0) {
            event.status = EventStatus::Applied;
            event.processed_at = Some(Utc::now());
        }
        Ok(())
    }

    async fn mark_event_rejected(&self, id: &ProviderEventId) -> Result<(), RepositoryError> {
        let mut inner = self.inner.lock().await;
        if let Some(event) = inner.events.get_mut(&id.0) {
            event.status = EventStatus::Rejected;
            event.processed_at = Some(Utc::now());
        }
        Ok(())
    }

    async fn stale_received_events(
        &self,
        older_than_secs: i64,
    ) -> Result<Vec<ProviderEventId>, RepositoryError> {
        let cutoff = Utc::now() - Duration::seconds(older_than_secs);
        let inner = self.inner.lock().await;
        Ok(inner
            .events
            .values()
            .filter(|e| e.status == EventStatus::Received && e.received_at <= cutoff)
            .map(|e| e.provider_event_id.clone())
            .collect())
    }

    async fn release_in_flight_events(&self) -> Result<usize, RepositoryError> {
        let mut inner = self.inner.lock().await;
        let mut released = 0;
        for event in inner.events.values_mut() {
            if event.status == EventStatus::Processing {
                event.status = EventStatus::Received;
                released += 1;
            }
        }
        Ok(released)
    }

    async fn find_intent(
        &self,
        id: &ProviderIntentId,
    ) -> Result<Option<PaymentIntent>, RepositoryError> {
        let inner = self.inner.lock().await;
        Ok(inner.intents.get(&id.0).cloned())
    }

    async fn find_or_create_intent(
        &self,
        intent: PaymentIntent,
    ) -> Result<PaymentIntent, RepositoryError> {
        let mut inner = self.inner.lock().await;
        let entry = inner
            .intents
            .entry(intent.provider_intent_id.0.clone())
            .or_insert(intent);
        Ok(entry.clone())
    }

    async fn commit_transition(
        &self,
        expected_version: u64,
        updated: PaymentIntent,
        effects: CommitEffects,
    ) -> Result<CommitReceipt, RepositoryError> {
        let mut inner = self.inner.lock().await;

        let stored = inner
            .intents
            .get(&updated.provider_intent_id.0)
            .ok_or_else(|| RepositoryError::storage("commit_transition", "intent not found"))?;
        if stored.version != expected_version {
            return Err(RepositoryError::conflict("payment_intent"));
        }

        let mut committed = updated;
        committed.version = expected_version + 1;
        let intent_row_id = committed.id;
        inner
            .intents
            .insert(committed.provider_intent_id.0.clone(), committed);

        if let Some(transaction) = effects.transaction {
            // Append-only, once per (intent, charge): a replayed completion
            // must not mint a second settlement row.
            let exists = inner.transactions.iter().any(|t| {
                t.payment_intent_id == transaction.payment_intent_id
                    && t.charge_id == transaction.charge_id
            });
            if !exists {
                inner.transactions.push(transaction);
            }
        }

        let mut receipt = CommitReceipt::default();
        if let Some((user_id, course_id)) = effects.enrollment {
            receipt.enrollment = Some(insert_enrollment(
                &mut inner,
                &user_id,
                &course_id,
                Some(intent_row_id),
            ));
        }

        Ok(receipt)
    }

    async fn activate_enrollment(
        &self,
        user_id: &UserId,
        course_id: &CourseId,
        payment_intent_id: Option<Uuid>,
    ) -> Result<ActivationOutcome, RepositoryError> {
        let mut inner = self.inner.lock().await;
        Ok(insert_enrollment(
            &mut inner,
            user_id,
            course_id,
            payment_intent_id,
        ))
    }

    async fn find_enrollment(
        &self,
        user_id: &UserId,
        course_id: &CourseId,
    ) -> Result<Option<EnrollmentRecord>, RepositoryError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .enrollments
            .get(&(user_id.0.clone(), course_id.0.clone()))
            .cloned())
    }

    async fn transactions_for_intent(
        &self,
        payment_intent_id: Uuid,
    ) -> Result<Vec<TransactionRecord>, RepositoryError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .transactions
            .iter()
            .filter(|t| t.payment_intent_id == payment_intent_id)
            .cloned()
            .collect())
    }

    async fn push_dead_letter(&self, record: DeadLetterRecord) -> Result<(), RepositoryError> {
        let mut inner = self.inner.lock().await;
        inner
            .dead_letters
            .insert(record.provider_event_id.0.clone(), record);
        Ok(())
    }

    async fn list_dead_letters(&self) -> Result<Vec<DeadLetterRecord>, RepositoryError> {
        let inner = self.inner.lock().await;
        let mut records: Vec<_> = inner.dead_letters.values().cloned().collect();
        records.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(records)
    }

    async fn find_dead_letter(
        &self,
        id: &ProviderEventId,
    ) -> Result<Option<DeadLetterRecord>, RepositoryError> {
        let inner = self.inner.lock().await;
        Ok(inner.dead_letters.get(&id.0).cloned())
    }

    async fn requeue_dead_letter(&self, id: &ProviderEventId) -> Result<bool, RepositoryError> {
        let mut inner = self.inner.lock().await;
        if inner.dead_letters.remove(&id.0).is_none() {
            return Ok(false);
        }
        if let Some(event) = inner.events.get_mut(&id.0) {
            event.status = EventStatus::Received;
            event.processed_at = None;
        }
        Ok(true)
    }
}

fn insert_enrollment(
    inner: &mut Inner,
    user_id: &UserId,
    course_id: &CourseId,
    payment_intent_id: Option<Uuid>,
) -> ActivationOutcome {
    let key = (user_id.0.clone(), course_id.0.clone());
    if inner.enrollments.contains_key(&key) {
        return ActivationOutcome::AlreadyEnrolled;
    }
    inner.enrollments.insert(
        key,
        EnrollmentRecord {
            id: Uuid::new_v4(),
            user_id: user_id.clone(),
            course_id: course_id.clone(),
            payment_intent_id,
            status: "active".to_string(),
            created_at: Utc::now(),
        },
    );
    ActivationOutcome::Created
}
