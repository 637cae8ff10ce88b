//! Repository abstraction for engine persistence.
//!
//! This module defines the `Repository` trait that abstracts storage for
//! the event store, payment intents, transactions, enrollments, and the
//! dead-letter queue. Implementations provide different backends
//! (in-memory for tests, SQLite for production).
//!
//! Two invariants are enforced HERE, at the storage layer, because they
//! must hold under concurrent callers:
//! - `ingest_event` claims the provider event id under a unique key, so a
//!   given event is handed out exactly once even under concurrent delivery;
//! - `commit_transition` applies the state flip, the transaction row, and
//!   the enrollment row in one unit of work guarded by a version
//!   compare-and-swap, so no reader observes `completed` without its
//!   records and no two writers commit over each other.

mod memory;
mod sqlite;

pub use memory::InMemoryRepository;
pub use sqlite::SqliteRepository;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use uuid::Uuid;

use crate::state_machine::state::{
    ChargeId, CourseId, PaymentIntent, ProviderEventId, ProviderIntentId, UserId,
};

/// Errors from repository operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RepositoryError {
    /// The backing store failed (I/O, corruption, poisoned lock).
    Storage { op: &'static str, message: String },
    /// An optimistic-version compare-and-swap lost a race with a
    /// concurrent writer. The caller must reread and retry.
    Conflict { entity: &'static str },
}

impl RepositoryError {
    pub fn storage(op: &'static str, message: impl Into<String>) -> Self {
        Self::Storage {
            op,
            message: message.into(),
        }
    }

    pub fn conflict(entity: &'static str) -> Self {
        Self::Conflict { entity }
    }

    /// Returns true if the error is a lost optimistic-lock race.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }
}

impl fmt::Display for RepositoryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Storage { op, message } => write!(f, "storage error during {}: {}", op, message),
            Self::Conflict { entity } => {
                write!(f, "concurrent modification detected on {}", entity)
            }
        }
    }
}

impl std::error::Error for RepositoryError {}

/// Lifecycle status of a stored webhook event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventStatus {
    /// Durably recorded, not yet reconciled.
    Received,
    /// A worker holds the claim and is reconciling it.
    Processing,
    /// Reconciled; immutable from here.
    Applied,
    /// Permanently rejected (dead-lettered).
    Rejected,
}

impl EventStatus {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Received => "received",
            Self::Processing => "processing",
            Self::Applied => "applied",
            Self::Rejected => "rejected",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "received" => Some(Self::Received),
            "processing" => Some(Self::Processing),
            "applied" => Some(Self::Applied),
            "rejected" => Some(Self::Rejected),
            _ => None,
        }
    }
}

/// Outcome of the dedup gate for an inbound event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOutcome {
    /// First time we see this event id; it was durably recorded.
    Fresh,
    /// The event id exists and is queued or being reconciled. Ack without
    /// re-enqueueing.
    AlreadyInFlight,
    /// The event id was fully handled (applied or rejected). Ack as an
    /// idempotent no-op.
    AlreadyProcessed,
}

/// Outcome of a worker claiming an event for reconciliation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventClaim {
    /// This worker owns the event now.
    Claimed,
    /// Another worker is reconciling it.
    Busy,
    /// Already applied/rejected, or unknown.
    Done,
}

/// A webhook event to record on ingestion.
#[derive(Debug, Clone)]
pub struct NewEvent {
    pub provider_event_id: ProviderEventId,
    pub kind: String,
    /// Raw JSON body, retained for reconciliation and manual replay.
    pub payload: String,
    /// Hex SHA-256 of the raw body.
    pub payload_hash: String,
    pub received_at: DateTime<Utc>,
}

/// A stored webhook event.
#[derive(Debug, Clone)]
pub struct StoredEvent {
    pub provider_event_id: ProviderEventId,
    pub kind: String,
    pub payload: String,
    pub payload_hash: String,
    pub received_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
    pub status: EventStatus,
}

/// Append-only settlement record. Created once, when a payment intent
/// first reaches `completed`; refunds would be further rows referencing
/// the same intent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionRecord {
    pub id: Uuid,
    pub payment_intent_id: Uuid,
    pub charge_id: ChargeId,
    pub amount_minor: i64,
    pub status: String,
    pub created_at: DateTime<Utc>,
}

/// Enrollment row. At most one non-deleted row per `(user_id, course_id)`,
/// enforced by a storage-level uniqueness constraint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnrollmentRecord {
    pub id: Uuid,
    pub user_id: UserId,
    pub course_id: CourseId,
    /// None for free-course enrollments.
    pub payment_intent_id: Option<Uuid>,
    pub status: String,
    pub created_at: DateTime<Utc>,
}

/// Outcome of an enrollment activation attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivationOutcome {
    Created,
    /// The uniqueness constraint fired: the user is already enrolled.
    /// Treated as success, not an error.
    AlreadyEnrolled,
}

/// A failure parked for manual review.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeadLetterRecord {
    pub provider_event_id: ProviderEventId,
    pub reason: String,
    pub attempts: u32,
    pub last_error: String,
    pub created_at: DateTime<Utc>,
}

/// Writes that must land in the same unit of work as a state transition.
#[derive(Debug, Clone, Default)]
pub struct CommitEffects {
    pub transaction: Option<TransactionRecord>,
    /// `(user_id, course_id)` to enroll, linked to the committed intent.
    pub enrollment: Option<(UserId, CourseId)>,
}

/// What actually happened inside a successful commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CommitReceipt {
    /// Present when the commit carried an enrollment effect.
    pub enrollment: Option<ActivationOutcome>,
}

/// Repository trait for engine persistence.
#[async_trait]
pub trait Repository: Send + Sync {
    // =========================================================================
    // Event store / dedup gate
    // =========================================================================

    /// Atomically record an inbound event under its unique provider id.
    ///
    /// This is the sole fan-in point that guarantees "this specific event
    /// has not been handled before", even under concurrent delivery of the
    /// same event id from provider retries.
    async fn ingest_event(&self, event: NewEvent) -> Result<IngestOutcome, RepositoryError>;

    /// Load a stored event by provider id.
    async fn load_event(
        &self,
        id: &ProviderEventId,
    ) -> Result<Option<StoredEvent>, RepositoryError>;

    /// Claim an event for reconciliation (`received` -> `processing`).
    async fn claim_event(&self, id: &ProviderEventId) -> Result<EventClaim, RepositoryError>;

    /// Release a claim after a failed attempt (`processing` -> `received`)
    /// so a retry can re-claim it.
    async fn release_event(&self, id: &ProviderEventId) -> Result<(), RepositoryError>;

    /// Mark an event applied (terminal, immutable from here).
    async fn mark_event_applied(&self, id: &ProviderEventId) -> Result<(), RepositoryError>;

    /// Mark an event permanently rejected.
    async fn mark_event_rejected(&self, id: &ProviderEventId) -> Result<(), RepositoryError>;

    /// Events still in `received` that were recorded more than `older_than`
    /// seconds ago. Used by the recovery sweep; double-enqueueing is
    /// harmless because the claim gate dedups.
    async fn stale_received_events(
        &self,
        older_than_secs: i64,
    ) -> Result<Vec<ProviderEventId>, RepositoryError>;

    /// Startup recovery: move crash-orphaned `processing` events back to
    /// `received`. Returns how many were released.
    async fn release_in_flight_events(&self) -> Result<usize, RepositoryError>;

    // =========================================================================
    // Payment intents
    // =========================================================================

    /// Find an intent by provider intent id.
    async fn find_intent(
        &self,
        id: &ProviderIntentId,
    ) -> Result<Option<PaymentIntent>, RepositoryError>;

    /// Insert the intent if its provider id is unknown, otherwise return
    /// the stored row. Atomic, so two workers racing to create the same
    /// intent converge on one row.
    async fn find_or_create_intent(
        &self,
        intent: PaymentIntent,
    ) -> Result<PaymentIntent, RepositoryError>;

    /// Commit a transition: persist `updated` (with `version` set to
    /// `expected_version + 1`) together with the side-effect writes, all
    /// in one unit of work. Fails with `Conflict` if the stored version
    /// no longer equals `expected_version`.
    async fn commit_transition(
        &self,
        expected_version: u64,
        updated: PaymentIntent,
        effects: CommitEffects,
    ) -> Result<CommitReceipt, RepositoryError>;

    // =========================================================================
    // Enrollment (free-course path; payment-path enrollment goes through
    // commit_transition)
    // =========================================================================

    /// Insert an enrollment row; a uniqueness conflict is reported as
    /// `AlreadyEnrolled`, never as an error. Safe under concurrent calls
    /// for the same pair.
    async fn activate_enrollment(
        &self,
        user_id: &UserId,
        course_id: &CourseId,
        payment_intent_id: Option<Uuid>,
    ) -> Result<ActivationOutcome, RepositoryError>;

    /// Look up the enrollment for a pair, if any.
    async fn find_enrollment(
        &self,
        user_id: &UserId,
        course_id: &CourseId,
    ) -> Result<Option<EnrollmentRecord>, RepositoryError>;

    /// Transactions recorded for an intent (operational queries, tests).
    async fn transactions_for_intent(
        &self,
        payment_intent_id: Uuid,
    ) -> Result<Vec<TransactionRecord>, RepositoryError>;

    // =========================================================================
    // Dead letters
    // =========================================================================

    /// Park a failure for manual review (upsert by event id).
    async fn push_dead_letter(&self, record: DeadLetterRecord) -> Result<(), RepositoryError>;

    /// All parked failures, newest first.
    async fn list_dead_letters(&self) -> Result<Vec<DeadLetterRecord>, RepositoryError>;

    /// Load one parked failure.
    async fn find_dead_letter(
        &self,
        id: &ProviderEventId,
    ) -> Result<Option<DeadLetterRecord>, RepositoryError>;

    /// Manual replay: drop the dead letter and reset its event to
    /// `received` so the sweep re-enqueues it. Returns false if no dead
    /// letter existed for the id.
    async fn requeue_dead_letter(&self, id: &ProviderEventId) -> Result<bool, RepositoryError>;
}
