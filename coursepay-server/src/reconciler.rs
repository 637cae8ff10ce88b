//! The reconciliation engine.
//!
//! Ties the pieces together for a single stored webhook event: claim it
//! through the dedup gate, load or create the local payment intent,
//! resolve authoritative charge data when the event needs it, run the
//! pure transition, and commit the result - state flip, transaction row
//! and enrollment row in one unit of work, guarded by the intent's
//! optimistic version.
//!
//! The reconciler classifies nothing and retries nothing: it reports a
//! typed error and leaves the claim in `processing`. The scheduler owns
//! release/retry/dead-letter decisions.

use std::fmt;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::enrollment::{DomainEvent, EnrollmentActivator};
use crate::repository::{
    ActivationOutcome, CommitEffects, EventClaim, Repository, RepositoryError, StoredEvent,
    TransactionRecord,
};
use crate::resolver::{ChargeResolver, ResolveError};
use crate::state_machine::effect::{Effect, LogLevel};
use crate::state_machine::event::{EventKind, PaymentEvent};
use crate::state_machine::state::{
    CourseId, PaymentIntent, ProviderEventId, ProviderIntentId, ResolvedCharge, UserId,
};
use crate::state_machine::transition::{transition, TransitionError};
use crate::webhook::EventEnvelope;

/// How reconciling a stored event can fail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileError {
    /// The stored payload cannot be interpreted (bad JSON, missing
    /// identifiers). Permanent.
    Malformed(String),
    /// The event contradicts committed state (e.g. failed after
    /// completed). Permanent.
    Invariant(String),
    /// Charge lookup hit network/provider trouble. Transient.
    TransientLookup(String),
    /// No charge exists at the provider yet. Transient, capped.
    ChargeUnavailable,
    /// A concurrent reconciliation committed first. Transient; reread
    /// and retry.
    Conflict,
    /// The backing store failed. Transient.
    Storage(RepositoryError),
}

impl fmt::Display for ReconcileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Malformed(msg) => write!(f, "malformed event payload: {}", msg),
            Self::Invariant(msg) => write!(f, "invariant violation: {}", msg),
            Self::TransientLookup(msg) => write!(f, "transient lookup failure: {}", msg),
            Self::ChargeUnavailable => write!(f, "charge unavailable"),
            Self::Conflict => write!(f, "concurrency conflict"),
            Self::Storage(err) => write!(f, "storage failure: {}", err),
        }
    }
}

impl std::error::Error for ReconcileError {}

impl From<RepositoryError> for ReconcileError {
    fn from(err: RepositoryError) -> Self {
        if err.is_conflict() {
            Self::Conflict
        } else {
            Self::Storage(err)
        }
    }
}

impl From<ResolveError> for ReconcileError {
    fn from(err: ResolveError) -> Self {
        match err {
            ResolveError::TransientLookup(msg) => Self::TransientLookup(msg),
            ResolveError::ChargeUnavailable => Self::ChargeUnavailable,
        }
    }
}

impl From<TransitionError> for ReconcileError {
    fn from(err: TransitionError) -> Self {
        Self::Invariant(err.to_string())
    }
}

/// What reconciling an event amounted to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// A state transition was committed.
    Applied,
    /// Replay or stale chatter; acknowledged without a state change.
    NoOp,
    /// The event kind is outside the payment lifecycle (refund family,
    /// unknown kinds). Recorded and acknowledged, no transition.
    Ignored,
    /// Another worker holds or already finished this event.
    Duplicate,
}

/// The engine. One instance serves all payment intents; per-intent
/// serialization comes from the version compare-and-swap at commit.
pub struct Reconciler {
    repository: Arc<dyn Repository>,
    resolver: ChargeResolver,
    activator: EnrollmentActivator,
}

impl Reconciler {
    pub fn new(repository: Arc<dyn Repository>, resolver: ChargeResolver) -> Self {
        let activator = EnrollmentActivator::new(repository.clone());
        Self {
            repository,
            resolver,
            activator,
        }
    }

    /// Subscribe to domain events published after commit.
    pub fn subscribe(&self) -> broadcast::Receiver<DomainEvent> {
        self.activator.subscribe()
    }

    /// Activate an enrollment outside the payment path (free courses).
    pub async fn activate_enrollment(
        &self,
        user_id: &UserId,
        course_id: &CourseId,
    ) -> Result<ActivationOutcome, RepositoryError> {
        self.activator.activate(user_id, course_id, None).await
    }

    /// Reconcile one stored event end to end.
    ///
    /// On success the event is marked `applied`. On failure the claim is
    /// left in `processing`; the scheduler releases or rejects it based
    /// on its classification of the error.
    pub async fn reconcile(
        &self,
        event_id: &ProviderEventId,
    ) -> Result<ReconcileOutcome, ReconcileError> {
        match self.repository.claim_event(event_id).await? {
            EventClaim::Claimed => {}
            EventClaim::Busy | EventClaim::Done => {
                debug!("event {} already claimed or finished", event_id);
                return Ok(ReconcileOutcome::Duplicate);
            }
        }

        let stored = self.repository.load_event(event_id).await?.ok_or_else(|| {
            ReconcileError::Storage(RepositoryError::storage(
                "load_event",
                format!("claimed event {} vanished", event_id),
            ))
        })?;

        let outcome = self.apply(&stored).await?;
        self.repository.mark_event_applied(event_id).await?;

        info!(
            "event {} reconciled: {:?} (kind {})",
            event_id, outcome, stored.kind
        );
        Ok(outcome)
    }

    /// Interpret and apply a claimed event.
    async fn apply(&self, stored: &StoredEvent) -> Result<ReconcileOutcome, ReconcileError> {
        let envelope: EventEnvelope = serde_json::from_str(&stored.payload)
            .map_err(|e| ReconcileError::Malformed(e.to_string()))?;

        let kind = EventKind::parse(&envelope.kind);
        if kind == EventKind::Other {
            debug!(
                "event {} has kind {} outside the payment lifecycle, acknowledging",
                stored.provider_event_id, envelope.kind
            );
            return Ok(ReconcileOutcome::Ignored);
        }

        let object = envelope.data.object;
        if object.id.is_empty() {
            return Err(ReconcileError::Malformed(
                "payload object has no payment intent id".to_string(),
            ));
        }
        let provider_intent_id = ProviderIntentId(object.id.clone());

        let now = Utc::now();

        // Any event referencing an intent not yet locally known creates it
        // in `pending` first; webhooks arrive in no particular order.
        let intent = match self.repository.find_intent(&provider_intent_id).await? {
            Some(intent) => intent,
            None => {
                if object.metadata.user_id.is_empty() || object.metadata.course_id.is_empty() {
                    return Err(ReconcileError::Malformed(format!(
                        "event for unknown intent {} carries no user/course metadata",
                        provider_intent_id
                    )));
                }
                if object.currency.is_empty() {
                    return Err(ReconcileError::Malformed(format!(
                        "event for unknown intent {} carries no currency",
                        provider_intent_id
                    )));
                }
                let fresh = PaymentIntent::new_pending(
                    provider_intent_id.clone(),
                    UserId(object.metadata.user_id.clone()),
                    CourseId(object.metadata.course_id.clone()),
                    object.amount,
                    object.currency.clone(),
                    now,
                );
                self.repository.find_or_create_intent(fresh).await?
            }
        };

        // Build the machine event, resolving charge data where required.
        let event = match kind {
            EventKind::IntentCreated => PaymentEvent::IntentCreated,
            EventKind::Processing => PaymentEvent::Processing,
            EventKind::RequiresAction => PaymentEvent::ActionRequired,
            EventKind::Failed => PaymentEvent::Failed {
                reason: object
                    .last_payment_error
                    .map(|e| e.message)
                    .filter(|m| !m.is_empty())
                    .unwrap_or_else(|| "payment failed".to_string()),
            },
            EventKind::Succeeded => {
                // `completed` without a settled charge would be a lie, so
                // resolution happens before the transition runs. Terminal
                // replays skip the lookup: the transition either no-ops
                // (completed) or rejects (failed) without reading it.
                let charge = if intent.state.is_terminal() {
                    ResolvedCharge {
                        charge_id: intent.state.charge_id().cloned().unwrap_or_else(|| {
                            crate::state_machine::state::ChargeId(String::new())
                        }),
                        amount_captured: intent.amount_minor,
                        status: "succeeded".to_string(),
                    }
                } else {
                    self.resolver
                        .resolve(&provider_intent_id, embedded_charge(&object))
                        .await?
                };
                PaymentEvent::Succeeded { charge }
            }
            EventKind::Other => unreachable!("handled above"),
        };

        let before_state = intent.state.clone();
        let expected_version = intent.version;
        let result = transition(intent, event, now)?;

        run_log_effects(&result.effects);

        if !result.changed(&before_state) {
            return Ok(ReconcileOutcome::NoOp);
        }

        let mut commit = CommitEffects::default();
        for effect in &result.effects {
            match effect {
                Effect::RecordTransaction {
                    charge_id,
                    amount_minor,
                    status,
                } => {
                    commit.transaction = Some(TransactionRecord {
                        id: Uuid::new_v4(),
                        payment_intent_id: result.intent.id,
                        charge_id: charge_id.clone(),
                        amount_minor: *amount_minor,
                        status: status.clone(),
                        created_at: now,
                    });
                }
                Effect::ActivateEnrollment { user_id, course_id } => {
                    commit.enrollment = Some((user_id.clone(), course_id.clone()));
                }
                Effect::Log { .. } => {}
            }
        }

        let intent_row_id = result.intent.id;
        let enrollment_pair = commit.enrollment.clone();
        let receipt = self
            .repository
            .commit_transition(expected_version, result.intent, commit)
            .await?;

        // CourseEnrolled goes out only when THIS commit created the row;
        // a replayed or racing path that found it existing stays silent.
        if receipt.enrollment == Some(ActivationOutcome::Created) {
            if let Some((user_id, course_id)) = enrollment_pair {
                self.activator
                    .publish_enrolled(user_id, course_id, Some(intent_row_id));
            }
        }

        Ok(ReconcileOutcome::Applied)
    }
}

fn embedded_charge(object: &crate::webhook::IntentObject) -> Option<ResolvedCharge> {
    match &object.latest_charge {
        Some(crate::provider::ChargeRef::Expanded(charge)) => Some(charge.clone().into()),
        // A bare id is a reference, not embedded data; the resolver's
        // fallback chain handles it.
        Some(crate::provider::ChargeRef::Id(_)) | None => None,
    }
}

fn run_log_effects(effects: &[Effect]) {
    for effect in effects {
        if let Effect::Log { level, message } = effect {
            match level {
                LogLevel::Debug => debug!("{}", message),
                LogLevel::Info => info!("{}", message),
                LogLevel::Warn => warn!("{}", message),
                LogLevel::Error => error!("{}", message),
            }
        }
    }
}
