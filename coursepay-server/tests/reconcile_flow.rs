//! End-to-end reconciliation properties, driven through the public engine
//! API with the in-memory repository and scripted provider fakes.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Value};

use coursepay_server::provider::{
    ChargeLookup, ChargeRef, LookupError, ProviderCharge, ProviderIntent,
};
use coursepay_server::reconciler::ReconcileError;
use coursepay_server::repository::{EventStatus, IngestOutcome, NewEvent, Repository};
use coursepay_server::state_machine::state::{
    ChargeId, CourseId, PaymentState, ProviderEventId, ProviderIntentId, UserId,
};
use coursepay_server::{
    ChargeResolver, DomainEvent, InMemoryRepository, ReconcileJob, ReconcileOutcome, Reconciler,
    RetryPolicy, Scheduler,
};

// =============================================================================
// Scripted provider fakes
// =============================================================================

/// What the fake provider should answer with.
enum Script {
    /// Intent fetch returns an expanded charge.
    Expanded,
    /// Intent fetch exposes only a charge id; the charge fetch answers.
    Reference,
    /// No charge exists anywhere.
    NoCharge,
    /// Every call fails transiently.
    AlwaysTransient,
    /// Any call is a test failure.
    MustNotBeCalled,
}

struct FakeProvider {
    script: Script,
    intent_calls: AtomicU32,
    charge_calls: AtomicU32,
}

impl FakeProvider {
    fn new(script: Script) -> Arc<Self> {
        Arc::new(Self {
            script,
            intent_calls: AtomicU32::new(0),
            charge_calls: AtomicU32::new(0),
        })
    }

    fn total_calls(&self) -> u32 {
        self.intent_calls.load(Ordering::SeqCst) + self.charge_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ChargeLookup for FakeProvider {
    async fn fetch_intent(&self, id: &ProviderIntentId) -> Result<ProviderIntent, LookupError> {
        self.intent_calls.fetch_add(1, Ordering::SeqCst);
        match self.script {
            Script::Expanded => Ok(ProviderIntent {
                id: id.0.clone(),
                status: "succeeded".to_string(),
                latest_charge: Some(ChargeRef::Expanded(ProviderCharge {
                    id: "ch_1".to_string(),
                    amount_captured: 9999,
                    status: "succeeded".to_string(),
                })),
            }),
            Script::Reference => Ok(ProviderIntent {
                id: id.0.clone(),
                status: "succeeded".to_string(),
                latest_charge: Some(ChargeRef::Id("ch_1".to_string())),
            }),
            Script::NoCharge => Ok(ProviderIntent {
                id: id.0.clone(),
                status: "processing".to_string(),
                latest_charge: None,
            }),
            Script::AlwaysTransient => Err(LookupError::Transient("provider 503".to_string())),
            Script::MustNotBeCalled => panic!("provider must not be called in this scenario"),
        }
    }

    async fn fetch_charge(&self, id: &ChargeId) -> Result<ProviderCharge, LookupError> {
        self.charge_calls.fetch_add(1, Ordering::SeqCst);
        match self.script {
            Script::Reference => Ok(ProviderCharge {
                id: id.0.clone(),
                amount_captured: 9999,
                status: "succeeded".to_string(),
            }),
            Script::AlwaysTransient => Err(LookupError::Transient("provider 503".to_string())),
            _ => panic!("unexpected charge fetch in this scenario"),
        }
    }
}

// =============================================================================
// Harness
// =============================================================================

struct Harness {
    repository: Arc<InMemoryRepository>,
    reconciler: Arc<Reconciler>,
    provider: Arc<FakeProvider>,
}

fn harness(script: Script) -> Harness {
    let repository = Arc::new(InMemoryRepository::new());
    let provider = FakeProvider::new(script);
    let resolver = ChargeResolver::new(provider.clone(), Duration::from_secs(1));
    let repo_dyn: Arc<dyn Repository> = repository.clone();
    let reconciler = Arc::new(Reconciler::new(repo_dyn, resolver));
    Harness {
        repository,
        reconciler,
        provider,
    }
}

fn envelope(event_id: &str, kind: &str, object: Value) -> String {
    json!({"id": event_id, "type": kind, "data": {"object": object}}).to_string()
}

fn intent_object(intent_id: &str) -> Value {
    json!({
        "id": intent_id,
        "amount": 9999,
        "currency": "usd",
        "metadata": {"user_id": "user_1", "course_id": "course_1"},
    })
}

async fn ingest(
    repository: &InMemoryRepository,
    event_id: &str,
    kind: &str,
    object: Value,
) -> IngestOutcome {
    repository
        .ingest_event(NewEvent {
            provider_event_id: ProviderEventId::from(event_id),
            kind: kind.to_string(),
            payload: envelope(event_id, kind, object),
            payload_hash: "test".to_string(),
            received_at: Utc::now(),
        })
        .await
        .unwrap()
}

async fn assert_completed(harness: &Harness, intent_id: &str, charge_id: &str) {
    let intent = harness
        .repository
        .find_intent(&ProviderIntentId::from(intent_id))
        .await
        .unwrap()
        .expect("intent must exist");
    match &intent.state {
        PaymentState::Completed { charge_id: ch, .. } => assert_eq!(ch.0, charge_id),
        other => panic!("expected Completed, got {:?}", other),
    }

    let transactions = harness
        .repository
        .transactions_for_intent(intent.id)
        .await
        .unwrap();
    assert_eq!(transactions.len(), 1, "exactly one settlement row");
    assert_eq!(transactions[0].amount_minor, 9999);
    assert_eq!(transactions[0].charge_id.0, charge_id);

    let enrollment = harness
        .repository
        .find_enrollment(&UserId::from("user_1"), &CourseId::from("course_1"))
        .await
        .unwrap();
    assert!(enrollment.is_some(), "exactly one enrollment row");
}

// =============================================================================
// Spec properties
// =============================================================================

/// Applying the same event twice yields the same terminal state and
/// exactly one Transaction/Enrollment pair.
#[tokio::test]
async fn idempotent_replay() {
    let h = harness(Script::Expanded);

    ingest(
        &h.repository,
        "evt_1",
        "payment_intent.succeeded",
        intent_object("pi_123"),
    )
    .await;

    let first = h
        .reconciler
        .reconcile(&ProviderEventId::from("evt_1"))
        .await
        .unwrap();
    assert_eq!(first, ReconcileOutcome::Applied);

    // Same event again: the dedup gate reports it finished.
    let second = h
        .reconciler
        .reconcile(&ProviderEventId::from("evt_1"))
        .await
        .unwrap();
    assert_eq!(second, ReconcileOutcome::Duplicate);

    // A distinct delivery with the same semantic content replays as a
    // no-op against the terminal state.
    ingest(
        &h.repository,
        "evt_2",
        "payment_intent.succeeded",
        intent_object("pi_123"),
    )
    .await;
    let replay = h
        .reconciler
        .reconcile(&ProviderEventId::from("evt_2"))
        .await
        .unwrap();
    assert_eq!(replay, ReconcileOutcome::NoOp);

    assert_completed(&h, "pi_123", "ch_1").await;
}

/// A `succeeded` event delivered before the corresponding `created` event
/// still reaches `completed` with correct data once both are applied.
#[tokio::test]
async fn out_of_order_delivery() {
    let h = harness(Script::Expanded);

    ingest(
        &h.repository,
        "evt_succeeded",
        "payment_intent.succeeded",
        intent_object("pi_123"),
    )
    .await;
    let outcome = h
        .reconciler
        .reconcile(&ProviderEventId::from("evt_succeeded"))
        .await
        .unwrap();
    assert_eq!(outcome, ReconcileOutcome::Applied);

    // The late `created` event changes nothing.
    ingest(
        &h.repository,
        "evt_created",
        "payment_intent.created",
        intent_object("pi_123"),
    )
    .await;
    let outcome = h
        .reconciler
        .reconcile(&ProviderEventId::from("evt_created"))
        .await
        .unwrap();
    assert_eq!(outcome, ReconcileOutcome::NoOp);

    assert_completed(&h, "pi_123", "ch_1").await;
}

/// N concurrent deliveries of the identical event id: one transition, one
/// enrollment row, the rest observe the dedup gate.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_duplicate_delivery() {
    let h = harness(Script::Expanded);

    // Concurrent ingestion of the same event id: exactly one Fresh.
    let mut ingest_handles = Vec::new();
    for _ in 0..8 {
        let repository = h.repository.clone();
        ingest_handles.push(tokio::spawn(async move {
            ingest(
                &repository,
                "evt_1",
                "payment_intent.succeeded",
                intent_object("pi_123"),
            )
            .await
        }));
    }
    let mut fresh = 0;
    for handle in ingest_handles {
        if handle.await.unwrap() == IngestOutcome::Fresh {
            fresh += 1;
        }
    }
    assert_eq!(fresh, 1);

    // Concurrent reconciliation of that one event: exactly one Applied.
    let mut reconcile_handles = Vec::new();
    for _ in 0..8 {
        let reconciler = h.reconciler.clone();
        reconcile_handles.push(tokio::spawn(async move {
            reconciler
                .reconcile(&ProviderEventId::from("evt_1"))
                .await
                .unwrap()
        }));
    }
    let mut applied = 0;
    for handle in reconcile_handles {
        if handle.await.unwrap() == ReconcileOutcome::Applied {
            applied += 1;
        }
    }
    assert_eq!(applied, 1, "exactly one worker may commit the transition");

    assert_completed(&h, "pi_123", "ch_1").await;
}

/// Fallback chain: embedded payload data wins without a provider call.
#[tokio::test]
async fn fallback_embedded_charge() {
    let h = harness(Script::MustNotBeCalled);

    let mut object = intent_object("pi_123");
    object["latest_charge"] = json!({
        "id": "ch_embedded",
        "amount_captured": 9999,
        "status": "succeeded",
    });
    ingest(&h.repository, "evt_1", "payment_intent.succeeded", object).await;

    let outcome = h
        .reconciler
        .reconcile(&ProviderEventId::from("evt_1"))
        .await
        .unwrap();
    assert_eq!(outcome, ReconcileOutcome::Applied);
    assert_eq!(h.provider.total_calls(), 0);

    assert_completed(&h, "pi_123", "ch_embedded").await;
}

/// Fallback chain: no embedded data, the expanded intent fetch answers.
#[tokio::test]
async fn fallback_expanded_fetch() {
    let h = harness(Script::Expanded);

    ingest(
        &h.repository,
        "evt_1",
        "payment_intent.succeeded",
        intent_object("pi_123"),
    )
    .await;
    h.reconciler
        .reconcile(&ProviderEventId::from("evt_1"))
        .await
        .unwrap();

    assert_eq!(h.provider.intent_calls.load(Ordering::SeqCst), 1);
    assert_eq!(h.provider.charge_calls.load(Ordering::SeqCst), 0);
    assert_completed(&h, "pi_123", "ch_1").await;
}

/// Fallback chain: the intent exposes only a reference; the charge is
/// fetched directly by id.
#[tokio::test]
async fn fallback_latest_charge_fetch() {
    let h = harness(Script::Reference);

    ingest(
        &h.repository,
        "evt_1",
        "payment_intent.succeeded",
        intent_object("pi_123"),
    )
    .await;
    h.reconciler
        .reconcile(&ProviderEventId::from("evt_1"))
        .await
        .unwrap();

    assert_eq!(h.provider.intent_calls.load(Ordering::SeqCst), 1);
    assert_eq!(h.provider.charge_calls.load(Ordering::SeqCst), 1);
    assert_completed(&h, "pi_123", "ch_1").await;
}

/// Fallback chain: no charge anywhere is a typed, retryable outcome, not
/// a crash, and the intent does not move.
#[tokio::test]
async fn fallback_no_charge_anywhere() {
    let h = harness(Script::NoCharge);

    ingest(
        &h.repository,
        "evt_1",
        "payment_intent.succeeded",
        intent_object("pi_123"),
    )
    .await;
    let err = h
        .reconciler
        .reconcile(&ProviderEventId::from("evt_1"))
        .await
        .unwrap_err();
    assert_eq!(err, ReconcileError::ChargeUnavailable);

    let intent = h
        .repository
        .find_intent(&ProviderIntentId::from("pi_123"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(intent.state, PaymentState::Pending);
}

/// A `failed` event delivered after `completed` is rejected and does not
/// alter state.
#[tokio::test]
async fn terminal_immutability() {
    let h = harness(Script::Expanded);

    ingest(
        &h.repository,
        "evt_ok",
        "payment_intent.succeeded",
        intent_object("pi_123"),
    )
    .await;
    h.reconciler
        .reconcile(&ProviderEventId::from("evt_ok"))
        .await
        .unwrap();

    let mut object = intent_object("pi_123");
    object["last_payment_error"] = json!({"message": "card_declined"});
    ingest(
        &h.repository,
        "evt_failed",
        "payment_intent.payment_failed",
        object,
    )
    .await;
    let err = h
        .reconciler
        .reconcile(&ProviderEventId::from("evt_failed"))
        .await
        .unwrap_err();
    assert!(matches!(err, ReconcileError::Invariant(_)));

    // Success is not revocable: still completed, records intact.
    assert_completed(&h, "pi_123", "ch_1").await;
}

/// An always-transient resolver is retried exactly `max_attempts` times
/// and then dead-lettered, never indefinitely.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn retry_cap_dead_letters() {
    let h = harness(Script::AlwaysTransient);
    let policy = RetryPolicy {
        max_attempts: 3,
        base_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(4),
    };
    let repo_dyn: Arc<dyn Repository> = h.repository.clone();
    let scheduler = Scheduler::start(
        h.reconciler.clone(),
        repo_dyn,
        policy,
        2,
        16,
        Duration::ZERO,
    );

    ingest(
        &h.repository,
        "evt_1",
        "payment_intent.succeeded",
        intent_object("pi_123"),
    )
    .await;
    scheduler
        .enqueue(ReconcileJob::new(ProviderEventId::from("evt_1")))
        .await;

    // Wait for the dead letter to land.
    let mut dead = None;
    for _ in 0..500 {
        if let Some(record) = h
            .repository
            .find_dead_letter(&ProviderEventId::from("evt_1"))
            .await
            .unwrap()
        {
            dead = Some(record);
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let dead = dead.expect("event must be dead-lettered");

    assert_eq!(dead.attempts, 3);
    assert_eq!(dead.reason, "transient failure retry limit exceeded");
    assert_eq!(
        h.provider.intent_calls.load(Ordering::SeqCst),
        3,
        "resolver runs exactly max_attempts times"
    );

    let event = h
        .repository
        .load_event(&ProviderEventId::from("evt_1"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(event.status, EventStatus::Rejected);
}

/// The canonical double-delivery scenario: `evt_1` for `pi_123` delivered
/// twice concurrently, no embedded charge, resolver falls back to the
/// expanded fetch and finds `ch_1` for 9999 minor units.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn example_scenario() {
    let h = harness(Script::Expanded);

    let (a, b) = tokio::join!(
        {
            let repository = h.repository.clone();
            async move {
                ingest(
                    &repository,
                    "evt_1",
                    "payment_intent.succeeded",
                    intent_object("pi_123"),
                )
                .await
            }
        },
        {
            let repository = h.repository.clone();
            async move {
                ingest(
                    &repository,
                    "evt_1",
                    "payment_intent.succeeded",
                    intent_object("pi_123"),
                )
                .await
            }
        }
    );

    // One delivery wins the gate; the other acknowledges without writes.
    let outcomes = [a, b];
    assert_eq!(
        outcomes
            .iter()
            .filter(|o| **o == IngestOutcome::Fresh)
            .count(),
        1
    );
    assert_eq!(
        outcomes
            .iter()
            .filter(|o| **o == IngestOutcome::AlreadyInFlight)
            .count(),
        1
    );

    h.reconciler
        .reconcile(&ProviderEventId::from("evt_1"))
        .await
        .unwrap();
    assert_completed(&h, "pi_123", "ch_1").await;
}

/// `CourseEnrolled` is published exactly once per enrollment, after
/// commit, and replays stay silent.
#[tokio::test]
async fn domain_event_published_once() {
    let h = harness(Script::Expanded);
    let mut events = h.reconciler.subscribe();

    ingest(
        &h.repository,
        "evt_1",
        "payment_intent.succeeded",
        intent_object("pi_123"),
    )
    .await;
    h.reconciler
        .reconcile(&ProviderEventId::from("evt_1"))
        .await
        .unwrap();

    let event = events.try_recv().unwrap();
    match event {
        DomainEvent::CourseEnrolled {
            user_id,
            course_id,
            payment_intent_id,
        } => {
            assert_eq!(user_id.0, "user_1");
            assert_eq!(course_id.0, "course_1");
            assert!(payment_intent_id.is_some());
        }
    }

    // Replay of the same semantic event: no second publication.
    ingest(
        &h.repository,
        "evt_2",
        "payment_intent.succeeded",
        intent_object("pi_123"),
    )
    .await;
    h.reconciler
        .reconcile(&ProviderEventId::from("evt_2"))
        .await
        .unwrap();
    assert!(events.try_recv().is_err());
}

/// Refund-family kinds are acknowledged and recorded but produce no
/// transition; they must not dead-letter normal provider traffic.
#[tokio::test]
async fn refund_kinds_are_ignored_not_rejected() {
    let h = harness(Script::MustNotBeCalled);

    ingest(
        &h.repository,
        "evt_refund",
        "charge.refunded",
        json!({"id": "ch_1", "amount_refunded": 9999}),
    )
    .await;
    let outcome = h
        .reconciler
        .reconcile(&ProviderEventId::from("evt_refund"))
        .await
        .unwrap();
    assert_eq!(outcome, ReconcileOutcome::Ignored);

    let event = h
        .repository
        .load_event(&ProviderEventId::from("evt_refund"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(event.status, EventStatus::Applied);
}

/// Free-course activation races the payment path; the uniqueness
/// constraint lets exactly one through and both report success.
#[tokio::test]
async fn free_path_races_payment_path() {
    let h = harness(Script::Expanded);

    // Free enrollment lands first.
    h.reconciler
        .activate_enrollment(&UserId::from("user_1"), &CourseId::from("course_1"))
        .await
        .unwrap();

    // Payment settles afterwards; the enrollment conflict is success.
    ingest(
        &h.repository,
        "evt_1",
        "payment_intent.succeeded",
        intent_object("pi_123"),
    )
    .await;
    let outcome = h
        .reconciler
        .reconcile(&ProviderEventId::from("evt_1"))
        .await
        .unwrap();
    assert_eq!(outcome, ReconcileOutcome::Applied);

    let intent = h
        .repository
        .find_intent(&ProviderIntentId::from("pi_123"))
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(intent.state, PaymentState::Completed { .. }));

    // Still a single enrollment row, from the free path.
    let enrollment = h
        .repository
        .find_enrollment(&UserId::from("user_1"), &CourseId::from("course_1"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(enrollment.payment_intent_id, None);
}

/// Malformed payloads (well-formed envelope, missing identifiers) are a
/// permanent failure surfaced through the typed error, not a panic.
#[tokio::test]
async fn missing_metadata_is_malformed() {
    let h = harness(Script::MustNotBeCalled);

    ingest(
        &h.repository,
        "evt_1",
        "payment_intent.succeeded",
        json!({"id": "pi_123", "amount": 9999, "currency": "usd"}),
    )
    .await;
    let err = h
        .reconciler
        .reconcile(&ProviderEventId::from("evt_1"))
        .await
        .unwrap_err();
    assert!(matches!(err, ReconcileError::Malformed(_)));
}
