//! Retry / dead-letter scheduler.
//!
//! Reconciliation runs out-of-band from the webhook handler: ingestion
//! enqueues a `ReconcileJob` and acknowledges immediately, and a bounded
//! worker pool drains the queue. Every failure is classified as transient
//! (re-enqueued with exponential backoff until the attempt cap) or
//! permanent (dead-lettered immediately). Retries are explicit scheduled
//! messages, not in-process loops, so a crashed process loses nothing:
//! the startup recovery and the periodic sweep re-enqueue any event still
//! sitting in `received`.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{mpsc, Mutex};
use tokio::time::interval;
use tracing::{debug, error, info, warn};

use crate::reconciler::{ReconcileError, Reconciler};
use crate::repository::{DeadLetterRecord, Repository};
use crate::state_machine::state::ProviderEventId;

/// Backoff and attempt policy. A configuration input, not hard-coded.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total reconcile attempts before a transient failure dead-letters.
    pub max_attempts: u32,
    /// Delay before the first retry; doubles each attempt.
    pub base_delay: Duration,
    /// Ceiling for the doubled delay.
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    /// Delay before retrying after `attempt` failed attempts
    /// (`base * 2^attempt`, capped at `max_delay`).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let shift = attempt.min(31);
        let millis = (self.base_delay.as_millis() as u64).saturating_mul(1u64 << shift);
        Duration::from_millis(millis).min(self.max_delay)
    }
}

/// Classification of a reconcile failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// Worth retrying with backoff.
    Transient,
    /// Retrying cannot help; straight to the dead letter queue.
    Permanent,
}

/// Classify a reconcile error.
pub fn classify(error: &ReconcileError) -> FailureClass {
    match error {
        ReconcileError::Malformed(_) | ReconcileError::Invariant(_) => FailureClass::Permanent,
        ReconcileError::TransientLookup(_)
        | ReconcileError::ChargeUnavailable
        | ReconcileError::Conflict
        | ReconcileError::Storage(_) => FailureClass::Transient,
    }
}

/// One unit of reconciliation work.
#[derive(Debug, Clone)]
pub struct ReconcileJob {
    pub provider_event_id: ProviderEventId,
    /// Attempts already made (0 for a fresh event).
    pub attempt: u32,
}

impl ReconcileJob {
    pub fn new(provider_event_id: ProviderEventId) -> Self {
        Self {
            provider_event_id,
            attempt: 0,
        }
    }
}

/// Handle for enqueueing work. Cheap to clone.
#[derive(Clone)]
pub struct Scheduler {
    tx: mpsc::Sender<ReconcileJob>,
}

impl Scheduler {
    /// Spawn the worker pool (and, when `sweep_interval` is non-zero, the
    /// periodic sweep that re-enqueues stale `received` events).
    ///
    /// Double-enqueueing an event is harmless: the claim gate hands it to
    /// exactly one worker and the rest observe `Duplicate`.
    pub fn start(
        reconciler: Arc<Reconciler>,
        repository: Arc<dyn Repository>,
        policy: RetryPolicy,
        worker_count: usize,
        queue_depth: usize,
        sweep_interval: Duration,
    ) -> Self {
        let (tx, rx) = mpsc::channel(queue_depth.max(1));
        let rx = Arc::new(Mutex::new(rx));

        for worker_id in 0..worker_count.max(1) {
            tokio::spawn(worker_loop(
                worker_id,
                rx.clone(),
                tx.clone(),
                reconciler.clone(),
                repository.clone(),
                policy.clone(),
            ));
        }

        if !sweep_interval.is_zero() {
            tokio::spawn(sweep_loop(tx.clone(), repository, sweep_interval));
        }

        Self { tx }
    }

    /// Enqueue a job. The webhook handler calls this after durably
    /// recording the event; it must never block on reconciliation itself.
    pub async fn enqueue(&self, job: ReconcileJob) {
        if let Err(e) = self.tx.send(job).await {
            // Only happens at shutdown when the workers are gone; the
            // sweep re-enqueues the event on next start.
            error!("failed to enqueue reconcile job: {}", e);
        }
    }
}

async fn worker_loop(
    worker_id: usize,
    rx: Arc<Mutex<mpsc::Receiver<ReconcileJob>>>,
    tx: mpsc::Sender<ReconcileJob>,
    reconciler: Arc<Reconciler>,
    repository: Arc<dyn Repository>,
    policy: RetryPolicy,
) {
    debug!("reconcile worker {} started", worker_id);
    loop {
        let job = { rx.lock().await.recv().await };
        let Some(job) = job else {
            debug!("reconcile worker {} shutting down", worker_id);
            break;
        };
        process_job(job, &tx, &reconciler, &repository, &policy).await;
    }
}

async fn process_job(
    job: ReconcileJob,
    tx: &mpsc::Sender<ReconcileJob>,
    reconciler: &Reconciler,
    repository: &Arc<dyn Repository>,
    policy: &RetryPolicy,
) {
    match reconciler.reconcile(&job.provider_event_id).await {
        Ok(outcome) => {
            debug!(
                "event {} finished with outcome {:?} on attempt {}",
                job.provider_event_id,
                outcome,
                job.attempt + 1
            );
        }
        Err(err) => match classify(&err) {
            FailureClass::Permanent => {
                dead_letter(repository, &job, &err, job.attempt + 1, "permanent failure").await;
            }
            FailureClass::Transient => {
                let attempts_made = job.attempt + 1;
                if attempts_made >= policy.max_attempts {
                    dead_letter(
                        repository,
                        &job,
                        &err,
                        attempts_made,
                        "transient failure retry limit exceeded",
                    )
                    .await;
                    return;
                }

                // Hand the claim back so the retry can re-claim it.
                if let Err(release_err) = repository.release_event(&job.provider_event_id).await {
                    error!(
                        "failed to release claim on {}: {}",
                        job.provider_event_id, release_err
                    );
                }

                let delay = policy.delay_for(job.attempt);
                warn!(
                    "event {} failed transiently ({}), retry {}/{} in {:?}",
                    job.provider_event_id, err, attempts_made, policy.max_attempts, delay
                );

                let tx = tx.clone();
                let next = ReconcileJob {
                    provider_event_id: job.provider_event_id.clone(),
                    attempt: attempts_made,
                };
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    if tx.send(next).await.is_err() {
                        error!("retry queue closed, dropping delayed job");
                    }
                });
            }
        },
    }
}

async fn dead_letter(
    repository: &Arc<dyn Repository>,
    job: &ReconcileJob,
    err: &ReconcileError,
    attempts: u32,
    reason: &str,
) {
    error!(
        "dead-lettering event {} after {} attempt(s): {} ({})",
        job.provider_event_id, attempts, err, reason
    );

    let record = DeadLetterRecord {
        provider_event_id: job.provider_event_id.clone(),
        reason: reason.to_string(),
        attempts,
        last_error: err.to_string(),
        created_at: Utc::now(),
    };
    if let Err(e) = repository.push_dead_letter(record).await {
        error!(
            "failed to record dead letter for {}: {}",
            job.provider_event_id, e
        );
    }
    if let Err(e) = repository.mark_event_rejected(&job.provider_event_id).await {
        error!("failed to reject event {}: {}", job.provider_event_id, e);
    }
}

async fn sweep_loop(
    tx: mpsc::Sender<ReconcileJob>,
    repository: Arc<dyn Repository>,
    sweep_interval: Duration,
) {
    let mut ticker = interval(sweep_interval);
    // The first tick fires immediately; startup recovery already enqueued
    // everything, so skip it.
    ticker.tick().await;

    loop {
        ticker.tick().await;
        match repository
            .stale_received_events(sweep_interval.as_secs() as i64)
            .await
        {
            Ok(ids) => {
                if !ids.is_empty() {
                    info!("sweep re-enqueueing {} stale event(s)", ids.len());
                }
                for id in ids {
                    if tx.send(ReconcileJob::new(id)).await.is_err() {
                        return;
                    }
                }
            }
            Err(e) => error!("sweep failed to scan for stale events: {}", e),
        }
    }
}
