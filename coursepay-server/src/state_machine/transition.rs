//! Pure state transition function.
//!
//! The transition function is the core of the reconciliation engine. It
//! takes the current payment intent and a provider event, and returns the
//! updated intent plus a list of effects. It has NO side effects - it is
//! pure and deterministic (the clock is an argument).
//!
//! Replay rules:
//! - an event whose target state equals the current terminal state is a
//!   no-op success, which is what makes duplicate `succeeded` webhooks
//!   harmless;
//! - a `failed` event after `completed` is an invariant violation: success
//!   is not revocable through this channel, refunds are a separate flow.

use chrono::{DateTime, Utc};
use std::fmt;

use super::effect::{Effect, LogLevel};
use super::event::PaymentEvent;
use super::state::{PaymentIntent, PaymentState};

/// Result of a state transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransitionResult {
    /// The intent after the transition. `version` is untouched here; the
    /// repository bumps it when the commit's compare-and-swap succeeds.
    pub intent: PaymentIntent,
    /// Effects to execute. Commit effects join the state flip in one unit
    /// of work.
    pub effects: Vec<Effect>,
}

impl TransitionResult {
    fn new(intent: PaymentIntent, effects: Vec<Effect>) -> Self {
        Self { intent, effects }
    }

    fn noop(intent: PaymentIntent, message: String) -> Self {
        Self {
            intent,
            effects: vec![Effect::Log {
                level: LogLevel::Info,
                message,
            }],
        }
    }

    /// Returns true if the transition changed the intent's state.
    pub fn changed(&self, before: &PaymentState) -> bool {
        self.intent.state != *before
    }
}

/// Rejected transitions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransitionError {
    /// The event contradicts a terminal state (e.g. `failed` after
    /// `completed`). Logged, rejected, dead-lettered; never retried.
    InvariantViolation { state: &'static str, event: String },
}

impl fmt::Display for TransitionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvariantViolation { state, event } => {
                write!(f, "event {} is illegal in terminal state {}", event, state)
            }
        }
    }
}

impl std::error::Error for TransitionError {}

/// Pure state transition function.
///
/// Given the current intent and an event, returns the updated intent and
/// effects to execute, or rejects the event as an invariant violation.
pub fn transition(
    mut intent: PaymentIntent,
    event: PaymentEvent,
    now: DateTime<Utc>,
) -> Result<TransitionResult, TransitionError> {
    let summary = event.log_summary();

    match (intent.state.clone(), event) {
        // =====================================================================
        // Forward progress
        // =====================================================================

        // Provider reports the payment in flight. RequiresAction also moves
        // here: the provider may report processing after a challenge clears.
        (
            PaymentState::Pending | PaymentState::RequiresAction,
            PaymentEvent::Processing,
        ) => {
            intent.state = PaymentState::Processing;
            intent.updated_at = now;
            Ok(TransitionResult::new(intent, vec![]))
        }

        // Settlement. Only reachable with a resolved charge in hand (the
        // event carries it by construction). The transaction and enrollment
        // effects commit atomically with this state flip.
        (
            PaymentState::Pending | PaymentState::Processing | PaymentState::RequiresAction,
            PaymentEvent::Succeeded { charge },
        ) => {
            let effects = vec![
                Effect::RecordTransaction {
                    charge_id: charge.charge_id.clone(),
                    amount_minor: charge.amount_captured,
                    status: charge.status,
                },
                Effect::ActivateEnrollment {
                    user_id: intent.user_id.clone(),
                    course_id: intent.course_id.clone(),
                },
            ];
            intent.state = PaymentState::Completed {
                charge_id: charge.charge_id,
                paid_at: now,
            };
            intent.updated_at = now;
            Ok(TransitionResult::new(intent, effects))
        }

        // Terminal failure.
        (
            PaymentState::Pending | PaymentState::Processing | PaymentState::RequiresAction,
            PaymentEvent::Failed { reason },
        ) => {
            intent.state = PaymentState::Failed { reason };
            intent.updated_at = now;
            Ok(TransitionResult::new(intent, vec![]))
        }

        // Customer action required.
        (
            PaymentState::Pending | PaymentState::Processing,
            PaymentEvent::ActionRequired,
        ) => {
            intent.state = PaymentState::RequiresAction;
            intent.updated_at = now;
            Ok(TransitionResult::new(intent, vec![]))
        }

        // =====================================================================
        // Replay safety: no-op successes
        // =====================================================================

        // Created events are informational once the intent exists locally;
        // the intent was minted as `pending` on first reference.
        (_, PaymentEvent::IntentCreated) => {
            let message = format!(
                "ignoring IntentCreated for {} already in state {}",
                intent.provider_intent_id, intent.state
            );
            Ok(TransitionResult::noop(intent, message))
        }

        // Duplicate succeeded on a completed intent: no-op success.
        (PaymentState::Completed { .. }, PaymentEvent::Succeeded { charge }) => {
            let message = format!(
                "replayed succeeded event for {} (charge {}), already completed",
                intent.provider_intent_id, charge.charge_id
            );
            Ok(TransitionResult::noop(intent, message))
        }

        // Duplicate failed on a failed intent: no-op success.
        (PaymentState::Failed { .. }, PaymentEvent::Failed { .. }) => {
            let message = format!(
                "replayed failed event for {}, already failed",
                intent.provider_intent_id
            );
            Ok(TransitionResult::noop(intent, message))
        }

        // Duplicate action-required while already holding: no-op.
        (PaymentState::RequiresAction, PaymentEvent::ActionRequired) => {
            let message = format!(
                "duplicate requires_action event for {}",
                intent.provider_intent_id
            );
            Ok(TransitionResult::noop(intent, message))
        }

        // Stale lifecycle chatter after a terminal state: the provider's
        // retries can deliver old processing/requires_action events late.
        (
            PaymentState::Completed { .. } | PaymentState::Failed { .. },
            PaymentEvent::Processing | PaymentEvent::ActionRequired,
        ) => {
            let message = format!(
                "ignoring stale {} for {} in terminal state {}",
                summary, intent.provider_intent_id, intent.state
            );
            Ok(TransitionResult::noop(intent, message))
        }

        // Duplicate processing while processing: no-op.
        (PaymentState::Processing, PaymentEvent::Processing) => {
            let message = format!(
                "duplicate processing event for {}",
                intent.provider_intent_id
            );
            Ok(TransitionResult::noop(intent, message))
        }

        // =====================================================================
        // Invariant violations
        // =====================================================================

        // Success is not revocable via this channel.
        (PaymentState::Completed { .. }, PaymentEvent::Failed { .. }) => {
            Err(TransitionError::InvariantViolation {
                state: "completed",
                event: summary,
            })
        }

        // A failed intent cannot settle; a retried payment is a new intent.
        (PaymentState::Failed { .. }, PaymentEvent::Succeeded { .. }) => {
            Err(TransitionError::InvariantViolation {
                state: "failed",
                event: summary,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state_machine::state::{
        ChargeId, CourseId, PaymentIntent, ProviderIntentId, ResolvedCharge, UserId,
    };

    fn pending_intent() -> PaymentIntent {
        PaymentIntent::new_pending(
            ProviderIntentId::from("pi_123"),
            UserId::from("user_1"),
            CourseId::from("course_1"),
            9999,
            "usd".to_string(),
            Utc::now(),
        )
    }

    fn resolved_charge() -> ResolvedCharge {
        ResolvedCharge {
            charge_id: ChargeId::from("ch_1"),
            amount_captured: 9999,
            status: "succeeded".to_string(),
        }
    }

    fn completed_intent() -> PaymentIntent {
        let now = Utc::now();
        let result = transition(
            pending_intent(),
            PaymentEvent::Succeeded {
                charge: resolved_charge(),
            },
            now,
        )
        .unwrap();
        result.intent
    }

    #[test]
    fn test_pending_to_processing() {
        let result = transition(pending_intent(), PaymentEvent::Processing, Utc::now()).unwrap();
        assert_eq!(result.intent.state, PaymentState::Processing);
        assert!(result.effects.is_empty());
    }

    #[test]
    fn test_processing_to_completed_emits_commit_effects() {
        let now = Utc::now();
        let processing = transition(pending_intent(), PaymentEvent::Processing, now)
            .unwrap()
            .intent;

        let result = transition(
            processing,
            PaymentEvent::Succeeded {
                charge: resolved_charge(),
            },
            now,
        )
        .unwrap();

        assert!(matches!(
            result.intent.state,
            PaymentState::Completed { .. }
        ));
        assert_eq!(result.effects.len(), 2);
        assert!(matches!(
            &result.effects[0],
            Effect::RecordTransaction {
                charge_id,
                amount_minor: 9999,
                ..
            } if charge_id.0 == "ch_1"
        ));
        assert!(matches!(
            &result.effects[1],
            Effect::ActivateEnrollment { user_id, course_id }
                if user_id.0 == "user_1" && course_id.0 == "course_1"
        ));
    }

    #[test]
    fn test_pending_straight_to_completed() {
        // Out-of-order delivery: succeeded can arrive before processing
        // (or before created). It must still settle.
        let result = transition(
            pending_intent(),
            PaymentEvent::Succeeded {
                charge: resolved_charge(),
            },
            Utc::now(),
        )
        .unwrap();

        assert!(matches!(
            result.intent.state,
            PaymentState::Completed { .. }
        ));
        assert_eq!(result.effects.len(), 2);
    }

    #[test]
    fn test_requires_action_then_succeeded() {
        let holding = transition(pending_intent(), PaymentEvent::ActionRequired, Utc::now())
            .unwrap()
            .intent;
        assert_eq!(holding.state, PaymentState::RequiresAction);

        let result = transition(
            holding,
            PaymentEvent::Succeeded {
                charge: resolved_charge(),
            },
            Utc::now(),
        )
        .unwrap();
        assert!(matches!(
            result.intent.state,
            PaymentState::Completed { .. }
        ));
    }

    #[test]
    fn test_duplicate_succeeded_is_noop() {
        let completed = completed_intent();
        let before = completed.state.clone();

        let result = transition(
            completed,
            PaymentEvent::Succeeded {
                charge: resolved_charge(),
            },
            Utc::now(),
        )
        .unwrap();

        assert!(!result.changed(&before));
        // Replay must not re-emit commit effects.
        assert!(!result.effects.iter().any(Effect::is_commit_effect));
    }

    #[test]
    fn test_failed_after_completed_is_invariant_violation() {
        let completed = completed_intent();

        let err = transition(
            completed,
            PaymentEvent::Failed {
                reason: "card_declined".to_string(),
            },
            Utc::now(),
        )
        .unwrap_err();

        assert!(matches!(
            err,
            TransitionError::InvariantViolation {
                state: "completed",
                ..
            }
        ));
    }

    #[test]
    fn test_succeeded_after_failed_is_invariant_violation() {
        let failed = transition(
            pending_intent(),
            PaymentEvent::Failed {
                reason: "card_declined".to_string(),
            },
            Utc::now(),
        )
        .unwrap()
        .intent;

        let err = transition(
            failed,
            PaymentEvent::Succeeded {
                charge: resolved_charge(),
            },
            Utc::now(),
        )
        .unwrap_err();

        assert!(matches!(
            err,
            TransitionError::InvariantViolation { state: "failed", .. }
        ));
    }

    #[test]
    fn test_created_event_is_informational_in_every_state() {
        for intent in [pending_intent(), completed_intent()] {
            let before = intent.state.clone();
            let result = transition(intent, PaymentEvent::IntentCreated, Utc::now()).unwrap();
            assert!(!result.changed(&before), "IntentCreated must never move state");
        }
    }

    #[test]
    fn test_stale_processing_after_completed_is_noop() {
        let completed = completed_intent();
        let before = completed.state.clone();

        let result = transition(completed, PaymentEvent::Processing, Utc::now()).unwrap();
        assert!(!result.changed(&before));
        assert!(matches!(
            result.effects.as_slice(),
            [Effect::Log {
                level: LogLevel::Info,
                ..
            }]
        ));
    }

    #[test]
    fn test_duplicate_failed_is_noop() {
        let failed = transition(
            pending_intent(),
            PaymentEvent::Failed {
                reason: "expired_card".to_string(),
            },
            Utc::now(),
        )
        .unwrap()
        .intent;
        let before = failed.state.clone();

        let result = transition(
            failed,
            PaymentEvent::Failed {
                reason: "expired_card".to_string(),
            },
            Utc::now(),
        )
        .unwrap();
        assert!(!result.changed(&before));
    }

    /// Regression-style check: the paid_at recorded on completion is the
    /// clock passed in, keeping the function deterministic for tests.
    #[test]
    fn test_completed_records_injected_clock() {
        let now = Utc::now();
        let result = transition(
            pending_intent(),
            PaymentEvent::Succeeded {
                charge: resolved_charge(),
            },
            now,
        )
        .unwrap();

        match result.intent.state {
            PaymentState::Completed { paid_at, .. } => assert_eq!(paid_at, now),
            other => panic!("expected Completed, got {:?}", other),
        }
        assert_eq!(result.intent.paid_at(), Some(now));
    }

    #[test]
    fn test_transition_does_not_bump_version() {
        // The version is the repository's compare-and-swap token; the pure
        // function must leave it alone.
        let intent = pending_intent();
        let version = intent.version;
        let result = transition(intent, PaymentEvent::Processing, Utc::now()).unwrap();
        assert_eq!(result.intent.version, version);
    }
}
