//! Events that trigger state transitions.
//!
//! Events represent things the payment provider told us happened. They are
//! inputs to the pure transition function. Raw webhook kinds are first
//! classified by `EventKind::parse`; the reconciler then builds a
//! `PaymentEvent`, resolving authoritative charge data where the kind
//! requires it.

use super::state::ResolvedCharge;

/// Classification of a provider webhook `type` string.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    /// `payment_intent.created`
    IntentCreated,
    /// `payment_intent.processing`
    Processing,
    /// `payment_intent.succeeded`
    Succeeded,
    /// `payment_intent.payment_failed`
    Failed,
    /// `payment_intent.requires_action`
    RequiresAction,
    /// Anything else (refund family, new provider kinds). Recorded and
    /// acknowledged, but produces no transition.
    Other,
}

impl EventKind {
    /// Classify a provider event type string.
    pub fn parse(s: &str) -> Self {
        match s {
            "payment_intent.created" => Self::IntentCreated,
            "payment_intent.processing" => Self::Processing,
            "payment_intent.succeeded" => Self::Succeeded,
            "payment_intent.payment_failed" => Self::Failed,
            "payment_intent.requires_action" => Self::RequiresAction,
            _ => Self::Other,
        }
    }

    /// Returns true if applying this kind needs authoritative charge data.
    pub fn needs_charge(&self) -> bool {
        matches!(self, Self::Succeeded)
    }
}

/// All events that can trigger payment intent transitions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PaymentEvent {
    /// The provider created the payment intent.
    IntentCreated,

    /// The provider reported the payment as in flight.
    Processing,

    /// The payment settled. Carries the resolved charge by construction:
    /// `completed` is unreachable without one.
    Succeeded { charge: ResolvedCharge },

    /// The payment terminally failed.
    Failed { reason: String },

    /// The customer must take action (e.g. authentication).
    ActionRequired,
}

impl PaymentEvent {
    /// Returns a summary of the event suitable for logging.
    ///
    /// Avoids logging full payloads; charge amounts are fine, raw payloads
    /// are not.
    pub fn log_summary(&self) -> String {
        match self {
            Self::IntentCreated => "IntentCreated".to_string(),
            Self::Processing => "Processing".to_string(),
            Self::Succeeded { charge } => {
                format!(
                    "Succeeded {{ charge: {}, amount: {} }}",
                    charge.charge_id, charge.amount_captured
                )
            }
            Self::Failed { reason } => format!("Failed {{ reason: {} }}", reason),
            Self::ActionRequired => "ActionRequired".to_string(),
        }
    }
}
