//! State types for the payment reconciliation state machine.
//!
//! This module defines the explicit state machine for a single payment
//! intent's lifecycle. Following the principle of "make illegal states
//! unrepresentable", completion data (the settled charge) lives inside the
//! `Completed` variant rather than in nullable fields on the record.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Newtype for the provider's event id (`evt_...`) to prevent mixing with
/// other strings.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProviderEventId(pub String);

impl fmt::Display for ProviderEventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for ProviderEventId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for ProviderEventId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Newtype for the provider's payment intent id (`pi_...`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProviderIntentId(pub String);

impl fmt::Display for ProviderIntentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for ProviderIntentId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for ProviderIntentId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Newtype for the provider's charge id (`ch_...`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChargeId(pub String);

impl fmt::Display for ChargeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for ChargeId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for ChargeId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Newtype for a marketplace user id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UserId(pub String);

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for UserId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for UserId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Newtype for a marketplace course id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CourseId(pub String);

impl fmt::Display for CourseId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for CourseId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for CourseId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Authoritative charge data produced by the charge resolver.
///
/// Ephemeral: folded into the payment intent and transaction on completion,
/// never persisted on its own.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedCharge {
    pub charge_id: ChargeId,
    /// Amount actually captured by the provider, in minor units.
    pub amount_captured: i64,
    /// Provider-reported charge status (e.g. "succeeded").
    pub status: String,
}

/// The explicit state machine for a single payment intent's lifecycle.
///
/// `Completed` and `Failed` are terminal. `RequiresAction` is a holding
/// state (e.g. 3DS challenge outstanding); for transition guards it behaves
/// like `Pending`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PaymentState {
    /// Intent known locally but no authoritative provider progress yet.
    Pending,

    /// Provider reported the payment as in flight.
    Processing,

    /// Payment settled; the transaction and enrollment were committed in
    /// the same unit of work that entered this state.
    Completed {
        charge_id: ChargeId,
        paid_at: DateTime<Utc>,
    },

    /// Payment terminally failed (terminal for this intent; a retried
    /// payment arrives as a new intent).
    Failed { reason: String },

    /// Customer action required (e.g. authentication challenge).
    RequiresAction,
}

impl PaymentState {
    /// Stable name used for persistence and logging.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed { .. } => "completed",
            Self::Failed { .. } => "failed",
            Self::RequiresAction => "requires_action",
        }
    }

    /// Returns true if this is a terminal state (Completed or Failed).
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed { .. } | Self::Failed { .. })
    }

    /// Returns the settled charge id, if any.
    pub fn charge_id(&self) -> Option<&ChargeId> {
        match self {
            Self::Completed { charge_id, .. } => Some(charge_id),
            _ => None,
        }
    }
}

impl fmt::Display for PaymentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Local record tracking the lifecycle of a single payment attempt.
///
/// Owned exclusively by the reconciliation state machine: all mutation goes
/// through the transition function, and `version` is the optimistic lock
/// that serializes concurrent writers at commit time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaymentIntent {
    pub id: Uuid,
    pub provider_intent_id: ProviderIntentId,
    pub user_id: UserId,
    pub course_id: CourseId,
    pub amount_minor: i64,
    pub currency: String,
    pub state: PaymentState,
    /// Incremented on every committed mutation; compare-and-swap guard.
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PaymentIntent {
    /// Create a fresh `Pending` intent.
    ///
    /// Webhooks may arrive before the intent's creation path is known
    /// locally, so any event referencing an unknown intent goes through
    /// here first.
    pub fn new_pending(
        provider_intent_id: ProviderIntentId,
        user_id: UserId,
        course_id: CourseId,
        amount_minor: i64,
        currency: String,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            provider_intent_id,
            user_id,
            course_id,
            amount_minor,
            currency,
            state: PaymentState::Pending,
            version: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// Returns the settlement time, if the intent has completed.
    pub fn paid_at(&self) -> Option<DateTime<Utc>> {
        match &self.state {
            PaymentState::Completed { paid_at, .. } => Some(*paid_at),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_is_terminal() {
        assert!(!PaymentState::Pending.is_terminal());
        assert!(!PaymentState::Processing.is_terminal());
        assert!(!PaymentState::RequiresAction.is_terminal());

        let completed = PaymentState::Completed {
            charge_id: ChargeId::from("ch_1"),
            paid_at: Utc::now(),
        };
        assert!(completed.is_terminal());

        let failed = PaymentState::Failed {
            reason: "card_declined".to_string(),
        };
        assert!(failed.is_terminal());
    }

    #[test]
    fn test_state_names_are_stable() {
        assert_eq!(PaymentState::Pending.name(), "pending");
        assert_eq!(PaymentState::Processing.name(), "processing");
        assert_eq!(PaymentState::RequiresAction.name(), "requires_action");
        assert_eq!(
            PaymentState::Completed {
                charge_id: ChargeId::from("ch_1"),
                paid_at: Utc::now(),
            }
            .name(),
            "completed"
        );
        assert_eq!(
            PaymentState::Failed {
                reason: String::new()
            }
            .name(),
            "failed"
        );
    }

    #[test]
    fn test_new_pending_starts_at_version_zero() {
        let now = Utc::now();
        let intent = PaymentIntent::new_pending(
            ProviderIntentId::from("pi_123"),
            UserId::from("user_1"),
            CourseId::from("course_1"),
            9999,
            "usd".to_string(),
            now,
        );

        assert_eq!(intent.version, 0);
        assert_eq!(intent.state, PaymentState::Pending);
        assert_eq!(intent.created_at, now);
        assert_eq!(intent.paid_at(), None);
    }

    #[test]
    fn test_charge_id_only_on_completed() {
        assert_eq!(PaymentState::Pending.charge_id(), None);

        let completed = PaymentState::Completed {
            charge_id: ChargeId::from("ch_42"),
            paid_at: Utc::now(),
        };
        assert_eq!(completed.charge_id().map(|c| c.0.as_str()), Some("ch_42"));
    }
}
