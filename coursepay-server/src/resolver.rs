//! Charge resolver.
//!
//! Obtains authoritative charge data for a payment intent. The provider
//! may deliver webhooks with no embedded charge, so resolution is a
//! fallback chain, attempted in order, stopping at first success:
//!
//! 1. charge data embedded in the event payload, if present and non-empty;
//! 2. re-fetch the intent from the provider with expanded charge data;
//! 3. if the intent exposes only a `latest_charge` reference, fetch that
//!    charge directly by id;
//! 4. otherwise `ChargeUnavailable` - retryable, because the provider may
//!    not have finished settling the charge yet.
//!
//! The resolver performs no writes; every step is a bounded-timeout read.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::provider::{ChargeLookup, ChargeRef, LookupError};
use crate::state_machine::state::{ProviderIntentId, ResolvedCharge};

/// Typed resolution failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolveError {
    /// Network/provider-side trouble; retry with backoff.
    TransientLookup(String),
    /// No charge exists anywhere yet. Retried (the charge may still be
    /// settling) and escalated to the dead letter queue after the cap.
    ChargeUnavailable,
}

impl fmt::Display for ResolveError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TransientLookup(msg) => write!(f, "transient charge lookup failure: {}", msg),
            Self::ChargeUnavailable => write!(f, "no charge available for intent yet"),
        }
    }
}

impl std::error::Error for ResolveError {}

/// Resolves authoritative charge data through a `ChargeLookup` capability.
pub struct ChargeResolver {
    lookup: Arc<dyn ChargeLookup>,
    /// Per-attempt bound; a timeout classifies as `TransientLookup`.
    attempt_timeout: Duration,
}

impl ChargeResolver {
    pub fn new(lookup: Arc<dyn ChargeLookup>, attempt_timeout: Duration) -> Self {
        Self {
            lookup,
            attempt_timeout,
        }
    }

    /// Run the fallback chain for `intent_id`.
    ///
    /// `embedded` is whatever charge data the webhook payload itself
    /// carried (already parsed by the caller).
    pub async fn resolve(
        &self,
        intent_id: &ProviderIntentId,
        embedded: Option<ResolvedCharge>,
    ) -> Result<ResolvedCharge, ResolveError> {
        // Step 1: embedded payload data wins; no network round trip.
        if let Some(charge) = embedded {
            if !charge.charge_id.0.is_empty() {
                debug!("resolved charge {} from embedded payload", charge.charge_id);
                return Ok(charge);
            }
        }

        // Step 2: re-fetch the intent with expanded charge data.
        let intent = self
            .bounded(self.lookup.fetch_intent(intent_id))
            .await?;

        match intent.latest_charge {
            Some(ChargeRef::Expanded(charge)) => {
                debug!("resolved charge {} from expanded intent fetch", charge.id);
                Ok(charge.into())
            }
            // Step 3: only a reference was exposed; fetch the charge itself.
            Some(ChargeRef::Id(charge_id)) => {
                let charge_id = crate::state_machine::state::ChargeId(charge_id);
                let charge = self.bounded(self.lookup.fetch_charge(&charge_id)).await?;
                debug!("resolved charge {} from direct charge fetch", charge.id);
                Ok(charge.into())
            }
            // Step 4: nothing anywhere. Not permanent: the provider may
            // still be settling.
            None => Err(ResolveError::ChargeUnavailable),
        }
    }

    async fn bounded<T>(
        &self,
        fut: impl std::future::Future<Output = Result<T, LookupError>>,
    ) -> Result<T, ResolveError> {
        match tokio::time::timeout(self.attempt_timeout, fut).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(LookupError::Transient(msg))) => Err(ResolveError::TransientLookup(msg)),
            // A definitive provider "no" means the charge cannot be
            // obtained through this call; the event is retried under the
            // same cap as a missing charge.
            Ok(Err(LookupError::Permanent(msg))) => {
                debug!("charge lookup answered permanently: {}", msg);
                Err(ResolveError::ChargeUnavailable)
            }
            Err(_) => Err(ResolveError::TransientLookup(format!(
                "lookup timed out after {:?}",
                self.attempt_timeout
            ))),
        }
    }
}
