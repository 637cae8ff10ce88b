//! Payment provider API client.
//!
//! The provider is an injected capability (`ChargeLookup`) rather than a
//! global client, so reconciliation logic is testable with fakes that
//! simulate missing or partial charge data and transient errors. The
//! real implementation wraps `reqwest` with a bearer key and a bounded
//! per-request timeout.
//!
//! This component performs no writes; everything here is safely
//! retryable.

use async_trait::async_trait;
use serde::Deserialize;
use std::fmt;
use std::time::Duration;

use crate::state_machine::state::{ChargeId, ProviderIntentId, ResolvedCharge};

/// Typed failure for outbound lookups.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LookupError {
    /// Network trouble, timeout, or a provider-side 5xx/429: worth
    /// retrying.
    Transient(String),
    /// The provider answered definitively and unhelpfully (4xx, garbage
    /// body): retrying the same call will not change the answer.
    Permanent(String),
}

impl fmt::Display for LookupError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transient(msg) => write!(f, "transient lookup error: {}", msg),
            Self::Permanent(msg) => write!(f, "permanent lookup error: {}", msg),
        }
    }
}

impl std::error::Error for LookupError {}

/// A charge as the provider returns it.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ProviderCharge {
    pub id: String,
    #[serde(default)]
    pub amount_captured: i64,
    #[serde(default)]
    pub status: String,
}

impl From<ProviderCharge> for ResolvedCharge {
    fn from(charge: ProviderCharge) -> Self {
        ResolvedCharge {
            charge_id: ChargeId(charge.id),
            amount_captured: charge.amount_captured,
            status: charge.status,
        }
    }
}

/// The provider's `latest_charge` field: either an expanded charge object
/// or a bare id reference, depending on whether expansion was requested
/// (and on how much the provider felt like including in the webhook).
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum ChargeRef {
    Expanded(ProviderCharge),
    Id(String),
}

/// A payment intent as the provider returns it.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ProviderIntent {
    pub id: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub latest_charge: Option<ChargeRef>,
}

/// Read-only access to authoritative charge state at the provider.
#[async_trait]
pub trait ChargeLookup: Send + Sync {
    /// Fetch a payment intent, requesting expanded charge data.
    async fn fetch_intent(&self, id: &ProviderIntentId) -> Result<ProviderIntent, LookupError>;

    /// Fetch a charge directly by id.
    async fn fetch_charge(&self, id: &ChargeId) -> Result<ProviderCharge, LookupError>;
}

/// `reqwest`-backed implementation of `ChargeLookup`.
pub struct ProviderClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl ProviderClient {
    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, anyhow::Error> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        let mut base_url = base_url.into();
        while base_url.ends_with('/') {
            base_url.pop();
        }
        Ok(Self {
            http,
            base_url,
            api_key: api_key.into(),
        })
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        url: String,
    ) -> Result<T, LookupError> {
        let response = self
            .http
            .get(&url)
            .bearer_auth(&self.api_key)
            .send()
            .await
            .map_err(|e| LookupError::Transient(e.to_string()))?;

        let status = response.status();
        if status.is_server_error() || status.as_u16() == 429 {
            return Err(LookupError::Transient(format!(
                "provider returned {}",
                status
            )));
        }
        if !status.is_success() {
            return Err(LookupError::Permanent(format!(
                "provider returned {}",
                status
            )));
        }

        response
            .json::<T>()
            .await
            .map_err(|e| LookupError::Permanent(format!("invalid response body: {}", e)))
    }
}

#[async_trait]
impl ChargeLookup for ProviderClient {
    async fn fetch_intent(&self, id: &ProviderIntentId) -> Result<ProviderIntent, LookupError> {
        let url = format!(
            "{}/v1/payment_intents/{}?expand[]=latest_charge",
            self.base_url, id.0
        );
        self.get_json(url).await
    }

    async fn fetch_charge(&self, id: &ChargeId) -> Result<ProviderCharge, LookupError> {
        let url = format!("{}/v1/charges/{}", self.base_url, id.0);
        self.get_json(url).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_charge_ref_parses_expanded_object() {
        let json = r#"{"id": "ch_1", "amount_captured": 9999, "status": "succeeded"}"#;
        let parsed: ChargeRef = serde_json::from_str(json).unwrap();
        match parsed {
            ChargeRef::Expanded(charge) => {
                assert_eq!(charge.id, "ch_1");
                assert_eq!(charge.amount_captured, 9999);
                assert_eq!(charge.status, "succeeded");
            }
            other => panic!("expected Expanded, got {:?}", other),
        }
    }

    #[test]
    fn test_charge_ref_parses_bare_id() {
        let parsed: ChargeRef = serde_json::from_str(r#""ch_1""#).unwrap();
        assert_eq!(parsed, ChargeRef::Id("ch_1".to_string()));
    }

    #[test]
    fn test_provider_intent_without_charge() {
        let json = r#"{"id": "pi_1", "status": "processing"}"#;
        let parsed: ProviderIntent = serde_json::from_str(json).unwrap();
        assert_eq!(parsed.id, "pi_1");
        assert!(parsed.latest_charge.is_none());
    }

    #[test]
    fn test_provider_charge_converts_to_resolved() {
        let charge = ProviderCharge {
            id: "ch_1".to_string(),
            amount_captured: 4200,
            status: "succeeded".to_string(),
        };
        let resolved: ResolvedCharge = charge.into();
        assert_eq!(resolved.charge_id.0, "ch_1");
        assert_eq!(resolved.amount_captured, 4200);
    }

    #[test]
    fn test_base_url_trailing_slash_stripped() {
        let client = ProviderClient::new(
            "https://api.example.com/",
            "sk_test",
            Duration::from_secs(5),
        )
        .unwrap();
        assert_eq!(client.base_url, "https://api.example.com");
    }
}
