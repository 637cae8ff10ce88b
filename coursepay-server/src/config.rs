use anyhow::{Context, Result};
use std::env;
use std::path::PathBuf;
use std::time::Duration;

use crate::scheduler::RetryPolicy;

#[derive(Clone)]
pub struct Config {
    /// Shared secret for webhook signature verification.
    pub webhook_secret: String,
    /// Bearer key for the provider API.
    pub provider_api_key: String,
    pub provider_base_url: String,
    /// Per-attempt bound on provider calls.
    pub provider_timeout: Duration,
    pub port: u16,
    /// Directory for persistent state (SQLite database).
    /// Defaults to current working directory.
    pub state_dir: PathBuf,
    /// Tolerance window for webhook signature timestamps, both directions.
    pub signature_tolerance_secs: i64,
    pub retry_max_attempts: u32,
    pub retry_base_delay: Duration,
    pub retry_max_delay: Duration,
    pub worker_count: usize,
    pub queue_depth: usize,
    pub sweep_interval: Duration,
    /// Optional bearer token for the /dead-letters endpoint.
    /// If not set, the endpoint is disabled (returns 403 Forbidden).
    pub deadletter_auth_token: Option<String>,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let webhook_secret = env::var("PAYMENT_WEBHOOK_SECRET")
            .context("PAYMENT_WEBHOOK_SECRET environment variable is required")?;

        let provider_api_key = env::var("PROVIDER_API_KEY")
            .context("PROVIDER_API_KEY environment variable is required")?;

        let provider_base_url =
            env::var("PROVIDER_BASE_URL").unwrap_or_else(|_| "https://api.stripe.com".to_string());

        let provider_timeout = Duration::from_secs(
            env::var("PROVIDER_TIMEOUT_SECS")
                .unwrap_or_else(|_| "10".to_string())
                .parse::<u64>()
                .context("PROVIDER_TIMEOUT_SECS must be a valid number")?,
        );

        let port = env::var("PORT")
            .unwrap_or_else(|_| "3000".to_string())
            .parse::<u16>()
            .context("PORT must be a valid number")?;

        let state_dir = env::var("STATE_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("."));

        let signature_tolerance_secs = env::var("SIGNATURE_TOLERANCE_SECS")
            .unwrap_or_else(|_| "300".to_string())
            .parse::<i64>()
            .context("SIGNATURE_TOLERANCE_SECS must be a valid number")?;

        let retry_max_attempts = env::var("RETRY_MAX_ATTEMPTS")
            .unwrap_or_else(|_| "5".to_string())
            .parse::<u32>()
            .context("RETRY_MAX_ATTEMPTS must be a valid number")?;

        let retry_base_delay = Duration::from_millis(
            env::var("RETRY_BASE_DELAY_MS")
                .unwrap_or_else(|_| "500".to_string())
                .parse::<u64>()
                .context("RETRY_BASE_DELAY_MS must be a valid number")?,
        );

        let retry_max_delay = Duration::from_millis(
            env::var("RETRY_MAX_DELAY_MS")
                .unwrap_or_else(|_| "60000".to_string())
                .parse::<u64>()
                .context("RETRY_MAX_DELAY_MS must be a valid number")?,
        );

        let worker_count = env::var("WORKER_COUNT")
            .unwrap_or_else(|_| "4".to_string())
            .parse::<usize>()
            .context("WORKER_COUNT must be a valid number")?;

        let queue_depth = env::var("QUEUE_DEPTH")
            .unwrap_or_else(|_| "1024".to_string())
            .parse::<usize>()
            .context("QUEUE_DEPTH must be a valid number")?;

        let sweep_interval = Duration::from_secs(
            env::var("SWEEP_INTERVAL_SECS")
                .unwrap_or_else(|_| "60".to_string())
                .parse::<u64>()
                .context("SWEEP_INTERVAL_SECS must be a valid number")?,
        );

        let deadletter_auth_token = parse_auth_token(env::var("DEADLETTER_AUTH_TOKEN").ok());

        Ok(Config {
            webhook_secret,
            provider_api_key,
            provider_base_url,
            provider_timeout,
            port,
            state_dir,
            signature_tolerance_secs,
            retry_max_attempts,
            retry_base_delay,
            retry_max_delay,
            worker_count,
            queue_depth,
            sweep_interval,
            deadletter_auth_token,
        })
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.retry_max_attempts,
            base_delay: self.retry_base_delay,
            max_delay: self.retry_max_delay,
        }
    }
}

/// Parse an auth token from an optional string value.
///
/// Returns None if the value is missing, empty, or contains only
/// whitespace. An empty token must not silently allow unauthenticated
/// access.
pub fn parse_auth_token(value: Option<String>) -> Option<String> {
    value.filter(|s| !s.trim().is_empty())
}
