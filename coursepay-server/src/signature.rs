//! Webhook signature verification.
//!
//! The provider signs each delivery with
//! `Payment-Signature: t=<unix-seconds>,v1=<hex hmac-sha256>` where the
//! MAC is computed over `"{t}.{body}"` with the shared endpoint secret.
//! Multiple `v1` entries may be present during secret rotation; any one
//! matching is sufficient. Comparison is constant-time via
//! `Mac::verify_slice`.
//!
//! Requests failing verification are rejected before anything else runs
//! and never reach the event store.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::fmt;

type HmacSha256 = Hmac<Sha256>;

/// Why a delivery failed verification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureError {
    /// Header missing or not parseable as `t=...,v1=...`.
    MalformedHeader,
    /// Timestamp outside the tolerance window (replay, or clock skew).
    StaleTimestamp,
    /// No `v1` entry matched the computed MAC.
    Mismatch,
}

impl fmt::Display for SignatureError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MalformedHeader => write!(f, "malformed signature header"),
            Self::StaleTimestamp => write!(f, "signature timestamp outside tolerance"),
            Self::Mismatch => write!(f, "signature mismatch"),
        }
    }
}

impl std::error::Error for SignatureError {}

/// Check if a webhook timestamp is within the acceptable tolerance window.
///
/// Both old timestamps (replay attacks) and future timestamps (clock skew)
/// are checked.
pub fn is_timestamp_within_tolerance(timestamp_secs: i64, now_secs: i64, tolerance_secs: i64) -> bool {
    (now_secs - timestamp_secs).abs() <= tolerance_secs
}

/// Verify a `Payment-Signature` header against the raw request body.
pub fn verify_signature(
    secret: &str,
    body: &[u8],
    header: &str,
    now_secs: i64,
    tolerance_secs: i64,
) -> Result<(), SignatureError> {
    let mut timestamp: Option<i64> = None;
    let mut signatures: Vec<&str> = Vec::new();

    for part in header.split(',') {
        let part = part.trim();
        if let Some(value) = part.strip_prefix("t=") {
            timestamp = value.parse().ok();
        } else if let Some(value) = part.strip_prefix("v1=") {
            signatures.push(value);
        }
        // Unknown scheme prefixes (e.g. v0=) are ignored.
    }

    let timestamp = timestamp.ok_or(SignatureError::MalformedHeader)?;
    if signatures.is_empty() {
        return Err(SignatureError::MalformedHeader);
    }

    if !is_timestamp_within_tolerance(timestamp, now_secs, tolerance_secs) {
        return Err(SignatureError::StaleTimestamp);
    }

    // Signed payload binds the timestamp to the body so a captured body
    // cannot be replayed under a new timestamp.
    let mut signed_payload = Vec::with_capacity(body.len() + 16);
    signed_payload.extend_from_slice(timestamp.to_string().as_bytes());
    signed_payload.push(b'.');
    signed_payload.extend_from_slice(body);

    for signature_hex in signatures {
        let signature_bytes = match hex::decode(signature_hex) {
            Ok(bytes) => bytes,
            Err(_) => continue, // Skip malformed entries
        };

        // Fresh HMAC per attempt; verify_slice is constant-time.
        let mut mac = match HmacSha256::new_from_slice(secret.as_bytes()) {
            Ok(mac) => mac,
            Err(_) => return Err(SignatureError::Mismatch),
        };
        mac.update(&signed_payload);
        if mac.verify_slice(&signature_bytes).is_ok() {
            return Ok(());
        }
    }

    Err(SignatureError::Mismatch)
}

/// Compute the hex HMAC for a timestamp + body pair.
///
/// Used by tests and by tooling that needs to produce valid deliveries.
pub fn sign_payload(secret: &str, timestamp_secs: i64, body: &[u8]) -> String {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).expect("hmac accepts any key size");
    mac.update(timestamp_secs.to_string().as_bytes());
    mac.update(b".");
    mac.update(body);
    hex::encode(mac.finalize().into_bytes())
}

/// Build a complete `Payment-Signature` header value.
pub fn signature_header(secret: &str, timestamp_secs: i64, body: &[u8]) -> String {
    format!(
        "t={},v1={}",
        timestamp_secs,
        sign_payload(secret, timestamp_secs, body)
    )
}
