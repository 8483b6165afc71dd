use std::time::Duration;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use md5::{Digest, Md5};
use serde_json::Value;
use sha2::Sha256;
use subtle::ConstantTimeEq;
use thiserror::Error;

use crate::canonical_json::to_canonical_string;
use crate::envelope::WebhookEnvelope;

type HmacSha256 = Hmac<Sha256>;

/// Field Cryptomus embeds its signature under when no header is sent.
pub(crate) const EMBEDDED_SIGNATURE_FIELD: &str = "sign";

/// Reasons a webhook signature can be rejected.
///
/// The variants are kept apart so callers can alert on forged traffic
/// differently from replays or client bugs.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SignatureError {
    #[error("webhook signature is missing")]
    MissingSignature,
    #[error("webhook signature is malformed: {0}")]
    MalformedSignature(String),
    #[error("signature timestamp is {age_seconds}s from now, tolerance is {tolerance_seconds}s")]
    StaleSignature {
        age_seconds: i64,
        tolerance_seconds: u64,
    },
    #[error("webhook signature does not match")]
    SignatureMismatch,
}

impl SignatureError {
    /// Stable label used in logs and metrics.
    pub fn reason(&self) -> &'static str {
        match self {
            Self::MissingSignature => "missing_signature",
            Self::MalformedSignature(_) => "malformed_signature",
            Self::StaleSignature { .. } => "stale_signature",
            Self::SignatureMismatch => "signature_mismatch",
        }
    }

    fn malformed(detail: impl Into<String>) -> Self {
        Self::MalformedSignature(detail.into())
    }
}

/// Verification algorithm applied to an inbound webhook.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureStrategy {
    /// Hex HMAC-SHA256 of the raw body.
    RawHmac,
    /// Stripe-style `t=<ts>,v1=<hex>` header signing `"<ts>.<body>"`.
    TimestampedHmac { tolerance: Duration },
    /// Hex MD5 of `base64(canonical_json(payload)) + secret`.
    DigestOfEncodedPayload,
}

impl SignatureStrategy {
    pub fn label(&self) -> &'static str {
        match self {
            Self::RawHmac => "raw_hmac",
            Self::TimestampedHmac { .. } => "timestamped_hmac",
            Self::DigestOfEncodedPayload => "digest_of_encoded_payload",
        }
    }

    /// Verifies the envelope against the shared secret.
    ///
    /// Pure with respect to its inputs; `now` is only consulted by the
    /// timestamped variant.
    pub fn verify(
        &self,
        envelope: &WebhookEnvelope,
        secret: &[u8],
        now: DateTime<Utc>,
    ) -> Result<(), SignatureError> {
        match self {
            Self::RawHmac => verify_raw_hmac(envelope, secret),
            Self::TimestampedHmac { tolerance } => {
                verify_timestamped_hmac(envelope, secret, *tolerance, now)
            }
            Self::DigestOfEncodedPayload => verify_encoded_digest(envelope, secret),
        }
    }

    pub fn is_valid(&self, envelope: &WebhookEnvelope, secret: &[u8], now: DateTime<Utc>) -> bool {
        self.verify(envelope, secret, now).is_ok()
    }
}

fn verify_raw_hmac(envelope: &WebhookEnvelope, secret: &[u8]) -> Result<(), SignatureError> {
    let provided = envelope
        .signature()
        .ok_or(SignatureError::MissingSignature)?;
    let hex_part = provided.strip_prefix("sha256=").unwrap_or(provided);
    let provided_bytes =
        hex::decode(hex_part).map_err(|_| SignatureError::malformed("signature is not valid hex"))?;

    let expected = hmac_sha256(secret, &[envelope.body()]);
    if constant_time_eq(&expected, &provided_bytes) {
        Ok(())
    } else {
        Err(SignatureError::SignatureMismatch)
    }
}

fn verify_timestamped_hmac(
    envelope: &WebhookEnvelope,
    secret: &[u8],
    tolerance: Duration,
    now: DateTime<Utc>,
) -> Result<(), SignatureError> {
    let header = envelope
        .signature()
        .ok_or(SignatureError::MissingSignature)?;
    let parsed = TimestampedHeader::parse(header, envelope.timestamp())?;

    let expected = hmac_sha256(
        secret,
        &[parsed.timestamp_raw.as_bytes(), b".", envelope.body()],
    );
    let matched = parsed
        .candidates
        .iter()
        .any(|candidate| constant_time_eq(&expected, candidate));
    if !matched {
        return Err(SignatureError::SignatureMismatch);
    }

    let age_seconds = now.timestamp() - parsed.timestamp;
    let tolerance_seconds = tolerance.as_secs();
    if age_seconds.unsigned_abs() > tolerance_seconds {
        return Err(SignatureError::StaleSignature {
            age_seconds,
            tolerance_seconds,
        });
    }

    Ok(())
}

fn verify_encoded_digest(envelope: &WebhookEnvelope, secret: &[u8]) -> Result<(), SignatureError> {
    let header = envelope.signature();
    let mut payload: Value = match serde_json::from_slice(envelope.body()) {
        Ok(value) => value,
        Err(_) if header.is_none() => return Err(SignatureError::MissingSignature),
        Err(_) => return Err(SignatureError::malformed("body is not valid JSON")),
    };

    let embedded = payload
        .as_object_mut()
        .and_then(|object| object.remove(EMBEDDED_SIGNATURE_FIELD))
        .and_then(|value| value.as_str().map(str::to_string));
    let provided = header
        .map(str::to_string)
        .or(embedded)
        .ok_or(SignatureError::MissingSignature)?;
    let provided_bytes = hex::decode(provided.trim())
        .map_err(|_| SignatureError::malformed("signature is not valid hex"))?;

    let expected = encoded_digest(secret, &payload);
    if constant_time_eq(&expected, &provided_bytes) {
        Ok(())
    } else {
        Err(SignatureError::SignatureMismatch)
    }
}

struct TimestampedHeader {
    timestamp: i64,
    timestamp_raw: String,
    candidates: Vec<Vec<u8>>,
}

impl TimestampedHeader {
    fn parse(header: &str, fallback_timestamp: Option<&str>) -> Result<Self, SignatureError> {
        let mut timestamp_raw: Option<&str> = None;
        let mut candidates = Vec::new();

        for element in header.split(',').map(str::trim) {
            if element.is_empty() {
                continue;
            }
            let (key, value) = element
                .split_once('=')
                .ok_or_else(|| SignatureError::malformed(format!("element '{element}' has no '='")))?;
            match key.trim() {
                "t" => timestamp_raw = Some(value.trim()),
                "v1" => {
                    // Non-hex candidates can never match; skip them.
                    if let Ok(bytes) = hex::decode(value.trim()) {
                        candidates.push(bytes);
                    }
                }
                _ => {}
            }
        }

        let timestamp_raw = timestamp_raw
            .or(fallback_timestamp)
            .ok_or_else(|| SignatureError::malformed("missing timestamp"))?;
        let timestamp = timestamp_raw
            .parse::<i64>()
            .map_err(|_| SignatureError::malformed("timestamp is not an integer"))?;
        if candidates.is_empty() {
            return Err(SignatureError::malformed("no v1 signature present"));
        }

        Ok(Self {
            timestamp,
            timestamp_raw: timestamp_raw.to_string(),
            candidates,
        })
    }
}

fn hmac_sha256(secret: &[u8], parts: &[&[u8]]) -> Vec<u8> {
    // HMAC accepts keys of any length, so construction cannot fail.
    let mut mac = <HmacSha256 as Mac>::new_from_slice(secret)
        .unwrap_or_else(|_| unreachable!("hmac accepts any key length"));
    for part in parts {
        mac.update(part);
    }
    mac.finalize().into_bytes().to_vec()
}

fn encoded_digest(secret: &[u8], payload: &Value) -> Vec<u8> {
    let encoded = BASE64.encode(to_canonical_string(payload));
    let mut hasher = Md5::new();
    hasher.update(encoded.as_bytes());
    hasher.update(secret);
    hasher.finalize().to_vec()
}

fn constant_time_eq(expected: &[u8], provided: &[u8]) -> bool {
    expected.ct_eq(provided).into()
}

/// Hex HMAC-SHA256 signature for [`SignatureStrategy::RawHmac`].
pub fn sign_raw_hmac(secret: &[u8], body: &[u8]) -> String {
    hex::encode(hmac_sha256(secret, &[body]))
}

/// Full `t=...,v1=...` header value for [`SignatureStrategy::TimestampedHmac`].
pub fn sign_timestamped(secret: &[u8], timestamp: i64, body: &[u8]) -> String {
    let timestamp = timestamp.to_string();
    let signature = hmac_sha256(secret, &[timestamp.as_bytes(), b".", body]);
    format!("t={timestamp},v1={}", hex::encode(signature))
}

/// Hex digest for [`SignatureStrategy::DigestOfEncodedPayload`].
///
/// A top-level `sign` field is ignored, matching verification.
pub fn sign_encoded_digest(secret: &[u8], payload: &Value) -> String {
    let mut payload = payload.clone();
    if let Some(object) = payload.as_object_mut() {
        object.remove(EMBEDDED_SIGNATURE_FIELD);
    }
    hex::encode(encoded_digest(secret, &payload))
}
