//! Cryptographic utilities for webhook verification.
//!
//! Payment and subscription webhooks carry a `x-signature` header of the form
//! `t=<unix seconds>,v1=<hex hmac>[,v1=...]`, where each `v1` value is the
//! HMAC-SHA256 of `"{t}.{body}"` under the shared webhook secret.

use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Maximum age of a signed webhook, in seconds.
pub const SIGNATURE_TOLERANCE_SECONDS: i64 = 300;

/// Signature verification failures.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum SignatureError {
    /// The header is missing the timestamp or every `v1` value.
    #[error("malformed signature header")]
    Malformed,

    /// The timestamp is outside the tolerance window.
    #[error("signature timestamp outside tolerance")]
    Expired,

    /// No `v1` value matches.
    #[error("signature mismatch")]
    Mismatch,

    /// The secret cannot key the MAC.
    #[error("invalid signing key")]
    InvalidKey,
}

/// Compute HMAC-SHA256 and return the hex-encoded result (64 characters).
///
/// # Errors
///
/// Returns `SignatureError::InvalidKey` if the MAC rejects the key.
pub fn hmac_sha256_hex(secret: &str, message: &str) -> Result<String, SignatureError> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|_| SignatureError::InvalidKey)?;
    mac.update(message.as_bytes());
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Build a signature header for `payload` at `timestamp`.
///
/// # Errors
///
/// Returns `SignatureError::InvalidKey` if the MAC rejects the key.
pub fn sign_payload(secret: &str, timestamp: i64, payload: &str) -> Result<String, SignatureError> {
    let signature = hmac_sha256_hex(secret, &format!("{timestamp}.{payload}"))?;
    Ok(format!("t={timestamp},v1={signature}"))
}

/// Verify a signature header against `payload`.
///
/// # Errors
///
/// Returns the reason the header was rejected.
pub fn verify_signature(
    secret: &str,
    header: &str,
    payload: &str,
    now: i64,
) -> Result<(), SignatureError> {
    let mut timestamp: Option<&str> = None;
    let mut signatures: Vec<&str> = Vec::new();

    for part in header.split(',') {
        let mut kv = part.trim().splitn(2, '=');
        match (kv.next(), kv.next()) {
            (Some("t"), Some(ts)) => timestamp = Some(ts),
            (Some("v1"), Some(sig)) => signatures.push(sig),
            _ => {}
        }
    }

    let timestamp = timestamp.ok_or(SignatureError::Malformed)?;
    if signatures.is_empty() {
        return Err(SignatureError::Malformed);
    }

    let issued: i64 = timestamp.parse().map_err(|_| SignatureError::Malformed)?;
    if (now - issued).abs() > SIGNATURE_TOLERANCE_SECONDS {
        return Err(SignatureError::Expired);
    }

    let expected = hmac_sha256_hex(secret, &format!("{timestamp}.{payload}"))?;
    if signatures.iter().any(|sig| constant_time_eq(&expected, sig)) {
        Ok(())
    } else {
        Err(SignatureError::Mismatch)
    }
}

/// Constant-time string comparison to prevent timing attacks.
#[must_use]
pub fn constant_time_eq(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }

    let mut result = 0u8;
    for (x, y) in a.bytes().zip(b.bytes()) {
        result |= x ^ y;
    }
    result == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "whsec_test";
    const NOW: i64 = 1_760_000_000;

    #[test]
    fn hmac_sha256_produces_correct_length() {
        let result = hmac_sha256_hex("key", "The quick brown fox jumps over the lazy dog").unwrap();
        assert_eq!(result.len(), 64);
    }

    #[test]
    fn signed_payload_verifies() {
        let header = sign_payload(SECRET, NOW, r#"{"a":1}"#).unwrap();
        assert_eq!(verify_signature(SECRET, &header, r#"{"a":1}"#, NOW + 10), Ok(()));
    }

    #[test]
    fn tampered_payload_is_rejected() {
        let header = sign_payload(SECRET, NOW, r#"{"a":1}"#).unwrap();
        assert_eq!(
            verify_signature(SECRET, &header, r#"{"a":2}"#, NOW),
            Err(SignatureError::Mismatch)
        );
        assert_eq!(
            verify_signature("other", &header, r#"{"a":1}"#, NOW),
            Err(SignatureError::Mismatch)
        );
    }

    #[test]
    fn stale_signature_is_rejected() {
        let header = sign_payload(SECRET, NOW, "{}").unwrap();
        assert_eq!(
            verify_signature(SECRET, &header, "{}", NOW + SIGNATURE_TOLERANCE_SECONDS + 1),
            Err(SignatureError::Expired)
        );
    }

    #[test]
    fn any_matching_v1_is_accepted() {
        let valid = sign_payload(SECRET, NOW, "{}").unwrap();
        let sig = valid.split("v1=").nth(1).unwrap();
        let header = format!("t={NOW},v1=deadbeef,v1={sig}");
        assert_eq!(verify_signature(SECRET, &header, "{}", NOW), Ok(()));
    }

    #[test]
    fn malformed_headers_are_rejected() {
        assert_eq!(
            verify_signature(SECRET, "v1=abc", "{}", NOW),
            Err(SignatureError::Malformed)
        );
        assert_eq!(
            verify_signature(SECRET, "t=123", "{}", NOW),
            Err(SignatureError::Malformed)
        );
        assert_eq!(
            verify_signature(SECRET, "t=soon,v1=abc", "{}", NOW),
            Err(SignatureError::Malformed)
        );
    }

    #[test]
    fn constant_time_eq_compares() {
        assert!(constant_time_eq("abc", "abc"));
        assert!(!constant_time_eq("abc", "abd"));
        assert!(!constant_time_eq("abc", "ab"));
    }
}
