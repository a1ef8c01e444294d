//! GitHub webhook signature verification using HMAC-SHA256.
//!
//! GitHub signs the raw request body with the shared webhook secret and
//! sends the digest in `X-Hub-Signature-256` as `sha256=<hex>`. The check
//! runs over the exact bytes received, before any JSON parsing.

use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};

use crate::error::WebhookError;

type HmacSha256 = Hmac<Sha256>;

/// Parses a GitHub signature header (e.g., "sha256=abc123...") into raw bytes.
///
/// Returns `None` for a missing prefix, another algorithm, or invalid hex.
pub fn parse_signature_header(header: &str) -> Option<Vec<u8>> {
    let hex_sig = header.trim().strip_prefix("sha256=")?;
    hex::decode(hex_sig).ok()
}

/// Verifies a signature header against the payload and secret.
///
/// Uses the constant-time comparison of the HMAC library.
pub fn verify_signature(payload: &[u8], signature_header: &str, secret: &[u8]) -> bool {
    let expected_signature = match parse_signature_header(signature_header) {
        Some(sig) => sig,
        None => return false,
    };

    let mut mac = match HmacSha256::new_from_slice(secret) {
        Ok(mac) => mac,
        Err(_) => return false,
    };
    mac.update(payload);

    mac.verify_slice(&expected_signature).is_ok()
}

/// Hex sha256 of the raw body, stored on the delivery record.
pub fn payload_hash(payload: &[u8]) -> String {
    hex::encode(Sha256::digest(payload))
}

/// Holds the webhook secret and rejects unauthenticated deliveries.
#[derive(Clone)]
pub struct WebhookVerifier {
    secret: Vec<u8>,
}

impl WebhookVerifier {
    pub fn new(secret: impl Into<Vec<u8>>) -> Self {
        Self {
            secret: secret.into(),
        }
    }

    pub fn verify(&self, payload: &[u8], signature_header: Option<&str>) -> Result<(), WebhookError> {
        let header = signature_header.ok_or(WebhookError::MissingSignature)?;

        // SECURITY: an empty secret would accept signatures anyone can compute
        if self.secret.is_empty() || !verify_signature(payload, header, &self.secret) {
            return Err(WebhookError::InvalidSignature);
        }
        Ok(())
    }
}

impl std::fmt::Debug for WebhookVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebhookVerifier")
            .field("secret", &"<redacted>")
            .finish()
    }
}

/// Computes the HMAC-SHA256 signature of a payload.
#[cfg(test)]
pub fn compute_signature(payload: &[u8], secret: &[u8]) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(secret).expect("HMAC can take key of any size");
    mac.update(payload);
    mac.finalize().into_bytes().to_vec()
}

/// Formats a signature as a GitHub-style header value.
#[cfg(test)]
pub fn format_signature_header(signature: &[u8]) -> String {
    format!("sha256={}", hex::encode(signature))
}

/// `X-Hub-Signature-256` value for a payload.
#[cfg(test)]
pub fn sign(payload: &[u8], secret: &[u8]) -> String {
    format_signature_header(&compute_signature(payload, secret))
}
