//! Webhook signature verification
//!
//! The gateway signs the raw request body with HMAC-SHA256 and sends the hex
//! digest in the `X-Signature` header, optionally prefixed with `sha256=`.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;

type HmacSha256 = Hmac<Sha256>;

/// Header carrying the body signature
pub const SIGNATURE_HEADER: &str = "x-signature";

/// Stateless HMAC-SHA256 verifier bound to one secret
#[derive(Clone)]
pub struct SignatureVerifier {
    secret: Vec<u8>,
}

impl std::fmt::Debug for SignatureVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignatureVerifier").finish_non_exhaustive()
    }
}

impl SignatureVerifier {
    pub fn new(secret: impl AsRef<[u8]>) -> Self {
        Self {
            secret: secret.as_ref().to_vec(),
        }
    }

    /// Returns true when `signature` is a valid HMAC of `payload`.
    ///
    /// Malformed signatures (bad hex, wrong length, empty) are simply invalid.
    pub fn verify(&self, payload: &[u8], signature: &str) -> bool {
        verify_signature(&self.secret, payload, signature)
    }

    /// Compute the hex signature for a payload
    pub fn sign(&self, payload: &[u8]) -> String {
        sign_payload(&self.secret, payload)
    }
}

/// Compute the hex-encoded HMAC-SHA256 of `payload`
pub fn sign_payload(secret: &[u8], payload: &[u8]) -> String {
    match HmacSha256::new_from_slice(secret) {
        Ok(mut mac) => {
            mac.update(payload);
            hex::encode(mac.finalize().into_bytes())
        }
        // HMAC accepts keys of any length
        Err(_) => String::new(),
    }
}

/// Constant-time comparison of the provided signature against the expected one
pub fn verify_signature(secret: &[u8], payload: &[u8], signature: &str) -> bool {
    if secret.is_empty() {
        return false;
    }

    let provided = signature.trim();
    let provided = provided.strip_prefix("sha256=").unwrap_or(provided);

    let provided_bytes = match hex::decode(provided) {
        Ok(bytes) => bytes,
        Err(_) => return false,
    };

    let mut mac = match HmacSha256::new_from_slice(secret) {
        Ok(mac) => mac,
        Err(_) => return false,
    };
    mac.update(payload);
    let expected = mac.finalize().into_bytes();

    // ct_eq on slices of different lengths returns false without early exit on content
    expected.as_slice().ct_eq(provided_bytes.as_slice()).into()
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "whsec_test_secret";

    #[test]
    fn test_valid_signature_accepted() {
        let verifier = SignatureVerifier::new(SECRET);
        let body = br#"{"id":"evt_1"}"#;
        let sig = verifier.sign(body);
        assert!(verifier.verify(body, &sig));
        assert!(verifier.verify(body, &format!("sha256={}", sig)));
    }

    #[test]
    fn test_tampered_body_rejected() {
        let verifier = SignatureVerifier::new(SECRET);
        let sig = verifier.sign(br#"{"amount":100}"#);
        assert!(!verifier.verify(br#"{"amount":999}"#, &sig));
    }

    #[test]
    fn test_wrong_secret_rejected() {
        let body = b"payload";
        let sig = sign_payload(b"other_secret", body);
        assert!(!SignatureVerifier::new(SECRET).verify(body, &sig));
    }

    #[test]
    fn test_malformed_signatures_are_invalid_not_errors() {
        let verifier = SignatureVerifier::new(SECRET);
        let body = b"payload";
        assert!(!verifier.verify(body, ""));
        assert!(!verifier.verify(body, "not-hex-at-all"));
        assert!(!verifier.verify(body, "abcd"));
        assert!(!verifier.verify(body, "sha256="));
        assert!(!verifier.verify(body, "t=123,v1=deadbeef"));
    }

    #[test]
    fn test_empty_secret_never_validates() {
        let body = b"payload";
        let sig = sign_payload(b"", body);
        assert!(!verify_signature(b"", body, &sig));
    }

    #[test]
    fn test_debug_does_not_leak_secret() {
        let rendered = format!("{:?}", SignatureVerifier::new(SECRET));
        assert!(!rendered.contains(SECRET));
    }
}
