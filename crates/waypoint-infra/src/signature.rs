//! HMAC-SHA256 request signing with key rotation.
//!
//! The scheduler signs every delivery with the current signing key and puts
//! the hex digest in `Waypoint-Signature`. Workflow endpoints accept a
//! signature made with either the current or the next key, so keys can be
//! rotated without dropping in-flight messages. With no keys configured
//! verification is disabled (local development).

use hmac::{Hmac, Mac};
use secrecy::{ExposeSecret, SecretString};
use sha2::Sha256;
use waypoint_types::config::SigningConfig;

type HmacSha256 = Hmac<Sha256>;

/// Errors that can occur while verifying a request signature.
#[derive(Debug, thiserror::Error)]
pub enum SignatureError {
    #[error("missing signature header")]
    Missing,

    #[error("signature verification failed")]
    Invalid,

    #[error("invalid signing key: {0}")]
    InvalidKey(String),
}

/// Verifies (and, for the local scheduler, produces) request signatures.
#[derive(Clone, Default)]
pub struct RequestSigner {
    current: Option<SecretString>,
    next: Option<SecretString>,
}

impl std::fmt::Debug for RequestSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestSigner")
            .field("current", &self.current.is_some())
            .field("next", &self.next.is_some())
            .finish()
    }
}

impl RequestSigner {
    pub fn new(current: Option<String>, next: Option<String>) -> Self {
        Self {
            current: current.map(SecretString::from),
            next: next.map(SecretString::from),
        }
    }

    pub fn from_config(config: &SigningConfig) -> Self {
        Self::new(config.current_key.clone(), config.next_key.clone())
    }

    /// Whether any key is configured. Verification is skipped otherwise.
    pub fn is_enabled(&self) -> bool {
        self.current.is_some() || self.next.is_some()
    }

    /// Sign `body` with the current key (falling back to the next key).
    pub fn sign(&self, body: &[u8]) -> Result<Option<String>, SignatureError> {
        match self.current.as_ref().or(self.next.as_ref()) {
            Some(key) => compute_hmac_sha256_hex(key.expose_secret().as_bytes(), body).map(Some),
            None => Ok(None),
        }
    }

    /// Verify a request body against its `Waypoint-Signature` header.
    pub fn verify(&self, body: &[u8], signature: Option<&str>) -> Result<(), SignatureError> {
        if !self.is_enabled() {
            return Ok(());
        }
        let signature = signature.ok_or(SignatureError::Missing)?;

        for key in [&self.current, &self.next].into_iter().flatten() {
            match verify_hmac_sha256(key.expose_secret().as_bytes(), body, signature) {
                Ok(()) => return Ok(()),
                Err(SignatureError::Invalid) => continue,
                Err(other) => return Err(other),
            }
        }
        Err(SignatureError::Invalid)
    }
}

/// Verify a hex HMAC-SHA256 signature in constant time.
pub fn verify_hmac_sha256(secret: &[u8], body: &[u8], signature_hex: &str) -> Result<(), SignatureError> {
    let expected_bytes = hex_decode(signature_hex.trim()).ok_or(SignatureError::Invalid)?;

    let mut mac = HmacSha256::new_from_slice(secret)
        .map_err(|e| SignatureError::InvalidKey(e.to_string()))?;
    mac.update(body);

    mac.verify_slice(&expected_bytes)
        .map_err(|_| SignatureError::Invalid)
}

/// Compute HMAC-SHA256 and return the lowercase hex digest.
pub fn compute_hmac_sha256_hex(secret: &[u8], body: &[u8]) -> Result<String, SignatureError> {
    let mut mac = HmacSha256::new_from_slice(secret)
        .map_err(|e| SignatureError::InvalidKey(e.to_string()))?;
    mac.update(body);
    Ok(hex_encode(&mac.finalize().into_bytes()))
}

fn hex_decode(hex: &str) -> Option<Vec<u8>> {
    if hex.len() % 2 != 0 || !hex.is_ascii() {
        return None;
    }
    (0..hex.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&hex[i..i + 2], 16).ok())
        .collect()
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const BODY: &[u8] = br#"{"runId":"wfr_1","token":"init-wfr_1","delivery":{"type":"resume"}}"#;

    #[test]
    fn test_sign_then_verify_with_current_key() {
        let signer = RequestSigner::new(Some("sig_current".to_string()), None);
        let signature = signer.sign(BODY).unwrap().unwrap();
        assert_eq!(signature.len(), 64);
        assert!(signer.verify(BODY, Some(&signature)).is_ok());
    }

    #[test]
    fn test_next_key_is_accepted_during_rotation() {
        let old = RequestSigner::new(Some("sig_next".to_string()), None);
        let signature = old.sign(BODY).unwrap().unwrap();

        let rotating = RequestSigner::new(Some("sig_current".to_string()), Some("sig_next".to_string()));
        assert!(rotating.verify(BODY, Some(&signature)).is_ok());
    }

    #[test]
    fn test_wrong_key_or_body_is_rejected() {
        let signer = RequestSigner::new(Some("sig_current".to_string()), Some("sig_next".to_string()));
        let forged = compute_hmac_sha256_hex(b"sig_other", BODY).unwrap();
        assert!(matches!(signer.verify(BODY, Some(&forged)), Err(SignatureError::Invalid)));

        let signature = signer.sign(BODY).unwrap().unwrap();
        assert!(matches!(signer.verify(b"tampered", Some(&signature)), Err(SignatureError::Invalid)));
        assert!(matches!(signer.verify(BODY, Some("not-hex")), Err(SignatureError::Invalid)));
    }

    #[test]
    fn test_missing_signature_is_rejected_when_enabled() {
        let signer = RequestSigner::new(None, Some("sig_next".to_string()));
        assert!(matches!(signer.verify(BODY, None), Err(SignatureError::Missing)));
    }

    #[test]
    fn test_verification_disabled_without_keys() {
        let signer = RequestSigner::from_config(&SigningConfig::default());
        assert!(!signer.is_enabled());
        assert!(signer.verify(BODY, None).is_ok());
        assert_eq!(signer.sign(BODY).unwrap(), None);
    }

    #[test]
    fn test_debug_does_not_leak_keys() {
        let signer = RequestSigner::new(Some("super-secret".to_string()), None);
        assert!(!format!("{signer:?}").contains("super-secret"));
    }
}
