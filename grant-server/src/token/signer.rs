//! Compact JWS signing of token claims with Ed25519

use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use base64::Engine as _;
use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use rand::RngCore;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SignerError {
    #[error("invalid signing key: {0}")]
    InvalidKey(String),
    #[error("malformed token: {0}")]
    Malformed(String),
    #[error("token signature is invalid")]
    BadSignature,
    #[error("failed to encode claims: {0}")]
    Json(#[from] serde_json::Error),
}

/// Signs claim sets into tokens and checks tokens it produced
pub trait TokenSigner: Send + Sync {
    fn sign(&self, claims: &Value) -> Result<String, SignerError>;

    /// Verify the signature and return the claims. Does not check `exp`.
    fn verify(&self, token: &str) -> Result<Value, SignerError>;
}

const ALGORITHM: &str = "EdDSA";

pub struct Ed25519Signer {
    signing_key: SigningKey,
    verifying_key: VerifyingKey,
    key_id: String,
}

impl Ed25519Signer {
    pub fn from_seed(seed: [u8; 32]) -> Self {
        let signing_key = SigningKey::from_bytes(&seed);
        let verifying_key = signing_key.verifying_key();
        let fingerprint = Sha256::digest(verifying_key.as_bytes());
        Self {
            signing_key,
            verifying_key,
            key_id: URL_SAFE_NO_PAD.encode(&fingerprint[..8]),
        }
    }

    /// Fresh random key; tokens do not survive a restart
    pub fn generate() -> Self {
        let mut seed = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut seed);
        Self::from_seed(seed)
    }

    /// Key from a base64 (standard or URL-safe) 32 byte seed
    pub fn from_base64(encoded: &str) -> Result<Self, SignerError> {
        let encoded = encoded.trim();
        let bytes = STANDARD
            .decode(encoded)
            .or_else(|_| URL_SAFE_NO_PAD.decode(encoded))
            .map_err(|e| SignerError::InvalidKey(e.to_string()))?;
        let seed: [u8; 32] = bytes
            .try_into()
            .map_err(|bytes: Vec<u8>| {
                SignerError::InvalidKey(format!("expected 32 bytes, got {}", bytes.len()))
            })?;
        Ok(Self::from_seed(seed))
    }

    pub fn key_id(&self) -> &str {
        &self.key_id
    }
}

fn decode_segment(segment: &str, name: &str) -> Result<Vec<u8>, SignerError> {
    URL_SAFE_NO_PAD
        .decode(segment)
        .map_err(|e| SignerError::Malformed(format!("{name}: {e}")))
}

impl TokenSigner for Ed25519Signer {
    fn sign(&self, claims: &Value) -> Result<String, SignerError> {
        let header = json!({"alg": ALGORITHM, "typ": "JWT", "kid": self.key_id});
        let signing_input = format!(
            "{}.{}",
            URL_SAFE_NO_PAD.encode(serde_json::to_vec(&header)?),
            URL_SAFE_NO_PAD.encode(serde_json::to_vec(claims)?)
        );
        let signature = self.signing_key.sign(signing_input.as_bytes());
        Ok(format!(
            "{signing_input}.{}",
            URL_SAFE_NO_PAD.encode(signature.to_bytes())
        ))
    }

    fn verify(&self, token: &str) -> Result<Value, SignerError> {
        let mut parts = token.split('.');
        let (Some(header_segment), Some(payload_segment), Some(signature_segment), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(SignerError::Malformed("expected three segments".to_string()));
        };

        let header: Value = serde_json::from_slice(&decode_segment(header_segment, "header")?)
            .map_err(|e| SignerError::Malformed(format!("header: {e}")))?;
        if header.get("alg").and_then(Value::as_str) != Some(ALGORITHM) {
            return Err(SignerError::Malformed("unexpected alg".to_string()));
        }

        let signature = Signature::from_slice(&decode_segment(signature_segment, "signature")?)
            .map_err(|_| SignerError::BadSignature)?;
        let signing_input = format!("{header_segment}.{payload_segment}");
        self.verifying_key
            .verify_strict(signing_input.as_bytes(), &signature)
            .map_err(|_| SignerError::BadSignature)?;

        serde_json::from_slice(&decode_segment(payload_segment, "payload")?)
            .map_err(|e| SignerError::Malformed(format!("payload: {e}")))
    }
}
