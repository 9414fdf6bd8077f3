//! Proof Key for Code Exchange (RFC 7636)

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use log::debug;
use rand::RngCore;
use sha2::{Digest, Sha256};
use thiserror::Error;

pub const S256: &str = "S256";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PkceError {
    #[error("authorization request did not include a code_challenge")]
    MissingChallenge,
    #[error("code_verifier is required")]
    MissingVerifier,
    #[error("code_verifier must be 43 to 128 unreserved characters")]
    MalformedVerifier,
    #[error("unsupported code_challenge_method: {0}")]
    UnsupportedMethod(String),
    #[error("code_verifier does not match code_challenge")]
    Mismatch,
}

/// `BASE64URL(SHA256(verifier))`
pub fn s256_challenge(verifier: &str) -> String {
    let digest = Sha256::digest(verifier.as_bytes());
    URL_SAFE_NO_PAD.encode(digest)
}

/// Fresh high-entropy verifier of 43 characters
pub fn new_verifier() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Check the challenge a client pushes with its authorization request
pub fn check_challenge(
    challenge: Option<&str>,
    method: Option<&str>,
    allow_missing: bool,
) -> Result<(), PkceError> {
    if challenge.is_none() {
        return if allow_missing {
            Ok(())
        } else {
            Err(PkceError::MissingChallenge)
        };
    }
    match method.unwrap_or(S256) {
        S256 => Ok(()),
        other => Err(PkceError::UnsupportedMethod(other.to_string())),
    }
}

fn is_well_formed(verifier: &str) -> bool {
    (43..=128).contains(&verifier.len())
        && verifier
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'-' | b'.' | b'_' | b'~'))
}

/// Check a verifier against the challenge stored with the request.
///
/// Only `S256` is accepted; an absent method means `S256`. Requests pushed
/// without a challenge pass only when `allow_missing` is set.
pub fn verify(
    challenge: Option<&str>,
    method: Option<&str>,
    verifier: Option<&str>,
    allow_missing: bool,
) -> Result<(), PkceError> {
    check_challenge(challenge, method, allow_missing)?;
    let Some(challenge) = challenge else {
        return Ok(());
    };
    let verifier = verifier.ok_or(PkceError::MissingVerifier)?;
    if !is_well_formed(verifier) {
        return Err(PkceError::MalformedVerifier);
    }
    if s256_challenge(verifier) != challenge {
        return Err(PkceError::Mismatch);
    }

    debug!("PKCE validation successful");
    Ok(())
}
