//! Decryption of OpenTofu-encrypted state documents.
//!
//! Envelope layout:
//!
//! ```text
//! {
//!   "meta": { "key_provider.pbkdf2.<name>": base64(JSON {salt, iterations, hash_function, key_length}) },
//!   "encrypted_data": base64(nonce || ciphertext || tag)
//! }
//! ```
//!
//! The key is derived with PBKDF2-HMAC using exactly the parameters carried in
//! the envelope, then the payload is opened with AES-GCM.

use std::collections::BTreeMap;

use aes_gcm::aead::consts::U12;
use aes_gcm::aead::{Aead, KeyInit, Nonce};
use aes_gcm::aes::Aes192;
use aes_gcm::{Aes128Gcm, Aes256Gcm, AesGcm};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use hmac::Hmac;
use serde::Deserialize;
use sha2::{Sha256, Sha512};
use thiserror::Error;
use tracing::debug;
use zeroize::Zeroizing;

use crate::env::EnvLookup;

/// Top-level member that marks a document as encrypted.
pub const ENCRYPTED_MARKER: &str = "encrypted_data";
/// Prefix of the `meta` member holding PBKDF2 parameters.
pub const PBKDF2_PROVIDER_PREFIX: &str = "key_provider.pbkdf2.";
/// Environment variables consulted for a passphrase, in order.
pub const PASSPHRASE_VARS: [&str; 2] = ["STATEQ_PASSPHRASE", "TF_VAR_passphrase"];

const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;

type Aes192Gcm = AesGcm<Aes192, U12>;

/// Errors raised while decrypting a state document.
#[derive(Debug, Error)]
pub enum DecryptError {
    /// The document is not a JSON encryption envelope.
    #[error("failed to parse encrypted state envelope: {0}")]
    Envelope(#[source] serde_json::Error),

    /// No PBKDF2 key provider entry is present in `meta`.
    #[error("no {PBKDF2_PROVIDER_PREFIX}* key provider in state meta")]
    MissingKeyProvider,

    /// A base64 field did not decode.
    #[error("failed to decode {field}: {source}")]
    Base64 {
        /// Name of the field.
        field: &'static str,
        /// Underlying decode error.
        #[source]
        source: base64::DecodeError,
    },

    /// The key provider parameter block is not valid JSON.
    #[error("failed to parse key provider config: {0}")]
    Params(#[source] serde_json::Error),

    /// The key provider names a hash function this routine does not implement.
    #[error("unsupported key provider hash function: {0}")]
    UnsupportedHash(String),

    /// The key provider asks for a key length AES-GCM cannot use.
    #[error("unsupported key length: {0} bytes")]
    InvalidKeyLength(usize),

    /// The key provider parameters cannot drive key derivation.
    #[error("invalid key provider parameters: {0}")]
    InvalidParams(&'static str),

    /// The payload is shorter than nonce plus authentication tag.
    #[error("ciphertext too short: expected at least {expected} bytes, got {actual}")]
    CiphertextTooShort {
        /// Minimum length.
        expected: usize,
        /// Actual decoded length.
        actual: usize,
    },

    /// Authentication failed: wrong passphrase or tampered payload.
    #[error("authentication failed: wrong passphrase or corrupted payload")]
    AuthenticationFailed,
}

#[derive(Deserialize)]
struct Envelope {
    #[serde(default)]
    meta: BTreeMap<String, serde_json::Value>,
    encrypted_data: String,
}

#[derive(Deserialize)]
struct KdfParams {
    salt: String,
    iterations: u32,
    hash_function: String,
    key_length: usize,
}

/// True when `doc` is a JSON object carrying the encrypted-envelope marker.
pub fn is_encrypted(doc: &[u8]) -> bool {
    serde_json::from_slice::<serde_json::Map<String, serde_json::Value>>(doc)
        .map(|m| m.contains_key(ENCRYPTED_MARKER))
        .unwrap_or(false)
}

/// Passphrase from the flag, else the first non-empty passphrase variable.
pub fn resolve_passphrase(flag: Option<&str>, env: &dyn EnvLookup) -> Option<String> {
    flag.filter(|p| !p.is_empty())
        .map(str::to_string)
        .or_else(|| PASSPHRASE_VARS.iter().find_map(|var| env.non_empty(var)))
}

/// Decrypt an encrypted state document with `passphrase`.
pub fn decrypt_state(doc: &[u8], passphrase: &str) -> Result<Vec<u8>, DecryptError> {
    let envelope: Envelope = serde_json::from_slice(doc).map_err(DecryptError::Envelope)?;

    let provider = envelope
        .meta
        .iter()
        .filter(|(k, _)| k.starts_with(PBKDF2_PROVIDER_PREFIX))
        .find_map(|(_, v)| v.as_str())
        .ok_or(DecryptError::MissingKeyProvider)?;

    let raw_params = decode_field("key provider config", provider)?;
    let params: KdfParams = serde_json::from_slice(&raw_params).map_err(DecryptError::Params)?;
    let salt = decode_field("salt", &params.salt)?;
    let key = derive_key(passphrase.as_bytes(), &salt, &params)?;

    let blob = decode_field("encrypted data", &envelope.encrypted_data)?;
    if blob.len() < NONCE_LEN + TAG_LEN {
        return Err(DecryptError::CiphertextTooShort {
            expected: NONCE_LEN + TAG_LEN,
            actual: blob.len(),
        });
    }
    let (nonce, sealed) = blob.split_at(NONCE_LEN);

    debug!(
        "decrypting {} bytes with {}-bit key ({}, {} iterations)",
        sealed.len(),
        params.key_length * 8,
        params.hash_function,
        params.iterations
    );
    match params.key_length {
        16 => open::<Aes128Gcm>(&key, nonce, sealed),
        24 => open::<Aes192Gcm>(&key, nonce, sealed),
        32 => open::<Aes256Gcm>(&key, nonce, sealed),
        n => Err(DecryptError::InvalidKeyLength(n)),
    }
}

fn decode_field(field: &'static str, value: &str) -> Result<Vec<u8>, DecryptError> {
    STANDARD
        .decode(value)
        .map_err(|source| DecryptError::Base64 { field, source })
}

fn derive_key(
    passphrase: &[u8],
    salt: &[u8],
    params: &KdfParams,
) -> Result<Zeroizing<Vec<u8>>, DecryptError> {
    if !matches!(params.key_length, 16 | 24 | 32) {
        return Err(DecryptError::InvalidKeyLength(params.key_length));
    }
    if params.iterations == 0 {
        return Err(DecryptError::InvalidParams("iterations must be positive"));
    }

    let mut key = Zeroizing::new(vec![0u8; params.key_length]);
    let derived = match params.hash_function.to_ascii_lowercase().as_str() {
        "sha512" => pbkdf2::pbkdf2::<Hmac<Sha512>>(passphrase, salt, params.iterations, &mut key),
        "sha256" => pbkdf2::pbkdf2::<Hmac<Sha256>>(passphrase, salt, params.iterations, &mut key),
        other => return Err(DecryptError::UnsupportedHash(other.to_string())),
    };
    derived.map_err(|_| DecryptError::InvalidParams("key derivation rejected parameters"))?;
    Ok(key)
}

fn open<C: Aead + KeyInit>(key: &[u8], nonce: &[u8], sealed: &[u8]) -> Result<Vec<u8>, DecryptError> {
    let cipher = C::new_from_slice(key).map_err(|_| DecryptError::InvalidKeyLength(key.len()))?;
    cipher
        .decrypt(Nonce::<C>::from_slice(nonce), sealed)
        .map_err(|_| DecryptError::AuthenticationFailed)
}
