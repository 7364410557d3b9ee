//! RSA public keys used to verify API tokens, indexed by key id.
//!
//! Keys are configured as PEM-encoded X.509 SubjectPublicKeyInfo documents.
//! A key id is the hex SHA-1 digest of the PEM text with surrounding
//! whitespace removed, so a key set can be assembled with nothing more than
//! `openssl rsa -pubout` and `sha1sum`.

use crate::errors::{KeySetError, TokenError};
use jsonwebtoken::DecodingKey;
use rsa::RsaPublicKey;
use rsa::pkcs8::DecodePublicKey;
use rsa::traits::PublicKeyParts;
use sha1::{Digest, Sha1};
use std::collections::HashMap;
use std::fmt;

/// JSON object mapping key id to PEM string.
pub const API_AUTHTOKEN_VERIFICATION_PUBKEY_SET: &str = "API_AUTHTOKEN_VERIFICATION_PUBKEY_SET";
/// Single PEM string used for tokens that carry no `kid` header.
pub const API_AUTHTOKEN_VERIFICATION_PUBKEY: &str = "API_AUTHTOKEN_VERIFICATION_PUBKEY";

pub fn key_id_from_pem(pem: &str) -> String {
    hex::encode(Sha1::digest(pem.trim().as_bytes()))
}

pub struct KeySet {
    keys: HashMap<String, DecodingKey>,
    fallback: Option<DecodingKey>,
}

impl fmt::Debug for KeySet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut ids: Vec<&String> = self.keys.keys().collect();
        ids.sort();
        f.debug_struct("KeySet")
            .field("key_ids", &ids)
            .field("fallback", &self.fallback.is_some())
            .finish()
    }
}

impl KeySet {
    pub fn from_env() -> Result<Self, KeySetError> {
        let key_set = std::env::var(API_AUTHTOKEN_VERIFICATION_PUBKEY_SET).ok();
        let legacy = std::env::var(API_AUTHTOKEN_VERIFICATION_PUBKEY).ok();
        Self::from_sources(key_set.as_deref(), legacy.as_deref())
    }

    pub fn from_sources(key_set: Option<&str>, legacy: Option<&str>) -> Result<Self, KeySetError> {
        let fallback = parse_legacy_key(legacy)?;

        let data = match key_set {
            None => {
                return Err(KeySetError::MissingVariable(
                    API_AUTHTOKEN_VERIFICATION_PUBKEY_SET,
                ));
            }
            Some("") => {
                return Err(KeySetError::EmptyVariable(
                    API_AUTHTOKEN_VERIFICATION_PUBKEY_SET,
                ));
            }
            Some(data) => data,
        };
        tracing::info!(value = data, "{API_AUTHTOKEN_VERIFICATION_PUBKEY_SET} value");

        let entries: HashMap<String, String> =
            serde_json::from_str(data).map_err(|source| KeySetError::InvalidJson {
                variable: API_AUTHTOKEN_VERIFICATION_PUBKEY_SET,
                source,
            })?;

        let mut keys = HashMap::with_capacity(entries.len());
        for (configured, pem) in entries {
            tracing::info!(key_id = %configured, "parse PEM bytes for key with ID");
            let (key, modulus_bits) = parse_public_key(&configured, &pem)?;

            let calculated = key_id_from_pem(&pem);
            tracing::info!(key_id = %calculated, "calculated key ID from PEM data");
            if calculated != configured {
                return Err(KeySetError::KeyIdMismatch {
                    configured,
                    calculated,
                });
            }
            tracing::info!("Parsed RSA public key. Modulus size: {modulus_bits} bits");
            keys.insert(configured, key);
        }

        Ok(Self { keys, fallback })
    }

    /// Resolves the key for a token's `kid` header, or the legacy key when the
    /// token has none.
    pub fn lookup(&self, kid: Option<&str>) -> Result<&DecodingKey, TokenError> {
        match kid {
            Some(kid) => self
                .keys
                .get(kid)
                .ok_or_else(|| TokenError::UnknownKey(kid.to_string())),
            None => self.fallback.as_ref().ok_or(TokenError::NoFallbackKey),
        }
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn has_fallback(&self) -> bool {
        self.fallback.is_some()
    }
}

fn parse_legacy_key(legacy: Option<&str>) -> Result<Option<DecodingKey>, KeySetError> {
    let pem = match legacy {
        None => {
            tracing::info!("{API_AUTHTOKEN_VERIFICATION_PUBKEY} is not set");
            return Ok(None);
        }
        Some("") => {
            tracing::info!("{API_AUTHTOKEN_VERIFICATION_PUBKEY} is empty");
            return Ok(None);
        }
        Some(pem) => pem,
    };

    let (key, modulus_bits) = parse_public_key("legacy", pem)?;
    tracing::info!(
        modulus_bits,
        "Successfully read RSA public key from legacy env var {API_AUTHTOKEN_VERIFICATION_PUBKEY}"
    );
    Ok(Some(key))
}

/// Accepts RSA keys only. Returns the verification key and its modulus size in bits.
fn parse_public_key(key_id: &str, pem: &str) -> Result<(DecodingKey, usize), KeySetError> {
    let invalid = |reason: String| KeySetError::InvalidPem {
        key_id: key_id.to_string(),
        reason,
    };

    let public_key = RsaPublicKey::from_public_key_pem(pem.trim()).map_err(|e| invalid(e.to_string()))?;
    let key = DecodingKey::from_rsa_pem(pem.trim().as_bytes()).map_err(|e| invalid(e.to_string()))?;

    Ok((key, public_key.size() * 8))
}
