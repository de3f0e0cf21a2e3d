//! Challenge/response authentication material.
//!
//! The daemon loads an authorized-keys style file, one key per line:
//!
//! ```text
//! ed25519 <base64 raw 32-byte public key> <identity>
//! ```
//!
//! Blank lines and `#` comments are ignored. During the handshake the
//! server sends a random 32-byte nonce; the client signs the raw nonce
//! bytes with its ed25519 secret key and answers with its identity and the
//! base64 signature.

use std::path::Path;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use rand::RngCore;
use subtle::ConstantTimeEq;
use thiserror::Error;

/// Length of the handshake nonce in bytes.
pub const NONCE_LEN: usize = 32;

#[derive(Debug, Error)]
pub enum KeyStoreError {
    #[error("failed to read key file {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("malformed key on line {line}")]
    MalformedLine { line: usize },
    #[error("invalid ed25519 public key on line {line}")]
    BadKey { line: usize },
}

#[derive(Debug, Error)]
pub enum SignError {
    #[error("failed to read key {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("invalid ed25519 secret key")]
    BadKey,
}

/// One trusted client key.
#[derive(Debug, Clone)]
pub struct AuthorizedKey {
    pub identity: String,
    pub key: VerifyingKey,
}

/// The set of keys allowed to authenticate.
#[derive(Debug, Clone, Default)]
pub struct KeyStore {
    keys: Vec<AuthorizedKey>,
}

impl KeyStore {
    /// Load and parse a key file. Fatal at startup on any malformed line.
    pub fn load(path: &Path) -> Result<Self, KeyStoreError> {
        let contents = std::fs::read_to_string(path).map_err(|source| KeyStoreError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::parse(&contents)
    }

    pub fn parse(contents: &str) -> Result<Self, KeyStoreError> {
        let mut keys = Vec::new();
        for (i, raw_line) in contents.lines().enumerate() {
            let line = raw_line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let line_no = i + 1;
            let mut fields = line.split_whitespace();
            let (algo, key_b64, identity) = match (fields.next(), fields.next(), fields.next()) {
                (Some(a), Some(k), Some(id)) => (a, k, id),
                _ => return Err(KeyStoreError::MalformedLine { line: line_no }),
            };
            if algo != "ed25519" {
                return Err(KeyStoreError::MalformedLine { line: line_no });
            }
            let raw = BASE64
                .decode(key_b64)
                .map_err(|_| KeyStoreError::BadKey { line: line_no })?;
            let raw: [u8; 32] = raw
                .try_into()
                .map_err(|_| KeyStoreError::BadKey { line: line_no })?;
            let key = VerifyingKey::from_bytes(&raw)
                .map_err(|_| KeyStoreError::BadKey { line: line_no })?;
            keys.push(AuthorizedKey {
                identity: identity.to_string(),
                key,
            });
        }
        Ok(Self { keys })
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Find a key by exact identity, compared in constant time.
    pub fn find(&self, identity: &str) -> Option<&AuthorizedKey> {
        self.keys.iter().find(|k| {
            bool::from(k.identity.as_bytes().ct_eq(identity.as_bytes()))
        })
    }
}

/// Fresh random nonce for one handshake.
pub fn generate_nonce() -> [u8; NONCE_LEN] {
    let mut nonce = [0u8; NONCE_LEN];
    rand::thread_rng().fill_bytes(&mut nonce);
    nonce
}

/// Verifier capability: check a base64 signature over the nonce bytes.
pub fn verify_signature(key: &VerifyingKey, nonce: &[u8], signature_b64: &str) -> bool {
    let Ok(raw) = BASE64.decode(signature_b64) else {
        return false;
    };
    let Ok(signature) = Signature::from_slice(&raw) else {
        return false;
    };
    key.verify_strict(nonce, &signature).is_ok()
}

/// Signer capability (client side): sign the nonce with the base64-encoded
/// 32-byte secret key stored at `path`.
pub fn sign_nonce(path: &Path, nonce: &[u8]) -> Result<String, SignError> {
    let contents = std::fs::read_to_string(path).map_err(|source| SignError::Read {
        path: path.display().to_string(),
        source,
    })?;
    let raw = BASE64
        .decode(contents.trim())
        .map_err(|_| SignError::BadKey)?;
    let raw: [u8; 32] = raw.try_into().map_err(|_| SignError::BadKey)?;
    let key = SigningKey::from_bytes(&raw);
    Ok(BASE64.encode(key.sign(nonce).to_bytes()))
}

/// Encode a signing key the way [`sign_nonce`] expects it on disk.
pub fn encode_signing_key(key: &SigningKey) -> String {
    BASE64.encode(key.to_bytes())
}

/// Render the key-file line for a signing key's public half.
pub fn key_file_line(key: &SigningKey, identity: &str) -> String {
    format!(
        "ed25519 {} {}",
        BASE64.encode(key.verifying_key().to_bytes()),
        identity
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::OsRng;

    #[test]
    fn parses_keys_and_skips_comments() {
        let key = SigningKey::generate(&mut OsRng);
        let contents = format!(
            "# trusted clients\n\n{}\n",
            key_file_line(&key, "laptop")
        );
        let store = KeyStore::parse(&contents).unwrap();
        assert_eq!(store.len(), 1);
        assert!(store.find("laptop").is_some());
        assert!(store.find("desktop").is_none());
    }

    #[test]
    fn rejects_malformed_lines() {
        assert!(matches!(
            KeyStore::parse("ed25519 onlytwo"),
            Err(KeyStoreError::MalformedLine { line: 1 })
        ));
        assert!(matches!(
            KeyStore::parse("rsa AAAA bob"),
            Err(KeyStoreError::MalformedLine { line: 1 })
        ));
        assert!(matches!(
            KeyStore::parse("ed25519 !!! bob"),
            Err(KeyStoreError::BadKey { line: 1 })
        ));
    }

    #[test]
    fn signature_round_trip() {
        let key = SigningKey::generate(&mut OsRng);
        let nonce = generate_nonce();
        let signature = BASE64.encode(key.sign(&nonce).to_bytes());
        assert!(verify_signature(&key.verifying_key(), &nonce, &signature));
    }

    #[test]
    fn wrong_key_or_nonce_fails_verification() {
        let key = SigningKey::generate(&mut OsRng);
        let other = SigningKey::generate(&mut OsRng);
        let nonce = generate_nonce();
        let signature = BASE64.encode(key.sign(&nonce).to_bytes());

        assert!(!verify_signature(&other.verifying_key(), &nonce, &signature));
        let other_nonce = generate_nonce();
        assert!(!verify_signature(&key.verifying_key(), &other_nonce, &signature));
        assert!(!verify_signature(&key.verifying_key(), &nonce, "not-base64!"));
    }

    #[test]
    fn sign_nonce_reads_key_from_disk() {
        let key = SigningKey::generate(&mut OsRng);
        let dir = tempfile::tempdir().unwrap();
        let key_path = dir.path().join("id_ed25519");
        std::fs::write(&key_path, encode_signing_key(&key)).unwrap();

        let nonce = generate_nonce();
        let signature = sign_nonce(&key_path, &nonce).unwrap();
        assert!(verify_signature(&key.verifying_key(), &nonce, &signature));
    }
}
