//! Data-encryption keys and their wrapped, at-rest form.
//!
//! A data-encryption key is 64 random bytes: the AES-XTS key and tweak key
//! handed to SPDK. On disk it is sealed with the caller's wrapping secret
//! (AES-256-GCM, the secret's IV as nonce and its `auth_data` as AAD) and
//! stored as `{cipher, algorithm, wrapped_key: [ciphertext, tag]}`.

use crate::error::{Error, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use ring::aead::{self, Aad, BoundKey, Nonce, NonceSequence, NONCE_LEN};
use ring::rand::{SecureRandom, SystemRandom};
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use vmhost_protocol::{WrappingSecret, WRAP_ALGORITHM};

/// Cipher SPDK uses for encrypted volumes.
pub const DATA_CIPHER: &str = "AES_XTS";

const XTS_KEY_LEN: usize = 32;

/// Plaintext key material of one encrypted volume.
#[derive(Clone, PartialEq, Eq)]
pub struct KeyMaterial {
    key: [u8; XTS_KEY_LEN],
    key2: [u8; XTS_KEY_LEN],
}

impl std::fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyMaterial")
            .field("cipher", &DATA_CIPHER)
            .field("key", &"<redacted>")
            .field("key2", &"<redacted>")
            .finish()
    }
}

impl KeyMaterial {
    /// Fresh random key and tweak key.
    pub fn generate() -> Result<Self> {
        let rng = SystemRandom::new();
        let mut key = [0u8; XTS_KEY_LEN];
        let mut key2 = [0u8; XTS_KEY_LEN];
        rng.fill(&mut key)
            .and_then(|_| rng.fill(&mut key2))
            .map_err(|_| Error::random("data-encryption key"))?;
        Ok(Self { key, key2 })
    }

    fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != 2 * XTS_KEY_LEN {
            return None;
        }
        let mut key = [0u8; XTS_KEY_LEN];
        let mut key2 = [0u8; XTS_KEY_LEN];
        key.copy_from_slice(&bytes[..XTS_KEY_LEN]);
        key2.copy_from_slice(&bytes[XTS_KEY_LEN..]);
        Some(Self { key, key2 })
    }

    /// Cipher identifier.
    pub fn cipher(&self) -> &'static str {
        DATA_CIPHER
    }

    /// Data key as hex, the form SPDK expects.
    pub fn key_hex(&self) -> String {
        hex::encode(self.key)
    }

    /// Tweak key as hex.
    pub fn key2_hex(&self) -> String {
        hex::encode(self.key2)
    }

    /// Seal with `secret`. `path` only labels errors.
    pub fn wrap(&self, secret: &WrappingSecret, path: &Path) -> Result<WrappedKey> {
        let (key, nonce) = secret_parts(secret, path)?;
        let unbound = aead::UnboundKey::new(&aead::AES_256_GCM, &key)
            .map_err(|_| Error::key_material(path, "wrapping key rejected"))?;
        let mut sealing = aead::SealingKey::new(unbound, SingleNonce(Some(nonce)));

        let mut in_out = Vec::with_capacity(2 * XTS_KEY_LEN);
        in_out.extend_from_slice(&self.key);
        in_out.extend_from_slice(&self.key2);
        let tag = sealing
            .seal_in_place_separate_tag(Aad::from(secret.auth_data.as_bytes()), &mut in_out)
            .map_err(|_| Error::key_material(path, "AES-256-GCM seal failed"))?;

        Ok(WrappedKey {
            cipher: DATA_CIPHER.to_string(),
            algorithm: WRAP_ALGORITHM.to_string(),
            wrapped_key: (BASE64.encode(&in_out), BASE64.encode(tag.as_ref())),
        })
    }
}

/// On-disk form of a data-encryption key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WrappedKey {
    pub cipher: String,
    pub algorithm: String,
    /// `[ciphertext, tag]`, both base64.
    pub wrapped_key: (String, String),
}

impl WrappedKey {
    /// Open with `secret`. `path` only labels errors.
    pub fn unwrap_with(&self, secret: &WrappingSecret, path: &Path) -> Result<KeyMaterial> {
        if self.cipher != DATA_CIPHER {
            return Err(Error::key_material(
                path,
                format!("unsupported cipher '{}'", self.cipher),
            ));
        }
        if self.algorithm != WRAP_ALGORITHM {
            return Err(Error::key_material(
                path,
                format!("unsupported wrapping algorithm '{}'", self.algorithm),
            ));
        }
        let (key, nonce) = secret_parts(secret, path)?;

        let mut in_out = BASE64
            .decode(&self.wrapped_key.0)
            .map_err(|e| Error::key_material(path, format!("ciphertext: {}", e)))?;
        let tag = BASE64
            .decode(&self.wrapped_key.1)
            .map_err(|e| Error::key_material(path, format!("tag: {}", e)))?;
        in_out.extend_from_slice(&tag);

        let unbound = aead::UnboundKey::new(&aead::AES_256_GCM, &key)
            .map_err(|_| Error::key_material(path, "wrapping key rejected"))?;
        let mut opening = aead::OpeningKey::new(unbound, SingleNonce(Some(nonce)));
        let plain = opening
            .open_in_place(Aad::from(secret.auth_data.as_bytes()), &mut in_out)
            .map_err(|_| {
                Error::key_material(path, "authentication failed: wrong secret or corrupted file")
            })?;

        KeyMaterial::from_bytes(plain)
            .ok_or_else(|| Error::key_material(path, "unwrapped key has the wrong length"))
    }
}

/// Nonce sequence that yields the secret's IV exactly once.
struct SingleNonce(Option<[u8; NONCE_LEN]>);

impl NonceSequence for SingleNonce {
    fn advance(&mut self) -> std::result::Result<Nonce, ring::error::Unspecified> {
        self.0
            .take()
            .map(Nonce::assume_unique_for_key)
            .ok_or(ring::error::Unspecified)
    }
}

fn secret_parts(secret: &WrappingSecret, path: &Path) -> Result<(Vec<u8>, [u8; NONCE_LEN])> {
    if !secret.algorithm.eq_ignore_ascii_case(WRAP_ALGORITHM) {
        return Err(Error::key_material(
            path,
            format!("unsupported wrapping algorithm '{}'", secret.algorithm),
        ));
    }
    let key = secret
        .key_bytes()
        .map_err(|e| Error::key_material(path, e.to_string()))?;
    if key.len() != aead::AES_256_GCM.key_len() {
        return Err(Error::key_material(
            path,
            format!("wrapping key is {} bytes, expected 32", key.len()),
        ));
    }
    let iv = secret
        .iv_bytes()
        .map_err(|e| Error::key_material(path, e.to_string()))?;
    let nonce: [u8; NONCE_LEN] = iv.as_slice().try_into().map_err(|_| {
        Error::key_material(
            path,
            format!("init vector is {} bytes, expected {}", iv.len(), NONCE_LEN),
        )
    })?;
    Ok((key, nonce))
}

/// Write `wrapped` to `path` with mode 0600.
///
/// The file is written beside its destination, fsynced, renamed into place
/// and the directory fsynced.
pub fn write_key_file(path: &Path, wrapped: &WrappedKey) -> Result<()> {
    let dir = path
        .parent()
        .ok_or_else(|| Error::key_material(path, "key file has no parent directory"))?;
    fs::create_dir_all(dir)?;

    let data = serde_json::to_vec_pretty(wrapped)?;
    let mut tmp = tempfile::Builder::new()
        .prefix(".dek")
        .permissions(fs::Permissions::from_mode(0o600))
        .tempfile_in(dir)?;
    tmp.write_all(&data)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| Error::Io(e.error))?;
    File::open(dir)?.sync_all()?;
    Ok(())
}

/// Read a wrapped key file.
pub fn read_key_file(path: &Path) -> Result<WrappedKey> {
    let data = fs::read(path).map_err(|e| Error::key_material(path, e.to_string()))?;
    serde_json::from_slice(&data).map_err(|e| Error::key_material(path, e.to_string()))
}

/// Encryption of one volume.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EncryptionMode {
    Plain,
    Encrypted(KeyMaterial),
}

impl EncryptionMode {
    /// Key material, when encrypted.
    pub fn key_material(&self) -> Option<&KeyMaterial> {
        match self {
            EncryptionMode::Plain => None,
            EncryptionMode::Encrypted(key) => Some(key),
        }
    }
}
