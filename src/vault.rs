//! Credential vault — envelope encryption for stored secrets
//!
//! Each secret is encrypted with a fresh random data key (DEK); the DEK is
//! wrapped by a key-encryption key (KEK) derived from the operator-supplied
//! master key with Argon2id. Future KEK rotation only re-wraps DEKs, never
//! payloads. Both layers are AES-256-GCM, so tampering surfaces as an
//! authentication failure rather than silent corruption.
//!
//! The vault is optional process state: when no master key is configured the
//! vault simply does not exist and credentials are stored in plaintext — an
//! explicit, logged choice made by the composition root.

use crate::error::{DecryptionError, Result, WatchError};
use aes_gcm::aead::{Aead, KeyInit, OsRng};
use aes_gcm::{AeadCore, Aes256Gcm, Nonce};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::RwLock;

/// Current envelope format version
const ENVELOPE_VERSION: u32 = 1;

/// Minimum master key length
const MIN_MASTER_KEY_LEN: usize = 16;

/// Versioned envelope persisted in place of the plaintext secret
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Envelope {
    version: u32,

    /// Base64 salt for KEK derivation
    kek_salt: String,

    /// Base64 nonce used when wrapping the DEK
    dek_nonce: String,

    /// Base64 DEK ciphertext (wrapped by the KEK)
    encrypted_dek: String,

    /// Base64 nonce used for the payload
    nonce: String,

    /// Base64 payload ciphertext (encrypted by the DEK)
    encrypted_data: String,
}

/// Envelope encryption for connection credentials
pub struct CredentialVault {
    master_key: String,

    /// Encryption salt chosen at construction; decryption derives per-envelope
    kek_salt: [u8; 16],

    /// Derived KEKs cached by salt so the slow derivation runs once per salt
    keks: RwLock<HashMap<String, [u8; 32]>>,
}

impl CredentialVault {
    /// Create a vault from an operator-supplied master key
    ///
    /// Fails hard when the key is shorter than 16 characters.
    pub fn new(master_key: impl Into<String>) -> Result<Self> {
        let master_key = master_key.into();
        if master_key.chars().count() < MIN_MASTER_KEY_LEN {
            return Err(WatchError::Config(format!(
                "Master key must be at least {} characters",
                MIN_MASTER_KEY_LEN
            )));
        }

        let mut kek_salt = [0u8; 16];
        OsRng.fill_bytes(&mut kek_salt);

        let vault = Self {
            master_key,
            kek_salt,
            keks: RwLock::new(HashMap::new()),
        };

        // Derive the encryption KEK eagerly so the cost is paid at startup
        vault.kek_for_salt(&kek_salt)?;
        Ok(vault)
    }

    /// Encrypt a plaintext secret into a serialized envelope
    pub fn encrypt(&self, plaintext: &str) -> Result<String> {
        let kek = self.kek_for_salt(&self.kek_salt)?;
        let kek_cipher = Aes256Gcm::new_from_slice(&kek)
            .map_err(|e| WatchError::Config(format!("KEK setup failed: {}", e)))?;

        let mut dek = [0u8; 32];
        OsRng.fill_bytes(&mut dek);
        let dek_cipher = Aes256Gcm::new_from_slice(&dek)
            .map_err(|e| WatchError::Config(format!("DEK setup failed: {}", e)))?;

        let dek_nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let encrypted_dek = kek_cipher
            .encrypt(&dek_nonce, dek.as_ref())
            .map_err(|e| WatchError::Config(format!("DEK wrap failed: {}", e)))?;

        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let encrypted_data = dek_cipher
            .encrypt(&nonce, plaintext.as_bytes())
            .map_err(|e| WatchError::Config(format!("Encryption failed: {}", e)))?;

        let envelope = Envelope {
            version: ENVELOPE_VERSION,
            kek_salt: BASE64.encode(self.kek_salt),
            dek_nonce: BASE64.encode(dek_nonce),
            encrypted_dek: BASE64.encode(encrypted_dek),
            nonce: BASE64.encode(nonce),
            encrypted_data: BASE64.encode(encrypted_data),
        };

        serde_json::to_string(&envelope).map_err(Into::into)
    }

    /// Decrypt a serialized envelope back to the plaintext secret
    ///
    /// Error cases are distinct: `UnknownVersion` for envelopes from a newer
    /// format, `WrongKey` when the master key cannot unwrap the DEK, and
    /// `Tampered` when the payload fails authentication under a valid DEK.
    pub fn decrypt(&self, envelope: &str) -> Result<String> {
        let envelope: Envelope = serde_json::from_str(envelope)
            .map_err(|e| DecryptionError::Malformed(e.to_string()))?;

        if envelope.version != ENVELOPE_VERSION {
            return Err(DecryptionError::UnknownVersion(envelope.version).into());
        }

        let salt = decode_field(&envelope.kek_salt, "kekSalt")?;
        let dek_nonce = decode_field(&envelope.dek_nonce, "dekNonce")?;
        let encrypted_dek = decode_field(&envelope.encrypted_dek, "encryptedDek")?;
        let nonce = decode_field(&envelope.nonce, "nonce")?;
        let encrypted_data = decode_field(&envelope.encrypted_data, "encryptedData")?;

        if dek_nonce.len() != 12 || nonce.len() != 12 {
            return Err(DecryptionError::Malformed("nonce has wrong length".into()).into());
        }

        let kek = self.kek_for_salt(&salt)?;
        let kek_cipher = Aes256Gcm::new_from_slice(&kek)
            .map_err(|e| WatchError::Config(format!("KEK setup failed: {}", e)))?;

        // AEAD failure here means the KEK is wrong for this envelope
        let dek = kek_cipher
            .decrypt(Nonce::from_slice(&dek_nonce), encrypted_dek.as_ref())
            .map_err(|_| DecryptionError::WrongKey)?;

        let dek_cipher = Aes256Gcm::new_from_slice(&dek)
            .map_err(|_| DecryptionError::Malformed("data key has wrong length".into()))?;

        // A valid DEK that fails to open the payload means tampering
        let plaintext = dek_cipher
            .decrypt(Nonce::from_slice(&nonce), encrypted_data.as_ref())
            .map_err(|_| DecryptionError::Tampered)?;

        String::from_utf8(plaintext)
            .map_err(|e| DecryptionError::Malformed(format!("plaintext not UTF-8: {}", e)).into())
    }

    /// Check whether a stored value is an envelope produced by this vault
    pub fn is_encrypted(value: &str) -> bool {
        serde_json::from_str::<Envelope>(value).is_ok()
    }

    fn kek_for_salt(&self, salt: &[u8]) -> Result<[u8; 32]> {
        let cache_key = BASE64.encode(salt);

        {
            let keks = self
                .keks
                .read()
                .map_err(|e| WatchError::Config(format!("Failed to acquire KEK lock: {}", e)))?;
            if let Some(kek) = keks.get(&cache_key) {
                return Ok(*kek);
            }
        }

        let mut kek = [0u8; 32];
        argon2::Argon2::default()
            .hash_password_into(self.master_key.as_bytes(), salt, &mut kek)
            .map_err(|e| WatchError::Config(format!("KEK derivation failed: {}", e)))?;

        let mut keks = self
            .keks
            .write()
            .map_err(|e| WatchError::Config(format!("Failed to acquire KEK lock: {}", e)))?;
        keks.insert(cache_key, kek);
        Ok(kek)
    }
}

fn decode_field(value: &str, field: &str) -> Result<Vec<u8>> {
    BASE64
        .decode(value)
        .map_err(|e| DecryptionError::Malformed(format!("invalid {} encoding: {}", field, e)).into())
}
