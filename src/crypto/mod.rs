//! Envelope encryption for unit environments.
//!
//! Services with a `kms_key` get their unit environments stored as an
//! envelope: a fresh data key is generated per unit, the environment JSON
//! is encrypted under it with AES-256-CBC, and the row carries the
//! encrypted data key, the IV and the ciphertext (all base64). Agents
//! decrypt the data key through the same [`KeyService`] contract and unwrap
//! the environment locally.
//!
//! The plaintext is padded to the AES block size with trailing spaces,
//! which JSON tolerates, so the stored blob format stays compatible with
//! existing rows.

use aes::cipher::{block_padding::NoPadding, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use rand::RngCore;
use std::collections::BTreeMap;
use thiserror::Error;
use tokio::sync::Mutex;

use crate::store::records::UnitEnvironment;

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

const AES_BLOCK_SIZE: usize = 16;
const DATA_KEY_LEN: usize = 32;

/// Result type for crypto operations
pub type CryptoResult<T> = Result<T, CryptoError>;

/// Envelope encryption errors
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("key service error: {0}")]
    KeyService(String),

    #[error("invalid base64 in {field}: {reason}")]
    Encoding { field: &'static str, reason: String },

    #[error("invalid {field} length: expected {expected}, got {actual}")]
    Length {
        field: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("environment is not valid JSON after decryption: {0}")]
    Plaintext(#[from] serde_json::Error),
}

/// A freshly generated data key: the plaintext for local use and the
/// encrypted blob for storage.
pub struct DataKey {
    pub plaintext: Vec<u8>,
    pub encrypted: Vec<u8>,
}

/// Narrow key-management contract: generate and decrypt data keys under a
/// named master key. The master key never leaves the service.
#[async_trait]
pub trait KeyService: Send + Sync {
    /// Generate a 256-bit data key under the master key `key_id`.
    async fn generate_data_key(&self, key_id: &str) -> CryptoResult<DataKey>;

    /// Decrypt an encrypted data key back to plaintext.
    async fn decrypt_data_key(&self, encrypted: &[u8]) -> CryptoResult<Vec<u8>>;
}

/// Key service backed by in-process master keys.
///
/// Wraps data keys by XOR with a keystream derived from the master key;
/// fine for tests and single-region demos, not a hardware module.
#[derive(Default)]
pub struct LocalKeyService {
    masters: Mutex<BTreeMap<String, [u8; DATA_KEY_LEN]>>,
}

impl LocalKeyService {
    pub fn new() -> Self {
        Self::default()
    }

    async fn master(&self, key_id: &str) -> [u8; DATA_KEY_LEN] {
        let mut masters = self.masters.lock().await;
        *masters.entry(key_id.to_string()).or_insert_with(|| {
            let mut key = [0u8; DATA_KEY_LEN];
            rand::thread_rng().fill_bytes(&mut key);
            key
        })
    }

    fn wrap(master: &[u8; DATA_KEY_LEN], data: &[u8]) -> Vec<u8> {
        data.iter()
            .enumerate()
            .map(|(i, b)| b ^ master[i % DATA_KEY_LEN])
            .collect()
    }
}

#[async_trait]
impl KeyService for LocalKeyService {
    async fn generate_data_key(&self, key_id: &str) -> CryptoResult<DataKey> {
        let master = self.master(key_id).await;
        let mut plaintext = vec![0u8; DATA_KEY_LEN];
        rand::thread_rng().fill_bytes(&mut plaintext);
        let mut encrypted = Self::wrap(&master, &plaintext);
        // Prefix with the key id so decrypt can find the master.
        let mut blob = key_id.as_bytes().to_vec();
        blob.push(0);
        blob.append(&mut encrypted);
        Ok(DataKey {
            plaintext,
            encrypted: blob,
        })
    }

    async fn decrypt_data_key(&self, encrypted: &[u8]) -> CryptoResult<Vec<u8>> {
        let split = encrypted
            .iter()
            .position(|b| *b == 0)
            .ok_or_else(|| CryptoError::KeyService("malformed data key blob".into()))?;
        let key_id = String::from_utf8_lossy(&encrypted[..split]).to_string();
        let master = self.master(&key_id).await;
        Ok(Self::wrap(&master, &encrypted[split + 1..]))
    }
}

/// Encrypt a unit environment under a service's master key.
pub async fn encrypt_environment(
    keys: &dyn KeyService,
    key_id: &str,
    environment: &BTreeMap<String, String>,
) -> CryptoResult<UnitEnvironment> {
    let data_key = keys.generate_data_key(key_id).await?;
    if data_key.plaintext.len() != DATA_KEY_LEN {
        return Err(CryptoError::Length {
            field: "data key",
            expected: DATA_KEY_LEN,
            actual: data_key.plaintext.len(),
        });
    }

    let mut iv = [0u8; AES_BLOCK_SIZE];
    rand::thread_rng().fill_bytes(&mut iv);

    let json = serde_json::to_string(environment)?;
    let padded = pad_with_spaces(json.as_bytes());

    let cipher = Aes256CbcEnc::new_from_slices(&data_key.plaintext, &iv)
        .map_err(|e| CryptoError::KeyService(e.to_string()))?;
    let ciphertext = cipher.encrypt_padded_vec_mut::<NoPadding>(&padded);

    Ok(UnitEnvironment::Encrypted {
        environment_key: BASE64.encode(&data_key.encrypted),
        environment_iv: BASE64.encode(iv),
        environment_data: BASE64.encode(ciphertext),
    })
}

/// Decrypt a stored environment back to the plaintext map. Plaintext rows
/// pass through untouched.
pub async fn decrypt_environment(
    keys: &dyn KeyService,
    environment: &UnitEnvironment,
) -> CryptoResult<BTreeMap<String, String>> {
    let (environment_key, environment_iv, environment_data) = match environment {
        UnitEnvironment::Plain { environment } => return Ok(environment.clone()),
        UnitEnvironment::Encrypted {
            environment_key,
            environment_iv,
            environment_data,
        } => (environment_key, environment_iv, environment_data),
    };

    let encrypted_key = decode(environment_key, "environment_key")?;
    let iv = decode(environment_iv, "environment_iv")?;
    let ciphertext = decode(environment_data, "environment_data")?;

    if iv.len() != AES_BLOCK_SIZE {
        return Err(CryptoError::Length {
            field: "environment_iv",
            expected: AES_BLOCK_SIZE,
            actual: iv.len(),
        });
    }
    if ciphertext.is_empty() || ciphertext.len() % AES_BLOCK_SIZE != 0 {
        return Err(CryptoError::Length {
            field: "environment_data",
            expected: AES_BLOCK_SIZE,
            actual: ciphertext.len(),
        });
    }

    let data_key = keys.decrypt_data_key(&encrypted_key).await?;
    if data_key.len() != DATA_KEY_LEN {
        return Err(CryptoError::Length {
            field: "data key",
            expected: DATA_KEY_LEN,
            actual: data_key.len(),
        });
    }

    let cipher = Aes256CbcDec::new_from_slices(&data_key, &iv)
        .map_err(|e| CryptoError::KeyService(e.to_string()))?;
    let mut buffer = ciphertext;
    let plaintext = cipher
        .decrypt_padded_mut::<NoPadding>(&mut buffer)
        .map_err(|e| CryptoError::KeyService(e.to_string()))?;

    let json = String::from_utf8_lossy(plaintext);
    Ok(serde_json::from_str(json.trim_end_matches(' '))?)
}

fn pad_with_spaces(data: &[u8]) -> Vec<u8> {
    let mut padded = data.to_vec();
    let remainder = padded.len() % AES_BLOCK_SIZE;
    let fill = if remainder == 0 {
        AES_BLOCK_SIZE
    } else {
        AES_BLOCK_SIZE - remainder
    };
    padded.extend(std::iter::repeat(b' ').take(fill));
    padded
}

fn decode(value: &str, field: &'static str) -> CryptoResult<Vec<u8>> {
    BASE64.decode(value).map_err(|e| CryptoError::Encoding {
        field,
        reason: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[tokio::test]
    async fn test_envelope_round_trip() {
        let keys = LocalKeyService::new();
        let environment = env(&[("DATABASE_URL", "postgres://db/app"), ("PORT", "8080")]);

        let encrypted = encrypt_environment(&keys, "master-1", &environment)
            .await
            .unwrap();
        match &encrypted {
            UnitEnvironment::Encrypted { environment_data, .. } => {
                assert!(!environment_data.contains("postgres"));
            }
            UnitEnvironment::Plain { .. } => panic!("environment was not encrypted"),
        }

        let decrypted = decrypt_environment(&keys, &encrypted).await.unwrap();
        assert_eq!(decrypted, environment);
    }

    #[tokio::test]
    async fn test_plain_environment_passes_through() {
        let keys = LocalKeyService::new();
        let environment = env(&[("A", "1")]);
        let decrypted = decrypt_environment(
            &keys,
            &UnitEnvironment::Plain {
                environment: environment.clone(),
            },
        )
        .await
        .unwrap();
        assert_eq!(decrypted, environment);
    }

    #[tokio::test]
    async fn test_each_unit_gets_a_fresh_iv() {
        let keys = LocalKeyService::new();
        let environment = env(&[("A", "1")]);
        let first = encrypt_environment(&keys, "master-1", &environment)
            .await
            .unwrap();
        let second = encrypt_environment(&keys, "master-1", &environment)
            .await
            .unwrap();
        let iv = |e: &UnitEnvironment| match e {
            UnitEnvironment::Encrypted { environment_iv, .. } => environment_iv.clone(),
            _ => panic!("expected encrypted"),
        };
        assert_ne!(iv(&first), iv(&second));
    }

    #[tokio::test]
    async fn test_empty_environment_round_trip() {
        let keys = LocalKeyService::new();
        let environment = env(&[]);
        let encrypted = encrypt_environment(&keys, "master-1", &environment)
            .await
            .unwrap();
        let decrypted = decrypt_environment(&keys, &encrypted).await.unwrap();
        assert!(decrypted.is_empty());
    }

    #[tokio::test]
    async fn test_bad_base64_is_rejected() {
        let keys = LocalKeyService::new();
        let result = decrypt_environment(
            &keys,
            &UnitEnvironment::Encrypted {
                environment_key: "!!".into(),
                environment_iv: "!!".into(),
                environment_data: "!!".into(),
            },
        )
        .await;
        assert!(matches!(result, Err(CryptoError::Encoding { .. })));
    }
}
