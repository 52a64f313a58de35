use std::collections::HashMap;

use rand::RngCore;
use zeroize::Zeroizing;

use crate::config::EncryptionConfig;
use crate::error::{Result, VaultError};

pub const KEY_LEN: usize = 32;

/// Encryption keys by id. New artifacts use `current`; any listed key can
/// decrypt the artifacts written under it.
pub struct KeyRing {
    current: String,
    keys: HashMap<String, Zeroizing<[u8; KEY_LEN]>>,
}

impl std::fmt::Debug for KeyRing {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut ids: Vec<&String> = self.keys.keys().collect();
        ids.sort();
        f.debug_struct("KeyRing")
            .field("current", &self.current)
            .field("ids", &ids)
            .finish()
    }
}

impl KeyRing {
    pub fn new(current: &str, keys: Vec<(String, [u8; KEY_LEN])>) -> Result<Self> {
        let keys: HashMap<String, Zeroizing<[u8; KEY_LEN]>> = keys
            .into_iter()
            .map(|(id, key)| (id, Zeroizing::new(key)))
            .collect();
        if !keys.contains_key(current) {
            return Err(VaultError::UnknownKey(current.to_string()));
        }
        Ok(Self {
            current: current.to_string(),
            keys,
        })
    }

    /// Build from configuration; returns `None` when encryption is disabled
    /// and no keys are listed for reading legacy artifacts.
    pub fn from_config(cfg: &EncryptionConfig) -> Result<Option<Self>> {
        if cfg.keys.is_empty() {
            if cfg.enabled {
                return Err(VaultError::Config(
                    "encryption is enabled but no keys are configured".into(),
                ));
            }
            return Ok(None);
        }

        let mut keys = Vec::with_capacity(cfg.keys.len());
        for key in &cfg.keys {
            let hex_text = match (&key.key_hex, &key.key_env) {
                (Some(hex), None) => Zeroizing::new(hex.clone()),
                (None, Some(var)) => Zeroizing::new(std::env::var(var).map_err(|_| {
                    VaultError::Config(format!(
                        "encryption key '{}': environment variable '{var}' is not set",
                        key.id
                    ))
                })?),
                _ => {
                    return Err(VaultError::Config(format!(
                        "encryption key '{}': set exactly one of key_hex or key_env",
                        key.id
                    )));
                }
            };
            keys.push((key.id.clone(), parse_key_hex(&key.id, hex_text.trim())?));
        }

        let current = match &cfg.current_key {
            Some(id) => id.clone(),
            None => keys[0].0.clone(),
        };
        Self::new(&current, keys).map(Some)
    }

    pub fn current_id(&self) -> &str {
        &self.current
    }

    pub fn current_key(&self) -> &[u8; KEY_LEN] {
        // Presence of `current` is checked at construction.
        &self.keys[&self.current]
    }

    pub fn key(&self, id: &str) -> Result<&[u8; KEY_LEN]> {
        self.keys
            .get(id)
            .map(|k| &**k)
            .ok_or_else(|| VaultError::UnknownKey(id.to_string()))
    }
}

fn parse_key_hex(id: &str, text: &str) -> Result<[u8; KEY_LEN]> {
    let bytes = Zeroizing::new(hex::decode(text).map_err(|e| {
        VaultError::Config(format!("encryption key '{id}': invalid hex: {e}"))
    })?);
    if bytes.len() != KEY_LEN {
        return Err(VaultError::Config(format!(
            "encryption key '{id}': expected {KEY_LEN} bytes, got {}",
            bytes.len()
        )));
    }
    let mut key = [0u8; KEY_LEN];
    key.copy_from_slice(&bytes);
    Ok(key)
}

/// Generate a fresh random key rendered as hex, for `dbvault keygen`.
pub fn generate_key_hex() -> Zeroizing<String> {
    let mut key = Zeroizing::new([0u8; KEY_LEN]);
    rand::rngs::OsRng.fill_bytes(&mut *key);
    Zeroizing::new(hex::encode(&*key))
}
