use crate::KeyError;
use sha2::{Digest, Sha256};
use std::collections::HashMap;

pub const MAC_KEY_ALIAS: &str = "message-mac";
pub const CHUNK_KEY_ALIAS: &str = "chunk-cipher";
pub const STORAGE_KEY_ALIAS: &str = "chunk-storage";

/// Source of key material. Peers treat a missing key as fatal.
pub trait KeyProvider: Send + Sync {
    fn get(&self, alias: &str) -> Result<Vec<u8>, KeyError>;
}

#[derive(Debug, Clone, Default)]
pub struct StaticKeys {
    keys: HashMap<String, Vec<u8>>,
}

impl StaticKeys {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_key(mut self, alias: &str, key: impl Into<Vec<u8>>) -> Self {
        self.keys.insert(alias.to_string(), key.into());
        self
    }
}

impl KeyProvider for StaticKeys {
    fn get(&self, alias: &str) -> Result<Vec<u8>, KeyError> {
        self.keys
            .get(alias)
            .cloned()
            .ok_or_else(|| KeyError::Missing(alias.to_string()))
    }
}

/// Derives one 256-bit key per alias from a secret shared by every peer of
/// the group.
#[derive(Clone)]
pub struct SharedSecretKeys {
    secret: Vec<u8>,
}

impl SharedSecretKeys {
    pub fn new(secret: impl Into<Vec<u8>>) -> Self {
        Self {
            secret: secret.into(),
        }
    }
}

impl KeyProvider for SharedSecretKeys {
    fn get(&self, alias: &str) -> Result<Vec<u8>, KeyError> {
        if self.secret.is_empty() {
            return Err(KeyError::Missing(alias.to_string()));
        }
        let mut hasher = Sha256::new();
        hasher.update(&self.secret);
        hasher.update([0u8]);
        hasher.update(alias.as_bytes());
        Ok(hasher.finalize().to_vec())
    }
}
