use crate::{CodecError, KeyError, KeyProvider};
use aes_gcm::{
    aead::{Aead, KeyInit, OsRng},
    AeadCore, Aes256Gcm, Nonce,
};
use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

const NONCE_LEN: usize = 12;
pub const CHUNK_KEY_LEN: usize = 32;

/// AES-256-GCM sealing of chunk payloads. Every sealed payload is the 96-bit
/// nonce followed by the ciphertext and tag.
#[derive(Clone)]
pub struct ChunkCipher {
    cipher: Aes256Gcm,
}

impl ChunkCipher {
    pub fn from_provider(keys: &dyn KeyProvider, alias: &str) -> Result<Self, KeyError> {
        let key = keys.get(alias)?;
        let cipher = Aes256Gcm::new_from_slice(&key).map_err(|_| KeyError::InvalidLength {
            alias: alias.to_string(),
            len: key.len(),
            expected: CHUNK_KEY_LEN,
        })?;
        Ok(Self { cipher })
    }

    pub fn seal(&self, plain: &[u8]) -> Result<Vec<u8>, CodecError> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let sealed = self.cipher.encrypt(&nonce, plain).map_err(|_| CodecError::Seal)?;
        let mut payload = nonce.to_vec();
        payload.extend_from_slice(&sealed);
        Ok(payload)
    }

    pub fn open(&self, payload: &[u8]) -> Result<Vec<u8>, CodecError> {
        if payload.len() < NONCE_LEN {
            return Err(CodecError::Open);
        }
        let (nonce, ciphertext) = payload.split_at(NONCE_LEN);
        self.cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| CodecError::Open)
    }
}

#[derive(Clone)]
pub(crate) struct MessageMac {
    keyed: HmacSha256,
}

impl MessageMac {
    pub(crate) fn from_provider(keys: &dyn KeyProvider, alias: &str) -> Result<Self, KeyError> {
        let key = keys.get(alias)?;
        if key.is_empty() {
            return Err(KeyError::Missing(alias.to_string()));
        }
        // HMAC accepts keys of any length.
        let keyed = <HmacSha256 as Mac>::new_from_slice(&key).map_err(|_| KeyError::Missing(alias.to_string()))?;
        Ok(Self { keyed })
    }

    pub(crate) fn tag_hex(&self, data: &[u8]) -> String {
        let mut mac = self.keyed.clone();
        mac.update(data);
        hex::encode(mac.finalize().into_bytes())
    }

    pub(crate) fn verify(&self, data: &[u8], tag: &[u8]) -> bool {
        let mut mac = self.keyed.clone();
        mac.update(data);
        mac.verify_slice(tag).is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SharedSecretKeys;

    #[test]
    fn sealed_chunk_opens_with_same_key_only() {
        let cipher = ChunkCipher::from_provider(&SharedSecretKeys::new("a"), "chunk").unwrap();
        let other = ChunkCipher::from_provider(&SharedSecretKeys::new("b"), "chunk").unwrap();
        let sealed = cipher.seal(b"payload").unwrap();
        assert_eq!(cipher.open(&sealed).unwrap(), b"payload");
        assert!(other.open(&sealed).is_err());
    }

    #[test]
    fn short_keys_are_rejected() {
        let keys = crate::StaticKeys::new().with_key("chunk", vec![1u8; 16]);
        assert!(matches!(
            ChunkCipher::from_provider(&keys, "chunk"),
            Err(KeyError::InvalidLength { len: 16, .. })
        ));
    }

    #[test]
    fn mac_keys_of_any_length_work_but_empty_is_missing() {
        let short = crate::StaticKeys::new().with_key("mac", vec![3u8; 16]);
        let mac = MessageMac::from_provider(&short, "mac").unwrap();
        let tag = mac.tag_hex(b"header");
        assert!(mac.verify(b"header", &hex::decode(&tag).unwrap()));

        let empty = crate::StaticKeys::new().with_key("mac", Vec::new());
        assert!(matches!(
            MessageMac::from_provider(&empty, "mac"),
            Err(KeyError::Missing(alias)) if alias == "mac"
        ));
    }
}
