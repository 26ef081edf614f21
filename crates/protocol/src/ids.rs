use crate::CodecError;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;

/// Plaintext bytes carried by one chunk.
pub const CHUNK_SIZE: usize = 64_000;
pub const MAX_CHUNK_INDEX: u32 = 1_000_000;
pub const MAX_CHUNK_COUNT: u64 = MAX_CHUNK_INDEX as u64 + 1;
pub const MIN_REPLICATION_DEGREE: u8 = 1;
pub const MAX_REPLICATION_DEGREE: u8 = 9;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerId(pub u32);

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for PeerId {
    type Err = CodecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if !is_decimal(s) {
            return Err(CodecError::InvalidPeerId(s.to_string()));
        }
        s.parse::<u32>()
            .map(PeerId)
            .map_err(|_| CodecError::InvalidPeerId(s.to_string()))
    }
}

/// Content identifier of a backed-up file: SHA-256 over the file name and its
/// last-modified time, rendered as 64 lowercase hex characters.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FileId([u8; 32]);

impl FileId {
    pub const HEX_LEN: usize = 64;

    pub fn derive(file_name: &str, modified_ms: i64) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(file_name.as_bytes());
        hasher.update(b":");
        hasher.update(modified_ms.to_string().as_bytes());
        Self(hasher.finalize().into())
    }

    /// Identifier used to correlate a RETRIEVE lookup for `file_name` before
    /// its real content id is known.
    pub fn lookup(file_name: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(b"retrieve:");
        hasher.update(file_name.as_bytes());
        Self(hasher.finalize().into())
    }

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FileId({})", &self.to_hex()[..12])
    }
}

impl FromStr for FileId {
    type Err = CodecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != Self::HEX_LEN || !s.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(CodecError::InvalidFileId(s.to_string()));
        }
        let mut bytes = [0u8; 32];
        hex::decode_to_slice(s, &mut bytes)
            .map_err(|_| CodecError::InvalidFileId(s.to_string()))?;
        Ok(Self(bytes))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChunkKey {
    pub file_id: FileId,
    pub chunk_no: u32,
}

impl ChunkKey {
    pub fn new(file_id: FileId, chunk_no: u32) -> Self {
        Self { file_id, chunk_no }
    }
}

impl fmt::Display for ChunkKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.file_id, self.chunk_no)
    }
}

/// Protocol version in `<digit>.<digit>` form. `1.0` is the basic protocol;
/// every other version speaks the enhanced variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Version {
    pub major: u8,
    pub minor: u8,
}

impl Version {
    pub const BASIC: Version = Version { major: 1, minor: 0 };
    pub const ENHANCED: Version = Version { major: 2, minor: 0 };

    pub fn is_enhanced(&self) -> bool {
        *self != Self::BASIC
    }
}

impl Default for Version {
    fn default() -> Self {
        Self::ENHANCED
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

impl FromStr for Version {
    type Err = CodecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.as_bytes() {
            [major @ b'0'..=b'9', b'.', minor @ b'0'..=b'9'] => Ok(Version {
                major: major - b'0',
                minor: minor - b'0',
            }),
            _ => Err(CodecError::InvalidVersion(s.to_string())),
        }
    }
}

/// Number of chunks a file of `len` bytes is split into. A trailing chunk
/// shorter than `chunk_size` (possibly empty) always terminates the file.
pub fn chunk_count(len: u64, chunk_size: usize) -> u64 {
    len / chunk_size as u64 + 1
}

pub(crate) fn is_decimal(s: &str) -> bool {
    !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit())
}

pub(crate) fn parse_chunk_index(s: &str) -> Result<u32, CodecError> {
    if !is_decimal(s) || s.len() > 7 {
        return Err(CodecError::InvalidChunkIndex(s.to_string()));
    }
    match s.parse::<u32>() {
        Ok(n) if n <= MAX_CHUNK_INDEX => Ok(n),
        _ => Err(CodecError::InvalidChunkIndex(s.to_string())),
    }
}

pub(crate) fn parse_chunk_count(s: &str) -> Result<u32, CodecError> {
    if !is_decimal(s) || s.len() > 7 {
        return Err(CodecError::InvalidChunkCount(s.to_string()));
    }
    match s.parse::<u32>() {
        Ok(n) if n >= 1 && u64::from(n) <= MAX_CHUNK_COUNT => Ok(n),
        _ => Err(CodecError::InvalidChunkCount(s.to_string())),
    }
}

pub(crate) fn parse_replication_degree(s: &str) -> Result<u8, CodecError> {
    match s.as_bytes() {
        [d @ b'1'..=b'9'] => Ok(d - b'0'),
        _ => Err(CodecError::InvalidReplicationDegree(s.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_count_counts_trailing_chunk() {
        assert_eq!(chunk_count(200_000, CHUNK_SIZE), 4);
        assert_eq!(chunk_count(128_000, CHUNK_SIZE), 3);
        assert_eq!(chunk_count(0, CHUNK_SIZE), 1);
    }

    #[test]
    fn file_id_is_stable_and_name_sensitive() {
        let a = FileId::derive("photo.png", 1_700_000_000_000);
        let b = FileId::derive("photo.png", 1_700_000_000_000);
        let c = FileId::derive("photo.png", 1_700_000_000_001);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.to_hex().len(), FileId::HEX_LEN);
        assert_eq!(a.to_hex().parse::<FileId>().unwrap(), a);
    }

    #[test]
    fn version_requires_digit_dot_digit() {
        assert_eq!("1.0".parse::<Version>().unwrap(), Version::BASIC);
        assert!("2.0".parse::<Version>().unwrap().is_enhanced());
        for bad in ["1", "10.0", "1.x", "a.b", "1.0.0", ""] {
            assert!(bad.parse::<Version>().is_err(), "{bad} accepted");
        }
    }

    #[test]
    fn numeric_fields_reject_signs_and_ranges() {
        assert!("+5".parse::<PeerId>().is_err());
        assert!(parse_chunk_index("1000000").is_ok());
        assert!(parse_chunk_index("1000001").is_err());
        assert!(parse_replication_degree("0").is_err());
        assert!(parse_replication_degree("10").is_err());
        assert_eq!(parse_replication_degree("9").unwrap(), 9);
        assert!(parse_chunk_count("0").is_err());
        assert!(parse_chunk_count("1000001").is_ok());
    }
}
