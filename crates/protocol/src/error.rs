use thiserror::Error;

/// Reasons a datagram is rejected by [`crate::WireCodec::parse`] or a message
/// cannot be built.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("header terminator missing")]
    MissingTerminator,
    #[error("authentication trailer missing")]
    MissingMac,
    #[error("authentication tag mismatch")]
    MacMismatch,
    #[error("header is not printable ascii")]
    MalformedHeader,
    #[error("unknown message type {0:?}")]
    UnknownType(String),
    #[error("{kind} expects {expected} header fields, got {found}")]
    FieldCount {
        kind: &'static str,
        expected: usize,
        found: usize,
    },
    #[error("unexpected extra header line")]
    UnexpectedHeaderLine,
    #[error("invalid protocol version {0:?}")]
    InvalidVersion(String),
    #[error("invalid peer id {0:?}")]
    InvalidPeerId(String),
    #[error("invalid content id {0:?}")]
    InvalidFileId(String),
    #[error("invalid chunk index {0:?}")]
    InvalidChunkIndex(String),
    #[error("invalid chunk count {0:?}")]
    InvalidChunkCount(String),
    #[error("invalid replication degree {0:?}")]
    InvalidReplicationDegree(String),
    #[error("invalid callback address {0:?}")]
    InvalidCallback(String),
    #[error("invalid file name in body")]
    InvalidFileName,
    #[error("message type {0} carries no body")]
    UnexpectedBody(&'static str),
    #[error("chunk body of {0} bytes exceeds the chunk size")]
    BodyTooLarge(usize),
    #[error("chunk body could not be sealed")]
    Seal,
    #[error("chunk body could not be opened")]
    Open,
    #[error(transparent)]
    KeyMaterial(#[from] KeyError),
}

#[derive(Debug, Error)]
pub enum KeyError {
    #[error("no key material for alias {0}")]
    Missing(String),
    #[error("key material for alias {alias} has length {len}, expected {expected}")]
    InvalidLength {
        alias: String,
        len: usize,
        expected: usize,
    },
}
