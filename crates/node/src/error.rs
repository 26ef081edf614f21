use peerback_protocol::{ChunkKey, CodecError, FileId, KeyError, PeerId};
use std::path::PathBuf;
use thiserror::Error;

/// Outcome of a front-door operation that did not complete.
#[derive(Debug, Error)]
pub enum PeerError {
    #[error("i/o failure: {0}")]
    Io(#[from] std::io::Error),
    #[error("{path} needs {chunks} chunks, above the protocol limit")]
    FileTooLarge { path: PathBuf, chunks: u64 },
    #[error("replication degree {0} outside 1..=9")]
    InvalidReplicationDegree(u8),
    #[error("{} chunk(s) of {file_id} stayed under-replicated", chunks.len())]
    InsufficientReplication { file_id: FileId, chunks: Vec<u32> },
    #[error("no backup known for {0}")]
    UnknownFile(String),
    #[error("restore of {file_id} is missing chunk {}", missing.chunk_no)]
    RestoreIncomplete { file_id: FileId, missing: ChunkKey },
    #[error("restore of {0} timed out")]
    RestoreTimedOut(FileId),
    #[error("delete of {file_id} still pending on {} peer(s)", peers.len())]
    DeletePending { file_id: FileId, peers: Vec<PeerId> },
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error(transparent)]
    KeyMaterial(#[from] KeyError),
}

pub type PeerResult<T> = Result<T, PeerError>;
