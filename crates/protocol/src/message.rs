use crate::{ChunkKey, FileId, PeerId, Version};
use std::net::SocketAddr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    PutChunk,
    Stored,
    GetChunk,
    Chunk,
    Delete,
    Deleted,
    Removed,
    Started,
    Retrieve,
    Info,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::PutChunk => "PUTCHUNK",
            MessageKind::Stored => "STORED",
            MessageKind::GetChunk => "GETCHUNK",
            MessageKind::Chunk => "CHUNK",
            MessageKind::Delete => "DELETE",
            MessageKind::Deleted => "DELETED",
            MessageKind::Removed => "REMOVED",
            MessageKind::Started => "STARTED",
            MessageKind::Retrieve => "RETRIEVE",
            MessageKind::Info => "INFO",
        }
    }

    pub fn from_tag(tag: &str) -> Option<Self> {
        Some(match tag {
            "PUTCHUNK" => MessageKind::PutChunk,
            "STORED" => MessageKind::Stored,
            "GETCHUNK" => MessageKind::GetChunk,
            "CHUNK" => MessageKind::Chunk,
            "DELETE" => MessageKind::Delete,
            "DELETED" => MessageKind::Deleted,
            "REMOVED" => MessageKind::Removed,
            "STARTED" => MessageKind::Started,
            "RETRIEVE" => MessageKind::Retrieve,
            "INFO" => MessageKind::Info,
            _ => return None,
        })
    }

    /// Number of fields on the first header line, type and common fields
    /// included.
    pub(crate) fn field_count(&self) -> usize {
        match self {
            MessageKind::Started | MessageKind::Retrieve => 3,
            MessageKind::Delete | MessageKind::Deleted => 4,
            MessageKind::Stored
            | MessageKind::GetChunk
            | MessageKind::Chunk
            | MessageKind::Removed => 5,
            MessageKind::PutChunk | MessageKind::Info => 6,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    PutChunk {
        chunk: ChunkKey,
        replication_degree: u8,
        body: Vec<u8>,
    },
    Stored {
        chunk: ChunkKey,
    },
    /// `callback` is set by enhanced restores that expect the chunk over TCP.
    GetChunk {
        chunk: ChunkKey,
        callback: Option<SocketAddr>,
    },
    Chunk {
        chunk: ChunkKey,
        body: Vec<u8>,
    },
    Delete {
        file_id: FileId,
    },
    Deleted {
        file_id: FileId,
    },
    Removed {
        chunk: ChunkKey,
    },
    Started,
    Retrieve {
        file_name: String,
    },
    Info {
        file_id: FileId,
        chunk_count: u32,
        replication_degree: u8,
        file_name: String,
    },
}

impl Message {
    pub fn kind(&self) -> MessageKind {
        match self {
            Message::PutChunk { .. } => MessageKind::PutChunk,
            Message::Stored { .. } => MessageKind::Stored,
            Message::GetChunk { .. } => MessageKind::GetChunk,
            Message::Chunk { .. } => MessageKind::Chunk,
            Message::Delete { .. } => MessageKind::Delete,
            Message::Deleted { .. } => MessageKind::Deleted,
            Message::Removed { .. } => MessageKind::Removed,
            Message::Started => MessageKind::Started,
            Message::Retrieve { .. } => MessageKind::Retrieve,
            Message::Info { .. } => MessageKind::Info,
        }
    }

    pub fn file_id(&self) -> Option<FileId> {
        match self {
            Message::PutChunk { chunk, .. }
            | Message::Stored { chunk }
            | Message::GetChunk { chunk, .. }
            | Message::Chunk { chunk, .. }
            | Message::Removed { chunk } => Some(chunk.file_id),
            Message::Delete { file_id }
            | Message::Deleted { file_id }
            | Message::Info { file_id, .. } => Some(*file_id),
            Message::Started | Message::Retrieve { .. } => None,
        }
    }
}

/// A message together with the header fields every type carries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub version: Version,
    pub sender: PeerId,
    pub message: Message,
}

impl Envelope {
    pub fn new(version: Version, sender: PeerId, message: Message) -> Self {
        Self {
            version,
            sender,
            message,
        }
    }
}
