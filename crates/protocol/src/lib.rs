//! Wire format shared by every backup peer: identifiers, the message union,
//! and the authenticated codec.

mod codec;
mod crypto;
mod error;
mod ids;
mod keys;
mod message;

pub use codec::{ParseMode, WireCodec};
pub use crypto::ChunkCipher;
pub use error::{CodecError, KeyError};
pub use ids::{
    chunk_count, ChunkKey, FileId, PeerId, Version, CHUNK_SIZE, MAX_CHUNK_COUNT, MAX_CHUNK_INDEX,
    MAX_REPLICATION_DEGREE, MIN_REPLICATION_DEGREE,
};
pub use keys::{
    KeyProvider, SharedSecretKeys, StaticKeys, CHUNK_KEY_ALIAS, MAC_KEY_ALIAS, STORAGE_KEY_ALIAS,
};
pub use message::{Envelope, Message, MessageKind};
