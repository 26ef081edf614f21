//! A backup peer: joins the control, backup and restore multicast groups,
//! stores chunks for other peers and runs BACKUP, RESTORE, DELETE and RECLAIM
//! for its own files.

pub mod config;
mod dispatch;
pub mod error;
pub mod metadata;
mod ops;
pub mod peer;
pub mod registry;
pub mod store;
pub mod transport;

pub use config::{ChannelAddrs, PeerConfig};
pub use error::{PeerError, PeerResult};
pub use metadata::{FileRecord, PeerReport};
pub use ops::{BackupOutcome, DeleteOutcome, ReclaimOutcome};
pub use peer::{channel_for, Peer};
pub use transport::{Channel, ChannelKind, Channels, LocalHub, MulticastChannel};
