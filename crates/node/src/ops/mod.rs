//! Initiator and responder sides of the four protocol operations.

mod backup;
mod delete;
mod reclaim;
mod restore;

pub use backup::BackupOutcome;
pub use delete::DeleteOutcome;
pub use reclaim::ReclaimOutcome;
