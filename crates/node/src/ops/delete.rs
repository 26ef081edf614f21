use crate::error::{PeerError, PeerResult};
use crate::peer::Peer;
use crate::registry::{InstanceKey, OperationKind};
use peerback_protocol::{FileId, Message, PeerId};
use serde::Serialize;
use std::collections::BTreeSet;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Result of a DELETE that reached every known holder.
#[derive(Debug, Clone, Serialize)]
pub struct DeleteOutcome {
    pub file_id: FileId,
    /// Peers that confirmed with DELETED. Always empty on basic peers.
    pub acknowledged: Vec<PeerId>,
}

impl Peer {
    /// Deletes the backup of the file at `path` on every peer holding it.
    pub async fn delete(&self, path: impl AsRef<Path>) -> PeerResult<DeleteOutcome> {
        let path = path.as_ref();
        let record = self
            .metadata
            .file_by_path(path)
            .ok_or_else(|| PeerError::UnknownFile(path.display().to_string()))?;
        self.delete_file_id(record.file_id).await
    }

    pub(crate) async fn delete_file_id(&self, file_id: FileId) -> PeerResult<DeleteOutcome> {
        if !self.version.is_enhanced() {
            let interval = Duration::from_millis(self.config.delete_interval_ms);
            for n in 0..self.config.delete_repeats.max(1) {
                if n > 0 {
                    tokio::time::sleep(interval).await;
                }
                self.send(Message::Delete { file_id }).await?;
            }
            self.forget_file(&file_id).await;
            info!(peer = %self.id, %file_id, "delete sent");
            return Ok(DeleteOutcome {
                file_id,
                acknowledged: Vec::new(),
            });
        }

        let expected = self.metadata.holders(&file_id);
        let instance = self
            .instances
            .register(InstanceKey::new(self.id, file_id, OperationKind::Delete));
        instance.expect_responses([0]);
        for attempt in 0..self.config.delete_max_attempts.max(1) {
            self.send(Message::Delete { file_id }).await?;
            let timeout = self.config.delete_timeout(attempt);
            if instance.wait_for_responders(0, &expected, timeout).await {
                break;
            }
            debug!(%file_id, attempt, "waiting on DELETED acknowledgements");
        }
        let acknowledged: BTreeSet<PeerId> = instance.responders(0).into_iter().collect();
        drop(instance);

        for peer in &acknowledged {
            self.metadata.clear_pending_delete(*peer, &file_id);
        }
        self.forget_file(&file_id).await;

        let missing: Vec<PeerId> = expected.difference(&acknowledged).copied().collect();
        if !missing.is_empty() {
            for peer in &missing {
                self.metadata.add_pending_delete(*peer, file_id);
            }
            warn!(peer = %self.id, %file_id, pending = ?missing, "delete not acknowledged by every holder");
            return Err(PeerError::DeletePending {
                file_id,
                peers: missing,
            });
        }
        info!(peer = %self.id, %file_id, acknowledged = acknowledged.len(), "delete acknowledged");
        Ok(DeleteOutcome {
            file_id,
            acknowledged: acknowledged.into_iter().collect(),
        })
    }

    /// Drops every local trace of `file_id`.
    async fn forget_file(&self, file_id: &FileId) -> usize {
        let removed = match self.chunks.delete_file(file_id).await {
            Ok(n) => n,
            Err(e) => {
                warn!(%file_id, error = %e, "failed to remove chunk files");
                0
            }
        };
        self.metadata.record_delete(file_id);
        removed
    }

    pub(crate) async fn on_delete(&self, sender: PeerId, file_id: FileId) {
        let removed = self.forget_file(&file_id).await;
        if removed > 0 {
            info!(peer = %self.id, from = %sender, %file_id, removed, "chunks deleted");
        }
        if self.version.is_enhanced() {
            if let Err(e) = self.send(Message::Deleted { file_id }).await {
                warn!(%file_id, error = %e, "failed to send DELETED");
            }
        }
    }

    pub(crate) fn on_deleted(&self, sender: PeerId, file_id: FileId) {
        if self.metadata.clear_pending_delete(sender, &file_id) {
            info!(peer = %self.id, from = %sender, %file_id, "pending delete settled");
        }
        let key = InstanceKey::new(self.id, file_id, OperationKind::Delete);
        if let Some(instance) = self.instances.get(&key) {
            instance.record_response(0, sender);
        }
    }

    /// Replays deletes `sender` missed while it was away.
    pub(crate) async fn on_started(&self, sender: PeerId) {
        if !self.version.is_enhanced() {
            return;
        }
        for file_id in self.metadata.pending_deletes_for(sender) {
            debug!(to = %sender, %file_id, "replaying pending delete");
            if let Err(e) = self.send(Message::Delete { file_id }).await {
                warn!(%file_id, error = %e, "failed to replay DELETE");
            }
        }
    }
}
