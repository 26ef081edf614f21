use crate::error::PeerResult;
use crate::peer::Peer;
use crate::registry::{DedupeKey, InstanceKey, OperationKind, ReplyKind};
use peerback_protocol::{ChunkKey, Message, PeerId};
use serde::Serialize;
use std::cmp::Reverse;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Serialize)]
pub struct ReclaimOutcome {
    pub evicted: Vec<ChunkKey>,
    pub used_bytes: u64,
}

impl Peer {
    /// Caps local storage at `max_kb` and evicts chunks until usage fits.
    /// Over-replicated chunks go first, most surplus first; anything else
    /// follows only if that was not enough.
    pub async fn reclaim(&self, max_kb: u64) -> PeerResult<ReclaimOutcome> {
        self.set_capacity_kb(max_kb);
        let cap = max_kb.saturating_mul(1_000);
        let mut evicted = Vec::new();

        let mut surplus: Vec<_> = self
            .metadata
            .local_chunks()
            .into_iter()
            .filter(|(_, rec)| rec.surplus() > 0)
            .collect();
        surplus.sort_by_key(|(key, rec)| (Reverse(rec.surplus()), *key));
        for (key, _) in surplus {
            if self.metadata.used_bytes() <= cap {
                break;
            }
            // Replication may have changed since the listing.
            if self.metadata.chunk(&key).map_or(true, |rec| rec.surplus() <= 0) {
                continue;
            }
            if self.evict(key).await? {
                evicted.push(key);
            }
        }

        if self.metadata.used_bytes() > cap {
            let mut rest = self.metadata.local_chunks();
            rest.sort_by_key(|(key, _)| *key);
            for (key, _) in rest {
                if self.metadata.used_bytes() <= cap {
                    break;
                }
                if self.evict(key).await? {
                    evicted.push(key);
                }
            }
        }

        let used_bytes = self.metadata.used_bytes();
        info!(peer = %self.id, max_kb, used_bytes, evicted = evicted.len(), "reclaim finished");
        Ok(ReclaimOutcome {
            evicted,
            used_bytes,
        })
    }

    pub(super) async fn evict(&self, key: ChunkKey) -> PeerResult<bool> {
        if !self.chunks.delete_chunk(&key).await? {
            debug!(chunk = %key, "chunk file already gone");
        }
        let Some(freed) = self.metadata.clear_local(&key) else {
            return Ok(false);
        };
        debug!(peer = %self.id, chunk = %key, freed, "chunk evicted");
        self.send(Message::Removed { chunk: key }).await?;
        tokio::time::sleep(Duration::from_millis(self.config.reclaim_pacing_ms)).await;
        Ok(true)
    }

    pub(crate) fn on_removed(self: &Arc<Self>, sender: PeerId, chunk: ChunkKey) {
        let Some(desired) = self.metadata.record_removed(chunk, sender) else {
            return;
        };
        let key = DedupeKey {
            peer: self.id,
            chunk,
            kind: ReplyKind::PutChunk,
        };
        if !self.dedupe.claim(key) {
            return;
        }
        let peer = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(peer.jitter()).await;
            if !peer.dedupe.release(&key) {
                debug!(%chunk, "another peer is already healing");
                return;
            }
            if let Err(e) = peer.heal(chunk, desired).await {
                warn!(%chunk, error = %e, "self-heal failed");
            }
        });
    }

    /// Re-replicates a local chunk that fell under `desired` copies.
    async fn heal(&self, chunk: ChunkKey, desired: u8) -> PeerResult<()> {
        let perceived = self.metadata.perceived_degree(&chunk);
        if perceived >= usize::from(desired) {
            return Ok(());
        }
        let Some(body) = self.chunks.retrieve_chunk(&chunk).await? else {
            self.metadata.clear_local(&chunk);
            return Ok(());
        };
        info!(peer = %self.id, %chunk, perceived, desired, "self-healing chunk");
        let instance = self.instances.register(
            InstanceKey::new(self.id, chunk.file_id, OperationKind::Backup).with_extra(chunk.chunk_no),
        );
        // This peer's own copy counts toward the degree.
        let target = usize::from(desired).saturating_sub(1);
        if !self
            .replicate_chunk(&instance, chunk, desired, body, target)
            .await?
        {
            warn!(%chunk, desired, "chunk still under-replicated after self-heal");
        }
        Ok(())
    }
}
