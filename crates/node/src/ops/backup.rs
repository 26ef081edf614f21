use crate::error::{PeerError, PeerResult};
use crate::metadata::FileRecord;
use crate::peer::Peer;
use crate::registry::{DedupeKey, InstanceKey, OperationKind, ProtocolInstance, ReplyKind};
use crate::transport::ChannelKind;
use peerback_protocol::{
    chunk_count, ChunkKey, FileId, Message, PeerId, MAX_CHUNK_COUNT, MAX_REPLICATION_DEGREE,
    MIN_REPLICATION_DEGREE,
};
use serde::Serialize;
use std::io::SeekFrom;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BackupOutcome {
    pub file_id: FileId,
    pub chunk_count: u32,
}

impl Peer {
    /// Splits `path` into chunks and replicates each on `replication_degree`
    /// other peers. Chunks that stay under-replicated after every attempt are
    /// reported, never silently accepted.
    pub async fn backup(
        self: &Arc<Self>,
        path: impl AsRef<Path>,
        replication_degree: u8,
    ) -> PeerResult<BackupOutcome> {
        let path = path.as_ref();
        if !(MIN_REPLICATION_DEGREE..=MAX_REPLICATION_DEGREE).contains(&replication_degree) {
            return Err(PeerError::InvalidReplicationDegree(replication_degree));
        }
        let meta = tokio::fs::metadata(path).await?;
        let name = file_name(path)?;
        let modified_ms = chrono::DateTime::<chrono::Utc>::from(meta.modified()?).timestamp_millis();
        let chunks = chunk_count(meta.len(), self.config.chunk_size);
        if chunks > MAX_CHUNK_COUNT {
            return Err(PeerError::FileTooLarge {
                path: path.to_path_buf(),
                chunks,
            });
        }
        let chunks = chunks as u32;
        let file_id = FileId::derive(&name, modified_ms);
        info!(peer = %self.id, %file_id, chunks, replication_degree, path = %path.display(), "backup started");

        let instance = self
            .instances
            .register(InstanceKey::new(self.id, file_id, OperationKind::Backup));
        instance.expect_responses(0..chunks);

        let mut workers = Vec::new();
        for chunk_no in 0..chunks {
            let Ok(permit) = self.backup_slots.clone().acquire_owned().await else {
                break;
            };
            let peer = self.clone();
            let instance = instance.shared();
            let path = path.to_path_buf();
            workers.push((
                chunk_no,
                tokio::spawn(async move {
                    let _permit = permit;
                    peer.backup_chunk(&instance, &path, ChunkKey::new(file_id, chunk_no), replication_degree)
                        .await
                }),
            ));
        }

        let mut failed = Vec::new();
        for (chunk_no, worker) in workers {
            match worker.await {
                Ok(Ok(true)) => {}
                Ok(Ok(false)) => failed.push(chunk_no),
                Ok(Err(e)) => {
                    warn!(%file_id, chunk_no, error = %e, "chunk worker failed");
                    failed.push(chunk_no);
                }
                Err(e) => {
                    warn!(%file_id, chunk_no, error = %e, "chunk worker panicked");
                    failed.push(chunk_no);
                }
            }
        }
        let superseded = self.metadata.upsert_file(FileRecord {
            path: path.to_path_buf(),
            name,
            file_id,
            chunk_count: chunks,
            replication_degree,
            backed_up_at_ms: chrono::Utc::now().timestamp_millis(),
        });
        drop(instance);

        for old in superseded {
            info!(old = %old.file_id, new = %file_id, "deleting superseded backup");
            let peer = self.clone();
            tokio::spawn(async move {
                if let Err(e) = peer.delete_file_id(old.file_id).await {
                    warn!(file_id = %old.file_id, error = %e, "superseded backup not fully deleted");
                }
            });
        }

        if failed.is_empty() {
            info!(peer = %self.id, %file_id, "backup complete");
            Ok(BackupOutcome {
                file_id,
                chunk_count: chunks,
            })
        } else {
            warn!(peer = %self.id, %file_id, under_replicated = failed.len(), "backup under-replicated");
            Err(PeerError::InsufficientReplication {
                file_id,
                chunks: failed,
            })
        }
    }

    async fn backup_chunk(
        &self,
        instance: &ProtocolInstance,
        path: &Path,
        chunk: ChunkKey,
        replication_degree: u8,
    ) -> PeerResult<bool> {
        let body = self.read_chunk(path, chunk.chunk_no).await?;
        self.metadata.record_putchunk(chunk, replication_degree);
        self.replicate_chunk(instance, chunk, replication_degree, body, usize::from(replication_degree))
            .await
    }

    async fn read_chunk(&self, path: &Path, chunk_no: u32) -> PeerResult<Vec<u8>> {
        let chunk_size = self.config.chunk_size;
        let mut file = tokio::fs::File::open(path).await?;
        file.seek(SeekFrom::Start(u64::from(chunk_no) * chunk_size as u64)).await?;
        let mut body = Vec::with_capacity(chunk_size);
        file.take(chunk_size as u64).read_to_end(&mut body).await?;
        Ok(body)
    }

    /// Sends PUTCHUNK for one chunk until `target` peers acknowledged it,
    /// doubling the wait after each attempt.
    pub(crate) async fn replicate_chunk(
        &self,
        instance: &ProtocolInstance,
        chunk: ChunkKey,
        replication_degree: u8,
        body: Vec<u8>,
        target: usize,
    ) -> PeerResult<bool> {
        let datagram = self.codec.build(&self.envelope(Message::PutChunk {
            chunk,
            replication_degree,
            body,
        }))?;
        for attempt in 0..self.config.backup_max_attempts {
            self.send_raw(ChannelKind::Backup, &datagram).await?;
            let timeout = self.config.backup_timeout(attempt);
            if instance
                .wait_for_responses(chunk.chunk_no, target, timeout)
                .await
            {
                debug!(%chunk, attempt, "chunk replicated");
                return Ok(true);
            }
            if instance.is_completed() {
                return Ok(false);
            }
            debug!(
                %chunk,
                attempt,
                acks = instance.response_count(chunk.chunk_no),
                target,
                "chunk under-replicated, resending"
            );
        }
        Ok(instance.response_count(chunk.chunk_no) >= target)
    }

    pub(crate) fn on_putchunk(
        self: &Arc<Self>,
        sender: PeerId,
        chunk: ChunkKey,
        replication_degree: u8,
        body: Vec<u8>,
    ) {
        self.metadata.record_putchunk(chunk, replication_degree);
        self.dedupe.suppress(&DedupeKey {
            peer: self.id,
            chunk,
            kind: ReplyKind::PutChunk,
        });
        if self.metadata.file(&chunk.file_id).is_some() {
            // Peers never hold chunks of files they backed up themselves.
            return;
        }
        let peer = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(peer.jitter()).await;
            peer.store_and_acknowledge(sender, chunk, replication_degree, body).await;
        });
    }

    async fn store_and_acknowledge(
        &self,
        sender: PeerId,
        chunk: ChunkKey,
        replication_degree: u8,
        body: Vec<u8>,
    ) {
        let desired = usize::from(replication_degree);
        let mut stored_now = false;
        if !self.chunks.contains(&chunk).await {
            if self.replication_satisfied(&chunk, desired) {
                debug!(%chunk, from = %sender, "replication already satisfied, not storing");
                return;
            }
            let size = body.len() as u64;
            if let Some(capacity) = self.capacity_bytes() {
                if self.metadata.used_bytes().saturating_add(size) > capacity {
                    debug!(%chunk, capacity, "no room for chunk");
                    return;
                }
            }
            // STOREDs may have arrived while the capacity check ran.
            if self.replication_satisfied(&chunk, desired) {
                return;
            }
            match self.chunks.save_chunk(&chunk, &body).await {
                Ok(written) => stored_now = written,
                Err(e) => {
                    warn!(%chunk, error = %e, "failed to store chunk");
                    return;
                }
            }
            if stored_now && self.replication_satisfied(&chunk, desired) {
                debug!(%chunk, "replication satisfied while writing, discarding copy");
                if let Err(e) = self.chunks.delete_chunk(&chunk).await {
                    warn!(%chunk, error = %e, "failed to discard chunk");
                }
                return;
            }
            self.metadata.record_local(chunk, replication_degree, size);
            debug!(peer = %self.id, %chunk, from = %sender, "chunk stored");
        } else if !self.metadata.is_local(&chunk) {
            self.metadata
                .record_local(chunk, replication_degree, body.len() as u64);
        }
        if let Err(e) = self.send(Message::Stored { chunk }).await {
            warn!(%chunk, error = %e, "failed to send STORED");
            return;
        }
        if stored_now && self.version.is_enhanced() {
            // Give the STOREDs of peers whose jitter expired alongside ours
            // time to arrive before judging the replica set.
            let settle = Duration::from_millis(self.config.jitter_max_ms.saturating_mul(2).max(100));
            tokio::time::sleep(settle).await;
            self.drop_if_surplus(chunk).await;
        }
    }

    fn replication_satisfied(&self, chunk: &ChunkKey, desired: usize) -> bool {
        self.version.is_enhanced() && self.metadata.perceived_degree(chunk) >= desired
    }

    /// Gives up a freshly stored replica when more peers than desired hold
    /// the chunk. Every holder sees the same replica set, so the lowest peer
    /// ids keep their copies and the rest evict.
    async fn drop_if_surplus(&self, chunk: ChunkKey) {
        let Some(record) = self.metadata.chunk(&chunk) else {
            return;
        };
        if !record.is_local() || record.surplus() <= 0 {
            return;
        }
        let keeps = record
            .perceived
            .iter()
            .take(usize::from(record.desired_degree))
            .any(|holder| *holder == self.id);
        if keeps {
            return;
        }
        info!(peer = %self.id, %chunk, perceived = record.perceived.len(), desired = record.desired_degree, "dropping surplus replica");
        if let Err(e) = self.evict(chunk).await {
            warn!(%chunk, error = %e, "failed to drop surplus replica");
        }
    }

    pub(crate) fn on_stored(&self, sender: PeerId, chunk: ChunkKey) {
        self.metadata.record_stored(chunk, sender);
        let whole_file = InstanceKey::new(self.id, chunk.file_id, OperationKind::Backup);
        for key in [whole_file, whole_file.with_extra(chunk.chunk_no)] {
            if let Some(instance) = self.instances.get(&key) {
                instance.record_response(chunk.chunk_no, sender);
            }
        }
    }
}

pub(super) fn file_name(path: &Path) -> PeerResult<String> {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| PeerError::UnknownFile(path.display().to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_name_requires_a_final_component() {
        assert_eq!(file_name(Path::new("/tmp/a.txt")).unwrap(), "a.txt");
        assert!(file_name(Path::new("/")).is_err());
    }
}
