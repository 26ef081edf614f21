use super::backup::file_name;
use crate::dispatch::AbortOnDrop;
use crate::error::{PeerError, PeerResult};
use crate::metadata::FileRecord;
use crate::peer::Peer;
use crate::registry::{DedupeKey, InstanceKey, OperationKind, ReplyKind};
use crate::transport::{send_frame, ChannelKind, FrameListener};
use peerback_protocol::{ChunkKey, FileId, Message, PeerId, Version};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

impl Peer {
    /// Rebuilds the file backed up from `path` into this peer's `restored`
    /// directory and returns where it was written. Peers that did not back
    /// the file up themselves discover it by name first.
    ///
    /// Dropping the returned future cancels the restore, its TCP listener
    /// included, and removes the partial output.
    pub async fn restore(self: &Arc<Self>, path: impl AsRef<Path>) -> PeerResult<PathBuf> {
        let path = path.as_ref();
        let record = match self.metadata.file_by_path(path) {
            Some(record) => record,
            None => self.retrieve_record(&file_name(path)?).await?,
        };
        self.restore_record(&record).await
    }

    async fn retrieve_record(&self, file_name: &str) -> PeerResult<FileRecord> {
        let instance = self.instances.register(InstanceKey::new(
            self.id,
            FileId::lookup(file_name),
            OperationKind::Retrieve,
        ));
        self.send(Message::Retrieve {
            file_name: file_name.to_string(),
        })
        .await?;
        let record = instance
            .wait_for_file_record(self.config.retrieve_timeout())
            .await
            .ok_or_else(|| PeerError::UnknownFile(file_name.to_string()))?;
        info!(peer = %self.id, file_id = %record.file_id, chunks = record.chunk_count, "file discovered by name");
        Ok(record)
    }

    async fn restore_record(self: &Arc<Self>, record: &FileRecord) -> PeerResult<PathBuf> {
        let output = self.chunks.restored_path(&record.name);
        if let Some(parent) = output.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let partial = PartialOutput::new(output.clone());
        let out = tokio::fs::File::create(&output).await?;
        let overall = self.config.restore_timeout(record.chunk_count);
        let failure = match tokio::time::timeout(overall, self.fetch_chunks(record, out)).await {
            Ok(Ok(())) => {
                info!(peer = %self.id, file_id = %record.file_id, output = %output.display(), "restore complete");
                partial.keep();
                return Ok(output);
            }
            Ok(Err(e)) => e,
            Err(_) => PeerError::RestoreTimedOut(record.file_id),
        };
        warn!(peer = %self.id, file_id = %record.file_id, error = %failure, "restore failed");
        Err(failure)
    }

    async fn fetch_chunks(self: &Arc<Self>, record: &FileRecord, mut out: tokio::fs::File) -> PeerResult<()> {
        let file_id = record.file_id;
        let instance = self
            .instances
            .register(InstanceKey::new(self.id, file_id, OperationKind::Restore));

        let mut callback = None;
        let mut _side_channel = None;
        match self.config.advertise_ip.filter(|_| self.version.is_enhanced()) {
            Some(ip) => {
                let (frames_tx, mut frames_rx) = mpsc::channel(self.config.restore_window.max(1) as usize * 2);
                let listener = FrameListener::bind(unspecified_like(ip), self.config.tcp_max_clients, frames_tx).await?;
                callback = Some(SocketAddr::new(ip, listener.local_addr().port()));
                instance.set_multicast_chunks(false);
                let peer = self.clone();
                let pump = tokio::spawn(async move {
                    while let Some(frame) = frames_rx.recv().await {
                        peer.accept_tcp_chunk(&frame);
                    }
                });
                _side_channel = Some((listener, AbortOnDrop(pump)));
            }
            None if self.version.is_enhanced() => {
                debug!(%file_id, "no advertise address, collecting chunks from multicast");
            }
            None => {}
        }

        let window = self.config.restore_window.max(1);
        let mut next = 0u32;
        while next < record.chunk_count {
            let end = next.saturating_add(window).min(record.chunk_count);
            instance.open_window(next..end);

            let mut complete = false;
            for round in 0..self.config.restore_rounds.max(1) {
                for chunk_no in instance.missing_chunks() {
                    self.send(Message::GetChunk {
                        chunk: ChunkKey::new(file_id, chunk_no),
                        callback,
                    })
                    .await?;
                    tokio::time::sleep(Duration::from_millis(self.config.getchunk_interval_ms)).await;
                }
                let wait = Duration::from_millis(self.config.restore_window_timeout_ms);
                if instance.wait_for_window(wait).await {
                    complete = true;
                    break;
                }
                if instance.is_completed() {
                    break;
                }
                debug!(%file_id, round, missing = ?instance.missing_chunks(), "restore window incomplete");
            }
            if !complete {
                let missing = instance.missing_chunks().first().copied().unwrap_or(next);
                return Err(PeerError::RestoreIncomplete {
                    file_id,
                    missing: ChunkKey::new(file_id, missing),
                });
            }

            for (_, data) in instance.take_window() {
                out.write_all(&data).await?;
            }
            next = end;
        }
        out.flush().await?;
        out.sync_all().await?;
        Ok(())
    }

    fn accept_tcp_chunk(&self, frame: &[u8]) {
        match self.codec.parse(frame) {
            Ok(envelope) => match envelope.message {
                Message::Chunk { chunk, body } => {
                    let key = InstanceKey::new(self.id, chunk.file_id, OperationKind::Restore);
                    if let Some(instance) = self.instances.get(&key) {
                        instance.offer_chunk(chunk.chunk_no, body);
                    }
                }
                other => debug!(kind = other.kind().as_str(), "unexpected message on tcp side channel"),
            },
            Err(e) => debug!(error = %e, "dropping invalid tcp frame"),
        }
    }

    pub(crate) fn on_getchunk(self: &Arc<Self>, sender: PeerId, chunk: ChunkKey, callback: Option<SocketAddr>) {
        if !self.metadata.is_local(&chunk) {
            return;
        }
        let key = DedupeKey {
            peer: self.id,
            chunk,
            kind: ReplyKind::Chunk,
        };
        if !self.dedupe.claim(key) {
            return;
        }
        let peer = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(peer.jitter()).await;
            if !peer.dedupe.release(&key) {
                debug!(%chunk, "another peer already answered GETCHUNK");
                return;
            }
            let body = match peer.chunks.retrieve_chunk(&chunk).await {
                Ok(Some(body)) => body,
                Ok(None) => {
                    warn!(%chunk, "chunk recorded as local but missing on disk");
                    peer.metadata.clear_local(&chunk);
                    return;
                }
                Err(e) => {
                    warn!(%chunk, error = %e, "failed to read chunk");
                    return;
                }
            };
            if let Err(e) = peer.send_chunk(sender, chunk, body, callback).await {
                warn!(%chunk, error = %e, "failed to send CHUNK");
            }
        });
    }

    async fn send_chunk(
        &self,
        requester: PeerId,
        chunk: ChunkKey,
        body: Vec<u8>,
        callback: Option<SocketAddr>,
    ) -> PeerResult<()> {
        let Some(addr) = callback.filter(|_| self.version.is_enhanced()) else {
            return self.send(Message::Chunk { chunk, body }).await;
        };
        let frame = self.codec.build(&self.envelope(Message::Chunk {
            chunk,
            body: body.clone(),
        }))?;
        match send_frame(addr, &frame, self.config.tcp_connect_timeout()).await {
            Ok(()) => {
                debug!(%chunk, to = %requester, %addr, "chunk sent over tcp");
                // Header-only CHUNK so other holders stand down.
                self.send(Message::Chunk {
                    chunk,
                    body: Vec::new(),
                })
                .await
            }
            Err(e) => {
                warn!(%chunk, %addr, error = %e, "tcp delivery failed, falling back to multicast");
                let datagram = self.codec.build(&self.envelope(Message::Chunk { chunk, body }))?;
                self.send_raw(ChannelKind::Restore, &datagram).await
            }
        }
    }

    pub(crate) fn on_chunk(&self, version: Version, chunk: ChunkKey, body: Vec<u8>) {
        self.dedupe.suppress(&DedupeKey {
            peer: self.id,
            chunk,
            kind: ReplyKind::Chunk,
        });
        let key = InstanceKey::new(self.id, chunk.file_id, OperationKind::Restore);
        if let Some(instance) = self.instances.get(&key) {
            // An empty CHUNK from an enhanced sender means the payload went
            // over TCP; any body is a multicast fallback and still counts.
            let stand_down = body.is_empty() && version.is_enhanced() && !instance.accepts_multicast_chunks();
            if !stand_down {
                instance.offer_chunk(chunk.chunk_no, body);
            }
        }
    }

    pub(crate) async fn on_retrieve(&self, file_name: String) {
        let Some(record) = self.metadata.file_by_name(&file_name) else {
            return;
        };
        let reply = Message::Info {
            file_id: record.file_id,
            chunk_count: record.chunk_count,
            replication_degree: record.replication_degree,
            file_name,
        };
        if let Err(e) = self.send(reply).await {
            warn!(file_id = %record.file_id, error = %e, "failed to send INFO");
        }
    }

    pub(crate) fn on_info(&self, file_id: FileId, chunk_count: u32, replication_degree: u8, file_name: String) {
        let key = InstanceKey::new(self.id, FileId::lookup(&file_name), OperationKind::Retrieve);
        if let Some(instance) = self.instances.get(&key) {
            instance.offer_file_record(FileRecord {
                path: PathBuf::from(&file_name),
                name: file_name,
                file_id,
                chunk_count,
                replication_degree,
                backed_up_at_ms: 0,
            });
        }
    }
}

fn unspecified_like(ip: IpAddr) -> IpAddr {
    match ip {
        IpAddr::V4(_) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        IpAddr::V6(_) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
    }
}

/// Restore output that is deleted when dropped unless kept, so a failed or
/// cancelled restore never leaves a truncated file behind.
struct PartialOutput(Option<PathBuf>);

impl PartialOutput {
    fn new(path: PathBuf) -> Self {
        Self(Some(path))
    }

    fn keep(mut self) {
        self.0 = None;
    }
}

impl Drop for PartialOutput {
    fn drop(&mut self) {
        let Some(path) = self.0.take() else {
            return;
        };
        match std::fs::remove_file(&path) {
            Ok(()) => debug!(output = %path.display(), "removed partial restore"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(output = %path.display(), error = %e, "could not remove partial restore"),
        }
    }
}
