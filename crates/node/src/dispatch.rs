use crate::peer::{channel_for, Peer};
use crate::transport::ChannelKind;
use bytes::Bytes;
use peerback_protocol::{Envelope, Message};
use std::sync::Arc;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

impl Peer {
    /// Receive loop of one channel. Datagrams are queued in arrival order and
    /// handled by a bounded pool of workers.
    pub(crate) fn spawn_channel(self: &Arc<Self>, kind: ChannelKind) -> JoinHandle<()> {
        let channel = self.channels.get(kind).clone();
        let workers = Arc::new(Semaphore::new(self.config.channel_workers.max(1)));
        let peer = Arc::downgrade(self);
        let (queue_tx, mut queue_rx) = mpsc::unbounded_channel::<Bytes>();

        let receiver = tokio::spawn(async move {
            loop {
                match channel.recv().await {
                    Ok(datagram) => {
                        if queue_tx.send(datagram).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        warn!(channel = kind.as_str(), error = %e, "channel receive failed, stopping");
                        break;
                    }
                }
            }
        });

        tokio::spawn(async move {
            let _receiver = AbortOnDrop(receiver);
            while let Some(datagram) = queue_rx.recv().await {
                let Ok(permit) = workers.clone().acquire_owned().await else {
                    break;
                };
                let Some(peer) = peer.upgrade() else {
                    break;
                };
                tokio::spawn(async move {
                    let _permit = permit;
                    peer.handle_datagram(kind, &datagram).await;
                });
            }
        })
    }

    /// Validates one datagram and routes it to its handler. Anything that
    /// fails validation is dropped here.
    pub(crate) async fn handle_datagram(self: &Arc<Self>, channel: ChannelKind, datagram: &[u8]) {
        let envelope = match self.codec.parse(datagram) {
            Ok(envelope) => envelope,
            Err(e) => {
                debug!(channel = channel.as_str(), error = %e, "dropping invalid datagram");
                return;
            }
        };
        if envelope.sender == self.id {
            return;
        }
        let expected = channel_for(envelope.message.kind());
        if expected != channel {
            debug!(
                channel = channel.as_str(),
                kind = envelope.message.kind().as_str(),
                "message on wrong channel"
            );
            return;
        }
        self.dispatch(envelope).await;
    }

    pub(crate) async fn dispatch(self: &Arc<Self>, envelope: Envelope) {
        let Envelope {
            version,
            sender,
            message,
        } = envelope;
        debug!(peer = %self.id, from = %sender, kind = message.kind().as_str(), "received");
        match message {
            Message::PutChunk {
                chunk,
                replication_degree,
                body,
            } => self.on_putchunk(sender, chunk, replication_degree, body),
            Message::Stored { chunk } => self.on_stored(sender, chunk),
            Message::GetChunk { chunk, callback } => self.on_getchunk(sender, chunk, callback),
            Message::Chunk { chunk, body } => self.on_chunk(version, chunk, body),
            Message::Delete { file_id } => self.on_delete(sender, file_id).await,
            Message::Deleted { file_id } => self.on_deleted(sender, file_id),
            Message::Removed { chunk } => self.on_removed(sender, chunk),
            Message::Started => self.on_started(sender).await,
            Message::Retrieve { file_name } => self.on_retrieve(file_name).await,
            Message::Info {
                file_id,
                chunk_count,
                replication_degree,
                file_name,
            } => self.on_info(file_id, chunk_count, replication_degree, file_name),
        }
    }
}

/// Aborts the wrapped task when dropped.
pub(crate) struct AbortOnDrop(pub(crate) JoinHandle<()>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}
