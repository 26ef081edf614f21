use crate::config::PeerConfig;
use crate::error::PeerResult;
use crate::metadata::{MetadataStore, PeerReport};
use crate::registry::{DedupeRegistry, InstanceRegistry};
use crate::store::ChunkStore;
use crate::transport::{ChannelKind, Channels};
use peerback_protocol::{
    ChunkCipher, Envelope, KeyProvider, Message, MessageKind, PeerId, Version, WireCodec,
    STORAGE_KEY_ALIAS,
};
use rand::Rng;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const SNAPSHOT_FILE: &str = "metadata.bin";
const UNLIMITED: u64 = u64::MAX;

/// Channel a message type travels on.
pub fn channel_for(kind: MessageKind) -> ChannelKind {
    match kind {
        MessageKind::PutChunk => ChannelKind::Backup,
        MessageKind::Chunk => ChannelKind::Restore,
        MessageKind::Stored
        | MessageKind::GetChunk
        | MessageKind::Delete
        | MessageKind::Deleted
        | MessageKind::Removed
        | MessageKind::Started
        | MessageKind::Retrieve
        | MessageKind::Info => ChannelKind::Control,
    }
}

/// Everything one backup peer owns. Handlers and operations receive it
/// explicitly; there is no process-wide state.
pub struct Peer {
    pub(crate) id: PeerId,
    pub(crate) version: Version,
    pub(crate) config: PeerConfig,
    pub(crate) codec: WireCodec,
    pub(crate) channels: Channels,
    pub(crate) metadata: MetadataStore,
    pub(crate) chunks: ChunkStore,
    pub(crate) instances: InstanceRegistry,
    pub(crate) dedupe: DedupeRegistry,
    pub(crate) backup_slots: Arc<Semaphore>,
    capacity_kb: AtomicU64,
    snapshot_path: PathBuf,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Peer {
    /// Loads persisted state, joins the channels and starts serving. Missing
    /// key material fails here, before any traffic.
    pub async fn start(
        id: PeerId,
        version: Version,
        config: PeerConfig,
        keys: &dyn KeyProvider,
        channels: Channels,
    ) -> PeerResult<Arc<Self>> {
        let codec = WireCodec::new(keys)?;
        let cipher = ChunkCipher::from_provider(keys, STORAGE_KEY_ALIAS)?;
        let root = config.storage_path.join(id.to_string());
        tokio::fs::create_dir_all(&root).await?;

        let chunks = ChunkStore::new(&root, cipher);
        let snapshot_path = root.join(SNAPSHOT_FILE);
        let metadata = MetadataStore::load(id, &snapshot_path).await;
        match chunks.scan().await {
            Ok(on_disk) => metadata.reconcile(&on_disk),
            Err(e) => warn!(error = %e, "chunk store scan failed"),
        }

        let peer = Arc::new(Self {
            id,
            version,
            capacity_kb: AtomicU64::new(config.max_kb.unwrap_or(UNLIMITED)),
            backup_slots: Arc::new(Semaphore::new(config.backup_workers.max(1))),
            config,
            codec,
            channels,
            metadata,
            chunks,
            instances: InstanceRegistry::new(),
            dedupe: DedupeRegistry::new(),
            snapshot_path,
            tasks: Mutex::new(Vec::new()),
        });

        for kind in ChannelKind::ALL {
            let task = peer.spawn_channel(kind);
            peer.track(task);
        }
        let task = peer.spawn_persistence();
        peer.track(task);

        info!(
            peer = %id,
            version = %version,
            root = %root.display(),
            used_bytes = peer.metadata.used_bytes(),
            "peer started"
        );

        if version.is_enhanced() {
            if let Err(e) = peer.send(Message::Started).await {
                warn!(error = %e, "failed to announce start");
            }
        }
        Ok(peer)
    }

    pub fn id(&self) -> PeerId {
        self.id
    }

    pub fn version(&self) -> Version {
        self.version
    }

    pub fn config(&self) -> &PeerConfig {
        &self.config
    }

    pub fn storage_root(&self) -> &Path {
        self.chunks.root()
    }

    pub fn metadata(&self) -> &MetadataStore {
        &self.metadata
    }

    pub fn info(&self) -> PeerReport {
        self.metadata.report(self.capacity_bytes())
    }

    pub(crate) fn capacity_bytes(&self) -> Option<u64> {
        match self.capacity_kb.load(Ordering::Acquire) {
            UNLIMITED => None,
            kb => Some(kb.saturating_mul(1_000)),
        }
    }

    pub(crate) fn set_capacity_kb(&self, max_kb: u64) {
        self.capacity_kb.store(max_kb, Ordering::Release);
    }

    pub(crate) fn envelope(&self, message: Message) -> Envelope {
        Envelope::new(self.version, self.id, message)
    }

    /// Builds `message` and sends it on its channel.
    pub(crate) async fn send(&self, message: Message) -> PeerResult<()> {
        let channel = channel_for(message.kind());
        let datagram = self.codec.build(&self.envelope(message))?;
        self.send_raw(channel, &datagram).await
    }

    pub(crate) async fn send_raw(&self, channel: ChannelKind, datagram: &[u8]) -> PeerResult<()> {
        self.channels.get(channel).send(datagram).await?;
        Ok(())
    }

    /// Random responder delay that spreads concurrent replies apart.
    pub(crate) fn jitter(&self) -> Duration {
        let lo = self.config.jitter_min_ms;
        let hi = self.config.jitter_max_ms.max(lo);
        Duration::from_millis(rand::thread_rng().gen_range(lo..=hi))
    }

    pub(crate) fn track(&self, task: JoinHandle<()>) {
        let mut tasks = self.tasks.lock().unwrap_or_else(|p| p.into_inner());
        tasks.retain(|t| !t.is_finished());
        tasks.push(task);
    }

    fn spawn_persistence(self: &Arc<Self>) -> JoinHandle<()> {
        let peer = Arc::downgrade(self);
        let period = Duration::from_millis(self.config.persist_interval_ms.max(100));
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                let Some(peer) = peer.upgrade() else {
                    break;
                };
                match peer.metadata.persist_if_dirty(&peer.snapshot_path).await {
                    Ok(true) => debug!(path = %peer.snapshot_path.display(), "metadata persisted"),
                    Ok(false) => {}
                    Err(e) => warn!(path = %peer.snapshot_path.display(), error = %e, "metadata persist failed, retrying next tick"),
                }
            }
        })
    }

    pub async fn persist(&self) {
        match self.metadata.persist(&self.snapshot_path).await {
            Ok(()) => debug!(path = %self.snapshot_path.display(), "metadata persisted"),
            Err(e) => warn!(path = %self.snapshot_path.display(), error = %e, "metadata persist failed"),
        }
    }

    /// Stops every loop of this peer and writes a final snapshot.
    pub async fn shutdown(&self) {
        let tasks = std::mem::take(&mut *self.tasks.lock().unwrap_or_else(|p| p.into_inner()));
        for task in tasks {
            task.abort();
        }
        self.persist().await;
        info!(peer = %self.id, "peer stopped");
    }
}
