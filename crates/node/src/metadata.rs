use dashmap::DashMap;
use peerback_protocol::{ChunkKey, FileId, PeerId};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{info, warn};

const SNAPSHOT_FORMAT: u32 = 1;

/// A file this peer initiated a backup for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRecord {
    pub path: PathBuf,
    pub name: String,
    pub file_id: FileId,
    pub chunk_count: u32,
    pub replication_degree: u8,
    pub backed_up_at_ms: i64,
}

/// What this peer knows about one chunk. `local_size` is `None` for chunks
/// known to exist in the system but not stored here.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkRecord {
    pub desired_degree: u8,
    pub perceived: BTreeSet<PeerId>,
    pub local_size: Option<u64>,
}

impl ChunkRecord {
    pub fn perceived_degree(&self) -> usize {
        self.perceived.len()
    }

    pub fn is_local(&self) -> bool {
        self.local_size.is_some()
    }

    pub fn surplus(&self) -> isize {
        self.perceived.len() as isize - isize::from(self.desired_degree)
    }
}

#[derive(Serialize, Deserialize)]
struct Snapshot {
    format: u32,
    files: Vec<FileRecord>,
    chunks: Vec<(ChunkKey, ChunkRecord)>,
    pending_deletes: Vec<(PeerId, Vec<FileId>)>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BackedUpFile {
    pub path: PathBuf,
    pub name: String,
    pub file_id: String,
    pub desired_degree: u8,
    pub perceived_degrees: Vec<usize>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StoredChunk {
    pub file_id: String,
    pub chunk_no: u32,
    pub size_bytes: u64,
    pub desired_degree: u8,
    pub perceived_degree: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct PeerReport {
    pub peer_id: PeerId,
    pub backed_up: Vec<BackedUpFile>,
    pub stored: Vec<StoredChunk>,
    pub used_bytes: u64,
    pub capacity_bytes: Option<u64>,
    pub pending_deletes: Vec<(PeerId, Vec<String>)>,
}

/// Replication knowledge of one peer. Every mutation is a per-key atomic
/// insert-or-update; unrelated keys never contend on a shared lock.
pub struct MetadataStore {
    local: PeerId,
    files: DashMap<FileId, FileRecord>,
    chunks: DashMap<ChunkKey, ChunkRecord>,
    pending_deletes: DashMap<PeerId, BTreeSet<FileId>>,
    dirty: AtomicBool,
}

impl MetadataStore {
    pub fn new(local: PeerId) -> Self {
        Self {
            local,
            files: DashMap::new(),
            chunks: DashMap::new(),
            pending_deletes: DashMap::new(),
            dirty: AtomicBool::new(false),
        }
    }

    fn touch(&self) {
        self.dirty.store(true, Ordering::Release);
    }

    /// Another peer asked for `key` to be stored with `desired` replicas.
    pub fn record_putchunk(&self, key: ChunkKey, desired: u8) {
        self.chunks
            .entry(key)
            .and_modify(|rec| rec.desired_degree = desired)
            .or_insert_with(|| ChunkRecord {
                desired_degree: desired,
                ..ChunkRecord::default()
            });
        self.touch();
    }

    /// This peer holds `key` on disk with `size` bytes.
    pub fn record_local(&self, key: ChunkKey, desired: u8, size: u64) {
        let local = self.local;
        self.chunks
            .entry(key)
            .and_modify(|rec| {
                rec.desired_degree = desired;
                rec.local_size = Some(size);
                rec.perceived.insert(local);
            })
            .or_insert_with(|| ChunkRecord {
                desired_degree: desired,
                perceived: BTreeSet::from([local]),
                local_size: Some(size),
            });
        self.touch();
    }

    pub fn record_stored(&self, key: ChunkKey, peer: PeerId) {
        self.chunks.entry(key).or_default().perceived.insert(peer);
        self.touch();
    }

    /// Drops `peer` from the replicas of `key`. Returns the desired degree when
    /// the chunk fell under it and this peer can heal it from its own copy.
    pub fn record_removed(&self, key: ChunkKey, peer: PeerId) -> Option<u8> {
        let mut rec = self.chunks.get_mut(&key)?;
        rec.perceived.remove(&peer);
        self.touch();
        let under = rec.perceived.len() < usize::from(rec.desired_degree);
        (under && rec.is_local()).then_some(rec.desired_degree)
    }

    /// Forgets the local copy of `key`, returning its size.
    pub fn clear_local(&self, key: &ChunkKey) -> Option<u64> {
        let mut rec = self.chunks.get_mut(key)?;
        rec.perceived.remove(&self.local);
        let freed = rec.local_size.take();
        self.touch();
        freed
    }

    pub fn record_delete(&self, file_id: &FileId) {
        self.files.remove(file_id);
        self.chunks.retain(|key, _| key.file_id != *file_id);
        self.touch();
    }

    /// Inserts or replaces the record for `record.file_id`. Returns the records
    /// of older versions of the same path, which are removed.
    pub fn upsert_file(&self, record: FileRecord) -> Vec<FileRecord> {
        let superseded: Vec<FileId> = self
            .files
            .iter()
            .filter(|e| e.path == record.path && e.file_id != record.file_id)
            .map(|e| e.file_id)
            .collect();
        let removed = superseded
            .iter()
            .filter_map(|id| self.files.remove(id).map(|(_, rec)| rec))
            .collect();
        self.files.insert(record.file_id, record);
        self.touch();
        removed
    }

    pub fn file(&self, file_id: &FileId) -> Option<FileRecord> {
        self.files.get(file_id).map(|r| r.clone())
    }

    pub fn file_by_path(&self, path: &Path) -> Option<FileRecord> {
        self.files
            .iter()
            .filter(|r| r.path == path)
            .max_by_key(|r| r.backed_up_at_ms)
            .map(|r| r.clone())
    }

    pub fn file_by_name(&self, name: &str) -> Option<FileRecord> {
        self.files
            .iter()
            .filter(|r| r.name == name)
            .max_by_key(|r| r.backed_up_at_ms)
            .map(|r| r.clone())
    }

    pub fn chunk(&self, key: &ChunkKey) -> Option<ChunkRecord> {
        self.chunks.get(key).map(|r| r.clone())
    }

    pub fn perceived_degree(&self, key: &ChunkKey) -> usize {
        self.chunks.get(key).map(|r| r.perceived.len()).unwrap_or(0)
    }

    pub fn is_local(&self, key: &ChunkKey) -> bool {
        self.chunks.get(key).map(|r| r.is_local()).unwrap_or(false)
    }

    pub fn local_chunks(&self) -> Vec<(ChunkKey, ChunkRecord)> {
        self.chunks
            .iter()
            .filter(|e| e.is_local())
            .map(|e| (*e.key(), e.value().clone()))
            .collect()
    }

    pub fn used_bytes(&self) -> u64 {
        self.chunks.iter().filter_map(|e| e.local_size).sum()
    }

    /// Peers other than this one believed to hold any chunk of `file_id`.
    pub fn holders(&self, file_id: &FileId) -> BTreeSet<PeerId> {
        self.chunks
            .iter()
            .filter(|e| e.key().file_id == *file_id)
            .flat_map(|e| e.perceived.iter().copied().collect::<Vec<_>>())
            .filter(|peer| *peer != self.local)
            .collect()
    }

    pub fn add_pending_delete(&self, peer: PeerId, file_id: FileId) {
        self.pending_deletes.entry(peer).or_default().insert(file_id);
        self.touch();
    }

    pub fn clear_pending_delete(&self, peer: PeerId, file_id: &FileId) -> bool {
        let removed = match self.pending_deletes.get_mut(&peer) {
            Some(mut files) => files.remove(file_id),
            None => false,
        };
        if removed {
            self.pending_deletes.remove_if(&peer, |_, files| files.is_empty());
            self.touch();
        }
        removed
    }

    pub fn pending_deletes_for(&self, peer: PeerId) -> Vec<FileId> {
        self.pending_deletes
            .get(&peer)
            .map(|files| files.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Aligns local-copy knowledge with the chunk files actually on disk.
    pub fn reconcile(&self, on_disk: &[(ChunkKey, u64)]) {
        let present: HashSet<ChunkKey> = on_disk.iter().map(|(key, _)| *key).collect();
        for (key, size) in on_disk {
            let desired = self.chunk(key).map(|r| r.desired_degree).unwrap_or(1).max(1);
            if !self.is_local(key) {
                self.record_local(*key, desired, *size);
            }
        }
        let stale: Vec<ChunkKey> = self
            .chunks
            .iter()
            .filter(|e| e.is_local() && !present.contains(e.key()))
            .map(|e| *e.key())
            .collect();
        for key in stale {
            warn!(chunk = %key, "chunk file missing on disk, dropping local copy");
            self.clear_local(&key);
        }
    }

    pub fn report(&self, capacity_bytes: Option<u64>) -> PeerReport {
        let mut backed_up: Vec<BackedUpFile> = self
            .files
            .iter()
            .map(|f| BackedUpFile {
                path: f.path.clone(),
                name: f.name.clone(),
                file_id: f.file_id.to_hex(),
                desired_degree: f.replication_degree,
                perceived_degrees: (0..f.chunk_count)
                    .map(|n| self.perceived_degree(&ChunkKey::new(f.file_id, n)))
                    .collect(),
            })
            .collect();
        backed_up.sort_by(|a, b| a.path.cmp(&b.path));

        let mut stored: Vec<StoredChunk> = self
            .local_chunks()
            .into_iter()
            .map(|(key, rec)| StoredChunk {
                file_id: key.file_id.to_hex(),
                chunk_no: key.chunk_no,
                size_bytes: rec.local_size.unwrap_or(0),
                desired_degree: rec.desired_degree,
                perceived_degree: rec.perceived_degree(),
            })
            .collect();
        stored.sort_by(|a, b| (&a.file_id, a.chunk_no).cmp(&(&b.file_id, b.chunk_no)));

        let mut pending_deletes: Vec<(PeerId, Vec<String>)> = self
            .pending_deletes
            .iter()
            .map(|e| (*e.key(), e.iter().map(FileId::to_hex).collect()))
            .collect();
        pending_deletes.sort();

        PeerReport {
            peer_id: self.local,
            backed_up,
            stored,
            used_bytes: self.used_bytes(),
            capacity_bytes,
            pending_deletes,
        }
    }

    fn take_dirty(&self) -> bool {
        self.dirty.swap(false, Ordering::AcqRel)
    }

    /// Writes a snapshot when anything changed since the last successful
    /// write. Returns whether one was written; a failed write leaves the
    /// store dirty so the next call retries.
    pub async fn persist_if_dirty(&self, path: &Path) -> io::Result<bool> {
        if !self.take_dirty() {
            return Ok(false);
        }
        match self.persist(path).await {
            Ok(()) => Ok(true),
            Err(e) => {
                self.touch();
                Err(e)
            }
        }
    }

    pub fn to_snapshot(&self) -> Result<Vec<u8>, bincode::Error> {
        let snapshot = Snapshot {
            format: SNAPSHOT_FORMAT,
            files: self.files.iter().map(|e| e.value().clone()).collect(),
            chunks: self
                .chunks
                .iter()
                .map(|e| (*e.key(), e.value().clone()))
                .collect(),
            pending_deletes: self
                .pending_deletes
                .iter()
                .map(|e| (*e.key(), e.iter().copied().collect()))
                .collect(),
        };
        bincode::serialize(&snapshot)
    }

    pub fn from_snapshot(local: PeerId, bytes: &[u8]) -> Result<Self, bincode::Error> {
        let snapshot: Snapshot = bincode::deserialize(bytes)?;
        if snapshot.format != SNAPSHOT_FORMAT {
            return Err(Box::new(bincode::ErrorKind::Custom(format!(
                "unsupported snapshot format {}",
                snapshot.format
            ))));
        }
        let store = Self::new(local);
        for file in snapshot.files {
            store.files.insert(file.file_id, file);
        }
        for (key, rec) in snapshot.chunks {
            store.chunks.insert(key, rec);
        }
        for (peer, files) in snapshot.pending_deletes {
            store.pending_deletes.insert(peer, files.into_iter().collect());
        }
        Ok(store)
    }

    /// Writes the snapshot next to `path` and renames it into place.
    pub async fn persist(&self, path: &Path) -> io::Result<()> {
        let bytes = self
            .to_snapshot()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = path.with_extension("tmp");
        tokio::fs::write(&tmp, bytes).await?;
        tokio::fs::rename(&tmp, path).await
    }

    /// Loads the snapshot at `path`. A missing or unreadable snapshot yields an
    /// empty store.
    pub async fn load(local: PeerId, path: &Path) -> Self {
        let bytes = match tokio::fs::read(path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Self::new(local),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "metadata snapshot unreadable, starting empty");
                return Self::new(local);
            }
        };
        match Self::from_snapshot(local, &bytes) {
            Ok(store) => {
                info!(
                    path = %path.display(),
                    files = store.files.len(),
                    chunks = store.chunks.len(),
                    "metadata snapshot loaded"
                );
                store
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "metadata snapshot corrupt, starting empty");
                Self::new(local)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn key(n: u32) -> ChunkKey {
        ChunkKey::new(FileId::derive("meta.bin", 42), n)
    }

    #[test]
    fn duplicate_stored_counts_once_per_peer() {
        let meta = MetadataStore::new(PeerId(1));
        meta.record_putchunk(key(0), 2);
        for _ in 0..5 {
            meta.record_stored(key(0), PeerId(2));
        }
        meta.record_stored(key(0), PeerId(3));
        assert_eq!(meta.perceived_degree(&key(0)), 2);
    }

    #[test]
    fn removed_signals_heal_only_for_local_under_replicated_chunks() {
        let meta = MetadataStore::new(PeerId(1));
        meta.record_local(key(0), 2, 100);
        meta.record_stored(key(0), PeerId(2));
        meta.record_stored(key(0), PeerId(3));

        assert_eq!(meta.record_removed(key(0), PeerId(3)), None);
        assert_eq!(meta.record_removed(key(0), PeerId(2)), Some(2));

        meta.record_putchunk(key(1), 2);
        meta.record_stored(key(1), PeerId(2));
        assert_eq!(meta.record_removed(key(1), PeerId(2)), None, "not stored locally");
        assert_eq!(meta.record_removed(key(7), PeerId(2)), None, "unknown chunk");
    }

    #[test]
    fn concurrent_writes_never_mix_fields() {
        let meta = Arc::new(MetadataStore::new(PeerId(1)));
        let writers: Vec<_> = [(2u8, 200u64), (5u8, 500u64)]
            .into_iter()
            .map(|(deg, size)| {
                let meta = meta.clone();
                std::thread::spawn(move || {
                    for _ in 0..1_000 {
                        meta.record_local(key(0), deg, size);
                    }
                })
            })
            .collect();
        for writer in writers {
            writer.join().unwrap();
        }
        let rec = meta.chunk(&key(0)).unwrap();
        assert!(
            matches!((rec.desired_degree, rec.local_size), (2, Some(200)) | (5, Some(500))),
            "mixed record {rec:?}"
        );
        assert_eq!(rec.perceived_degree(), 1);
    }

    #[test]
    fn delete_forgets_file_and_chunks() {
        let meta = MetadataStore::new(PeerId(1));
        let file_id = key(0).file_id;
        meta.upsert_file(FileRecord {
            path: PathBuf::from("/data/meta.bin"),
            name: "meta.bin".into(),
            file_id,
            chunk_count: 2,
            replication_degree: 1,
            backed_up_at_ms: 0,
        });
        meta.record_stored(key(0), PeerId(2));
        meta.record_stored(key(1), PeerId(3));
        let other = ChunkKey::new(FileId::derive("other", 1), 0);
        meta.record_stored(other, PeerId(2));

        assert_eq!(meta.holders(&file_id), BTreeSet::from([PeerId(2), PeerId(3)]));
        meta.record_delete(&file_id);
        assert!(meta.file(&file_id).is_none());
        assert!(meta.chunk(&key(0)).is_none());
        assert!(meta.chunk(&other).is_some());
    }

    #[test]
    fn upsert_returns_superseded_versions_of_a_path() {
        let meta = MetadataStore::new(PeerId(1));
        let record = |modified: i64| FileRecord {
            path: PathBuf::from("/data/doc.txt"),
            name: "doc.txt".into(),
            file_id: FileId::derive("doc.txt", modified),
            chunk_count: 1,
            replication_degree: 1,
            backed_up_at_ms: modified,
        };
        assert!(meta.upsert_file(record(1)).is_empty());
        assert!(meta.upsert_file(record(1)).is_empty());
        let superseded = meta.upsert_file(record(2));
        assert_eq!(superseded, vec![record(1)]);
        assert_eq!(meta.file_by_name("doc.txt").unwrap(), record(2));
    }

    #[test]
    fn used_bytes_counts_only_local_chunks() {
        let meta = MetadataStore::new(PeerId(1));
        meta.record_local(key(0), 1, 64_000);
        meta.record_local(key(1), 1, 8_000);
        meta.record_putchunk(key(2), 1);
        assert_eq!(meta.used_bytes(), 72_000);
        assert_eq!(meta.clear_local(&key(0)), Some(64_000));
        assert_eq!(meta.used_bytes(), 8_000);
    }

    #[test]
    fn pending_deletes_clear_per_peer() {
        let meta = MetadataStore::new(PeerId(1));
        let file_id = key(0).file_id;
        meta.add_pending_delete(PeerId(4), file_id);
        assert_eq!(meta.pending_deletes_for(PeerId(4)), vec![file_id]);
        assert!(meta.clear_pending_delete(PeerId(4), &file_id));
        assert!(!meta.clear_pending_delete(PeerId(4), &file_id));
        assert!(meta.pending_deletes_for(PeerId(4)).is_empty());
    }

    #[tokio::test]
    async fn snapshot_survives_restart_and_corruption_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("metadata.bin");
        let meta = MetadataStore::new(PeerId(1));
        meta.record_local(key(0), 3, 10);
        meta.record_stored(key(0), PeerId(2));
        meta.add_pending_delete(PeerId(9), key(0).file_id);
        meta.persist(&path).await.unwrap();

        let loaded = MetadataStore::load(PeerId(1), &path).await;
        assert_eq!(loaded.chunk(&key(0)), meta.chunk(&key(0)));
        assert_eq!(loaded.pending_deletes_for(PeerId(9)), vec![key(0).file_id]);

        std::fs::write(&path, b"garbage").unwrap();
        let empty = MetadataStore::load(PeerId(1), &path).await;
        assert!(empty.chunk(&key(0)).is_none());
    }

    #[tokio::test]
    async fn failed_persist_is_retried_on_the_next_pass() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("not-a-dir");
        std::fs::write(&blocker, b"file").unwrap();
        let meta = MetadataStore::new(PeerId(1));
        meta.record_local(key(0), 2, 10);

        assert!(meta.persist_if_dirty(&blocker.join("metadata.bin")).await.is_err());

        let path = dir.path().join("metadata.bin");
        assert!(meta.persist_if_dirty(&path).await.unwrap(), "change still pending after failure");
        assert!(!meta.persist_if_dirty(&path).await.unwrap());
        let loaded = MetadataStore::load(PeerId(1), &path).await;
        assert_eq!(loaded.chunk(&key(0)), meta.chunk(&key(0)));
    }

    #[test]
    fn reconcile_follows_disk() {
        let meta = MetadataStore::new(PeerId(1));
        meta.record_local(key(0), 2, 10);
        meta.reconcile(&[(key(1), 20)]);
        assert!(!meta.is_local(&key(0)));
        assert_eq!(meta.chunk(&key(1)).unwrap().local_size, Some(20));
    }
}
