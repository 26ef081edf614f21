use peerback_protocol::{ChunkCipher, ChunkKey, FileId};
use std::io;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, warn};

const CHUNKS_DIR: &str = "chunks";
const RESTORED_DIR: &str = "restored";
// 96-bit nonce plus 128-bit tag added by sealing.
const SEAL_OVERHEAD: u64 = 12 + 16;

/// Chunk files of one peer, encrypted at rest, laid out as
/// `{root}/chunks/{contentID}/{chunkIndex}`.
pub struct ChunkStore {
    root: PathBuf,
    cipher: ChunkCipher,
}

impl ChunkStore {
    pub fn new(root: impl Into<PathBuf>, cipher: ChunkCipher) -> Self {
        Self {
            root: root.into(),
            cipher,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn chunk_path(&self, key: &ChunkKey) -> PathBuf {
        self.root
            .join(CHUNKS_DIR)
            .join(key.file_id.to_hex())
            .join(key.chunk_no.to_string())
    }

    pub fn restored_path(&self, file_name: &str) -> PathBuf {
        let stamp = chrono::Local::now().format("%Y-%m-%d %H-%M-%S");
        self.root.join(RESTORED_DIR).join(format!("{stamp} - {file_name}"))
    }

    pub async fn contains(&self, key: &ChunkKey) -> bool {
        fs::try_exists(self.chunk_path(key)).await.unwrap_or(false)
    }

    /// Writes a chunk unless it is already present. Returns whether a new file
    /// was written.
    pub async fn save_chunk(&self, key: &ChunkKey, data: &[u8]) -> io::Result<bool> {
        let path = self.chunk_path(key);
        if fs::try_exists(&path).await? {
            return Ok(false);
        }
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let sealed = self
            .cipher
            .seal(data)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        // Concurrent writers of one chunk each get their own temp file; the
        // rename is atomic so readers see one complete copy.
        let tmp = path.with_extension(format!("{:016x}.part", rand::random::<u64>()));
        if let Err(e) = fs::write(&tmp, sealed).await {
            let _ = fs::remove_file(&tmp).await;
            return Err(e);
        }
        fs::rename(&tmp, &path).await?;
        debug!(chunk = %key, bytes = data.len(), "chunk written");
        Ok(true)
    }

    pub async fn retrieve_chunk(&self, key: &ChunkKey) -> io::Result<Option<Vec<u8>>> {
        let sealed = match fs::read(self.chunk_path(key)).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e),
        };
        let plain = self
            .cipher
            .open(&sealed)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        Ok(Some(plain))
    }

    pub async fn delete_chunk(&self, key: &ChunkKey) -> io::Result<bool> {
        match fs::remove_file(self.chunk_path(key)).await {
            Ok(()) => {
                let dir = self.root.join(CHUNKS_DIR).join(key.file_id.to_hex());
                // Only succeeds once the directory is empty.
                let _ = fs::remove_dir(dir).await;
                Ok(true)
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Removes every chunk file of `file_id`. Returns the number removed.
    pub async fn delete_file(&self, file_id: &FileId) -> io::Result<usize> {
        let dir = self.root.join(CHUNKS_DIR).join(file_id.to_hex());
        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e),
        };
        let mut removed = 0;
        while let Some(entry) = entries.next_entry().await? {
            fs::remove_file(entry.path()).await?;
            removed += 1;
        }
        fs::remove_dir(&dir).await?;
        Ok(removed)
    }

    /// Lists every chunk on disk with its plaintext size.
    pub async fn scan(&self) -> io::Result<Vec<(ChunkKey, u64)>> {
        let mut found = Vec::new();
        let mut files = match fs::read_dir(self.root.join(CHUNKS_DIR)).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(found),
            Err(e) => return Err(e),
        };
        while let Some(file_dir) = files.next_entry().await? {
            let Ok(file_id) = file_dir.file_name().to_string_lossy().parse::<FileId>() else {
                warn!(path = %file_dir.path().display(), "ignoring foreign directory in chunk store");
                continue;
            };
            let mut chunks = fs::read_dir(file_dir.path()).await?;
            while let Some(chunk) = chunks.next_entry().await? {
                let Ok(chunk_no) = chunk.file_name().to_string_lossy().parse::<u32>() else {
                    continue;
                };
                let len = chunk.metadata().await?.len();
                found.push((ChunkKey::new(file_id, chunk_no), len.saturating_sub(SEAL_OVERHEAD)));
            }
        }
        Ok(found)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use peerback_protocol::{SharedSecretKeys, STORAGE_KEY_ALIAS};

    fn store(dir: &Path) -> ChunkStore {
        let cipher =
            ChunkCipher::from_provider(&SharedSecretKeys::new("store-test"), STORAGE_KEY_ALIAS)
                .unwrap();
        ChunkStore::new(dir, cipher)
    }

    #[tokio::test]
    async fn chunks_are_written_once_and_read_back() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        let key = ChunkKey::new(FileId::derive("a.txt", 1), 0);

        assert!(store.save_chunk(&key, b"first").await.unwrap());
        assert!(!store.save_chunk(&key, b"second").await.unwrap());
        assert_eq!(store.retrieve_chunk(&key).await.unwrap().unwrap(), b"first");

        let on_disk = std::fs::read(store.chunk_path(&key)).unwrap();
        assert_ne!(on_disk, b"first", "chunk must be sealed at rest");
    }

    #[tokio::test]
    async fn delete_file_removes_every_chunk() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        let file_id = FileId::derive("b.bin", 2);
        for n in 0..3 {
            store.save_chunk(&ChunkKey::new(file_id, n), &[n as u8; 10]).await.unwrap();
        }
        let other = ChunkKey::new(FileId::derive("c.bin", 3), 0);
        store.save_chunk(&other, b"keep").await.unwrap();

        assert_eq!(store.delete_file(&file_id).await.unwrap(), 3);
        assert_eq!(store.delete_file(&file_id).await.unwrap(), 0);
        let left = store.scan().await.unwrap();
        assert_eq!(left, vec![(other, 4)]);
    }

    #[tokio::test]
    async fn missing_chunk_reads_as_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        let key = ChunkKey::new(FileId::derive("d", 4), 9);
        assert!(store.retrieve_chunk(&key).await.unwrap().is_none());
        assert!(!store.delete_chunk(&key).await.unwrap());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_writers_of_one_chunk_leave_a_readable_copy() {
        let dir = tempfile::tempdir().unwrap();
        let store = std::sync::Arc::new(store(dir.path()));
        let key = ChunkKey::new(FileId::derive("dup.bin", 5), 0);
        let bodies: Vec<Vec<u8>> = (0..8u8).map(|n| vec![n; 64_000]).collect();

        let writers: Vec<_> = bodies
            .iter()
            .cloned()
            .map(|body| {
                let store = store.clone();
                tokio::spawn(async move { store.save_chunk(&key, &body).await })
            })
            .collect();
        for writer in writers {
            writer.await.unwrap().unwrap();
        }

        let read = store.retrieve_chunk(&key).await.unwrap().expect("chunk present");
        assert!(bodies.contains(&read), "stored copy is one complete body");
        let names: Vec<_> = std::fs::read_dir(store.chunk_path(&key).parent().unwrap())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["0".to_string()], "no temp files left behind");
        assert_eq!(store.scan().await.unwrap(), vec![(key, 64_000)]);
    }
}
