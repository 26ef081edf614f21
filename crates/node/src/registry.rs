use crate::metadata::FileRecord;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use peerback_protocol::{ChunkKey, FileId, PeerId};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::ops::Range;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationKind {
    Backup,
    Restore,
    Delete,
    Retrieve,
}

/// Registry key of a running operation. `extra` tells apart instances of the
/// same operation on one file, such as single-chunk self-heals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InstanceKey {
    pub peer: PeerId,
    pub file_id: FileId,
    pub kind: OperationKind,
    pub extra: Option<u32>,
}

impl InstanceKey {
    pub fn new(peer: PeerId, file_id: FileId, kind: OperationKind) -> Self {
        Self {
            peer,
            file_id,
            kind,
            extra: None,
        }
    }

    pub fn with_extra(mut self, extra: u32) -> Self {
        self.extra = Some(extra);
        self
    }
}

#[derive(Debug, Default)]
struct RestoreWindow {
    range: Range<u32>,
    chunks: BTreeMap<u32, Vec<u8>>,
}

/// Transient state of one running operation. Only the operation that
/// registered it drives it; the dispatcher feeds responses in.
#[derive(Debug)]
pub struct ProtocolInstance {
    key: InstanceKey,
    responses: Mutex<HashMap<u32, HashSet<PeerId>>>,
    window: Mutex<RestoreWindow>,
    lookup: Mutex<Option<FileRecord>>,
    multicast_chunks: AtomicBool,
    completed: AtomicBool,
    notify: Notify,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl ProtocolInstance {
    fn new(key: InstanceKey) -> Self {
        Self {
            key,
            responses: Mutex::new(HashMap::new()),
            window: Mutex::new(RestoreWindow::default()),
            lookup: Mutex::new(None),
            multicast_chunks: AtomicBool::new(true),
            completed: AtomicBool::new(false),
            notify: Notify::new(),
        }
    }

    /// Creates one empty response set per index.
    pub fn expect_responses(&self, indices: impl IntoIterator<Item = u32>) {
        let mut responses = lock(&self.responses);
        for n in indices {
            responses.entry(n).or_default();
        }
    }

    /// Adds `peer` to the responders of `index`, returning the new count.
    pub fn record_response(&self, index: u32, peer: PeerId) -> usize {
        let count = {
            let mut responses = lock(&self.responses);
            let set = responses.entry(index).or_default();
            set.insert(peer);
            set.len()
        };
        self.notify.notify_waiters();
        count
    }

    pub fn response_count(&self, index: u32) -> usize {
        lock(&self.responses).get(&index).map(HashSet::len).unwrap_or(0)
    }

    pub fn responders(&self, index: u32) -> HashSet<PeerId> {
        lock(&self.responses).get(&index).cloned().unwrap_or_default()
    }

    /// Waits until `index` has at least `target` responders or `timeout`
    /// elapses. Returns whether the target was met.
    pub async fn wait_for_responses(&self, index: u32, target: usize, timeout: Duration) -> bool {
        self.wait_until(timeout, || self.response_count(index) >= target).await
    }

    /// Waits until every peer in `expected` has responded on `index`.
    pub async fn wait_for_responders(&self, index: u32, expected: &BTreeSet<PeerId>, timeout: Duration) -> bool {
        self.wait_until(timeout, || {
            let responses = lock(&self.responses);
            let all_in = match responses.get(&index) {
                Some(got) => expected.is_subset(&got.iter().copied().collect()),
                None => expected.is_empty(),
            };
            all_in
        })
        .await
    }

    pub fn set_multicast_chunks(&self, accept: bool) {
        self.multicast_chunks.store(accept, Ordering::Release);
    }

    /// Whether CHUNK payloads arriving over multicast feed this restore.
    pub fn accepts_multicast_chunks(&self) -> bool {
        self.multicast_chunks.load(Ordering::Acquire)
    }

    /// Starts collecting the chunks in `range`, dropping anything held from an
    /// earlier window.
    pub fn open_window(&self, range: Range<u32>) {
        let mut window = lock(&self.window);
        window.chunks.clear();
        window.range = range;
    }

    /// Keeps `data` if `index` belongs to the open window and is not held yet.
    pub fn offer_chunk(&self, index: u32, data: Vec<u8>) -> bool {
        let accepted = {
            let mut window = lock(&self.window);
            if !window.range.contains(&index) || window.chunks.contains_key(&index) {
                false
            } else {
                window.chunks.insert(index, data);
                true
            }
        };
        if accepted {
            self.notify.notify_waiters();
        }
        accepted
    }

    pub fn missing_chunks(&self) -> Vec<u32> {
        let window = lock(&self.window);
        window
            .range
            .clone()
            .filter(|n| !window.chunks.contains_key(n))
            .collect()
    }

    pub async fn wait_for_window(&self, timeout: Duration) -> bool {
        self.wait_until(timeout, || self.missing_chunks().is_empty()).await
    }

    pub fn take_window(&self) -> BTreeMap<u32, Vec<u8>> {
        std::mem::take(&mut lock(&self.window).chunks)
    }

    pub fn offer_file_record(&self, record: FileRecord) {
        lock(&self.lookup).get_or_insert(record);
        self.notify.notify_waiters();
    }

    pub async fn wait_for_file_record(&self, timeout: Duration) -> Option<FileRecord> {
        self.wait_until(timeout, || lock(&self.lookup).is_some()).await;
        lock(&self.lookup).clone()
    }

    pub fn complete(&self) {
        self.completed.store(true, Ordering::Release);
        self.notify.notify_waiters();
    }

    pub fn is_completed(&self) -> bool {
        self.completed.load(Ordering::Acquire)
    }

    async fn wait_until(&self, timeout: Duration, mut ready: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            if ready() {
                return true;
            }
            if self.is_completed() {
                return false;
            }
            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep_until(deadline) => return ready(),
            }
        }
    }
}

/// Running operations of this peer, keyed by [`InstanceKey`].
#[derive(Default)]
pub struct InstanceRegistry {
    instances: DashMap<InstanceKey, Arc<ProtocolInstance>>,
}

impl InstanceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a fresh instance under `key`. An instance already registered
    /// under the same key is superseded and completed.
    pub fn register(&self, key: InstanceKey) -> RegisteredInstance<'_> {
        let instance = Arc::new(ProtocolInstance::new(key));
        match self.instances.entry(key) {
            Entry::Occupied(mut occupied) => {
                let previous = occupied.insert(instance.clone());
                previous.complete();
            }
            Entry::Vacant(vacant) => {
                vacant.insert(instance.clone());
            }
        }
        RegisteredInstance {
            registry: self,
            instance,
        }
    }

    pub fn get(&self, key: &InstanceKey) -> Option<Arc<ProtocolInstance>> {
        self.instances.get(key).map(|e| e.value().clone())
    }

    pub fn len(&self) -> usize {
        self.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    fn remove(&self, instance: &Arc<ProtocolInstance>) {
        self.instances
            .remove_if(&instance.key, |_, current| Arc::ptr_eq(current, instance));
    }
}

/// Keeps an instance registered for as long as the guard lives.
pub struct RegisteredInstance<'a> {
    registry: &'a InstanceRegistry,
    instance: Arc<ProtocolInstance>,
}

impl RegisteredInstance<'_> {
    /// Handle for tasks that outlive the borrow of the registry. The instance
    /// still deregisters when this guard drops.
    pub fn shared(&self) -> Arc<ProtocolInstance> {
        self.instance.clone()
    }
}

impl std::ops::Deref for RegisteredInstance<'_> {
    type Target = ProtocolInstance;

    fn deref(&self) -> &ProtocolInstance {
        &self.instance
    }
}

impl Drop for RegisteredInstance<'_> {
    fn drop(&mut self) {
        self.instance.complete();
        self.registry.remove(&self.instance);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReplyKind {
    Chunk,
    PutChunk,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DedupeKey {
    pub peer: PeerId,
    pub chunk: ChunkKey,
    pub kind: ReplyKind,
}

/// Scheduled replies that another peer's equivalent reply may cancel.
#[derive(Default)]
pub struct DedupeRegistry {
    // value: whether an equivalent reply from elsewhere was observed
    pending: DashMap<DedupeKey, bool>,
}

impl DedupeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claims `key`. Returns false when a reply for it is already scheduled.
    pub fn claim(&self, key: DedupeKey) -> bool {
        match self.pending.entry(key) {
            Entry::Occupied(_) => false,
            Entry::Vacant(vacant) => {
                vacant.insert(false);
                true
            }
        }
    }

    /// Records that someone else already sent the reply for `key`.
    pub fn suppress(&self, key: &DedupeKey) -> bool {
        match self.pending.get_mut(key) {
            Some(mut observed) => {
                *observed = true;
                true
            }
            None => false,
        }
    }

    /// Releases `key`. Returns true when the reply should still be sent.
    pub fn release(&self, key: &DedupeKey) -> bool {
        matches!(self.pending.remove(key), Some((_, false)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(kind: OperationKind) -> InstanceKey {
        InstanceKey::new(PeerId(1), FileId::derive("reg", 1), kind)
    }

    #[test]
    fn guard_removes_its_instance_only() {
        let registry = InstanceRegistry::new();
        let first = registry.register(key(OperationKind::Backup));
        let second = registry.register(key(OperationKind::Backup));
        assert!(first.is_completed(), "superseded instance is completed");
        drop(first);
        assert!(registry.get(&key(OperationKind::Backup)).is_some());
        drop(second);
        assert!(registry.is_empty());
    }

    #[test]
    fn duplicate_responses_count_once() {
        let registry = InstanceRegistry::new();
        let inst = registry.register(key(OperationKind::Backup));
        inst.expect_responses(0..3);
        assert_eq!(inst.record_response(1, PeerId(2)), 1);
        assert_eq!(inst.record_response(1, PeerId(2)), 1);
        assert_eq!(inst.record_response(1, PeerId(3)), 2);
        assert_eq!(inst.response_count(0), 0);
    }

    #[tokio::test]
    async fn wait_returns_early_once_target_is_met() {
        let registry = Arc::new(InstanceRegistry::new());
        let k = key(OperationKind::Backup);
        let inst = registry.register(k);
        let feeder = {
            let registry = registry.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                let inst = registry.get(&k).unwrap();
                inst.record_response(0, PeerId(2));
                inst.record_response(0, PeerId(3));
            })
        };
        let started = Instant::now();
        assert!(inst.wait_for_responses(0, 2, Duration::from_secs(10)).await);
        assert!(started.elapsed() < Duration::from_secs(5));
        feeder.await.unwrap();
        assert!(!inst.wait_for_responses(0, 3, Duration::from_millis(30)).await);
    }

    #[tokio::test]
    async fn waits_for_every_expected_responder() {
        let registry = InstanceRegistry::new();
        let inst = registry.register(key(OperationKind::Delete));
        let expected = BTreeSet::from([PeerId(2), PeerId(3)]);
        inst.record_response(0, PeerId(2));
        inst.record_response(0, PeerId(9));
        assert!(!inst.wait_for_responders(0, &expected, Duration::from_millis(20)).await);
        inst.record_response(0, PeerId(3));
        assert!(inst.wait_for_responders(0, &expected, Duration::from_millis(20)).await);
        assert!(inst.wait_for_responders(1, &BTreeSet::new(), Duration::from_millis(1)).await);
    }

    #[test]
    fn window_accepts_only_open_indices() {
        let registry = InstanceRegistry::new();
        let inst = registry.register(key(OperationKind::Restore));
        inst.open_window(5..8);
        assert!(!inst.offer_chunk(4, vec![4]));
        assert!(inst.offer_chunk(5, vec![5]));
        assert!(!inst.offer_chunk(5, vec![0]));
        assert_eq!(inst.missing_chunks(), vec![6, 7]);
        assert_eq!(inst.take_window().get(&5), Some(&vec![5]));
    }

    #[test]
    fn dedupe_claim_suppress_release() {
        let dedupe = DedupeRegistry::new();
        let k = DedupeKey {
            peer: PeerId(1),
            chunk: ChunkKey::new(FileId::derive("d", 1), 0),
            kind: ReplyKind::Chunk,
        };
        assert!(!dedupe.suppress(&k), "nothing scheduled yet");
        assert!(dedupe.claim(k));
        assert!(!dedupe.claim(k));
        assert!(dedupe.release(&k));

        assert!(dedupe.claim(k));
        assert!(dedupe.suppress(&k));
        assert!(!dedupe.release(&k));
    }
}
