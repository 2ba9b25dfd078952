use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use bytes::Bytes;
use rustc_hash::FxHashMap;

use crate::cache_error::{CacheError, CacheResult};
use crate::types::{Priority, ResponseInfo};

use super::{
    Backend, BackendPoll, CompletionMode, DiskEntry, DoomCallback, EntryCallback, OpenedEntry,
};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Counters of the operations a [`MemoryBackend`] has served.
#[derive(Debug, Default)]
pub struct BackendStats {
    opens: AtomicUsize,
    creates: AtomicUsize,
    dooms: AtomicUsize,
    closes: AtomicUsize,
    external_hits: AtomicUsize,
}

/// A point-in-time copy of [`BackendStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BackendStatsSnapshot {
    /// Calls to `open_entry`, and `open_or_create_entry` calls that found an entry.
    pub opens: usize,
    /// Calls to `create_entry`, and `open_or_create_entry` calls that created one.
    pub creates: usize,
    /// Calls to `doom_entry`.
    pub dooms: usize,
    /// Entry handles closed.
    pub closes: usize,
    pub external_hits: usize,
}

impl BackendStats {
    pub fn snapshot(&self) -> BackendStatsSnapshot {
        BackendStatsSnapshot {
            opens: self.opens.load(Ordering::Relaxed),
            creates: self.creates.load(Ordering::Relaxed),
            dooms: self.dooms.load(Ordering::Relaxed),
            closes: self.closes.load(Ordering::Relaxed),
            external_hits: self.external_hits.load(Ordering::Relaxed),
        }
    }

    fn bump(counter: &AtomicUsize) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

#[derive(Debug, Default)]
struct StoredEntry {
    response_info: Option<ResponseInfo>,
    metadata: Option<Bytes>,
}

type Store = Arc<Mutex<FxHashMap<String, Arc<Mutex<StoredEntry>>>>>;

/// A backend that keeps all entries in memory.
///
/// Dooming an entry removes it from the index right away. Handles that are still open keep
/// working against the detached data until they are closed.
#[derive(Debug)]
pub struct MemoryBackend {
    store: Store,
    stats: Arc<BackendStats>,
    completion: CompletionMode,
    max_bytes: u64,
}

impl MemoryBackend {
    pub fn new(max_bytes: u64, completion: CompletionMode) -> Self {
        Self {
            store: Default::default(),
            stats: Default::default(),
            completion,
            max_bytes,
        }
    }

    /// A shared handle to this backend's operation counters.
    pub fn stats(&self) -> Arc<BackendStats> {
        Arc::clone(&self.stats)
    }

    fn entry(&self, key: &str, data: Arc<Mutex<StoredEntry>>, opened: bool) -> OpenedEntry {
        OpenedEntry {
            entry: Box::new(MemoryEntry {
                key: key.to_owned(),
                data,
                store: Arc::clone(&self.store),
                stats: Arc::clone(&self.stats),
                doomed: false,
            }),
            opened,
        }
    }

    fn open(&self, key: &str) -> CacheResult<OpenedEntry> {
        BackendStats::bump(&self.stats.opens);
        let data = lock(&self.store).get(key).cloned();
        match data {
            Some(data) => Ok(self.entry(key, data, true)),
            None => Err(CacheError::NotFound),
        }
    }

    fn create(&self, key: &str) -> CacheResult<OpenedEntry> {
        BackendStats::bump(&self.stats.creates);
        let data = {
            let mut store = lock(&self.store);
            if store.contains_key(key) {
                return Err(CacheError::Failed);
            }
            let data = Arc::new(Mutex::new(StoredEntry::default()));
            store.insert(key.to_owned(), Arc::clone(&data));
            data
        };
        Ok(self.entry(key, data, false))
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new(0, CompletionMode::Sync)
    }
}

impl Backend for MemoryBackend {
    fn open_entry(
        &mut self,
        key: &str,
        _priority: Priority,
        callback: EntryCallback,
    ) -> BackendPoll<OpenedEntry> {
        let result = self.open(key);
        self.completion.finish(callback, result)
    }

    fn create_entry(
        &mut self,
        key: &str,
        _priority: Priority,
        callback: EntryCallback,
    ) -> BackendPoll<OpenedEntry> {
        let result = self.create(key);
        self.completion.finish(callback, result)
    }

    fn open_or_create_entry(
        &mut self,
        key: &str,
        _priority: Priority,
        callback: EntryCallback,
    ) -> BackendPoll<OpenedEntry> {
        let exists = lock(&self.store).contains_key(key);
        let result = if exists {
            self.open(key)
        } else {
            self.create(key)
        };
        self.completion.finish(callback, result)
    }

    fn doom_entry(
        &mut self,
        key: &str,
        _priority: Priority,
        callback: DoomCallback,
    ) -> BackendPoll<()> {
        BackendStats::bump(&self.stats.dooms);
        let result = match lock(&self.store).remove(key) {
            Some(_) => Ok(()),
            None => Err(CacheError::NotFound),
        };
        self.completion.finish(callback, result)
    }

    fn entry_count(&self) -> usize {
        lock(&self.store).len()
    }

    fn max_file_size(&self) -> u64 {
        self.max_bytes / 8
    }

    fn on_external_cache_hit(&mut self, _key: &str) {
        BackendStats::bump(&self.stats.external_hits);
    }
}

struct MemoryEntry {
    key: String,
    data: Arc<Mutex<StoredEntry>>,
    store: Store,
    stats: Arc<BackendStats>,
    doomed: bool,
}

impl DiskEntry for MemoryEntry {
    fn key(&self) -> &str {
        &self.key
    }

    fn doom(&mut self) {
        if std::mem::replace(&mut self.doomed, true) {
            return;
        }
        let mut store = lock(&self.store);
        // only remove the index entry if it still refers to our data
        if store
            .get(&self.key)
            .is_some_and(|data| Arc::ptr_eq(data, &self.data))
        {
            store.remove(&self.key);
        }
    }

    fn close(self: Box<Self>) {
        BackendStats::bump(&self.stats.closes);
    }

    fn read_response_info(&self) -> CacheResult<Option<ResponseInfo>> {
        Ok(lock(&self.data).response_info.clone())
    }

    fn write_response_info(&mut self, info: &ResponseInfo) -> CacheResult<()> {
        lock(&self.data).response_info = Some(info.clone());
        Ok(())
    }

    fn read_metadata(&self) -> CacheResult<Option<Bytes>> {
        Ok(lock(&self.data).metadata.clone())
    }

    fn write_metadata(&mut self, data: &[u8]) -> CacheResult<()> {
        lock(&self.data).metadata = Some(Bytes::copy_from_slice(data));
        Ok(())
    }
}
