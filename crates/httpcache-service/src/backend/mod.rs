//! The abstract disk cache backend consumed by the [`Coordinator`](crate::coordinator::Coordinator).
//!
//! A [`Backend`] opens, creates and dooms entries by key. Every operation either finishes right
//! away with [`BackendPoll::Ready`], or returns [`BackendPoll::Pending`] and later reports its
//! result through the [`OperationCallback`] it was handed. That callback always posts back onto
//! the coordinator's sequence, so backends are free to complete from any thread.
//!
//! Backends are constructed lazily through a [`BackendFactory`]. [`DefaultBackend`] builds either
//! a [`MemoryBackend`] or a [`FileBackend`], depending on configuration.

use std::fmt;

use bytes::Bytes;

use crate::cache_error::CacheResult;
use crate::types::{Priority, ResponseInfo};

mod factory;
mod file;
mod memory;

pub use crate::coordinator::OperationCallback;
pub use factory::*;
pub use file::*;
pub use memory::*;

/// The result of a backend operation that may complete asynchronously.
#[derive(Debug)]
pub enum BackendPoll<T> {
    Ready(CacheResult<T>),
    Pending,
}

impl<T> BackendPoll<T> {
    pub fn is_pending(&self) -> bool {
        matches!(self, BackendPoll::Pending)
    }
}

/// An entry handed out by a successful open or create.
pub struct OpenedEntry {
    pub entry: Box<dyn DiskEntry>,
    /// `true` if an existing entry was opened, `false` if a new one was created.
    pub opened: bool,
}

impl fmt::Debug for OpenedEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpenedEntry")
            .field("key", &self.entry.key())
            .field("opened", &self.opened)
            .finish()
    }
}

pub type EntryCallback = OperationCallback<OpenedEntry>;
pub type DoomCallback = OperationCallback<()>;
pub type BackendCallback = OperationCallback<Box<dyn Backend>>;

/// A physical cache entry, exclusively owned by whoever opened it.
pub trait DiskEntry: Send {
    fn key(&self) -> &str;

    /// Marks the entry for deletion once it is closed.
    fn doom(&mut self);

    /// Releases the entry.
    fn close(self: Box<Self>);

    /// Cancels any outstanding sparse (range) I/O on the entry.
    fn cancel_sparse_io(&mut self) {}

    fn read_response_info(&self) -> CacheResult<Option<ResponseInfo>>;

    fn write_response_info(&mut self, info: &ResponseInfo) -> CacheResult<()>;

    /// Reads the out-of-band metadata stream.
    fn read_metadata(&self) -> CacheResult<Option<Bytes>>;

    /// Replaces the out-of-band metadata stream.
    fn write_metadata(&mut self, data: &[u8]) -> CacheResult<()>;
}

pub trait Backend: Send {
    fn open_entry(
        &mut self,
        key: &str,
        priority: Priority,
        callback: EntryCallback,
    ) -> BackendPoll<OpenedEntry>;

    fn create_entry(
        &mut self,
        key: &str,
        priority: Priority,
        callback: EntryCallback,
    ) -> BackendPoll<OpenedEntry>;

    fn open_or_create_entry(
        &mut self,
        key: &str,
        priority: Priority,
        callback: EntryCallback,
    ) -> BackendPoll<OpenedEntry>;

    fn doom_entry(
        &mut self,
        key: &str,
        priority: Priority,
        callback: DoomCallback,
    ) -> BackendPoll<()>;

    /// The number of stored entries.
    fn entry_count(&self) -> usize;

    /// The largest body a single entry may hold.
    fn max_file_size(&self) -> u64;

    /// Tells the backend that `key` was served from an external cache.
    fn on_external_cache_hit(&mut self, _key: &str) {}
}

/// Constructs the backend, at most once per coordinator.
pub trait BackendFactory: Send {
    fn create_backend(&mut self, callback: BackendCallback) -> BackendPoll<Box<dyn Backend>>;
}

/// Whether a backend finishes its operations right away or posts them to the sequence.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CompletionMode {
    #[default]
    Sync,
    Async,
}

impl CompletionMode {
    /// Finishes an operation according to this mode.
    pub(crate) fn finish<T>(
        self,
        callback: OperationCallback<T>,
        result: CacheResult<T>,
    ) -> BackendPoll<T> {
        match self {
            CompletionMode::Sync => BackendPoll::Ready(result),
            CompletionMode::Async => {
                callback.complete(result);
                BackendPoll::Pending
            }
        }
    }
}
