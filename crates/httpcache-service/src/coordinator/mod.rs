//! Coordinates concurrent HTTP transactions over a shared disk cache backend.
//!
//! The [`Coordinator`] owns the backend, every entry currently in use, and the bookkeeping that
//! serializes access to them:
//!
//! - Backend calls are coalesced per key. While an open, create or doom for a key is in flight,
//!   further requests for that key queue behind it and are resolved from its result.
//! - An entry in use is an [`ActiveEntry`]. Transactions are admitted to it one at a time to
//!   validate headers, and then become its single writer or one of its readers.
//! - The backend itself is built lazily by a [`BackendFactory`]. Requests that arrive during
//!   construction wait for it.
//!
//! The coordinator is a synchronous state machine. Operations either finish right away with
//! [`Completion::Ready`] or return [`Completion::Pending`], in which case the transaction later
//! receives exactly one [`Notification`] through the [`CompletionSink`] it was created with.
//! Backend completions and the coordinator's own deferred work are queued as tasks, which
//! [`Coordinator::run_until_idle`] or [`Coordinator::run_next`] process one at a time.

use rustc_hash::{FxHashMap, FxHashSet};
use sha2::{Digest, Sha256};
use tokio::sync::oneshot;
use url::Url;

use crate::backend::{Backend, BackendFactory, BackendPoll, DefaultBackend};
use crate::cache_error::{CacheError, CacheResult};
use crate::cache_key;
use crate::config::CacheConfig;
use crate::types::{Priority, RequestInfo};
use crate::utils::arena::Arena;

mod active_entry;
mod metadata_writer;
mod pending_op;
mod task;
mod transaction;
mod work_item;


pub use active_entry::{ActiveEntry, EntryId};
pub use task::OperationCallback;
pub(crate) use task::{Task, TaskQueue};
pub use transaction::{CompletionSink, Mode, Notification, Transaction, TransactionId};

use metadata_writer::MetadataWriter;
use pending_op::{BACKEND_KEY, PendingOperation};
use transaction::Sink;
use work_item::{Operation, WorkItem};

/// The outcome of a coordinator operation.
#[must_use]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Completion {
    /// The operation finished.
    Ready(CacheResult<()>),
    /// The operation finishes later, with a [`Notification`] to the transaction's sink.
    Pending,
}

impl Completion {
    pub fn is_pending(&self) -> bool {
        matches!(self, Completion::Pending)
    }
}

/// The outcome of [`Coordinator::get_backend`].
#[must_use]
#[derive(Debug)]
pub enum GetBackend {
    Ready(CacheResult<()>),
    /// The backend is being built. The receiver resolves once construction finished.
    Pending(oneshot::Receiver<CacheResult<()>>),
}

pub struct Coordinator {
    tasks: TaskQueue,
    factory: Option<Box<dyn BackendFactory>>,
    backend: Option<Box<dyn Backend>>,
    building_backend: bool,

    transactions: Arena<Transaction>,
    entries: Arena<ActiveEntry>,
    /// The entries in use, by key. Doomed entries are no longer in here.
    active_entries: FxHashMap<String, EntryId>,
    /// Doomed entries that still have transactions attached.
    doomed_entries: FxHashSet<EntryId>,
    pending_ops: FxHashMap<String, PendingOperation>,
    next_op_id: u64,

    metadata_writers: FxHashMap<TransactionId, MetadataWriter>,
    /// Hashes of keys whose last response was not cacheable.
    no_store_keys: moka::sync::Cache<[u8; 32], ()>,
}

impl Coordinator {
    pub fn new(factory: impl BackendFactory + 'static) -> Self {
        Self::with_factory(Some(Box::new(factory)), &CacheConfig::default())
    }

    /// Creates a coordinator that builds the backend described by `config`.
    pub fn from_config(config: &CacheConfig) -> Self {
        let factory = DefaultBackend::from_config(config);
        Self::with_factory(Some(Box::new(factory)), config)
    }

    /// Creates a coordinator with an optional factory.
    ///
    /// Without a factory, no backend is ever built and every transaction bypasses the cache.
    pub fn with_factory(factory: Option<Box<dyn BackendFactory>>, config: &CacheConfig) -> Self {
        let mut no_store_keys = moka::sync::Cache::builder().max_capacity(config.no_store_capacity);
        if let Some(ttl) = config.no_store_ttl {
            no_store_keys = no_store_keys.time_to_live(ttl);
        }

        Self {
            tasks: TaskQueue::new(),
            factory,
            backend: None,
            building_backend: false,
            transactions: Arena::new(),
            entries: Arena::new(),
            active_entries: FxHashMap::default(),
            doomed_entries: FxHashSet::default(),
            pending_ops: FxHashMap::default(),
            next_op_id: 0,
            metadata_writers: FxHashMap::default(),
            no_store_keys: no_store_keys.build(),
        }
    }

    /// Runs queued tasks until there are none left.
    ///
    /// Returns the number of tasks that ran.
    pub fn run_until_idle(&mut self) -> usize {
        let mut count = 0;
        while let Some(task) = self.tasks.try_next() {
            self.run_task(task);
            count += 1;
        }
        count
    }

    /// Runs the next queued task, if there is one.
    pub fn run_one(&mut self) -> bool {
        match self.tasks.try_next() {
            Some(task) => {
                self.run_task(task);
                true
            }
            None => false,
        }
    }

    /// Waits for the next task and runs it.
    ///
    /// This is what drives the coordinator when backend operations complete on other threads.
    pub async fn run_next(&mut self) {
        if let Some(task) = self.tasks.next().await {
            self.run_task(task);
        }
    }

    fn run_task(&mut self, task: Task) {
        tracing::trace!(task = task.name(), "running task");
        match task {
            Task::ProcessQueuedTransactions(entry) => self.on_process_queued_transactions(entry),
            Task::EntryOperationComplete { key, op, result } => {
                self.on_io_complete(&key, op, result.map(Some))
            }
            Task::DoomComplete { key, op, result } => {
                self.on_io_complete(&key, op, result.map(|()| None))
            }
            Task::BackendCreated { op, result } => {
                let current = self.pending_ops.get(BACKEND_KEY).map(|pending| pending.id);
                if current == Some(op) {
                    self.on_backend_created(result.map(Some));
                } else {
                    tracing::trace!("dropping stale backend");
                }
            }
            Task::ContinueBackendCreation { result } => {
                self.on_backend_created(result.map(|()| None))
            }
            Task::Notify {
                transaction,
                result,
            } => self.notify_transaction(transaction, result),
            Task::ResumeMetadataWriter {
                transaction,
                result,
            } => self.resume_metadata_writer(transaction, result),
        }
    }

    /// Makes sure the backend exists.
    ///
    /// The first call starts backend construction, and later calls wait for it.
    pub fn get_backend(&mut self) -> GetBackend {
        if self.backend.is_some() {
            return GetBackend::Ready(Ok(()));
        }
        let (sender, receiver) = oneshot::channel();
        match self.create_backend(Some(sender)) {
            Completion::Ready(result) => GetBackend::Ready(result),
            Completion::Pending => GetBackend::Pending(receiver),
        }
    }

    /// Starts backend construction, or queues `callback` behind the construction in flight.
    fn create_backend(
        &mut self,
        callback: Option<oneshot::Sender<CacheResult<()>>>,
    ) -> Completion {
        let Some(mut factory) = self.factory.take() else {
            return Completion::Ready(Err(CacheError::Failed));
        };
        self.building_backend = true;

        let item = WorkItem::with_callback(Operation::CreateBackend, callback);
        let pending = self.pending_op(BACKEND_KEY);
        if pending.in_flight.is_some() {
            if item.callback.is_some() {
                pending.queue.push_back(item);
            }
            self.factory = Some(factory);
            return Completion::Pending;
        }
        let op = pending.id;
        pending.in_flight = Some(item);

        metric!(counter("coordinator.backend_op") += 1, "op" => Operation::CreateBackend.as_tag());
        let callback = self
            .tasks
            .callback(move |result| Task::BackendCreated { op, result });
        let poll = factory.create_backend(callback);
        self.factory = Some(factory);

        match poll {
            BackendPoll::Pending => Completion::Pending,
            BackendPoll::Ready(result) => {
                let rv = result.as_ref().map(|_| ()).map_err(Clone::clone);
                // the caller learns the result from the return value
                if let Some(item) = self
                    .pending_ops
                    .get_mut(BACKEND_KEY)
                    .and_then(|pending| pending.in_flight.as_mut())
                {
                    item.callback = None;
                }
                self.on_backend_created(result.map(Some));
                Completion::Ready(rv)
            }
        }
    }

    /// Hands the result of backend construction to the in-flight request.
    ///
    /// When more requests are queued, the next one is installed as the in-flight request and
    /// resumed from a posted task.
    fn on_backend_created(&mut self, result: CacheResult<Option<Box<dyn Backend>>>) {
        let rv = result.as_ref().map(|_| ()).map_err(Clone::clone);
        let Some(pending) = self.pending_ops.get_mut(BACKEND_KEY) else {
            return;
        };
        let item = pending.in_flight.take();

        // the first completion commits the backend and retires the factory
        if self.factory.take().is_some() {
            match result {
                Ok(Some(backend)) => {
                    tracing::debug!("backend created");
                    self.backend = Some(backend);
                }
                Ok(None) => {}
                Err(ref error) => tracing::warn!(%error, "failed to create backend"),
            }
        }

        if let Some(next) = pending.queue.pop_front() {
            pending.in_flight = Some(next);
            self.tasks
                .post(Task::ContinueBackendCreation { result: rv.clone() });
        } else {
            self.building_backend = false;
            self.pending_ops.remove(BACKEND_KEY);
            metric!(gauge("coordinator.pending_ops") = self.pending_ops.len() as u64);
        }

        if let Some(mut item) = item {
            if !item.do_callback(&rv) {
                self.notify_work_item(item, rv, None);
            }
        }
    }

    /// Makes sure the backend exists before `transaction` uses it.
    ///
    /// Fails if there is no backend and nothing is building one. The transaction should then
    /// bypass the cache.
    pub fn get_backend_for_transaction(&mut self, transaction: TransactionId) -> Completion {
        if self.backend.is_some() {
            return Completion::Ready(Ok(()));
        }
        if !self.building_backend {
            return Completion::Ready(Err(CacheError::Failed));
        }
        let item = WorkItem::new(Operation::CreateBackend, Some(transaction));
        self.pending_op(BACKEND_KEY).queue.push_back(item);
        self.pending_for(Some(transaction))
    }

    /// Registers a new transaction.
    ///
    /// The first transaction starts building the backend.
    pub fn create_transaction(
        &mut self,
        priority: Priority,
        request: RequestInfo,
        sink: CompletionSink,
    ) -> TransactionId {
        self.insert_transaction(priority, request, Sink::External(sink))
    }

    fn insert_transaction(
        &mut self,
        priority: Priority,
        request: RequestInfo,
        sink: Sink,
    ) -> TransactionId {
        if self.backend.is_none() && !self.building_backend {
            // failures surface through `get_backend_for_transaction`
            let _ = self.create_backend(None);
        }
        TransactionId(
            self.transactions
                .insert(Transaction::new(priority, request, sink)),
        )
    }

    /// Forgets a transaction, detaching it from whatever it still waits for or holds.
    #[tracing::instrument(level = "trace", skip(self))]
    pub fn release_transaction(&mut self, transaction: TransactionId) {
        let Some(txn) = self.transactions.get(transaction.0) else {
            return;
        };
        let partial = txn.is_partial();
        let cache_pending = txn.cache_pending;
        let attached = txn.entry.filter(|&entry| self.entries.contains(entry.0));
        let queued = attached.is_some_and(|entry| {
            self.entries
                .get(entry.0)
                .is_some_and(|active| active.add_to_entry_queue.contains(&transaction))
        });

        if cache_pending && !queued {
            self.remove_pending_transaction(transaction);
        }
        // an entry that was opened but never joined still has to be let go
        if let Some(entry) = attached {
            self.done_with_entry(entry, transaction, true, partial);
        }
        self.transactions.remove(transaction.0);
    }

    /// Whether `transaction` was admitted to `entry`.
    fn holds_role(&self, entry: EntryId, transaction: TransactionId) -> bool {
        let Some(active) = self.entries.get(entry.0) else {
            return false;
        };
        active.writer == Some(transaction)
            || active.headers_transaction == Some(transaction)
            || active.readers.contains(&transaction)
            || active.done_headers_queue.contains(&transaction)
    }

    pub fn transaction(&self, transaction: TransactionId) -> Option<&Transaction> {
        self.transactions.get(transaction.0)
    }

    pub fn transaction_mut(&mut self, transaction: TransactionId) -> Option<&mut Transaction> {
        self.transactions.get_mut(transaction.0)
    }

    /// Marks `transaction` as waiting on the coordinator.
    fn pending_for(&mut self, transaction: Option<TransactionId>) -> Completion {
        if let Some(txn) = transaction.and_then(|id| self.transactions.get_mut(id.0)) {
            txn.cache_pending = true;
            txn.awaiting_completion = true;
        }
        Completion::Pending
    }

    /// Delivers the result of a pending operation to `transaction`.
    ///
    /// Errors also detach the transaction from its entry.
    fn notify_transaction(&mut self, transaction: TransactionId, result: CacheResult<()>) {
        let Some(txn) = self.transactions.get_mut(transaction.0) else {
            tracing::trace!(?transaction, "dropping notification of released transaction");
            return;
        };
        debug_assert!(
            txn.awaiting_completion,
            "{transaction:?} is not waiting for a notification"
        );
        txn.awaiting_completion = false;
        txn.cache_pending = false;
        if result.is_err() {
            txn.entry = None;
        }

        match &txn.sink {
            Sink::External(sink) => {
                if sink.send(Notification { transaction, result }).is_err() {
                    tracing::trace!(?transaction, "completion sink is closed");
                }
            }
            Sink::MetadataWriter => self.tasks.post(Task::ResumeMetadataWriter {
                transaction,
                result,
            }),
        }
    }

    fn notify_work_item(&mut self, item: WorkItem, result: CacheResult<()>, entry: Option<EntryId>) {
        if let Some(txn) = item
            .entry_slot
            .and_then(|slot| self.transactions.get_mut(slot.0))
        {
            txn.entry = if result.is_ok() { entry } else { None };
        }
        if let Some(transaction) = item.transaction {
            self.notify_transaction(transaction, result);
        }
    }

    /// Tells the backend that a GET or HEAD of `url` was served from somewhere else.
    pub fn on_external_cache_hit(&mut self, url: &Url, method: &str) {
        if method != "GET" && method != "HEAD" {
            return;
        }
        let Some(backend) = self.backend.as_mut() else {
            return;
        };
        backend.on_external_cache_hit(&cache_key::generate(url, 0));
    }

    /// Remembers that a response for `key` was not cacheable.
    pub fn mark_key_no_store(&self, key: &str) {
        self.no_store_keys.insert(hash_key(key), ());
    }

    /// Whether the last response for `key` was not cacheable.
    pub fn did_key_lead_to_no_store_response(&self, key: &str) -> bool {
        self.no_store_keys.contains_key(&hash_key(key))
    }

    pub fn backend(&self) -> Option<&dyn Backend> {
        self.backend.as_deref()
    }

    pub fn has_backend(&self) -> bool {
        self.backend.is_some()
    }

    pub fn is_building_backend(&self) -> bool {
        self.building_backend
    }

    /// The active entry of `key`. Doomed entries do not count.
    pub fn active_entry_for(&self, key: &str) -> Option<EntryId> {
        self.active_entries.get(key).copied()
    }

    pub fn entry(&self, entry: EntryId) -> Option<&ActiveEntry> {
        self.entries.get(entry.0)
    }

    pub fn entry_mut(&mut self, entry: EntryId) -> Option<&mut ActiveEntry> {
        self.entries.get_mut(entry.0)
    }

    pub fn is_doomed(&self, entry: EntryId) -> bool {
        self.doomed_entries.contains(&entry)
    }

    pub fn active_entry_count(&self) -> usize {
        self.active_entries.len()
    }

    pub fn doomed_entry_count(&self) -> usize {
        self.doomed_entries.len()
    }

    /// The number of requests waiting on the backend operation for `key`, including the one in
    /// flight.
    pub fn pending_op_len(&self, key: &str) -> usize {
        self.pending_ops.get(key).map_or(0, |pending| {
            pending.queue.len() + usize::from(pending.in_flight.is_some())
        })
    }
}

impl Drop for Coordinator {
    fn drop(&mut self) {
        // late completions must not find their way back
        self.tasks.close();

        for entry in self.entries.values_mut() {
            entry.clear_transactions();
        }
        let active: Vec<_> = self.active_entries.drain().map(|(_, entry)| entry).collect();
        for entry in active {
            self.entries.remove(entry.0);
        }
        self.doomed_entries.clear();
        self.entries.drain();

        self.backend = None;

        // nobody is notified: the transactions go away with the coordinator
        self.pending_ops.clear();
        self.metadata_writers.clear();
    }
}

impl std::fmt::Debug for Coordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Coordinator")
            .field("has_backend", &self.backend.is_some())
            .field("building_backend", &self.building_backend)
            .field("active_entries", &self.active_entries.len())
            .field("doomed_entries", &self.doomed_entries.len())
            .field("pending_ops", &self.pending_ops.len())
            .field("transactions", &self.transactions.len())
            .finish()
    }
}

fn hash_key(key: &str) -> [u8; 32] {
    Sha256::digest(key.as_bytes()).into()
}
