//! Per-key backend operations and the fan-out of their results.
//!
//! Only one backend call per key is in flight at any time. Requests for a key that arrive while
//! its call is outstanding queue behind it and are resolved from its result once it completes.

use std::collections::VecDeque;

use url::Url;

use crate::backend::{BackendPoll, OpenedEntry};
use crate::cache_error::{CacheError, CacheResult};
use crate::cache_key;
use crate::types::Priority;

use super::work_item::{Operation, WorkItem};
use super::{Completion, Coordinator, Task, TransactionId};

/// The key under which backend construction is tracked.
pub(super) const BACKEND_KEY: &str = "";

/// Identifies one incarnation of a [`PendingOperation`].
///
/// Completions carry the id they were issued for, so a completion that arrives after its
/// operation was torn down is recognized and dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct OpId(u64);

#[derive(Debug)]
pub(super) struct PendingOperation {
    pub id: OpId,
    pub in_flight: Option<WorkItem>,
    pub queue: VecDeque<WorkItem>,
}

impl PendingOperation {
    /// Neutralizes or removes the work item of `transaction`.
    ///
    /// The in-flight item stays in place so its completion still has somewhere to go.
    fn remove_transaction(&mut self, transaction: TransactionId) -> bool {
        if let Some(item) = self.in_flight.as_mut().filter(|item| item.matches(transaction)) {
            item.withdraw();
            return true;
        }
        match self.queue.iter().position(|item| item.matches(transaction)) {
            Some(position) => {
                self.queue.remove(position);
                true
            }
            None => false,
        }
    }
}

impl Coordinator {
    pub(super) fn pending_op(&mut self, key: &str) -> &mut PendingOperation {
        if !self.pending_ops.contains_key(key) {
            metric!(gauge("coordinator.pending_ops") = self.pending_ops.len() as u64 + 1);
        }
        let next_op_id = &mut self.next_op_id;
        self.pending_ops
            .entry(key.to_owned())
            .or_insert_with(|| {
                *next_op_id += 1;
                PendingOperation {
                    id: OpId(*next_op_id),
                    in_flight: None,
                    queue: VecDeque::new(),
                }
            })
    }

    /// Opens the entry for `key`, handing out the active entry if there is one.
    ///
    /// On success the transaction's [`entry`](super::Transaction::entry) is set.
    #[tracing::instrument(level = "trace", skip(self))]
    pub fn open_entry(&mut self, key: &str, transaction: TransactionId) -> Completion {
        self.request_entry(key, transaction, Operation::OpenEntry)
    }

    /// Creates a new entry for `key`.
    ///
    /// Fails with [`CacheError::CreateFailure`] if the key already has an active entry.
    #[tracing::instrument(level = "trace", skip(self))]
    pub fn create_entry(&mut self, key: &str, transaction: TransactionId) -> Completion {
        self.request_entry(key, transaction, Operation::CreateEntry)
    }

    /// Opens the entry for `key`, or creates it when the backend does not have one.
    #[tracing::instrument(level = "trace", skip(self))]
    pub fn open_or_create_entry(&mut self, key: &str, transaction: TransactionId) -> Completion {
        self.request_entry(key, transaction, Operation::OpenOrCreateEntry)
    }

    fn request_entry(
        &mut self,
        key: &str,
        transaction: TransactionId,
        operation: Operation,
    ) -> Completion {
        let Some(priority) = self.transactions.get(transaction.0).map(|t| t.priority()) else {
            debug_assert!(false, "unknown transaction {transaction:?}");
            return Completion::Ready(Err(CacheError::InternalError));
        };

        if let Some(&entry) = self.active_entries.get(key) {
            if operation == Operation::CreateEntry {
                return Completion::Ready(Err(CacheError::CreateFailure));
            }
            if let Some(txn) = self.transactions.get_mut(transaction.0) {
                txn.entry = Some(entry);
            }
            return Completion::Ready(Ok(()));
        }

        let item = WorkItem::with_entry_slot(operation, transaction);
        self.issue_entry_operation(key, item, priority)
    }

    /// Dooms the entry for `key`.
    ///
    /// An active entry is doomed right away. Otherwise the backend is asked to doom it on behalf
    /// of `transaction`, if any.
    #[tracing::instrument(level = "trace", skip(self))]
    pub fn doom_entry(&mut self, key: &str, transaction: Option<TransactionId>) -> Completion {
        match self.active_entries.get(key) {
            Some(&entry) => {
                self.doom_active_entry_by_id(entry);
                Completion::Ready(Ok(()))
            }
            None => self.async_doom_entry(key, transaction),
        }
    }

    fn async_doom_entry(&mut self, key: &str, transaction: Option<TransactionId>) -> Completion {
        let priority = transaction
            .and_then(|id| self.transactions.get(id.0))
            .map(|t| t.priority())
            .unwrap_or_default();
        let item = WorkItem::new(Operation::DoomEntry, transaction);
        self.issue_entry_operation(key, item, priority)
    }

    /// Dooms the entry that a plain GET of `url` would use.
    pub fn doom_main_entry_for_url(&mut self, url: &Url) {
        if self.backend.is_none() {
            return;
        }
        let key = cache_key::generate(url, 0);
        tracing::debug!(%key, "dooming main entry");
        if self.active_entries.contains_key(&key) {
            let _ = self.doom_entry(&key, None);
        } else {
            let _ = self.async_doom_entry(&key, None);
        }
    }

    /// Queues `item` behind the in-flight operation for `key`, or dispatches it to the backend.
    fn issue_entry_operation(&mut self, key: &str, item: WorkItem, priority: Priority) -> Completion {
        debug_assert!(!self.active_entries.contains_key(key));
        if self.backend.is_none() {
            return Completion::Ready(Err(CacheError::Failed));
        }

        let requester = item.transaction;
        let operation = item.operation;
        let pending = self.pending_op(key);
        if pending.in_flight.is_some() {
            tracing::trace!(key, op = operation.as_tag(), "queueing behind in-flight operation");
            pending.queue.push_back(item);
            metric!(counter("coordinator.coalesced") += 1, "op" => operation.as_tag());
            return self.pending_for(requester);
        }
        let op = pending.id;
        pending.in_flight = Some(item);

        let Some(backend) = self.backend.as_mut() else {
            self.pending_ops.remove(key);
            return Completion::Ready(Err(CacheError::Failed));
        };
        metric!(counter("coordinator.backend_op") += 1, "op" => operation.as_tag());

        let owned_key = key.to_owned();
        let poll = if operation == Operation::DoomEntry {
            let callback = self.tasks.callback(move |result| Task::DoomComplete {
                key: owned_key,
                op,
                result,
            });
            match backend.doom_entry(key, priority, callback) {
                BackendPoll::Ready(result) => BackendPoll::Ready(result.map(|()| None)),
                BackendPoll::Pending => BackendPoll::Pending,
            }
        } else {
            let callback = self.tasks.callback(move |result| Task::EntryOperationComplete {
                key: owned_key,
                op,
                result,
            });
            let poll = match operation {
                Operation::OpenEntry => backend.open_entry(key, priority, callback),
                Operation::CreateEntry => backend.create_entry(key, priority, callback),
                _ => backend.open_or_create_entry(key, priority, callback),
            };
            match poll {
                BackendPoll::Ready(result) => BackendPoll::Ready(result.map(Some)),
                BackendPoll::Pending => BackendPoll::Pending,
            }
        };

        match poll {
            BackendPoll::Pending => self.pending_for(requester),
            BackendPoll::Ready(result) => {
                let rv = result.as_ref().map(|_| ()).map_err(Clone::clone);
                // the requester learns the result from the return value
                if let Some(item) = self
                    .pending_ops
                    .get_mut(key)
                    .and_then(|pending| pending.in_flight.as_mut())
                {
                    item.transaction = None;
                }
                self.on_io_complete(key, op, result);
                Completion::Ready(rv)
            }
        }
    }

    /// Resolves the in-flight item of `key` and every item queued behind it.
    pub(super) fn on_io_complete(
        &mut self,
        key: &str,
        op: OpId,
        result: CacheResult<Option<OpenedEntry>>,
    ) {
        let Some(pending) = self.pending_ops.get_mut(key).filter(|pending| pending.id == op) else {
            tracing::trace!(key, "dropping stale backend completion");
            if let Ok(Some(opened)) = result {
                opened.entry.close();
            }
            return;
        };
        let in_flight = pending.in_flight.take();
        let queued = std::mem::take(&mut pending.queue);
        self.pending_ops.remove(key);
        metric!(gauge("coordinator.pending_ops") = self.pending_ops.len() as u64);

        let Some(item) = in_flight else {
            debug_assert!(false, "completion without an in-flight item");
            if let Ok(Some(opened)) = result {
                opened.entry.close();
            }
            return;
        };

        let operation = item.operation;
        let rv = result.as_ref().map(|_| ()).map_err(Clone::clone);
        if let Err(error) = &rv {
            tracing::trace!(key, op = operation.as_tag(), %error, "backend operation failed");
        }

        let mut fail_requests = false;
        let mut entry = None;
        match result {
            Ok(Some(opened)) if item.is_valid() => entry = Some(self.activate_entry(key, opened)),
            Ok(Some(OpenedEntry {
                entry: mut disk_entry,
                opened,
            })) => {
                // nobody is waiting for this entry any more
                if !opened {
                    disk_entry.doom();
                }
                disk_entry.close();
                fail_requests = true;
            }
            Ok(None) => fail_requests = true,
            Err(_) => {}
        }

        self.notify_work_item(item, rv.clone(), entry);

        for queued_item in queued {
            if queued_item.operation == Operation::DoomEntry {
                fail_requests = true;
            } else if rv.is_ok() {
                entry = self.active_entries.get(key).copied();
                if entry.is_none() {
                    fail_requests = true;
                }
            }

            if fail_requests {
                metric!(counter("coordinator.race") += 1, "reason" => "queued_backend_op");
                self.notify_work_item(queued_item, Err(CacheError::CacheRace), None);
                continue;
            }

            let result = match queued_item.operation {
                Operation::CreateEntry => {
                    if rv.is_ok() {
                        Err(CacheError::CreateFailure)
                    } else if !matches!(
                        operation,
                        Operation::CreateEntry | Operation::OpenOrCreateEntry
                    ) {
                        fail_requests = true;
                        Err(CacheError::CacheRace)
                    } else {
                        rv.clone()
                    }
                }
                Operation::OpenOrCreateEntry
                    if rv.is_err()
                        && matches!(operation, Operation::OpenEntry | Operation::CreateEntry) =>
                {
                    fail_requests = true;
                    Err(CacheError::CacheRace)
                }
                Operation::OpenEntry if rv.is_err() && operation == Operation::CreateEntry => {
                    fail_requests = true;
                    Err(CacheError::CacheRace)
                }
                _ => rv.clone(),
            };
            if result == Err(CacheError::CacheRace) {
                metric!(counter("coordinator.race") += 1, "reason" => "queued_backend_op");
            }
            self.notify_work_item(queued_item, result, entry);
        }
    }

    /// Withdraws a transaction that is waiting on the coordinator.
    ///
    /// The transaction is looked for in the add-to-entry queue of its key's active entry, behind
    /// backend construction, behind the backend operation for its key, and finally in the queues
    /// of doomed entries.
    #[tracing::instrument(level = "trace", skip(self))]
    pub fn remove_pending_transaction(&mut self, transaction: TransactionId) {
        let Some(key) = self.transactions.get(transaction.0).map(|t| t.key().to_owned()) else {
            return;
        };

        let mut found = match self.active_entries.get(&key) {
            Some(&entry) => self.remove_from_add_to_entry_queue(entry, transaction),
            None => false,
        };

        if !found && self.building_backend {
            if let Some(pending) = self.pending_ops.get_mut(BACKEND_KEY) {
                found = pending.remove_transaction(transaction);
            }
        }

        if !found {
            if let Some(pending) = self.pending_ops.get_mut(&key) {
                found = pending.remove_transaction(transaction);
            }
        }

        if !found {
            let doomed: Vec<_> = self.doomed_entries.iter().copied().collect();
            found = doomed
                .into_iter()
                .any(|entry| self.remove_from_add_to_entry_queue(entry, transaction));
        }

        debug_assert!(found, "pending transaction {transaction:?} not found");

        if let Some(txn) = self.transactions.get_mut(transaction.0) {
            txn.cache_pending = false;
            txn.awaiting_completion = false;
            txn.entry = None;
        }
    }
}
