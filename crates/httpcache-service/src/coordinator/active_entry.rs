//! Entries in use, and the state machine that admits transactions to them.
//!
//! A transaction first queues for admission. Once admitted it is the entry's single
//! headers-validation transaction. After its headers phase it becomes the writer, a reader, or
//! waits in the done-headers queue until the current writer is gone:
//!
//! ```text
//! add_to_entry_queue -> headers_transaction -> done_headers_queue -> writer | readers
//!                                           \-----------------------^
//! ```
//!
//! Admission never happens inline. [`Coordinator::process_queued_transactions`] posts a single
//! deferred pass per entry, and every pass admits at most one transaction.

use std::collections::{BTreeSet, VecDeque};
use std::fmt;

use crate::backend::{DiskEntry, OpenedEntry};
use crate::cache_error::CacheError;
use crate::types::LoadState;
use crate::utils::arena::Index;

use super::transaction::Mode;
use super::{Completion, Coordinator, Task, TransactionId};

/// A handle to an entry tracked by a [`Coordinator`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntryId(pub(super) Index);

/// A backend entry together with the transactions using it.
pub struct ActiveEntry {
    pub(super) key: String,
    pub(super) disk_entry: Option<Box<dyn DiskEntry>>,
    pub(super) opened: bool,
    pub(super) writer: Option<TransactionId>,
    pub(super) readers: BTreeSet<TransactionId>,
    pub(super) headers_transaction: Option<TransactionId>,
    pub(super) add_to_entry_queue: VecDeque<TransactionId>,
    pub(super) done_headers_queue: VecDeque<TransactionId>,
    pub(super) doomed: bool,
    pub(super) will_process_queued_transactions: bool,
}

impl ActiveEntry {
    fn new(key: String, opened: OpenedEntry) -> Self {
        Self {
            key,
            disk_entry: Some(opened.entry),
            opened: opened.opened,
            writer: None,
            readers: BTreeSet::new(),
            headers_transaction: None,
            add_to_entry_queue: VecDeque::new(),
            done_headers_queue: VecDeque::new(),
            doomed: false,
            will_process_queued_transactions: false,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Whether the backend opened an existing entry, as opposed to creating it.
    pub fn was_opened(&self) -> bool {
        self.opened
    }

    pub fn writer(&self) -> Option<TransactionId> {
        self.writer
    }

    pub fn readers(&self) -> impl Iterator<Item = TransactionId> + '_ {
        self.readers.iter().copied()
    }

    pub fn headers_transaction(&self) -> Option<TransactionId> {
        self.headers_transaction
    }

    pub fn add_to_entry_queue(&self) -> impl Iterator<Item = TransactionId> + '_ {
        self.add_to_entry_queue.iter().copied()
    }

    pub fn done_headers_queue(&self) -> impl Iterator<Item = TransactionId> + '_ {
        self.done_headers_queue.iter().copied()
    }

    pub fn is_doomed(&self) -> bool {
        self.doomed
    }

    pub fn will_process_queued_transactions(&self) -> bool {
        self.will_process_queued_transactions
    }

    pub fn has_no_transactions(&self) -> bool {
        self.writer.is_none()
            && self.readers.is_empty()
            && self.headers_transaction.is_none()
            && self.add_to_entry_queue.is_empty()
            && self.done_headers_queue.is_empty()
    }

    pub fn is_writing_in_progress(&self) -> bool {
        self.writer.is_some()
    }

    pub fn disk_entry(&self) -> Option<&dyn DiskEntry> {
        self.disk_entry.as_deref()
    }

    pub fn disk_entry_mut(&mut self) -> Option<&mut (dyn DiskEntry + 'static)> {
        self.disk_entry.as_deref_mut()
    }

    fn doom_disk_entry(&mut self) {
        if let Some(disk_entry) = self.disk_entry.as_mut() {
            disk_entry.doom();
        }
    }

    /// Removes both queues, done-headers first.
    fn take_queued_transactions(&mut self) -> Vec<TransactionId> {
        let mut list: Vec<_> = self.done_headers_queue.drain(..).collect();
        list.extend(self.add_to_entry_queue.drain(..));
        list
    }

    /// Drops every role and queue, without notifying anyone.
    pub(super) fn clear_transactions(&mut self) {
        self.writer = None;
        self.readers.clear();
        self.headers_transaction = None;
        self.add_to_entry_queue.clear();
        self.done_headers_queue.clear();
        self.will_process_queued_transactions = false;
    }
}

impl Drop for ActiveEntry {
    fn drop(&mut self) {
        if let Some(disk_entry) = self.disk_entry.take() {
            disk_entry.close();
        }
    }
}

impl fmt::Debug for ActiveEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActiveEntry")
            .field("key", &self.key)
            .field("writer", &self.writer)
            .field("readers", &self.readers)
            .field("headers_transaction", &self.headers_transaction)
            .field("add_to_entry_queue", &self.add_to_entry_queue)
            .field("done_headers_queue", &self.done_headers_queue)
            .field("doomed", &self.doomed)
            .field(
                "will_process_queued_transactions",
                &self.will_process_queued_transactions,
            )
            .finish()
    }
}

/// How a transaction that finished its headers phase reached its role.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Promotion {
    /// Right from `done_with_response_headers`, which reports success itself.
    Inline,
    /// From the deferred pass, which has to notify the transaction.
    Deferred,
}

impl Coordinator {
    /// Registers a backend entry as the active entry of `key`.
    pub(super) fn activate_entry(&mut self, key: &str, opened: OpenedEntry) -> EntryId {
        if let Some(&existing) = self.active_entries.get(key) {
            debug_assert!(false, "entry for {key} is already active");
            opened.entry.close();
            return existing;
        }
        let entry = EntryId(self.entries.insert(ActiveEntry::new(key.to_owned(), opened)));
        self.active_entries.insert(key.to_owned(), entry);
        tracing::trace!(key, ?entry, "activated entry");
        metric!(counter("coordinator.entry.activated") += 1);
        metric!(gauge("coordinator.active_entries") = self.active_entries.len() as u64);
        entry
    }

    /// Queues `transaction` for admission to `entry`.
    ///
    /// This always completes asynchronously. Once admitted, the transaction is the entry's
    /// headers-validation transaction.
    #[tracing::instrument(level = "trace", skip(self))]
    pub fn add_transaction_to_entry(
        &mut self,
        entry: EntryId,
        transaction: TransactionId,
    ) -> Completion {
        let Some(active) = self.entries.get_mut(entry.0) else {
            return Completion::Ready(Err(CacheError::CacheRace));
        };
        active.add_to_entry_queue.push_back(transaction);
        if let Some(txn) = self.transactions.get_mut(transaction.0) {
            txn.entry = Some(entry);
            // a transaction that lost an earlier entry starts over here
            txn.validating_cannot_proceed = false;
        }
        self.process_queued_transactions(entry);
        self.pending_for(Some(transaction))
    }

    /// Called when the headers-validation transaction is done with the headers phase.
    ///
    /// A writing transaction becomes the writer right away if the entry has none and nobody is
    /// queued ahead of it. Everyone else waits for the writer to finish.
    #[tracing::instrument(level = "trace", skip(self))]
    pub fn done_with_response_headers(
        &mut self,
        entry: EntryId,
        transaction: TransactionId,
        is_partial: bool,
    ) -> Completion {
        let Some(mode) = self.transactions.get(transaction.0).map(|txn| txn.mode()) else {
            return Completion::Ready(Err(CacheError::InternalError));
        };
        let Some(active) = self.entries.get_mut(entry.0) else {
            return Completion::Ready(Err(CacheError::CacheRace));
        };

        if active.writer == Some(transaction) {
            debug_assert!(is_partial, "only range requests re-enter the headers phase");
            return Completion::Ready(Ok(()));
        }
        if active.headers_transaction != Some(transaction) {
            tracing::debug!(?transaction, "transaction lost its headers phase");
            return Completion::Ready(Err(CacheError::CacheRace));
        }
        active.headers_transaction = None;

        if mode.contains(Mode::WRITE)
            && active.writer.is_none()
            && active.done_headers_queue.is_empty()
        {
            self.promote_after_headers(entry, transaction, Promotion::Inline);
            return Completion::Ready(Ok(()));
        }

        active.done_headers_queue.push_back(transaction);
        self.process_queued_transactions(entry);
        self.pending_for(Some(transaction))
    }

    /// Installs a transaction that finished its headers phase as writer or reader.
    fn promote_after_headers(
        &mut self,
        entry: EntryId,
        transaction: TransactionId,
        promotion: Promotion,
    ) {
        let is_writer = self
            .transactions
            .get(transaction.0)
            .is_some_and(|txn| txn.mode().contains(Mode::WRITE));
        let Some(active) = self.entries.get_mut(entry.0) else {
            return;
        };
        if is_writer {
            debug_assert!(active.writer.is_none());
            active.writer = Some(transaction);
            tracing::trace!(key = %active.key, ?transaction, "installed writer");
        } else {
            // without a writer the body is complete, so the transaction can read it
            active.readers.insert(transaction);
            tracing::trace!(key = %active.key, ?transaction, "installed reader");
        }

        // give the transactions queued behind this one a chance to proceed
        self.process_queued_transactions(entry);

        if promotion == Promotion::Deferred {
            self.notify_transaction(transaction, Ok(()));
        }
    }

    /// Called when a transaction is done with `entry`, in whatever role it holds.
    ///
    /// `process_cancel` is set when the transaction stops early. If other transactions depend on
    /// what it was writing, the entry is either marked as truncated or doomed, and the dependents
    /// restart.
    #[tracing::instrument(level = "trace", skip(self))]
    pub fn done_with_entry(
        &mut self,
        entry: EntryId,
        transaction: TransactionId,
        process_cancel: bool,
        is_partial: bool,
    ) {
        if !self.entries.contains(entry.0) {
            return;
        }
        let should_restart = process_cancel
            && self.holds_role(entry, transaction)
            && self.has_dependent_transactions(entry, transaction);
        if let Some(txn) = self.transactions.get_mut(transaction.0) {
            txn.entry = None;
            txn.awaiting_completion = false;
            txn.cache_pending = false;
        }
        let Some(active) = self.entries.get_mut(entry.0) else {
            return;
        };
        if should_restart && is_partial {
            if let Some(disk_entry) = active.disk_entry.as_mut() {
                disk_entry.cancel_sparse_io();
            }
        }

        if let Some(position) = active
            .done_headers_queue
            .iter()
            .position(|&queued| queued == transaction)
        {
            active.done_headers_queue.remove(position);
            if should_restart {
                self.process_entry_failure(entry, transaction);
            } else {
                self.process_queued_transactions(entry);
            }
            return;
        }

        if active.headers_transaction == Some(transaction) {
            self.done_writing_to_entry(entry, !should_restart, transaction);
            return;
        }

        if active.writer == Some(transaction) {
            let valid_response = self
                .transactions
                .get(transaction.0)
                .is_some_and(|txn| txn.is_valid_response_for_writer(is_partial));
            let success = if should_restart && valid_response {
                let truncated = match (
                    self.transactions.get_mut(transaction.0),
                    self.entries
                        .get_mut(entry.0)
                        .and_then(|active| active.disk_entry.as_deref_mut()),
                ) {
                    (Some(txn), Some(disk_entry)) => txn.add_truncated_flag(disk_entry),
                    _ => Err(CacheError::Failed),
                };
                match truncated {
                    Ok(did_truncate) if did_truncate || is_partial => {
                        self.finish_truncated_write(entry, transaction);
                        return;
                    }
                    Ok(_) => true,
                    Err(error) => {
                        tracing::debug!(?transaction, %error, "could not truncate entry");
                        false
                    }
                }
            } else {
                !process_cancel
            };
            self.done_writing_to_entry(entry, success, transaction);
            return;
        }

        if active.readers.remove(&transaction) {
            self.process_queued_transactions(entry);
            return;
        }

        if let Some(position) = active
            .add_to_entry_queue
            .iter()
            .position(|&queued| queued == transaction)
        {
            active.add_to_entry_queue.remove(position);
            self.process_queued_transactions(entry);
            return;
        }

        // opened the entry but never joined it, which may leave it without transactions
        tracing::trace!(?transaction, ?entry, "transaction leaves without a role");
        self.process_queued_transactions(entry);
    }

    /// The writer stopped early, but the entry is kept as a resumable, truncated response.
    fn finish_truncated_write(&mut self, entry: EntryId, transaction: TransactionId) {
        let Some(active) = self.entries.get_mut(entry.0) else {
            return;
        };
        active.writer = None;
        tracing::debug!(key = %active.key, "keeping truncated entry");
        // already validated transactions have to see the truncated state
        self.restart_headers_phase_transactions(entry, transaction);

        let Some(active) = self.entries.get(entry.0) else {
            return;
        };
        if active.has_no_transactions() && !active.will_process_queued_transactions {
            self.destroy_entry(entry);
        } else {
            self.process_queued_transactions(entry);
        }
    }

    /// Called when the writer or the headers-validation transaction is done writing.
    #[tracing::instrument(level = "trace", skip(self))]
    pub fn done_writing_to_entry(
        &mut self,
        entry: EntryId,
        success: bool,
        transaction: TransactionId,
    ) {
        if let Some(txn) = self.transactions.get_mut(transaction.0) {
            txn.entry = None;
        }
        let Some(active) = self.entries.get_mut(entry.0) else {
            return;
        };
        if active.writer == Some(transaction) {
            active.writer = None;
        } else if active.headers_transaction == Some(transaction) {
            active.headers_transaction = None;
        } else {
            debug_assert!(false, "{transaction:?} is not writing to the entry");
            return;
        }

        if success {
            self.process_queued_transactions(entry);
        } else {
            self.process_entry_failure(entry, transaction);
        }
    }

    /// Whether anyone else relies on what `transaction` writes to `entry`.
    pub(super) fn has_dependent_transactions(
        &self,
        entry: EntryId,
        transaction: TransactionId,
    ) -> bool {
        let Some(txn) = self.transactions.get(transaction.0) else {
            return false;
        };
        if txn.method() == "HEAD" || txn.method() == "DELETE" {
            return false;
        }
        // a transaction whose writing was aborted has mode NONE, which counts as a failed writer
        if !txn.mode().contains(Mode::WRITE) && !txn.mode().is_empty() {
            return false;
        }
        // a transaction that was not admitted yet did not write anything
        match self.entries.get(entry.0) {
            Some(active) => !active.add_to_entry_queue.contains(&transaction),
            None => false,
        }
    }

    /// Dooms `entry` after a failed write and restarts everyone waiting on it.
    fn process_entry_failure(&mut self, entry: EntryId, transaction: TransactionId) {
        let Some(active) = self.entries.get(entry.0) else {
            return;
        };
        if active
            .headers_transaction
            .is_some_and(|headers| headers != transaction)
        {
            self.restart_headers_transaction(entry);
        }

        let Some(active) = self.entries.get_mut(entry.0) else {
            return;
        };
        let list = active.take_queued_transactions();
        tracing::debug!(key = %active.key, restarting = list.len(), "entry failed");

        if active.has_no_transactions() && !active.will_process_queued_transactions {
            active.doom_disk_entry();
            self.destroy_entry(entry);
        } else {
            self.doom_active_entry_by_id(entry);
        }

        for queued in list {
            metric!(counter("coordinator.race") += 1, "reason" => "entry_failure");
            self.notify_transaction(queued, Err(CacheError::CacheRace));
        }
    }

    fn restart_headers_transaction(&mut self, entry: EntryId) {
        let Some(headers) = self
            .entries
            .get_mut(entry.0)
            .and_then(|active| active.headers_transaction.take())
        else {
            return;
        };
        tracing::debug!(transaction = ?headers, "headers validation can not proceed");
        if let Some(txn) = self.transactions.get_mut(headers.0) {
            txn.set_validating_cannot_proceed();
        }
    }

    fn restart_headers_phase_transactions(&mut self, entry: EntryId, transaction: TransactionId) {
        let Some(active) = self.entries.get(entry.0) else {
            return;
        };
        if active
            .headers_transaction
            .is_some_and(|headers| headers != transaction)
        {
            self.restart_headers_transaction(entry);
        }
        let Some(active) = self.entries.get_mut(entry.0) else {
            return;
        };
        let done_headers: Vec<_> = active.done_headers_queue.drain(..).collect();
        for queued in done_headers {
            metric!(counter("coordinator.race") += 1, "reason" => "truncated");
            self.notify_transaction(queued, Err(CacheError::CacheRace));
        }
    }

    /// Called by the headers-validation transaction when the server response does not match
    /// the stored one.
    ///
    /// The entry is doomed. Transactions still waiting for admission restart. Transactions that
    /// already passed their headers phase keep reading the doomed entry.
    #[tracing::instrument(level = "trace", skip(self))]
    pub fn doom_entry_validation_no_match(&mut self, entry: EntryId) {
        let Some(active) = self.entries.get_mut(entry.0) else {
            return;
        };
        let headers = active.headers_transaction.take();
        if let Some(txn) = headers.and_then(|headers| self.transactions.get_mut(headers.0)) {
            txn.entry = None;
        }

        let Some(active) = self.entries.get_mut(entry.0) else {
            return;
        };
        if active.has_no_transactions() && !active.will_process_queued_transactions {
            active.doom_disk_entry();
            self.destroy_entry(entry);
            return;
        }

        self.doom_active_entry_by_id(entry);

        let Some(active) = self.entries.get_mut(entry.0) else {
            return;
        };
        let queued: Vec<_> = active.add_to_entry_queue.drain(..).collect();
        for transaction in queued {
            if let Some(txn) = self.transactions.get_mut(transaction.0) {
                txn.reset_cache_pending_state();
                txn.entry = None;
            }
            metric!(counter("coordinator.race") += 1, "reason" => "validation_no_match");
            self.tasks.post(Task::Notify {
                transaction,
                result: Err(CacheError::CacheRace),
            });
        }
    }

    /// Schedules a deferred admission pass for `entry`, unless one is scheduled already.
    pub(super) fn process_queued_transactions(&mut self, entry: EntryId) {
        let Some(active) = self.entries.get_mut(entry.0) else {
            return;
        };
        if active.will_process_queued_transactions {
            return;
        }
        active.will_process_queued_transactions = true;
        self.tasks.post(Task::ProcessQueuedTransactions(entry));
    }

    /// The deferred admission pass. Admits at most one transaction.
    pub(super) fn on_process_queued_transactions(&mut self, entry: EntryId) {
        let Some(active) = self.entries.get_mut(entry.0) else {
            return;
        };
        active.will_process_queued_transactions = false;

        if active.has_no_transactions() {
            self.destroy_entry(entry);
            return;
        }

        // done-headers first, which keeps the overall order
        if active.writer.is_none() {
            if let Some(transaction) = active.done_headers_queue.pop_front() {
                self.promote_after_headers(entry, transaction, Promotion::Deferred);
                return;
            }
        }

        if active.headers_transaction.is_none() {
            if let Some(transaction) = active.add_to_entry_queue.pop_front() {
                active.headers_transaction = Some(transaction);
                tracing::trace!(key = %active.key, ?transaction, "admitted transaction");
                self.notify_transaction(transaction, Ok(()));
            }
        }
    }

    /// Dooms the active entry of `key`, if there is one.
    pub fn doom_active_entry(&mut self, key: &str) {
        if let Some(&entry) = self.active_entries.get(key) {
            self.doom_active_entry_by_id(entry);
        }
    }

    /// Dooms `entry`, but only while it is still the active entry of its key.
    pub(super) fn doom_active_entry_by_id(&mut self, entry: EntryId) {
        let Some(active) = self.entries.get_mut(entry.0) else {
            return;
        };
        if active.doomed || self.active_entries.get(&active.key) != Some(&entry) {
            return;
        }
        self.active_entries.remove(&active.key);
        self.doomed_entries.insert(entry);
        active.doom_disk_entry();
        active.doomed = true;
        tracing::debug!(key = %active.key, ?entry, "doomed entry");
        metric!(counter("coordinator.entry.doomed") += 1);
        metric!(gauge("coordinator.active_entries") = self.active_entries.len() as u64);
    }

    fn destroy_entry(&mut self, entry: EntryId) {
        let Some(active) = self.entries.get(entry.0) else {
            return;
        };
        if active.doomed {
            self.finalize_doomed_entry(entry);
        } else {
            self.deactivate_entry(entry);
        }
    }

    fn finalize_doomed_entry(&mut self, entry: EntryId) {
        let removed = self.doomed_entries.remove(&entry);
        debug_assert!(removed, "{entry:?} is not doomed");
        if let Some(active) = self.entries.remove(entry.0) {
            tracing::trace!(key = %active.key, "finalized doomed entry");
            metric!(counter("coordinator.entry.destroyed") += 1, "doomed" => "true");
        }
    }

    fn deactivate_entry(&mut self, entry: EntryId) {
        let Some(active) = self.entries.remove(entry.0) else {
            return;
        };
        debug_assert!(!active.will_process_queued_transactions);
        debug_assert!(!active.doomed);
        debug_assert!(active.has_no_transactions());

        if !active.key.is_empty() && self.active_entries.get(&active.key) == Some(&entry) {
            self.active_entries.remove(&active.key);
        } else {
            self.active_entries.retain(|_, active_entry| *active_entry != entry);
        }
        tracing::trace!(key = %active.key, "deactivated entry");
        metric!(counter("coordinator.entry.destroyed") += 1, "doomed" => "false");
        metric!(gauge("coordinator.active_entries") = self.active_entries.len() as u64);
    }

    /// Removes `transaction` from the add-to-entry queue of `entry`.
    pub(super) fn remove_from_add_to_entry_queue(
        &mut self,
        entry: EntryId,
        transaction: TransactionId,
    ) -> bool {
        let Some(active) = self.entries.get_mut(entry.0) else {
            return false;
        };
        match active
            .add_to_entry_queue
            .iter()
            .position(|&queued| queued == transaction)
        {
            Some(position) => {
                active.add_to_entry_queue.remove(position);
                true
            }
            None => false,
        }
    }

    /// What a transaction that waits for its key is waiting for.
    pub fn get_load_state_for_pending_transaction(&self, transaction: TransactionId) -> LoadState {
        let writer = self
            .transactions
            .get(transaction.0)
            .and_then(|txn| self.active_entries.get(txn.key()))
            .and_then(|&entry| self.entries.get(entry.0))
            .and_then(|active| active.writer)
            .and_then(|writer| self.transactions.get(writer.0));
        match writer {
            Some(writer) => writer.writer_load_state(),
            None => LoadState::WaitingForCache,
        }
    }

    /// Whether `transaction` may write the response headers to `entry`.
    ///
    /// `is_match` is set when the server response matches the stored one.
    pub fn can_transaction_write_response_headers(
        &self,
        entry: EntryId,
        transaction: TransactionId,
        is_partial: bool,
        is_match: bool,
    ) -> bool {
        let Some(active) = self.entries.get(entry.0) else {
            return false;
        };
        if active.writer == Some(transaction) {
            debug_assert!(is_partial);
            return true;
        }
        if active.headers_transaction != Some(transaction) {
            return false;
        }
        let writes = self
            .transactions
            .get(transaction.0)
            .is_some_and(|txn| txn.mode().contains(Mode::WRITE));
        if !writes {
            return false;
        }
        // only the transaction that is responsible for the body may replace a mismatch
        if !is_match {
            return active.writer.is_none()
                && active.done_headers_queue.is_empty()
                && active.readers.is_empty();
        }
        true
    }

    pub fn is_writing_in_progress(&self, entry: EntryId) -> bool {
        self.entries
            .get(entry.0)
            .is_some_and(ActiveEntry::is_writing_in_progress)
    }
}
