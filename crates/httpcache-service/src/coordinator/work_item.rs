use tokio::sync::oneshot;

use crate::cache_error::CacheResult;

use super::transaction::TransactionId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum Operation {
    CreateBackend,
    OpenEntry,
    CreateEntry,
    OpenOrCreateEntry,
    DoomEntry,
}

impl Operation {
    pub fn as_tag(self) -> &'static str {
        match self {
            Operation::CreateBackend => "create_backend",
            Operation::OpenEntry => "open_entry",
            Operation::CreateEntry => "create_entry",
            Operation::OpenOrCreateEntry => "open_or_create_entry",
            Operation::DoomEntry => "doom_entry",
        }
    }
}

/// One request waiting on a backend operation.
///
/// The requester can be a transaction, the transaction whose record receives the entry, and/or an
/// external callback. Withdrawing a transaction clears those, which makes the item invalid.
#[derive(Debug)]
pub(super) struct WorkItem {
    pub operation: Operation,
    pub transaction: Option<TransactionId>,
    pub entry_slot: Option<TransactionId>,
    pub callback: Option<oneshot::Sender<CacheResult<()>>>,
}

impl WorkItem {
    pub fn new(operation: Operation, transaction: Option<TransactionId>) -> Self {
        Self {
            operation,
            transaction,
            entry_slot: None,
            callback: None,
        }
    }

    /// An item whose requester receives the entry on success.
    pub fn with_entry_slot(operation: Operation, transaction: TransactionId) -> Self {
        Self {
            entry_slot: Some(transaction),
            ..Self::new(operation, Some(transaction))
        }
    }

    pub fn with_callback(
        operation: Operation,
        callback: Option<oneshot::Sender<CacheResult<()>>>,
    ) -> Self {
        Self {
            callback,
            ..Self::new(operation, None)
        }
    }

    pub fn matches(&self, transaction: TransactionId) -> bool {
        self.transaction == Some(transaction)
    }

    pub fn is_valid(&self) -> bool {
        self.transaction.is_some() || self.entry_slot.is_some() || self.callback.is_some()
    }

    /// Withdraws the requesting transaction and its entry slot.
    pub fn withdraw(&mut self) {
        self.transaction = None;
        self.entry_slot = None;
    }

    /// Runs the external callback, if this item has one.
    pub fn do_callback(&mut self, result: &CacheResult<()>) -> bool {
        match self.callback.take() {
            Some(callback) => {
                // the caller may have stopped waiting
                let _ = callback.send(result.clone());
                true
            }
            None => false,
        }
    }
}
