//! The coordinator's single logical sequence.
//!
//! Every resumption of the coordinator goes through this queue: backend completions posted by
//! [`OperationCallback`]s, and the coordinator's own deferred work that must not run inline.

use std::fmt;

use tokio::sync::mpsc::error::{SendError, TryRecvError};
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel};

use crate::backend::{Backend, OpenedEntry};
use crate::cache_error::CacheResult;

use super::active_entry::EntryId;
use super::pending_op::OpId;
use super::transaction::TransactionId;

pub(crate) enum Task {
    /// The deferred admission pass of one entry.
    ProcessQueuedTransactions(EntryId),
    /// The backend finished opening or creating an entry.
    EntryOperationComplete {
        key: String,
        op: OpId,
        result: CacheResult<OpenedEntry>,
    },
    /// The backend finished dooming an entry.
    DoomComplete {
        key: String,
        op: OpId,
        result: CacheResult<()>,
    },
    /// The factory finished constructing the backend.
    BackendCreated {
        op: OpId,
        result: CacheResult<Box<dyn Backend>>,
    },
    /// Hands the construction result to the next queued backend request.
    ContinueBackendCreation { result: CacheResult<()> },
    /// A notification that must not be delivered from the middle of a queue mutation.
    Notify {
        transaction: TransactionId,
        result: CacheResult<()>,
    },
    /// Resumes the metadata writer that owns the given transaction.
    ResumeMetadataWriter {
        transaction: TransactionId,
        result: CacheResult<()>,
    },
}

impl Task {
    pub fn name(&self) -> &'static str {
        match self {
            Task::ProcessQueuedTransactions(_) => "process_queued_transactions",
            Task::EntryOperationComplete { .. } => "entry_operation_complete",
            Task::DoomComplete { .. } => "doom_complete",
            Task::BackendCreated { .. } => "backend_created",
            Task::ContinueBackendCreation { .. } => "continue_backend_creation",
            Task::Notify { .. } => "notify",
            Task::ResumeMetadataWriter { .. } => "resume_metadata_writer",
        }
    }

    /// Releases what a task carries when it can no longer be run.
    pub fn discard(self) {
        if let Task::EntryOperationComplete {
            key,
            result: Ok(opened),
            ..
        } = self
        {
            tracing::trace!(%key, "closing entry of a dropped completion");
            opened.entry.close();
        }
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

pub(crate) struct TaskQueue {
    sender: UnboundedSender<Task>,
    receiver: UnboundedReceiver<Task>,
}

impl TaskQueue {
    pub fn new() -> Self {
        let (sender, receiver) = unbounded_channel();
        Self { sender, receiver }
    }

    pub fn post(&self, task: Task) {
        if let Err(SendError(task)) = self.sender.send(task) {
            task.discard();
        }
    }

    pub fn callback<T>(
        &self,
        into_task: impl FnOnce(CacheResult<T>) -> Task + Send + 'static,
    ) -> OperationCallback<T> {
        OperationCallback {
            sender: self.sender.clone(),
            into_task: Box::new(into_task),
        }
    }

    pub fn try_next(&mut self) -> Option<Task> {
        match self.receiver.try_recv() {
            Ok(task) => Some(task),
            Err(TryRecvError::Empty | TryRecvError::Disconnected) => None,
        }
    }

    pub async fn next(&mut self) -> Option<Task> {
        self.receiver.recv().await
    }

    /// Stops accepting tasks and releases everything still queued.
    ///
    /// Completions posted afterwards are discarded by their callbacks.
    pub fn close(&mut self) {
        self.receiver.close();
        while let Ok(task) = self.receiver.try_recv() {
            task.discard();
        }
    }
}

/// The completion sink handed to backend operations that may finish asynchronously.
///
/// A backend that returns [`BackendPoll::Pending`](crate::backend::BackendPoll::Pending) keeps
/// the callback and calls [`complete`](Self::complete) exactly once, from any thread. The result
/// is posted onto the coordinator's sequence and processed the next time it runs. Once the
/// coordinator is gone, completing is a no-op and any entry carried by the result is closed.
pub struct OperationCallback<T> {
    sender: UnboundedSender<Task>,
    into_task: Box<dyn FnOnce(CacheResult<T>) -> Task + Send>,
}

impl<T> OperationCallback<T> {
    pub fn complete(self, result: CacheResult<T>) {
        let task = (self.into_task)(result);
        if let Err(SendError(task)) = self.sender.send(task) {
            tracing::trace!(task = task.name(), "coordinator is gone, dropping completion");
            task.discard();
        }
    }
}

impl<T> fmt::Debug for OperationCallback<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OperationCallback").finish_non_exhaustive()
    }
}
