use bitflags::bitflags;
use tokio::sync::mpsc::UnboundedSender;

use crate::backend::DiskEntry;
use crate::cache_error::{CacheError, CacheResult};
use crate::types::{LoadState, Priority, RequestInfo, ResponseInfo};
use crate::utils::arena::Index;

use super::active_entry::EntryId;

bitflags! {
    /// How a transaction uses its cache entry.
    pub struct Mode: u8 {
        /// Caching is disabled, or writing was aborted.
        const NONE = 0;
        const READ_META = 1 << 0;
        const READ_DATA = 1 << 1;
        const READ = Self::READ_META.bits | Self::READ_DATA.bits;
        const WRITE = 1 << 2;
        const READ_WRITE = Self::READ.bits | Self::WRITE.bits;
        /// Read the stored headers and update them, but leave the body alone.
        const UPDATE = Self::READ_META.bits | Self::WRITE.bits;
    }
}

impl Default for Mode {
    fn default() -> Self {
        Mode::NONE
    }
}

/// A handle to a transaction registered with a [`Coordinator`](super::Coordinator).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TransactionId(pub(super) Index);

/// The result of an operation that returned [`Completion::Pending`](super::Completion::Pending).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub transaction: TransactionId,
    pub result: CacheResult<()>,
}

/// Where the coordinator delivers a transaction's [`Notification`]s.
///
/// Many transactions may share one sink, which preserves the order of their notifications.
pub type CompletionSink = UnboundedSender<Notification>;

#[derive(Debug)]
pub(super) enum Sink {
    External(CompletionSink),
    /// The transaction is driven by a metadata writer inside the coordinator.
    MetadataWriter,
}

/// The coordinator's record of one HTTP transaction.
///
/// The transaction's driver owns the request/response state and keeps it current through
/// [`Coordinator::transaction_mut`](super::Coordinator::transaction_mut). The coordinator owns
/// the bookkeeping that relates the transaction to its entry.
#[derive(Debug)]
pub struct Transaction {
    priority: Priority,
    request: RequestInfo,
    mode: Mode,
    response: Option<ResponseInfo>,
    partial: bool,
    truncated: bool,
    done_reading: bool,
    load_state: LoadState,
    pub(super) entry: Option<EntryId>,
    pub(super) cache_pending: bool,
    pub(super) awaiting_completion: bool,
    pub(super) validating_cannot_proceed: bool,
    pub(super) sink: Sink,
}

impl Transaction {
    pub(super) fn new(priority: Priority, request: RequestInfo, sink: Sink) -> Self {
        Self {
            priority,
            request,
            mode: Mode::NONE,
            response: None,
            partial: false,
            truncated: false,
            done_reading: false,
            load_state: LoadState::Idle,
            entry: None,
            cache_pending: false,
            awaiting_completion: false,
            validating_cannot_proceed: false,
            sink,
        }
    }

    pub fn priority(&self) -> Priority {
        self.priority
    }

    pub fn request(&self) -> &RequestInfo {
        &self.request
    }

    pub fn method(&self) -> &str {
        &self.request.method
    }

    pub fn key(&self) -> &str {
        &self.request.key
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn set_mode(&mut self, mode: Mode) {
        self.mode = mode;
    }

    pub fn response_info(&self) -> Option<&ResponseInfo> {
        self.response.as_ref()
    }

    pub fn set_response_info(&mut self, response: Option<ResponseInfo>) {
        self.response = response;
    }

    /// The entry this transaction was handed, if any.
    pub fn entry(&self) -> Option<EntryId> {
        self.entry
    }

    pub fn is_partial(&self) -> bool {
        self.partial
    }

    /// Marks this as a range request.
    pub fn set_partial(&mut self, partial: bool) {
        self.partial = partial;
    }

    pub fn is_truncated(&self) -> bool {
        self.truncated
    }

    /// Records that the whole response body was received.
    pub fn set_done_reading(&mut self, done_reading: bool) {
        self.done_reading = done_reading;
    }

    pub fn load_state(&self) -> LoadState {
        self.load_state
    }

    /// Records what the network side of this transaction is waiting for.
    pub fn set_load_state(&mut self, load_state: LoadState) {
        self.load_state = load_state;
    }

    /// Whether the transaction is waiting on the coordinator.
    pub fn is_cache_pending(&self) -> bool {
        self.cache_pending
    }

    /// Returns and clears the flag set when the entry was pulled from under a
    /// headers-validation transaction.
    ///
    /// Such a transaction has lost its entry and has to restart its cache lookup.
    pub fn take_validating_cannot_proceed(&mut self) -> bool {
        std::mem::take(&mut self.validating_cannot_proceed)
    }

    /// Marks the stored response as truncated so it can be resumed later.
    ///
    /// Returns whether the flag was actually written. Fails if the response can not be resumed.
    pub(super) fn add_truncated_flag(&mut self, disk_entry: &mut dyn DiskEntry) -> CacheResult<bool> {
        // sparse entries are never marked as truncated
        if self.partial && !self.truncated {
            return Ok(false);
        }
        if !self.can_resume() {
            return Err(CacheError::Failed);
        }
        // the whole resource may have been received already
        if self.done_reading {
            return Ok(false);
        }

        let Some(response) = self.response.as_mut() else {
            return Err(CacheError::Failed);
        };
        response.truncated = true;
        disk_entry.write_response_info(response)?;
        self.truncated = true;
        Ok(true)
    }

    fn can_resume(&self) -> bool {
        self.request.method == "GET"
            && self
                .response
                .as_ref()
                .is_some_and(|response| response.status == 200 && response.has_strong_validator())
    }

    /// Whether the response may be written to the entry by this transaction.
    pub(super) fn is_valid_response_for_writer(&self, is_partial: bool) -> bool {
        match &self.response {
            None => false,
            Some(response) => is_partial || response.status == 200 || response.status == 304,
        }
    }

    pub(super) fn set_validating_cannot_proceed(&mut self) {
        self.validating_cannot_proceed = true;
        self.entry = None;
        self.load_state = LoadState::Idle;
    }

    pub(super) fn reset_cache_pending_state(&mut self) {
        self.cache_pending = false;
    }

    /// What a transaction queued behind this one, the writer, is waiting for.
    pub fn writer_load_state(&self) -> LoadState {
        match self.load_state {
            LoadState::Idle | LoadState::WaitingForCache if self.entry.is_some() => LoadState::Idle,
            LoadState::Idle | LoadState::WaitingForCache => LoadState::WaitingForCache,
            network => network,
        }
    }
}
