use bytes::Bytes;
use chrono::{DateTime, Utc};
use url::Url;

use crate::cache_error::{CacheError, CacheResult};
use crate::cache_key;
use crate::types::{Priority, RequestInfo};

use super::transaction::{Mode, Sink};
use super::{Completion, Coordinator, EntryId, TransactionId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    GetBackend,
    GetBackendComplete,
    OpenEntryComplete,
    AddToEntryComplete,
    DoneHeadersComplete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Written,
    Mismatch,
    Error,
}

impl Outcome {
    fn as_tag(self) -> &'static str {
        match self {
            Outcome::Written => "written",
            Outcome::Mismatch => "mismatch",
            Outcome::Error => "error",
        }
    }
}

/// Attaches metadata to a stored response, as a reader of its entry.
///
/// The writer drives an internal transaction through the same steps as any other reader. It
/// gives up on the first error, including cache races.
#[derive(Debug)]
pub(super) struct MetadataWriter {
    key: String,
    expected_response_time: DateTime<Utc>,
    data: Bytes,
    state: State,
}

impl Coordinator {
    /// Stores `data` as metadata of the response cached for `url`.
    ///
    /// The metadata is only written if the stored response is the one that was received at
    /// `expected_response_time`. This happens in the background and reports nothing.
    pub fn write_metadata(
        &mut self,
        url: &Url,
        priority: Priority,
        expected_response_time: DateTime<Utc>,
        data: &[u8],
    ) {
        if data.is_empty() {
            return;
        }
        let key = cache_key::generate(url, 0);
        let mut request = RequestInfo::get(key.clone());
        request.only_from_cache = true;

        let transaction = self.insert_transaction(priority, request, Sink::MetadataWriter);
        if let Some(txn) = self.transactions.get_mut(transaction.0) {
            txn.set_mode(Mode::READ);
        }
        let writer = MetadataWriter {
            key,
            expected_response_time,
            data: Bytes::copy_from_slice(data),
            state: State::GetBackend,
        };
        self.metadata_writers.insert(transaction, writer);
        self.resume_metadata_writer(transaction, Ok(()));
    }

    pub(super) fn resume_metadata_writer(
        &mut self,
        transaction: TransactionId,
        result: CacheResult<()>,
    ) {
        let Some(mut writer) = self.metadata_writers.remove(&transaction) else {
            return;
        };

        let mut result = result;
        loop {
            if let Err(error) = &result {
                tracing::debug!(key = %writer.key, %error, "metadata writer failed");
                self.finish_metadata_writer(transaction, Outcome::Error);
                return;
            }

            let completion = match writer.state {
                State::GetBackend => {
                    writer.state = State::GetBackendComplete;
                    self.get_backend_for_transaction(transaction)
                }
                State::GetBackendComplete => {
                    writer.state = State::OpenEntryComplete;
                    self.open_entry(&writer.key, transaction)
                }
                State::OpenEntryComplete => {
                    let Some(entry) = self.writer_entry(transaction) else {
                        self.finish_metadata_writer(transaction, Outcome::Error);
                        return;
                    };
                    writer.state = State::AddToEntryComplete;
                    self.add_transaction_to_entry(entry, transaction)
                }
                State::AddToEntryComplete => {
                    let Some(entry) = self.writer_entry(transaction) else {
                        self.finish_metadata_writer(transaction, Outcome::Error);
                        return;
                    };
                    let stored = self
                        .entries
                        .get(entry.0)
                        .and_then(|active| active.disk_entry())
                        .and_then(|disk_entry| disk_entry.read_response_info().ok().flatten());
                    let matches = stored.is_some_and(|response| {
                        response.response_time == writer.expected_response_time
                    });
                    if !matches {
                        self.done_with_entry(entry, transaction, false, false);
                        self.finish_metadata_writer(transaction, Outcome::Mismatch);
                        return;
                    }
                    writer.state = State::DoneHeadersComplete;
                    self.done_with_response_headers(entry, transaction, false)
                }
                State::DoneHeadersComplete => {
                    let Some(entry) = self.writer_entry(transaction) else {
                        self.finish_metadata_writer(transaction, Outcome::Error);
                        return;
                    };
                    let written = match self
                        .entries
                        .get_mut(entry.0)
                        .and_then(|active| active.disk_entry_mut())
                    {
                        Some(disk_entry) => disk_entry.write_metadata(&writer.data),
                        None => Err(CacheError::Failed),
                    };
                    self.done_with_entry(entry, transaction, false, false);
                    let outcome = match written {
                        Ok(()) => Outcome::Written,
                        Err(_) => Outcome::Error,
                    };
                    self.finish_metadata_writer(transaction, outcome);
                    return;
                }
            };

            match completion {
                Completion::Ready(next) => result = next,
                Completion::Pending => {
                    self.metadata_writers.insert(transaction, writer);
                    return;
                }
            }
        }
    }

    fn writer_entry(&self, transaction: TransactionId) -> Option<EntryId> {
        self.transactions
            .get(transaction.0)
            .and_then(|txn| txn.entry())
    }

    fn finish_metadata_writer(&mut self, transaction: TransactionId, outcome: Outcome) {
        tracing::trace!(?transaction, outcome = outcome.as_tag(), "metadata writer finished");
        metric!(counter("metadata_writer.finished") += 1, "outcome" => outcome.as_tag());
        self.release_transaction(transaction);
    }
}
