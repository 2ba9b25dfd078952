use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use httpcache_service::backend::{
    Backend, BackendCallback, BackendFactory, BackendPoll, CompletionMode, DiskEntry,
    DoomCallback, EntryCallback, OpenedEntry, PrebuiltBackend,
};
use httpcache_service::cache_error::{CacheError, CacheResult};
use httpcache_service::coordinator::{
    Completion, CompletionSink, Coordinator, EntryId, Mode, Notification, TransactionId,
};
use httpcache_service::types::{Priority, RequestInfo, ResponseInfo};
use tokio::sync::mpsc::{UnboundedReceiver, unbounded_channel};

pub use httpcache_test as test;

type Log = Arc<Mutex<Vec<String>>>;

fn record(log: &Log, line: String) {
    log.lock().unwrap().push(line);
}

/// Backend state shared between the test and the backend owned by the coordinator.
///
/// Every backend call is recorded and stays pending until the test completes it.
#[derive(Clone, Default)]
pub struct Recorder {
    calls: Arc<Mutex<VecDeque<Call>>>,
    constructions: Arc<Mutex<VecDeque<BackendCallback>>>,
    factory_invocations: Arc<AtomicUsize>,
    log: Log,
}

impl Recorder {
    pub fn backend(&self) -> ManualBackend {
        ManualBackend {
            recorder: self.clone(),
        }
    }

    pub fn factory(&self) -> ManualFactory {
        ManualFactory {
            recorder: self.clone(),
        }
    }

    /// Takes the oldest backend call that was not completed yet.
    #[track_caller]
    pub fn next_call(&self) -> Call {
        self.calls
            .lock()
            .unwrap()
            .pop_front()
            .expect("no outstanding backend call")
    }

    pub fn outstanding_calls(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    pub fn factory_invocations(&self) -> usize {
        self.factory_invocations.load(Ordering::Relaxed)
    }

    /// Finishes the outstanding backend construction with a [`ManualBackend`].
    #[track_caller]
    pub fn finish_construction(&self) {
        let callback = self
            .constructions
            .lock()
            .unwrap()
            .pop_front()
            .expect("no backend under construction");
        callback.complete(Ok(Box::new(self.backend())));
    }

    /// Fails the outstanding backend construction.
    #[track_caller]
    pub fn fail_construction(&self, error: CacheError) {
        let callback = self
            .constructions
            .lock()
            .unwrap()
            .pop_front()
            .expect("no backend under construction");
        callback.complete(Err(error));
    }

    /// Returns and clears everything that happened to backend and entries so far.
    pub fn take_log(&self) -> String {
        std::mem::take(&mut *self.log.lock().unwrap()).join("\n")
    }
}

pub struct ManualFactory {
    recorder: Recorder,
}

impl BackendFactory for ManualFactory {
    fn create_backend(&mut self, callback: BackendCallback) -> BackendPoll<Box<dyn Backend>> {
        self.recorder
            .factory_invocations
            .fetch_add(1, Ordering::Relaxed);
        self.recorder
            .constructions
            .lock()
            .unwrap()
            .push_back(callback);
        BackendPoll::Pending
    }
}

pub struct ManualBackend {
    recorder: Recorder,
}

impl ManualBackend {
    fn entry_call(
        &mut self,
        op: &'static str,
        key: &str,
        callback: EntryCallback,
    ) -> BackendPoll<OpenedEntry> {
        self.push(op, key, CallKind::Entry(callback));
        BackendPoll::Pending
    }

    fn push(&self, op: &'static str, key: &str, kind: CallKind) {
        record(&self.recorder.log, format!("backend {op} {key}"));
        self.recorder.calls.lock().unwrap().push_back(Call {
            op,
            key: key.to_owned(),
            kind,
            log: self.recorder.log.clone(),
        });
    }
}

impl Backend for ManualBackend {
    fn open_entry(
        &mut self,
        key: &str,
        _priority: Priority,
        callback: EntryCallback,
    ) -> BackendPoll<OpenedEntry> {
        self.entry_call("open", key, callback)
    }

    fn create_entry(
        &mut self,
        key: &str,
        _priority: Priority,
        callback: EntryCallback,
    ) -> BackendPoll<OpenedEntry> {
        self.entry_call("create", key, callback)
    }

    fn open_or_create_entry(
        &mut self,
        key: &str,
        _priority: Priority,
        callback: EntryCallback,
    ) -> BackendPoll<OpenedEntry> {
        self.entry_call("open_or_create", key, callback)
    }

    fn doom_entry(
        &mut self,
        key: &str,
        _priority: Priority,
        callback: DoomCallback,
    ) -> BackendPoll<()> {
        self.push("doom", key, CallKind::Doom(callback));
        BackendPoll::Pending
    }

    fn entry_count(&self) -> usize {
        0
    }

    fn max_file_size(&self) -> u64 {
        u64::MAX
    }
}

enum CallKind {
    Entry(EntryCallback),
    Doom(DoomCallback),
}

/// A backend call the test has to complete.
pub struct Call {
    pub op: &'static str,
    pub key: String,
    kind: CallKind,
    log: Log,
}

impl Call {
    /// Completes an open with an existing entry.
    pub fn opened(self) {
        self.finish_entry(true)
    }

    /// Completes a create with a new entry.
    pub fn created(self) {
        self.finish_entry(false)
    }

    fn finish_entry(self, opened: bool) {
        let CallKind::Entry(callback) = self.kind else {
            panic!("{} does not hand out an entry", self.op);
        };
        let entry = TestEntry {
            key: self.key,
            log: self.log,
            response_info: None,
            metadata: None,
        };
        callback.complete(Ok(OpenedEntry {
            entry: Box::new(entry),
            opened,
        }));
    }

    /// Completes a doom successfully.
    pub fn doomed(self) {
        let CallKind::Doom(callback) = self.kind else {
            panic!("{} is not a doom", self.op);
        };
        callback.complete(Ok(()));
    }

    pub fn fail(self, error: CacheError) {
        match self.kind {
            CallKind::Entry(callback) => callback.complete(Err(error)),
            CallKind::Doom(callback) => callback.complete(Err(error)),
        }
    }
}

/// An entry that logs what is done with it.
pub struct TestEntry {
    key: String,
    log: Log,
    response_info: Option<ResponseInfo>,
    metadata: Option<Bytes>,
}

impl DiskEntry for TestEntry {
    fn key(&self) -> &str {
        &self.key
    }

    fn doom(&mut self) {
        record(&self.log, format!("entry doom {}", self.key));
    }

    fn close(self: Box<Self>) {
        record(&self.log, format!("entry close {}", self.key));
    }

    fn cancel_sparse_io(&mut self) {
        record(&self.log, format!("entry cancel_sparse_io {}", self.key));
    }

    fn read_response_info(&self) -> CacheResult<Option<ResponseInfo>> {
        Ok(self.response_info.clone())
    }

    fn write_response_info(&mut self, info: &ResponseInfo) -> CacheResult<()> {
        record(
            &self.log,
            format!("entry write_info {} truncated={}", self.key, info.truncated),
        );
        self.response_info = Some(info.clone());
        Ok(())
    }

    fn read_metadata(&self) -> CacheResult<Option<Bytes>> {
        Ok(self.metadata.clone())
    }

    fn write_metadata(&mut self, data: &[u8]) -> CacheResult<()> {
        record(
            &self.log,
            format!("entry write_metadata {} {:?}", self.key, String::from_utf8_lossy(data)),
        );
        self.metadata = Some(Bytes::copy_from_slice(data));
        Ok(())
    }
}

/// A coordinator over a [`ManualBackend`], with named transactions sharing one sink.
pub struct TestCache {
    pub coordinator: Coordinator,
    pub recorder: Recorder,
    sink: CompletionSink,
    notifications: UnboundedReceiver<Notification>,
    names: HashMap<TransactionId, &'static str>,
}

impl TestCache {
    /// A cache whose backend is available right away.
    pub fn new() -> Self {
        let recorder = Recorder::default();
        let factory = PrebuiltBackend::new(recorder.backend(), CompletionMode::Sync);
        Self::with_coordinator(Coordinator::new(factory), recorder)
    }

    /// A cache whose backend is built once the test calls
    /// [`Recorder::finish_construction`].
    pub fn with_pending_backend() -> Self {
        let recorder = Recorder::default();
        let coordinator = Coordinator::new(recorder.factory());
        Self::with_coordinator(coordinator, recorder)
    }

    fn with_coordinator(coordinator: Coordinator, recorder: Recorder) -> Self {
        test::setup();
        let (sink, notifications) = unbounded_channel();
        Self {
            coordinator,
            recorder,
            sink,
            notifications,
            names: HashMap::new(),
        }
    }

    /// Registers a `GET` transaction for `key`.
    pub fn transaction(&mut self, name: &'static str, key: &str, mode: Mode) -> TransactionId {
        self.transaction_with(name, RequestInfo::get(key), mode)
    }

    pub fn transaction_with(
        &mut self,
        name: &'static str,
        request: RequestInfo,
        mode: Mode,
    ) -> TransactionId {
        let id = self
            .coordinator
            .create_transaction(Priority::Medium, request, self.sink.clone());
        self.coordinator
            .transaction_mut(id)
            .unwrap()
            .set_mode(mode);
        self.names.insert(id, name);
        id
    }

    pub fn entry_of(&self, transaction: TransactionId) -> Option<EntryId> {
        self.coordinator.transaction(transaction).unwrap().entry()
    }

    /// Runs every queued task and renders the notifications that were delivered, in order.
    pub fn drain(&mut self) -> String {
        self.coordinator.run_until_idle();
        let mut lines = Vec::new();
        while let Ok(notification) = self.notifications.try_recv() {
            lines.push(self.describe(notification.transaction, &notification.result));
        }
        lines.join("\n")
    }

    /// Renders a synchronous result the way [`drain`](Self::drain) renders notifications.
    pub fn ready(&self, transaction: TransactionId, completion: Completion) -> String {
        match completion {
            Completion::Ready(result) => self.describe(transaction, &result),
            Completion::Pending => format!("{}: pending", self.names[&transaction]),
        }
    }

    fn describe(&self, transaction: TransactionId, result: &CacheResult<()>) -> String {
        let name = self.names.get(&transaction).copied().unwrap_or("?");
        match result {
            Ok(()) => format!("{name}: ok"),
            Err(error) => format!("{name}: {error}"),
        }
    }

    /// Opens or creates `key` for `writer`, admits it and installs it as the writer.
    pub fn install_writer(&mut self, key: &str, writer: TransactionId) -> EntryId {
        assert!(self.coordinator.create_entry(key, writer).is_pending());
        self.recorder.next_call().created();
        self.drain();
        let entry = self.entry_of(writer).unwrap();
        self.admit(entry, writer);
        assert_eq!(
            self.coordinator.done_with_response_headers(entry, writer, false),
            Completion::Ready(Ok(()))
        );
        entry
    }

    /// Adds `transaction` to `entry` and runs until it is admitted.
    pub fn admit(&mut self, entry: EntryId, transaction: TransactionId) {
        assert!(
            self.coordinator
                .add_transaction_to_entry(entry, transaction)
                .is_pending()
        );
        let name = self.names[&transaction];
        assert_eq!(self.drain(), format!("{name}: ok"));
        assert_eq!(
            self.coordinator.entry(entry).unwrap().headers_transaction(),
            Some(transaction)
        );
    }

    /// Asserts the writer/reader invariant of `entry`.
    pub fn check_roles(&self, entry: EntryId) {
        let Some(active) = self.coordinator.entry(entry) else {
            return;
        };
        if let Some(writer) = active.writer() {
            assert!(!active.readers().any(|reader| reader == writer));
            assert_ne!(active.headers_transaction(), Some(writer));
        }
    }
}

/// A `200 OK` response that can be resumed.
pub fn resumable_response() -> ResponseInfo {
    let mut response = ResponseInfo::new(200, chrono::Utc::now());
    response.etag = Some("\"v1\"".into());
    response
}
