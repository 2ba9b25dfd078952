use std::collections::HashMap;
use std::time::{Duration, Instant};

use chrono::Utc;
use httpcache_service::cache_error::{CacheError, CacheResult};
use httpcache_service::coordinator::{
    Completion, CompletionSink, Coordinator, EntryId, Mode, Notification, TransactionId,
};
use httpcache_service::types::{Priority, RequestInfo, ResponseInfo};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use sketches_ddsketch::DDSketch;
use tokio::sync::mpsc::{UnboundedReceiver, unbounded_channel};

#[derive(Debug, Deserialize, Serialize)]
pub struct WorkloadsConfig {
    pub workloads: Vec<Workload>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Workload {
    /// The number of transactions in flight at any time.
    pub concurrency: usize,
    /// The number of distinct URLs the transactions pick from.
    pub keys: usize,
    /// The share of transactions that store the response they get.
    #[serde(default = "default_write_ratio")]
    pub write_ratio: f64,
    /// The share of writing transactions whose server response does not match the stored one.
    #[serde(default)]
    pub validate_ratio: f64,
    /// The size of the simulated response bodies.
    #[serde(default)]
    pub body_size: u64,
}

fn default_write_ratio() -> f64 {
    0.5
}

/// The coordinator call a simulated transaction waits for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    Start,
    GetBackend,
    Open,
    Create,
    AddToEntry,
    Headers,
}

struct Simulated {
    key: String,
    writes: bool,
    step: Step,
    started: Instant,
    transaction: sentry::TransactionOrSpan,
}

enum Next {
    Wait(Completion),
    Restart,
    Finished,
}

/// Many simulated HTTP cache transactions sharing one coordinator.
pub struct Simulation {
    pub coordinator: Coordinator,
    workload: Workload,
    rng: StdRng,
    sink: CompletionSink,
    notifications: UnboundedReceiver<Notification>,
    active: HashMap<TransactionId, Simulated>,
    pub durations: DDSketch,
    pub races: usize,
}

impl Simulation {
    pub fn new(coordinator: Coordinator, workload: Workload) -> Self {
        let (sink, notifications) = unbounded_channel();
        Self {
            coordinator,
            workload,
            rng: StdRng::from_os_rng(),
            sink,
            notifications,
            active: HashMap::new(),
            durations: DDSketch::default(),
            races: 0,
        }
    }

    pub fn active(&self) -> usize {
        self.active.len()
    }

    /// Starts as many transactions as are missing to reach the workload's concurrency.
    ///
    /// Returns how many were started. Some of them may have finished already.
    pub fn fill(&mut self) -> usize {
        let missing = self.workload.concurrency.saturating_sub(self.active.len());
        for _ in 0..missing {
            let key = format!(
                "https://stress.invalid/{}",
                self.rng.random_range(0..self.workload.keys.max(1))
            );
            let writes = self.rng.random_bool(self.workload.write_ratio.clamp(0.0, 1.0));
            let ctx = sentry::TransactionContext::new("stresstest", "cache.transaction");
            let simulated = Simulated {
                key,
                writes,
                step: Step::Start,
                started: Instant::now(),
                transaction: sentry::start_transaction(ctx).into(),
            };
            let id = self.register(simulated);
            self.resume(id, Ok(()));
        }
        missing
    }

    /// Delivers every notification that arrived so far.
    ///
    /// Returns whether there was any.
    pub fn deliver(&mut self) -> bool {
        let mut delivered = false;
        while let Ok(Notification {
            transaction,
            result,
        }) = self.notifications.try_recv()
        {
            self.resume(transaction, result);
            delivered = true;
        }
        delivered
    }

    fn register(&mut self, simulated: Simulated) -> TransactionId {
        let id = self.coordinator.create_transaction(
            Priority::Medium,
            RequestInfo::get(simulated.key.clone()),
            self.sink.clone(),
        );
        let mode = if simulated.writes {
            Mode::READ_WRITE
        } else {
            Mode::READ
        };
        if let Some(txn) = self.coordinator.transaction_mut(id) {
            txn.set_mode(mode);
        }
        self.active.insert(id, simulated);
        id
    }

    fn resume(&mut self, mut id: TransactionId, mut result: CacheResult<()>) {
        loop {
            let completion = match self.step(id, result) {
                Next::Wait(completion) => completion,
                Next::Restart => {
                    self.races += 1;
                    id = self.restart(id);
                    Completion::Ready(Ok(()))
                }
                Next::Finished => {
                    self.finish(id);
                    return;
                }
            };
            match completion {
                Completion::Ready(next) => result = next,
                Completion::Pending => return,
            }
        }
    }

    fn step(&mut self, id: TransactionId, result: CacheResult<()>) -> Next {
        let Some(simulated) = self.active.get_mut(&id) else {
            return Next::Finished;
        };
        let coordinator = &mut self.coordinator;

        match (simulated.step, result) {
            (Step::Start, _) => {
                simulated.step = Step::GetBackend;
                Next::Wait(coordinator.get_backend_for_transaction(id))
            }
            (Step::GetBackend, Ok(())) => {
                simulated.step = Step::Open;
                Next::Wait(coordinator.open_entry(&simulated.key, id))
            }
            (Step::Open, Err(CacheError::NotFound)) if simulated.writes => {
                simulated.step = Step::Create;
                Next::Wait(coordinator.create_entry(&simulated.key, id))
            }
            (Step::Open | Step::Create, Ok(())) => {
                let Some(entry) = entry_of(coordinator, id) else {
                    return Next::Restart;
                };
                simulated.step = Step::AddToEntry;
                Next::Wait(coordinator.add_transaction_to_entry(entry, id))
            }
            (Step::AddToEntry, Ok(())) => {
                let Some(entry) = entry_of(coordinator, id) else {
                    return Next::Restart;
                };
                let mismatch = self.rng.random_bool(self.workload.validate_ratio.clamp(0.0, 1.0));
                if simulated.writes && mismatch {
                    // the server sent something else, so the stored response is useless
                    coordinator.doom_entry_validation_no_match(entry);
                    return Next::Restart;
                }
                if simulated.writes
                    && coordinator.can_transaction_write_response_headers(entry, id, false, true)
                {
                    let mut response = ResponseInfo::new(200, Utc::now());
                    response.content_length = Some(self.workload.body_size);
                    let written = coordinator
                        .entry_mut(entry)
                        .and_then(|active| active.disk_entry_mut())
                        .map(|disk_entry| disk_entry.write_response_info(&response));
                    if let Some(txn) = coordinator.transaction_mut(id) {
                        txn.set_response_info(Some(response));
                    }
                    if let Some(Err(error)) = written {
                        tracing::warn!(%error, "failed to write response");
                    }
                }
                simulated.step = Step::Headers;
                Next::Wait(coordinator.done_with_response_headers(entry, id, false))
            }
            (Step::Headers, Ok(())) => {
                if let Some(entry) = entry_of(coordinator, id) {
                    coordinator.done_with_entry(entry, id, false, false);
                }
                Next::Finished
            }
            (_, Err(CacheError::CacheRace | CacheError::CreateFailure)) => Next::Restart,
            (step, Err(error)) => {
                // a miss or a failure means going to the network without the cache
                tracing::trace!(?step, %error, "transaction bypasses the cache");
                Next::Finished
            }
        }
    }

    /// Replaces a transaction that lost a race with a fresh one for the same key.
    fn restart(&mut self, id: TransactionId) -> TransactionId {
        self.coordinator.release_transaction(id);
        match self.active.remove(&id) {
            Some(mut simulated) => {
                simulated.step = Step::Start;
                self.register(simulated)
            }
            None => id,
        }
    }

    fn finish(&mut self, id: TransactionId) {
        self.coordinator.release_transaction(id);
        if let Some(simulated) = self.active.remove(&id) {
            self.durations.add(simulated.started.elapsed().as_secs_f64());
            simulated.transaction.finish();
        }
    }

    /// The time the oldest running transaction has been waiting.
    pub fn oldest(&self) -> Duration {
        self.active
            .values()
            .map(|simulated| simulated.started.elapsed())
            .max()
            .unwrap_or_default()
    }
}

fn entry_of(coordinator: &Coordinator, id: TransactionId) -> Option<EntryId> {
    coordinator.transaction(id).and_then(|txn| txn.entry())
}
