//! Public surface of the scheduling subsystem.
//!
//! [`Scheduler`] owns the queue, the cancellation registry, the live index
//! used for category cancellation, and the processor. Submission is
//! synchronous and returns as soon as the request is queued.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::{Serialize, Serializer};
use tokio::sync::{broadcast, oneshot};
use tokio_util::sync::CancellationToken;

use crate::config::SchedulerConfig;
use crate::error::{Result, SchedulerError};
use crate::events::{RequestEvent, RequestEventBus, RequestEventPayload};
use crate::processor::{Processor, RequestLifecycle};
use crate::queue::{PriorityQueue, QueuedItem};
use crate::registry::CancellationRegistry;
use crate::request::{
    Priority, Request, RequestId, RequestOutcome, RequestState, SubmitOptions, WorkUnit,
};

#[derive(Clone, Debug)]
struct LiveEntry {
    category: Arc<str>,
    priority: Priority,
    state: RequestState,
}

/// Every request between submission and its terminal state.
struct LiveIndex {
    entries: Mutex<HashMap<RequestId, LiveEntry>>,
    registry: Arc<CancellationRegistry>,
}

impl fmt::Debug for LiveIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut debug = f.debug_struct("LiveIndex");
        match self.entries.try_lock() {
            Ok(entries) => {
                debug.field("live", &entries.len());
            }
            Err(_) => {
                debug.field("entries", &"<locked>");
            }
        }
        debug.field("registry", &self.registry).finish()
    }
}

impl LiveIndex {
    fn new(registry: Arc<CancellationRegistry>) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            registry,
        }
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<RequestId, LiveEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Claims `request`'s id. Fails if another live request already holds it.
    fn admit(&self, request: &Request) -> bool {
        let mut entries = self.entries();
        if entries.contains_key(&request.id) {
            return false;
        }
        if !self
            .registry
            .register(request.id.clone(), request.token().clone())
        {
            return false;
        }
        entries.insert(
            request.id.clone(),
            LiveEntry {
                category: Arc::clone(&request.category),
                priority: request.priority,
                state: RequestState::Queued,
            },
        );
        true
    }

    fn contains(&self, id: &RequestId) -> bool {
        self.entries().contains_key(id)
    }

    fn category(&self, id: &RequestId) -> Option<String> {
        self.entries().get(id).map(|entry| entry.category.to_string())
    }

    fn state(&self, id: &RequestId) -> Option<RequestState> {
        self.entries().get(id).map(|entry| entry.state)
    }

    fn len(&self) -> usize {
        self.entries().len()
    }

    fn running(&self) -> Vec<(RequestId, Priority)> {
        self.entries()
            .iter()
            .filter(|(_, entry)| entry.state == RequestState::Running)
            .map(|(id, entry)| (id.clone(), entry.priority))
            .collect()
    }
}

impl RequestLifecycle for LiveIndex {
    fn on_started(&self, id: &RequestId) {
        if let Some(entry) = self.entries().get_mut(id) {
            entry.state = RequestState::Running;
        }
    }

    fn on_finished(&self, id: &RequestId, state: RequestState) {
        let removed = self.entries().remove(id).is_some();
        self.registry.unregister(id);
        if removed {
            tracing::trace!(target: "inferlane::scheduler", request = %id, ?state, "request retired");
        }
    }
}

/// Read-only snapshot for dashboards and telemetry.
#[derive(Clone, Debug, Serialize)]
pub struct SchedulerStatus {
    /// Requests waiting in the queue.
    pub pending: usize,
    /// Executions currently holding a slot.
    pub active: usize,
    /// Queued plus running requests.
    pub live: usize,
    #[serde(rename = "avg_latency_ms", serialize_with = "serialize_millis")]
    pub avg_latency: Duration,
    pub error_rate: f64,
    pub limit: usize,
    pub ceiling: usize,
    pub processed: u64,
    pub errors: u64,
    pub adaptive: bool,
    pub stopped: bool,
}

impl SchedulerStatus {
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

fn serialize_millis<S>(value: &Duration, serializer: S) -> std::result::Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_u64(crate::processor::duration_ms(*value))
}

/// Priority scheduler in front of a capacity-limited backend.
///
/// Must be created inside a Tokio runtime: construction starts the dispatch
/// loop. Dropping the scheduler cancels everything it owns; call
/// [`Scheduler::stop`] to also wait for in-flight work.
pub struct Scheduler {
    config: SchedulerConfig,
    root: CancellationToken,
    queue: Arc<PriorityQueue>,
    registry: Arc<CancellationRegistry>,
    live: Arc<LiveIndex>,
    events: RequestEventBus,
    processor: Processor,
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("queue", &self.queue)
            .field("live", &self.live)
            .field("processor", &self.processor)
            .field("events", &self.events)
            .finish()
    }
}

impl Scheduler {
    pub fn new(config: SchedulerConfig) -> Self {
        let root = CancellationToken::new();
        let queue = Arc::new(PriorityQueue::new());
        let registry = Arc::new(CancellationRegistry::new());
        let live = Arc::new(LiveIndex::new(Arc::clone(&registry)));
        let events = RequestEventBus::new(config.events.channel_capacity);

        let processor = Processor::start(
            config.processor.clone(),
            config.adaptive.clone(),
            Arc::clone(&queue),
            events.clone(),
            Arc::clone(&live) as Arc<dyn RequestLifecycle>,
            root.clone(),
        );

        tracing::info!(
            target: "inferlane::scheduler",
            initial = config.processor.clamped_initial(),
            ceiling = config.processor.max_concurrency,
            adaptive = config.adaptive.enabled,
            "scheduler started"
        );

        Self {
            config,
            root,
            queue,
            registry,
            live,
            events,
            processor,
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Queues `work` and returns its id.
    ///
    /// Requests named in `supersedes` are cancelled first; those still queued
    /// never run. Fails with [`SchedulerError::ShutDown`] after
    /// [`Scheduler::stop`] and with [`SchedulerError::DuplicateId`] if an
    /// explicit id is already live.
    pub fn submit<W: WorkUnit>(&self, work: W, options: SubmitOptions) -> Result<RequestId> {
        self.submit_shared(Arc::new(work), options)
    }

    /// Like [`Scheduler::submit`] for work that is already shared.
    pub fn submit_shared(
        &self,
        work: Arc<dyn WorkUnit>,
        options: SubmitOptions,
    ) -> Result<RequestId> {
        if self.root.is_cancelled() {
            return Err(SchedulerError::ShutDown);
        }
        if let Some(id) = &options.id
            && self.live.contains(id)
        {
            return Err(SchedulerError::DuplicateId(id.to_string()));
        }

        let request = Request::new(work, options, &self.root);
        let id = request.id.clone();

        for stale in &request.supersedes {
            if stale == &id {
                continue;
            }
            if self.withdraw(stale) {
                tracing::debug!(
                    target: "inferlane::scheduler",
                    superseded = %stale,
                    by = %id,
                    "request superseded"
                );
                self.events.publish_for(
                    stale,
                    RequestEventPayload::Superseded {
                        superseded: stale.clone(),
                        by: id.clone(),
                    },
                );
            }
        }

        if !self.live.admit(&request) {
            return Err(SchedulerError::DuplicateId(id.to_string()));
        }

        let priority = request.priority;
        let category = request.category.to_string();
        self.queue.push(request);

        // A stop that raced this submission may have drained the queue already.
        if self.root.is_cancelled() {
            if let Some(request) = self.queue.take(&id) {
                self.processor.discard(request);
            }
            return Err(SchedulerError::ShutDown);
        }

        tracing::debug!(
            target: "inferlane::scheduler",
            request = %id,
            priority = %priority,
            category = %category,
            "request submitted"
        );
        self.events
            .publish_for(&id, RequestEventPayload::Queued { priority, category });
        Ok(id)
    }

    /// Submits `work` and waits for its terminal state.
    pub async fn run<W: WorkUnit>(&self, work: W, mut options: SubmitOptions) -> Result<()> {
        let id = options.id.get_or_insert_with(RequestId::new).clone();
        let (tx, rx) = oneshot::channel();
        let previous = options.on_complete.take();
        let options = options.on_complete(move |outcome| {
            if let Some(previous) = previous {
                previous(outcome);
            }
            let _ = tx.send(detach(outcome));
        });

        self.submit(work, options)?;
        match rx.await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(Some(err))) => Err(err),
            Ok(Err(None)) | Err(_) => Err(SchedulerError::Cancelled(id.to_string())),
        }
    }

    /// Cancels a queued or running request. Returns `false` for unknown or
    /// already finished ids, so repeated calls are harmless.
    pub fn cancel(&self, id: &RequestId) -> bool {
        let found = self.withdraw(id);
        if found {
            tracing::debug!(target: "inferlane::scheduler", request = %id, "request cancelled");
        }
        found
    }

    /// Cancels every live request in `category`; returns how many.
    pub fn cancel_by_category(&self, category: &str) -> usize {
        let live = Arc::clone(&self.live);
        let cancelled = self
            .registry
            .cancel_by_category(category, move |id| live.category(id));
        for id in &cancelled {
            if let Some(request) = self.queue.take(id) {
                self.processor.discard(request);
            }
        }
        if !cancelled.is_empty() {
            tracing::debug!(
                target: "inferlane::scheduler",
                category,
                count = cancelled.len(),
                "category cancelled"
            );
        }
        cancelled.len()
    }

    /// Signals the token and pulls the request out of the queue if it has not
    /// been dispatched yet.
    fn withdraw(&self, id: &RequestId) -> bool {
        let signalled = self.registry.cancel(id);
        let dequeued = match self.queue.take(id) {
            Some(request) => {
                self.processor.discard(request);
                true
            }
            None => false,
        };
        signalled || dequeued
    }

    pub fn status(&self) -> SchedulerStatus {
        let metrics = self.processor.metrics();
        let gate = self.processor.gate();
        SchedulerStatus {
            pending: self.queue.len(),
            active: gate.running,
            live: self.live.len(),
            avg_latency: metrics.avg_latency,
            error_rate: metrics.error_rate(),
            limit: gate.limit,
            ceiling: gate.ceiling,
            processed: metrics.processed,
            errors: metrics.errors,
            adaptive: self.processor.is_adaptive(),
            stopped: self.processor.is_stopped(),
        }
    }

    /// Current state of a live request; `None` once it reached a terminal
    /// state and was cleaned up.
    pub fn state(&self, id: &RequestId) -> Option<RequestState> {
        self.live.state(id)
    }

    /// Pending requests in dispatch order.
    pub fn queued(&self) -> Vec<QueuedItem> {
        self.queue.items()
    }

    /// Running requests with their priorities, in no particular order.
    pub fn running(&self) -> Vec<(RequestId, Priority)> {
        self.live.running()
    }

    /// Overrides the concurrency limit. Returns the limit now in force.
    pub fn set_max_workers(&self, workers: usize) -> usize {
        self.processor.set_max_workers(workers)
    }

    pub fn set_adaptive(&self, enabled: bool) {
        tracing::info!(target: "inferlane::scheduler", enabled, "adaptive concurrency toggled");
        self.processor.set_adaptive(enabled);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RequestEvent> {
        self.events.subscribe()
    }

    /// Cancels everything and waits for in-flight executions to return.
    /// Later submissions fail with [`SchedulerError::ShutDown`].
    pub async fn stop(&self) {
        if !self.root.is_cancelled() {
            tracing::info!(
                target: "inferlane::scheduler",
                pending = self.queue.len(),
                active = self.processor.active(),
                "scheduler stopping"
            );
        }
        self.processor.stop().await;
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.root.cancel();
    }
}

/// Converts a borrowed outcome into an owned result; `Err(None)` means
/// cancelled.
fn detach(outcome: &RequestOutcome) -> std::result::Result<(), Option<SchedulerError>> {
    match outcome {
        RequestOutcome::Completed => Ok(()),
        RequestOutcome::Cancelled => Err(None),
        RequestOutcome::Failed(SchedulerError::Timeout(after)) => {
            Err(Some(SchedulerError::Timeout(*after)))
        }
        RequestOutcome::Failed(SchedulerError::Execution(message)) => {
            Err(Some(SchedulerError::Execution(message.clone())))
        }
        RequestOutcome::Failed(other) => Err(Some(SchedulerError::Execution(other.to_string()))),
    }
}
