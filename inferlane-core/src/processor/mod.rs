//! Bounded-concurrency executor for queued requests.
//!
//! A single dispatch loop waits for a slot under the current concurrency
//! limit, pops the best queued request, and spawns its execution as its own
//! task. Every completion feeds the latency average, which in turn nudges the
//! limit up or down by one.

pub mod gate;
pub mod metrics;

use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures::FutureExt;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::config::{AdaptiveConfig, ProcessorConfig};
use crate::error::SchedulerError;
use crate::events::{RequestEvent, RequestEventBus, RequestEventPayload};
use crate::queue::PriorityQueue;
use crate::request::{ExecutionContext, Request, RequestId, RequestOutcome, RequestState};

pub use gate::{ConcurrencyGate, GateSnapshot, SlotPermit};
pub use metrics::ProcessorMetrics;

/// Bookkeeping hooks the processor calls as requests change state. Both
/// methods must tolerate being called more than once for the same id.
pub trait RequestLifecycle: Send + Sync + 'static {
    fn on_started(&self, id: &RequestId);
    fn on_finished(&self, id: &RequestId, state: RequestState);
}

/// Lifecycle that tracks nothing, for running a processor on its own.
#[derive(Debug, Default)]
pub struct NoopLifecycle;

impl RequestLifecycle for NoopLifecycle {
    fn on_started(&self, _id: &RequestId) {}
    fn on_finished(&self, _id: &RequestId, _state: RequestState) {}
}

struct ProcessorInner {
    config: ProcessorConfig,
    adaptive: AdaptiveConfig,
    adaptive_enabled: AtomicBool,
    queue: Arc<PriorityQueue>,
    gate: Arc<ConcurrencyGate>,
    metrics: Mutex<ProcessorMetrics>,
    events: RequestEventBus,
    lifecycle: Arc<dyn RequestLifecycle>,
    shutdown: CancellationToken,
    executions: TaskTracker,
}

#[derive(Clone)]
pub struct Processor {
    inner: Arc<ProcessorInner>,
    dispatcher: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl fmt::Debug for Processor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Processor")
            .field("config", &self.inner.config)
            .field("adaptive", &self.inner.adaptive)
            .field(
                "adaptive_enabled",
                &self.inner.adaptive_enabled.load(Ordering::Relaxed),
            )
            .field("gate", &self.inner.gate)
            .field("in_flight", &self.inner.executions.len())
            .field("shutdown_cancelled", &self.inner.shutdown.is_cancelled())
            .finish()
    }
}

impl Processor {
    /// Starts the dispatch loop on the current Tokio runtime.
    ///
    /// `shutdown` should be the root every request token was derived from so
    /// that [`Processor::stop`] reaches in-flight work.
    pub fn start(
        config: ProcessorConfig,
        adaptive: AdaptiveConfig,
        queue: Arc<PriorityQueue>,
        events: RequestEventBus,
        lifecycle: Arc<dyn RequestLifecycle>,
        shutdown: CancellationToken,
    ) -> Self {
        let gate = Arc::new(ConcurrencyGate::new(
            config.clamped_initial(),
            config.max_concurrency,
        ));
        let inner = Arc::new(ProcessorInner {
            adaptive_enabled: AtomicBool::new(adaptive.enabled),
            config,
            adaptive,
            queue,
            gate,
            metrics: Mutex::new(ProcessorMetrics::default()),
            events,
            lifecycle,
            shutdown,
            executions: TaskTracker::new(),
        });

        let handle = tokio::spawn(dispatch_loop(Arc::clone(&inner)));
        Self {
            inner,
            dispatcher: Arc::new(Mutex::new(Some(handle))),
        }
    }

    pub fn metrics(&self) -> ProcessorMetrics {
        *self.inner.metrics()
    }

    pub fn gate(&self) -> GateSnapshot {
        self.inner.gate.snapshot()
    }

    /// Number of executions currently running. A slot the dispatcher holds
    /// while waiting for work is not counted.
    pub fn active(&self) -> usize {
        self.inner.gate.running()
    }

    /// Manual override of the concurrency limit. Values above the configured
    /// ceiling raise the ceiling.
    pub fn set_max_workers(&self, workers: usize) -> usize {
        let (from, to) = self.inner.gate.force_limit(workers);
        if from != to {
            tracing::info!(
                target: "inferlane::processor",
                from,
                to,
                "concurrency limit set manually"
            );
            self.inner.events.publish(RequestEvent::global(
                RequestEventPayload::ConcurrencyAdjusted {
                    from,
                    to,
                    avg_latency_ms: duration_ms(self.metrics().avg_latency),
                },
            ));
        }
        to
    }

    pub fn set_adaptive(&self, enabled: bool) {
        self.inner.adaptive_enabled.store(enabled, Ordering::Relaxed);
    }

    pub fn is_adaptive(&self) -> bool {
        self.inner.adaptive_enabled.load(Ordering::Relaxed)
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }

    /// Finishes a request that was pulled out of the queue before dispatch.
    pub(crate) fn discard(&self, request: Request) {
        self.inner.discard(request);
    }

    /// Cancels the root token, stops dispatching, and waits for every
    /// in-flight execution to return. Safe to call more than once.
    pub async fn stop(&self) {
        self.inner.shutdown.cancel();

        let handle = self
            .dispatcher
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle
            && let Err(err) = handle.await
        {
            tracing::warn!(target: "inferlane::processor", error = %err, "dispatch loop failed");
        }

        self.inner.executions.close();
        self.inner.executions.wait().await;
        tracing::info!(target: "inferlane::processor", "processor stopped");
    }
}

impl ProcessorInner {
    fn metrics(&self) -> MutexGuard<'_, ProcessorMetrics> {
        self.metrics.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Finishes a request that never ran.
    fn discard(&self, mut request: Request) {
        request.token.cancel();
        self.lifecycle
            .on_finished(&request.id, RequestState::Cancelled);
        self.events
            .publish_for(&request.id, RequestEventPayload::Cancelled);
        request.complete(&RequestOutcome::Cancelled);
    }

    async fn execute(self: Arc<Self>, mut request: Request, mut permit: SlotPermit) {
        // Cancelled after dispatch but before this task first ran.
        if request.is_cancelled() {
            drop(permit);
            self.discard(request);
            return;
        }
        permit.mark_running();

        let id = request.id.clone();
        let token = request.token.clone();
        let timeout = request.timeout.unwrap_or_else(|| self.config.request_timeout());
        let started = Instant::now();
        let deadline = started + timeout;
        let ctx = ExecutionContext::new(
            id.clone(),
            Arc::clone(&request.category),
            token.clone(),
            deadline,
        );

        tracing::debug!(
            target: "inferlane::processor",
            request = %id,
            category = %request.category,
            priority = %request.priority,
            timeout_ms = duration_ms(timeout),
            "execution started"
        );
        self.events.publish_for(
            &id,
            RequestEventPayload::Started {
                priority: request.priority,
                category: request.category.to_string(),
            },
        );

        let work = Arc::clone(&request.work);
        let polled = AtomicBool::new(false);
        let run = async {
            polled.store(true, Ordering::Relaxed);
            AssertUnwindSafe(work.execute(ctx)).catch_unwind().await
        };
        tokio::pin!(run);

        // Cancellation is polled before the work so a token cancelled at
        // any point up to here keeps the work unit from ever starting.
        let mut timed_out = false;
        let finished = tokio::select! {
            biased;
            _ = token.cancelled() => None,
            result = &mut run => Some(result),
            _ = tokio::time::sleep_until(deadline) => {
                timed_out = true;
                None
            }
        };

        let (result, interrupted) = match finished {
            Some(result) => (Some(result), false),
            None if !polled.load(Ordering::Relaxed) => (None, true),
            None => {
                // Deadline or cancellation: signal the context, then let the
                // work wind down unless a grace period caps it.
                token.cancel();
                let result = match self.config.cancel_grace() {
                    Some(grace) => match tokio::time::timeout(grace, &mut run).await {
                        Ok(result) => Some(result),
                        Err(_) => {
                            tracing::warn!(
                                target: "inferlane::processor",
                                request = %id,
                                grace_ms = duration_ms(grace),
                                "execution ignored cancellation; dropping it"
                            );
                            None
                        }
                    },
                    None => Some(run.await),
                };
                (result, true)
            }
        };

        let latency = started.elapsed();
        drop(permit);

        let outcome = match result {
            _ if timed_out => RequestOutcome::Failed(SchedulerError::Timeout(timeout)),
            Some(Err(panic)) => {
                RequestOutcome::Failed(SchedulerError::Execution(panic_message(&*panic)))
            }
            _ if interrupted || token.is_cancelled() => RequestOutcome::Cancelled,
            Some(Ok(Ok(()))) => RequestOutcome::Completed,
            Some(Ok(Err(err))) => {
                RequestOutcome::Failed(SchedulerError::Execution(format!("{err:#}")))
            }
            None => RequestOutcome::Cancelled,
        };

        self.record(&id, latency, &outcome);
        self.lifecycle.on_finished(&id, outcome.state());
        request.complete(&outcome);
    }

    fn record(&self, id: &RequestId, latency: Duration, outcome: &RequestOutcome) {
        let latency_ms = duration_ms(latency);
        match outcome {
            RequestOutcome::Completed => {
                tracing::debug!(target: "inferlane::processor", request = %id, latency_ms, "execution completed");
                self.events
                    .publish_for(id, RequestEventPayload::Completed { latency_ms });
            }
            RequestOutcome::Failed(err) => {
                tracing::warn!(target: "inferlane::processor", request = %id, latency_ms, error = %err, "execution failed");
                self.events.publish_for(
                    id,
                    RequestEventPayload::Failed {
                        latency_ms,
                        error: err.to_string(),
                    },
                );
            }
            RequestOutcome::Cancelled => {
                tracing::debug!(target: "inferlane::processor", request = %id, latency_ms, "execution cancelled");
                self.events.publish_for(id, RequestEventPayload::Cancelled);
                return;
            }
        }

        let avg_latency = {
            let mut metrics = self.metrics();
            metrics.record(
                latency,
                matches!(outcome, RequestOutcome::Failed(_)),
                self.adaptive.ema_alpha,
            );
            metrics.avg_latency
        };
        self.adapt(avg_latency);
    }

    fn adapt(&self, avg_latency: Duration) {
        if !self.adaptive_enabled.load(Ordering::Relaxed) {
            return;
        }
        let Some((from, to)) = self.gate.adjust(|limit, ceiling| {
            metrics::next_limit(avg_latency, limit, ceiling, &self.adaptive)
        }) else {
            return;
        };
        if from == to {
            return;
        }
        let avg_latency_ms = duration_ms(avg_latency);
        tracing::info!(
            target: "inferlane::processor",
            from,
            to,
            avg_latency_ms,
            "concurrency adjusted"
        );
        self.events.publish(RequestEvent::global(
            RequestEventPayload::ConcurrencyAdjusted {
                from,
                to,
                avg_latency_ms,
            },
        ));
    }
}

async fn dispatch_loop(inner: Arc<ProcessorInner>) {
    tracing::debug!(target: "inferlane::processor", "dispatch loop started");
    loop {
        // Slot first: the request popped is the best one queued when it can start.
        let permit = tokio::select! {
            biased;
            _ = inner.shutdown.cancelled() => break,
            permit = inner.gate.acquire() => permit,
        };

        let request = tokio::select! {
            biased;
            _ = inner.shutdown.cancelled() => break,
            request = inner.queue.pop() => request,
        };

        if request.is_cancelled() {
            tracing::trace!(target: "inferlane::processor", request = %request.id, "skipping cancelled request");
            drop(permit);
            inner.discard(request);
            continue;
        }

        inner.lifecycle.on_started(&request.id);
        inner
            .executions
            .spawn(Arc::clone(&inner).execute(request, permit));
    }

    for request in inner.queue.drain() {
        inner.discard(request);
    }
    tracing::debug!(target: "inferlane::processor", "dispatch loop exited");
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        format!("work unit panicked: {message}")
    } else if let Some(message) = panic.downcast_ref::<String>() {
        format!("work unit panicked: {message}")
    } else {
        "work unit panicked".to_string()
    }
}

pub(crate) fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
