//! Request model shared by the queue, registry, processor, and facade.

use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};
use uuid::Uuid;

use crate::error::SchedulerError;

/// Category applied when the submitter does not name one.
pub const DEFAULT_CATEGORY: &str = "generic";

static NEXT_SEQUENCE: AtomicU64 = AtomicU64::new(0);

/// Unique identifier for scheduled requests.
#[derive(Clone, Debug, Eq, PartialEq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(String);

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl RequestId {
    pub fn new() -> Self {
        Self(Uuid::now_v7().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RequestId {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

impl From<String> for RequestId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Scheduling priority; higher values are dispatched first.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Priority(pub i32);

impl Priority {
    /// Background re-indexing and other deferrable work.
    pub const LOW: Priority = Priority(0);
    /// Default for submissions that do not pick a level.
    pub const MEDIUM: Priority = Priority(5);
    /// Analysis tiers the user is waiting on.
    pub const HIGH: Priority = Priority(10);
    /// Interactive chat.
    pub const CRITICAL: Priority = Priority(100);
}

impl Default for Priority {
    fn default() -> Self {
        Self::MEDIUM
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Scheduler-visible request states.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestState {
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
}

/// Cancellable, deadline-bound context handed to every execution.
///
/// Cancellation is advisory: work must poll [`ExecutionContext::is_cancelled`]
/// or await [`ExecutionContext::cancelled`] to stop early.
#[derive(Clone, Debug)]
pub struct ExecutionContext {
    request_id: RequestId,
    category: Arc<str>,
    token: CancellationToken,
    deadline: Instant,
}

impl ExecutionContext {
    pub(crate) fn new(
        request_id: RequestId,
        category: Arc<str>,
        token: CancellationToken,
        deadline: Instant,
    ) -> Self {
        Self {
            request_id,
            category,
            token,
            deadline,
        }
    }

    pub fn request_id(&self) -> &RequestId {
        &self.request_id
    }

    pub fn category(&self) -> &str {
        &self.category
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolves once the request is cancelled, superseded, times out, or the
    /// scheduler shuts down.
    pub fn cancelled(&self) -> WaitForCancellationFuture<'_> {
        self.token.cancelled()
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }
}

/// A unit of work the scheduler runs without inspecting.
#[async_trait]
pub trait WorkUnit: Send + Sync + 'static {
    async fn execute(&self, ctx: ExecutionContext) -> anyhow::Result<()>;
}

#[async_trait]
impl<F, Fut> WorkUnit for F
where
    F: Fn(ExecutionContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    async fn execute(&self, ctx: ExecutionContext) -> anyhow::Result<()> {
        (self)(ctx).await
    }
}

/// Terminal result delivered to completion callbacks.
#[derive(Debug)]
pub enum RequestOutcome {
    Completed,
    Failed(SchedulerError),
    Cancelled,
}

impl RequestOutcome {
    pub fn state(&self) -> RequestState {
        match self {
            RequestOutcome::Completed => RequestState::Completed,
            RequestOutcome::Failed(_) => RequestState::Failed,
            RequestOutcome::Cancelled => RequestState::Cancelled,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, RequestOutcome::Completed)
    }
}

pub type CompletionCallback = Box<dyn FnOnce(&RequestOutcome) + Send + 'static>;

/// Free-form metadata attached to a request.
pub type Metadata = BTreeMap<String, serde_json::Value>;

/// Optional knobs for a submission. Every field has a default.
#[derive(Default)]
pub struct SubmitOptions {
    pub(crate) id: Option<RequestId>,
    pub(crate) priority: Priority,
    pub(crate) category: Option<String>,
    pub(crate) supersedes: Vec<RequestId>,
    pub(crate) metadata: Metadata,
    pub(crate) timeout: Option<Duration>,
    pub(crate) parent: Option<CancellationToken>,
    pub(crate) on_complete: Option<CompletionCallback>,
}

impl fmt::Debug for SubmitOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubmitOptions")
            .field("id", &self.id)
            .field("priority", &self.priority)
            .field("category", &self.category)
            .field("supersedes", &self.supersedes)
            .field("metadata_keys", &self.metadata.len())
            .field("timeout", &self.timeout)
            .field("has_parent", &self.parent.is_some())
            .field("has_on_complete", &self.on_complete.is_some())
            .finish()
    }
}

impl SubmitOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn id(mut self, id: impl Into<RequestId>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn category(mut self, category: impl Into<String>) -> Self {
        self.category = Some(category.into());
        self
    }

    pub fn supersedes<I, T>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<RequestId>,
    {
        self.supersedes.extend(ids.into_iter().map(Into::into));
        self
    }

    pub fn metadata(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Overrides the processor's default deadline for this request only.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Ties the request to a caller-owned token: cancelling `parent` cancels
    /// the request.
    pub fn parent(mut self, parent: CancellationToken) -> Self {
        self.parent = Some(parent);
        self
    }

    pub fn on_complete<F>(mut self, callback: F) -> Self
    where
        F: FnOnce(&RequestOutcome) + Send + 'static,
    {
        self.on_complete = Some(Box::new(callback));
        self
    }
}

/// The work unit plus everything the scheduler tracks about it.
pub struct Request {
    pub id: RequestId,
    pub priority: Priority,
    pub category: Arc<str>,
    pub supersedes: Vec<RequestId>,
    pub created_at: DateTime<Utc>,
    pub metadata: Metadata,
    pub(crate) sequence: u64,
    pub(crate) token: CancellationToken,
    pub(crate) timeout: Option<Duration>,
    pub(crate) work: Arc<dyn WorkUnit>,
    pub(crate) on_complete: Option<CompletionCallback>,
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Request")
            .field("id", &self.id)
            .field("priority", &self.priority)
            .field("category", &self.category)
            .field("supersedes", &self.supersedes)
            .field("created_at", &self.created_at)
            .field("sequence", &self.sequence)
            .field("cancelled", &self.token.is_cancelled())
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl Request {
    /// Builds a request whose token is a child of `root`, so cancelling the
    /// root cancels it.
    pub fn new(work: Arc<dyn WorkUnit>, options: SubmitOptions, root: &CancellationToken) -> Self {
        let SubmitOptions {
            id,
            priority,
            category,
            supersedes,
            metadata,
            timeout,
            parent,
            on_complete,
        } = options;

        let token = root.child_token();
        if let Some(parent) = parent {
            link_parent(parent, token.clone());
        }

        Self {
            id: id.unwrap_or_default(),
            priority,
            category: Arc::from(category.as_deref().unwrap_or(DEFAULT_CATEGORY)),
            supersedes,
            created_at: Utc::now(),
            metadata,
            sequence: NEXT_SEQUENCE.fetch_add(1, Ordering::Relaxed),
            token,
            timeout,
            work,
            on_complete,
        }
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Fires the completion callback at most once.
    pub(crate) fn complete(&mut self, outcome: &RequestOutcome) {
        if let Some(callback) = self.on_complete.take() {
            callback(outcome);
        }
    }
}

/// Forwards cancellation from a caller token into the request token. The
/// forwarding task exits as soon as either side is cancelled.
fn link_parent(parent: CancellationToken, child: CancellationToken) {
    if parent.is_cancelled() {
        child.cancel();
        return;
    }
    let Ok(handle) = tokio::runtime::Handle::try_current() else {
        tracing::warn!(
            target: "inferlane::scheduler",
            "parent token ignored: no tokio runtime to forward cancellation"
        );
        return;
    };
    handle.spawn(async move {
        tokio::select! {
            _ = parent.cancelled() => child.cancel(),
            _ = child.cancelled() => {}
        }
    });
}
