use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::request::{Priority, RequestId};

/// Lifecycle notifications emitted by the scheduler.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RequestEventPayload {
    Queued {
        priority: Priority,
        category: String,
    },
    /// `superseded` was cancelled to make room for `by`.
    Superseded {
        superseded: RequestId,
        by: RequestId,
    },
    Started {
        priority: Priority,
        category: String,
    },
    Completed {
        latency_ms: u64,
    },
    Failed {
        latency_ms: u64,
        error: String,
    },
    Cancelled,
    ConcurrencyAdjusted {
        from: usize,
        to: usize,
        avg_latency_ms: u64,
    },
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RequestEvent {
    /// `None` for scheduler-wide events such as concurrency changes.
    pub request_id: Option<RequestId>,
    pub at: DateTime<Utc>,
    pub payload: RequestEventPayload,
}

impl RequestEvent {
    pub fn for_request(request_id: &RequestId, payload: RequestEventPayload) -> Self {
        Self {
            request_id: Some(request_id.clone()),
            at: Utc::now(),
            payload,
        }
    }

    pub fn global(payload: RequestEventPayload) -> Self {
        Self {
            request_id: None,
            at: Utc::now(),
            payload,
        }
    }
}

/// In-process fan-out of lifecycle events. Publishing never blocks and never
/// fails; events sent with no subscribers are dropped.
#[derive(Clone)]
pub struct RequestEventBus {
    sender: broadcast::Sender<RequestEvent>,
    capacity: usize,
}

impl fmt::Debug for RequestEventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestEventBus")
            .field("capacity", &self.capacity)
            .field("subscribers", &self.sender.receiver_count())
            .finish()
    }
}

impl RequestEventBus {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (sender, _) = broadcast::channel(capacity);
        Self { sender, capacity }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RequestEvent> {
        self.sender.subscribe()
    }

    pub fn publish(&self, event: RequestEvent) {
        let _ = self.sender.send(event);
    }

    pub fn publish_for(&self, request_id: &RequestId, payload: RequestEventPayload) {
        if self.sender.receiver_count() == 0 {
            return;
        }
        self.publish(RequestEvent::for_request(request_id, payload));
    }
}
