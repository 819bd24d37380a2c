//! Priority queue of pending requests.
//!
//! Ordering is strict: higher priority first, then submission order within a
//! priority. Every push wakes exactly one waiting dequeuer.

use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;
use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Notify;

use crate::request::{Priority, Request, RequestId};

struct Entry(Request);

impl Entry {
    fn key(&self) -> (Priority, Reverse<u64>) {
        (self.0.priority, Reverse(self.0.sequence))
    }
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key().cmp(&other.key())
    }
}

/// Point-in-time view of a queued request.
#[derive(Clone, Debug, Serialize)]
pub struct QueuedItem {
    pub id: RequestId,
    pub priority: Priority,
    pub category: String,
    pub created_at: DateTime<Utc>,
}

impl From<&Request> for QueuedItem {
    fn from(request: &Request) -> Self {
        Self {
            id: request.id.clone(),
            priority: request.priority,
            category: request.category.to_string(),
            created_at: request.created_at,
        }
    }
}

#[derive(Default)]
pub struct PriorityQueue {
    heap: Mutex<BinaryHeap<Entry>>,
    available: Notify,
}

impl fmt::Debug for PriorityQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut debug = f.debug_struct("PriorityQueue");
        match self.heap.try_lock() {
            Ok(heap) => {
                debug.field("len", &heap.len());
            }
            Err(_) => {
                debug.field("heap", &"<locked>");
            }
        }
        debug.finish()
    }
}

impl PriorityQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn heap(&self) -> MutexGuard<'_, BinaryHeap<Entry>> {
        self.heap.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn push(&self, request: Request) {
        tracing::trace!(
            target: "inferlane::queue",
            request = %request.id,
            priority = %request.priority,
            category = %request.category,
            "request queued"
        );
        self.heap().push(Entry(request));
        self.available.notify_one();
    }

    /// Waits until a request is available and returns the best one.
    ///
    /// Cancel-safe: dropping the future never loses a request.
    pub async fn pop(&self) -> Request {
        loop {
            let notified = self.available.notified();
            if let Some(request) = self.try_pop() {
                return request;
            }
            notified.await;
        }
    }

    pub fn try_pop(&self) -> Option<Request> {
        self.heap().pop().map(|entry| entry.0)
    }

    /// Drops a pending request. Returns whether it was still queued.
    pub fn remove(&self, id: &RequestId) -> bool {
        self.take(id).is_some()
    }

    /// Removes and returns a pending request so the caller can finish it.
    pub fn take(&self, id: &RequestId) -> Option<Request> {
        let mut heap = self.heap();
        if !heap.iter().any(|entry| &entry.0.id == id) {
            return None;
        }
        let mut entries = std::mem::take(&mut *heap).into_vec();
        let removed = entries
            .iter()
            .position(|entry| &entry.0.id == id)
            .map(|position| entries.swap_remove(position));
        *heap = BinaryHeap::from(entries);
        removed.map(|entry| entry.0)
    }

    pub fn contains(&self, id: &RequestId) -> bool {
        self.heap().iter().any(|entry| &entry.0.id == id)
    }

    pub fn len(&self) -> usize {
        self.heap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap().is_empty()
    }

    /// Snapshot in dispatch order. The lock is released before returning.
    pub fn items(&self) -> Vec<QueuedItem> {
        let mut entries: Vec<(Priority, Reverse<u64>, QueuedItem)> = {
            let heap = self.heap();
            heap.iter()
                .map(|entry| {
                    let (priority, seq) = entry.key();
                    (priority, seq, QueuedItem::from(&entry.0))
                })
                .collect()
        };
        entries.sort_by(|a, b| (b.0, b.1).cmp(&(a.0, a.1)));
        entries.into_iter().map(|(_, _, item)| item).collect()
    }

    /// Empties the queue, returning everything that was pending.
    pub fn drain(&self) -> Vec<Request> {
        let entries = std::mem::take(&mut *self.heap()).into_sorted_vec();
        entries.into_iter().rev().map(|entry| entry.0).collect()
    }
}
