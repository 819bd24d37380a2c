//! Cancel handles for every queued or running request.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio_util::sync::CancellationToken;

use crate::request::RequestId;

#[derive(Default)]
pub struct CancellationRegistry {
    handles: Mutex<HashMap<RequestId, CancellationToken>>,
}

impl fmt::Debug for CancellationRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut debug = f.debug_struct("CancellationRegistry");
        match self.handles.try_lock() {
            Ok(handles) => {
                debug.field("live", &handles.len());
            }
            Err(_) => {
                debug.field("handles", &"<locked>");
            }
        }
        debug.finish()
    }
}

impl CancellationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn handles(&self) -> MutexGuard<'_, HashMap<RequestId, CancellationToken>> {
        self.handles.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns `false` (and keeps the existing handle) if `id` is already live.
    pub fn register(&self, id: RequestId, token: CancellationToken) -> bool {
        let mut handles = self.handles();
        if handles.contains_key(&id) {
            return false;
        }
        handles.insert(id, token);
        true
    }

    pub fn unregister(&self, id: &RequestId) -> bool {
        self.handles().remove(id).is_some()
    }

    pub fn contains(&self, id: &RequestId) -> bool {
        self.handles().contains_key(id)
    }

    /// Signals the request's token and forgets it. Unknown ids return `false`.
    pub fn cancel(&self, id: &RequestId) -> bool {
        let token = self.handles().remove(id);
        match token {
            Some(token) => {
                token.cancel();
                tracing::debug!(target: "inferlane::registry", request = %id, "request cancelled");
                true
            }
            None => false,
        }
    }

    /// Cancels every known id in `ids`; returns how many were live.
    pub fn cancel_many<'a, I>(&self, ids: I) -> usize
    where
        I: IntoIterator<Item = &'a RequestId>,
    {
        ids.into_iter().filter(|id| self.cancel(id)).count()
    }

    /// Cancels every live request whose category, as reported by `lookup`,
    /// equals `category`. Returns the ids that were cancelled.
    ///
    /// `lookup` runs without the registry lock held.
    pub fn cancel_by_category<F>(&self, category: &str, lookup: F) -> Vec<RequestId>
    where
        F: Fn(&RequestId) -> Option<String>,
    {
        let live: Vec<RequestId> = self.handles().keys().cloned().collect();
        live.into_iter()
            .filter(|id| lookup(id).as_deref() == Some(category))
            .filter(|id| self.cancel(id))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.handles().len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    #[test]
    fn cancel_signals_token_once() {
        let registry = CancellationRegistry::new();
        let token = CancellationToken::new();
        let id = RequestId::from("r1");
        assert!(registry.register(id.clone(), token.clone()));

        assert!(registry.cancel(&id));
        assert!(token.is_cancelled());
        assert!(!registry.cancel(&id), "second cancel is a no-op");
        assert!(!registry.unregister(&id));
        assert!(registry.is_empty());
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let registry = CancellationRegistry::new();
        let first = CancellationToken::new();
        let second = CancellationToken::new();
        let id = RequestId::from("dup");

        assert!(registry.register(id.clone(), first.clone()));
        assert!(!registry.register(id.clone(), second.clone()));
        registry.cancel(&id);
        assert!(first.is_cancelled());
        assert!(!second.is_cancelled());
    }

    #[test]
    fn cancel_many_counts_only_live_ids() {
        let registry = CancellationRegistry::new();
        let ids: Vec<RequestId> = ["a", "b"].into_iter().map(RequestId::from).collect();
        for id in &ids {
            registry.register(id.clone(), CancellationToken::new());
        }
        let wanted = [ids[0].clone(), ids[1].clone(), RequestId::from("ghost")];
        assert_eq!(registry.cancel_many(wanted.iter()), 2);
        assert!(registry.is_empty());
    }

    #[test]
    fn cancel_by_category_uses_lookup() {
        let registry = CancellationRegistry::new();
        let categories: HashMap<RequestId, &str> = [("a", "scan"), ("b", "chat"), ("c", "scan")]
            .into_iter()
            .map(|(id, category)| (RequestId::from(id), category))
            .collect();
        let mut tokens = HashMap::new();
        for id in categories.keys() {
            let token = CancellationToken::new();
            tokens.insert(id.clone(), token.clone());
            registry.register(id.clone(), token);
        }

        let mut cancelled =
            registry.cancel_by_category("scan", |id| categories.get(id).map(|c| c.to_string()));
        cancelled.sort();
        assert_eq!(cancelled, vec![RequestId::from("a"), RequestId::from("c")]);
        assert!(!tokens[&RequestId::from("b")].is_cancelled());
        assert_eq!(registry.len(), 1);
    }
}
