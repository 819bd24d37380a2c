//! Debounced file-change coalescing.
//!
//! Raw notifications (from `notify` or injected by hand) are filtered through
//! [`IgnoreRules`] and fed to one flush loop per coalescer. The loop keeps the
//! latest [`ChangeKind`] per path and re-arms a single quiet-period timer on
//! every arrival; when the timer lapses the batch is grouped by kind and
//! handed to subscribers.

mod ignore;

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use crate::config::WatchConfig;
#[cfg(feature = "fs-watch")]
use crate::error::{Result, SchedulerError};

pub use ignore::IgnoreRules;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Created,
    Modified,
    Deleted,
    Renamed,
}

/// One coalesced batch: every path whose latest change in the window was
/// `kind`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub kind: ChangeKind,
    pub paths: Vec<PathBuf>,
}

type ChangeCallback = Arc<dyn Fn(&ChangeEvent) + Send + Sync>;
type UnionCallback = Arc<dyn Fn(&[PathBuf]) + Send + Sync>;

struct Listeners {
    ignore: RwLock<IgnoreRules>,
    subscribers: Mutex<Vec<ChangeCallback>>,
    union: Mutex<Option<UnionCallback>>,
}

impl Listeners {
    fn is_ignored(&self, path: &Path) -> bool {
        self.ignore
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_ignored(path)
    }

    fn subscribers(&self) -> MutexGuard<'_, Vec<ChangeCallback>> {
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn union(&self) -> MutexGuard<'_, Option<UnionCallback>> {
        self.union.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Clonable entry point for changes; applies the ignore rules before
/// anything reaches the flush loop so ignored paths never re-arm the timer.
#[derive(Clone)]
struct Intake {
    listeners: Arc<Listeners>,
    tx: mpsc::UnboundedSender<(PathBuf, ChangeKind)>,
}

impl Intake {
    fn record(&self, path: PathBuf, kind: ChangeKind) {
        if self.listeners.is_ignored(&path) {
            tracing::trace!(target: "inferlane::watch", path = %path.display(), "ignored change");
            return;
        }
        // A closed channel means the coalescer was stopped.
        let _ = self.tx.send((path, kind));
    }
}

/// Watches file trees and delivers debounced, per-kind change batches.
pub struct ChangeCoalescer {
    debounce: Duration,
    intake: Intake,
    shutdown: CancellationToken,
    flush_task: Mutex<Option<JoinHandle<()>>>,
    #[cfg(feature = "fs-watch")]
    watchers: Mutex<Vec<notify::RecommendedWatcher>>,
}

impl fmt::Debug for ChangeCoalescer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut debug = f.debug_struct("ChangeCoalescer");
        debug
            .field("debounce", &self.debounce)
            .field("stopped", &self.shutdown.is_cancelled());
        match self.intake.listeners.subscribers.try_lock() {
            Ok(subscribers) => {
                debug.field("subscribers", &subscribers.len());
            }
            Err(_) => {
                debug.field("subscribers", &"<locked>");
            }
        }
        #[cfg(feature = "fs-watch")]
        match self.watchers.try_lock() {
            Ok(watchers) => {
                debug.field("watchers", &watchers.len());
            }
            Err(_) => {
                debug.field("watchers", &"<locked>");
            }
        }
        debug.finish()
    }
}

impl ChangeCoalescer {
    /// Creates the coalescer and spawns its flush loop on the current Tokio
    /// runtime.
    pub fn new(config: WatchConfig) -> Self {
        let debounce = config.debounce();
        let listeners = Arc::new(Listeners {
            ignore: RwLock::new(config.ignore),
            subscribers: Mutex::new(Vec::new()),
            union: Mutex::new(None),
        });
        let (tx, rx) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();
        let flush_task = tokio::spawn(flush_loop(
            Arc::clone(&listeners),
            rx,
            debounce,
            shutdown.clone(),
        ));

        Self {
            debounce,
            intake: Intake { listeners, tx },
            shutdown,
            flush_task: Mutex::new(Some(flush_task)),
            #[cfg(feature = "fs-watch")]
            watchers: Mutex::new(Vec::new()),
        }
    }

    pub fn debounce(&self) -> Duration {
        self.debounce
    }

    /// Adds a listener called once per kind for every flushed window.
    /// Callbacks run on the flush task and should return quickly.
    pub fn subscribe<F>(&self, callback: F)
    where
        F: Fn(&ChangeEvent) + Send + Sync + 'static,
    {
        self.intake.listeners.subscribers().push(Arc::new(callback));
    }

    /// Sets the single listener that receives the union of all changed paths
    /// once per window, regardless of kind. Replaces any previous one.
    pub fn on_change<F>(&self, callback: F)
    where
        F: Fn(&[PathBuf]) + Send + Sync + 'static,
    {
        *self.intake.listeners.union() = Some(Arc::new(callback));
    }

    /// Records a modification, exactly as if the OS had reported it.
    pub fn file_changed(&self, path: impl Into<PathBuf>) {
        self.record(path, ChangeKind::Modified);
    }

    pub fn files_changed<I, P>(&self, paths: I)
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        for path in paths {
            self.file_changed(path);
        }
    }

    pub fn record(&self, path: impl Into<PathBuf>, kind: ChangeKind) {
        self.intake.record(path.into(), kind);
    }

    /// Replaces the ignore rules with ones built from `patterns`; see
    /// [`IgnoreRules::from_patterns`].
    pub fn set_ignore_paths<I, S>(&self, patterns: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.set_ignore_rules(IgnoreRules::from_patterns(patterns));
    }

    pub fn set_ignore_rules(&self, rules: IgnoreRules) {
        *self
            .intake
            .listeners
            .ignore
            .write()
            .unwrap_or_else(PoisonError::into_inner) = rules;
    }

    pub fn ignore_rules(&self) -> IgnoreRules {
        self.intake
            .listeners
            .ignore
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Starts recursive OS-level monitoring of `root`. May be called for
    /// several roots; all feed the same debounce window.
    #[cfg(feature = "fs-watch")]
    pub fn start_watching(&self, root: impl AsRef<Path>) -> Result<()> {
        use notify::{Config as NotifyConfig, Event, RecommendedWatcher, RecursiveMode, Watcher};

        let root = resolve_root(root.as_ref());
        let setup_error = |reason: String| SchedulerError::WatchSetup {
            path: root.display().to_string(),
            reason,
        };
        if self.shutdown.is_cancelled() {
            return Err(setup_error("coalescer is stopped".to_string()));
        }

        let intake = self.intake.clone();
        let watch_root = root.clone();
        let mut watcher = RecommendedWatcher::new(
            move |res: std::result::Result<Event, notify::Error>| match res {
                Ok(event) => {
                    for (path, kind) in classify_event(event) {
                        intake.record(path, kind);
                    }
                }
                Err(err) => {
                    let err = SchedulerError::WatchRuntime(err.to_string());
                    tracing::warn!(
                        target: "inferlane::watch",
                        root = %watch_root.display(),
                        error = %err,
                        "watcher reported an error"
                    );
                }
            },
            NotifyConfig::default(),
        )
        .map_err(|err| setup_error(err.to_string()))?;

        watcher
            .watch(&root, RecursiveMode::Recursive)
            .map_err(|err| setup_error(err.to_string()))?;

        tracing::info!(target: "inferlane::watch", root = %root.display(), "watching for changes");
        self.watchers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(watcher);
        Ok(())
    }

    /// Stops OS monitoring and the flush loop. Pending changes are dropped and
    /// no callback runs after this returns.
    pub async fn stop(&self) {
        self.shutdown.cancel();

        #[cfg(feature = "fs-watch")]
        self.watchers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();

        let task = self
            .flush_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = task
            && let Err(err) = task.await
        {
            tracing::warn!(target: "inferlane::watch", error = %err, "flush loop failed");
        }
    }
}

impl Drop for ChangeCoalescer {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn flush_loop(
    listeners: Arc<Listeners>,
    mut rx: mpsc::UnboundedReceiver<(PathBuf, ChangeKind)>,
    debounce: Duration,
    shutdown: CancellationToken,
) {
    let mut pending: BTreeMap<PathBuf, ChangeKind> = BTreeMap::new();

    loop {
        let received = if pending.is_empty() {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                received = rx.recv() => received,
            }
        } else {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                received = timeout(debounce, rx.recv()) => match received {
                    Ok(received) => received,
                    Err(_) => {
                        flush_pending(&listeners, &mut pending);
                        continue;
                    }
                },
            }
        };

        let Some((path, kind)) = received else {
            break;
        };
        pending.insert(path, kind);
    }

    if !pending.is_empty() {
        tracing::debug!(
            target: "inferlane::watch",
            dropped = pending.len(),
            "coalescer stopped with pending changes"
        );
    }
}

fn flush_pending(listeners: &Listeners, pending: &mut BTreeMap<PathBuf, ChangeKind>) {
    let drained = std::mem::take(pending);
    let union: Vec<PathBuf> = drained.keys().cloned().collect();

    let mut by_kind: BTreeMap<ChangeKind, Vec<PathBuf>> = BTreeMap::new();
    for (path, kind) in drained {
        by_kind.entry(kind).or_default().push(path);
    }

    tracing::debug!(
        target: "inferlane::watch",
        paths = union.len(),
        kinds = by_kind.len(),
        "flushing coalesced changes"
    );

    let subscribers: Vec<ChangeCallback> = listeners.subscribers().clone();
    for (kind, paths) in by_kind {
        let event = ChangeEvent { kind, paths };
        for callback in &subscribers {
            callback(&event);
        }
    }

    let union_callback = listeners.union().clone();
    if let Some(callback) = union_callback {
        callback(&union);
    }
}

#[cfg(feature = "fs-watch")]
fn resolve_root(root: &Path) -> PathBuf {
    if root.is_absolute() {
        root.to_path_buf()
    } else {
        std::env::current_dir()
            .unwrap_or_else(|_| PathBuf::from("."))
            .join(root)
    }
}

/// Maps a raw notification onto per-path change kinds. Access events carry no
/// change and are dropped.
#[cfg(feature = "fs-watch")]
fn classify_event(event: notify::Event) -> Vec<(PathBuf, ChangeKind)> {
    use notify::EventKind;
    use notify::event::ModifyKind;

    let kind = match event.kind {
        EventKind::Access(_) => return Vec::new(),
        EventKind::Create(_) => ChangeKind::Created,
        EventKind::Modify(ModifyKind::Name(_)) => ChangeKind::Renamed,
        EventKind::Modify(_) => ChangeKind::Modified,
        EventKind::Remove(_) => ChangeKind::Deleted,
        EventKind::Any | EventKind::Other => ChangeKind::Modified,
    };
    event.paths.into_iter().map(|path| (path, kind)).collect()
}

#[cfg(all(test, feature = "fs-watch"))]
mod tests {
    use notify::event::{AccessKind, CreateKind, EventKind, ModifyKind, RenameMode};

    use super::*;

    #[test]
    fn classify_maps_notify_kinds() {
        let event = notify::Event::new(EventKind::Modify(ModifyKind::Name(RenameMode::Both)))
            .add_path(PathBuf::from("/r/old.rs"))
            .add_path(PathBuf::from("/r/new.rs"));
        assert_eq!(
            classify_event(event),
            vec![
                (PathBuf::from("/r/old.rs"), ChangeKind::Renamed),
                (PathBuf::from("/r/new.rs"), ChangeKind::Renamed),
            ]
        );

        let created =
            notify::Event::new(EventKind::Create(CreateKind::File)).add_path(PathBuf::from("/r/a"));
        assert_eq!(classify_event(created)[0].1, ChangeKind::Created);

        let access =
            notify::Event::new(EventKind::Access(AccessKind::Any)).add_path(PathBuf::from("/r/a"));
        assert!(classify_event(access).is_empty());
    }

    #[tokio::test]
    async fn missing_root_is_a_setup_error() {
        let coalescer = ChangeCoalescer::new(WatchConfig::default());
        let missing = std::env::temp_dir().join(format!("inferlane-missing-{}", uuid::Uuid::new_v4()));
        let err = coalescer
            .start_watching(&missing)
            .expect_err("nonexistent root cannot be watched");
        assert!(matches!(err, SchedulerError::WatchSetup { .. }));
        coalescer.stop().await;
    }
}
