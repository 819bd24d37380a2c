use std::path::PathBuf;
use std::time::Duration;

use inferlane_core::{ChangeCoalescer, ChangeEvent, ChangeKind, IgnoreRules, WatchConfig};
use tokio::sync::mpsc;
use tokio::time::{Instant, sleep, timeout};

fn coalescer(debounce_ms: u64) -> ChangeCoalescer {
    ChangeCoalescer::new(WatchConfig {
        debounce_ms,
        ignore: IgnoreRules::none(),
    })
}

fn union_feed(coalescer: &ChangeCoalescer) -> mpsc::UnboundedReceiver<Vec<PathBuf>> {
    let (tx, rx) = mpsc::unbounded_channel();
    coalescer.on_change(move |paths| {
        let _ = tx.send(paths.to_vec());
    });
    rx
}

fn event_feed(coalescer: &ChangeCoalescer) -> mpsc::UnboundedReceiver<ChangeEvent> {
    let (tx, rx) = mpsc::unbounded_channel();
    coalescer.subscribe(move |event| {
        let _ = tx.send(event.clone());
    });
    rx
}

#[tokio::test(start_paused = true)]
async fn burst_is_delivered_once_with_the_union() {
    let coalescer = coalescer(2_000);
    let mut unions = union_feed(&coalescer);
    let mut events = event_feed(&coalescer);

    for name in ["a.rs", "b.rs", "c.rs", "a.rs", "b.rs"] {
        coalescer.file_changed(format!("/proj/{name}"));
        sleep(Duration::from_millis(20)).await;
    }

    let union = unions.recv().await.expect("one flush");
    assert_eq!(
        union,
        ["a.rs", "b.rs", "c.rs"]
            .map(|name| PathBuf::from(format!("/proj/{name}")))
            .to_vec()
    );
    let event = events.recv().await.expect("one modified batch");
    assert_eq!(event.kind, ChangeKind::Modified);
    assert_eq!(event.paths.len(), 3);

    assert!(
        timeout(Duration::from_secs(10), unions.recv()).await.is_err(),
        "nothing else fires"
    );
    assert!(events.try_recv().is_err());
    coalescer.stop().await;
}

#[tokio::test(start_paused = true)]
async fn each_arrival_restarts_the_quiet_period() {
    let coalescer = coalescer(2_000);
    let mut unions = union_feed(&coalescer);
    let start = Instant::now();

    coalescer.file_changed("/proj/a.rs");
    sleep(Duration::from_millis(1_900)).await;
    coalescer.file_changed("/proj/b.rs");

    let union = unions.recv().await.expect("flush");
    let elapsed = start.elapsed();
    assert_eq!(union.len(), 2);
    assert!(
        elapsed >= Duration::from_millis(3_900) && elapsed < Duration::from_millis(4_000),
        "flushed at {elapsed:?}"
    );
    coalescer.stop().await;
}

#[tokio::test(start_paused = true)]
async fn latest_kind_wins_and_batches_are_grouped_by_kind() {
    let coalescer = coalescer(500);
    let mut events = event_feed(&coalescer);

    coalescer.record("/proj/a.rs", ChangeKind::Created);
    coalescer.record("/proj/b.rs", ChangeKind::Deleted);
    coalescer.file_changed("/proj/a.rs");
    coalescer.record("/proj/c.rs", ChangeKind::Renamed);
    coalescer.files_changed(["/proj/d.rs"]);

    let mut batches = Vec::new();
    for _ in 0..3 {
        batches.push(events.recv().await.expect("batch"));
    }
    assert_eq!(
        batches,
        vec![
            ChangeEvent {
                kind: ChangeKind::Modified,
                paths: vec![PathBuf::from("/proj/a.rs"), PathBuf::from("/proj/d.rs")],
            },
            ChangeEvent {
                kind: ChangeKind::Deleted,
                paths: vec![PathBuf::from("/proj/b.rs")],
            },
            ChangeEvent {
                kind: ChangeKind::Renamed,
                paths: vec![PathBuf::from("/proj/c.rs")],
            },
        ]
    );
    coalescer.stop().await;
}

#[tokio::test(start_paused = true)]
async fn ignored_paths_neither_arrive_nor_reset_the_timer() {
    let coalescer = coalescer(2_000);
    coalescer.set_ignore_paths(["*.log", ".git"]);
    let mut unions = union_feed(&coalescer);
    let start = Instant::now();

    coalescer.file_changed("/proj/src/lib.rs");
    sleep(Duration::from_millis(1_500)).await;
    coalescer.file_changed("/proj/server.log");
    coalescer.file_changed("/proj/.git/index");

    let union = unions.recv().await.expect("flush");
    assert_eq!(union, vec![PathBuf::from("/proj/src/lib.rs")]);
    assert!(start.elapsed() < Duration::from_millis(2_100));

    coalescer.file_changed("/proj/other.log");
    assert!(timeout(Duration::from_secs(5), unions.recv()).await.is_err());
    coalescer.stop().await;
}

#[tokio::test(start_paused = true)]
async fn stop_discards_pending_changes() {
    let coalescer = coalescer(1_000);
    let mut unions = union_feed(&coalescer);

    coalescer.file_changed("/proj/a.rs");
    sleep(Duration::from_millis(200)).await;
    coalescer.stop().await;

    sleep(Duration::from_secs(5)).await;
    assert!(unions.try_recv().is_err());

    coalescer.file_changed("/proj/b.rs");
    coalescer.stop().await;
}

#[cfg(feature = "fs-watch")]
#[tokio::test]
async fn native_watcher_reports_file_writes() {
    let dir = tempfile::tempdir().expect("tempdir");
    let coalescer = coalescer(100);
    let mut unions = union_feed(&coalescer);
    coalescer.start_watching(dir.path()).expect("watch tempdir");

    std::fs::write(dir.path().join("notes.md"), b"hello").expect("write file");

    let union = timeout(Duration::from_secs(10), unions.recv())
        .await
        .expect("watcher flushes in time")
        .expect("channel open");
    assert!(
        union
            .iter()
            .any(|path| path.file_name().is_some_and(|name| name == "notes.md")),
        "got {union:?}"
    );
    coalescer.stop().await;
}
