use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use inferlane_core::{
    AdaptiveConfig, ExecutionContext, Priority, ProcessorConfig, RequestEventPayload, RequestId,
    RequestState, Scheduler, SchedulerConfig, SchedulerError, SubmitOptions,
};
use tokio::sync::{Notify, mpsc};
use tokio_util::sync::CancellationToken;

fn config(initial: usize, ceiling: usize, adaptive: bool) -> SchedulerConfig {
    SchedulerConfig {
        processor: ProcessorConfig {
            initial_concurrency: initial,
            max_concurrency: ceiling,
            ..ProcessorConfig::default()
        },
        adaptive: AdaptiveConfig {
            enabled: adaptive,
            ..AdaptiveConfig::default()
        },
        ..SchedulerConfig::default()
    }
}

/// A running request that holds its slot until released.
struct Blocker {
    id: RequestId,
    release: Arc<Notify>,
}

async fn occupy(scheduler: &Scheduler) -> Blocker {
    let started = Arc::new(Notify::new());
    let release = Arc::new(Notify::new());
    let (s, r) = (Arc::clone(&started), Arc::clone(&release));
    let id = scheduler
        .submit(
            move |_ctx: ExecutionContext| {
                let (s, r) = (Arc::clone(&s), Arc::clone(&r));
                async move {
                    s.notify_one();
                    r.notified().await;
                    anyhow::Ok(())
                }
            },
            SubmitOptions::new().priority(Priority::CRITICAL).category("blocker"),
        )
        .expect("blocker submits");
    started.notified().await;
    Blocker { id, release }
}

type Log = Arc<Mutex<Vec<&'static str>>>;

fn logged(name: &'static str, done: &mpsc::UnboundedSender<RequestState>) -> SubmitOptions {
    let done = done.clone();
    SubmitOptions::new().id(name).on_complete(move |outcome| {
        let _ = done.send(outcome.state());
    })
}

fn record(
    log: &Log,
    name: &'static str,
) -> impl Fn(ExecutionContext) -> futures::future::Ready<anyhow::Result<()>> + Send + Sync + 'static
{
    let log = Arc::clone(log);
    move |_ctx| {
        log.lock().expect("log lock").push(name);
        futures::future::ready(Ok(()))
    }
}

#[tokio::test(start_paused = true)]
async fn dispatches_by_priority_then_submission_order() {
    let scheduler = Scheduler::new(config(1, 1, false));
    let blocker = occupy(&scheduler).await;

    let log: Log = Arc::default();
    let (done, mut finished) = mpsc::unbounded_channel();
    scheduler
        .submit(record(&log, "A"), logged("A", &done).priority(Priority(5)))
        .expect("A");
    scheduler
        .submit(record(&log, "B"), logged("B", &done).priority(Priority(5)))
        .expect("B");
    scheduler
        .submit(record(&log, "C"), logged("C", &done).priority(Priority(10)))
        .expect("C");

    let queued: Vec<String> = scheduler
        .queued()
        .into_iter()
        .map(|item| item.id.to_string())
        .collect();
    assert_eq!(queued, vec!["C", "A", "B"]);

    blocker.release.notify_one();
    for _ in 0..3 {
        assert_eq!(finished.recv().await, Some(RequestState::Completed));
    }
    assert_eq!(*log.lock().expect("log lock"), vec!["C", "A", "B"]);
    scheduler.stop().await;
}

#[tokio::test(start_paused = true)]
async fn superseded_request_never_executes() {
    let scheduler = Scheduler::new(config(1, 1, false));
    let mut events = scheduler.subscribe();
    let blocker = occupy(&scheduler).await;

    let log: Log = Arc::default();
    let (done, mut finished) = mpsc::unbounded_channel();
    scheduler
        .submit(record(&log, "X"), logged("X", &done).category("reindex"))
        .expect("X");
    scheduler
        .submit(
            record(&log, "Y"),
            logged("Y", &done).category("reindex").supersedes(["X"]),
        )
        .expect("Y");

    assert_eq!(finished.recv().await, Some(RequestState::Cancelled), "X is finished at once");
    assert_eq!(scheduler.status().pending, 1);
    assert_eq!(scheduler.state(&RequestId::from("X")), None);

    blocker.release.notify_one();
    assert_eq!(finished.recv().await, Some(RequestState::Completed));
    assert_eq!(*log.lock().expect("log lock"), vec!["Y"]);

    let mut saw_supersede = false;
    while let Ok(event) = events.try_recv() {
        if let RequestEventPayload::Superseded { superseded, by } = event.payload {
            assert_eq!((superseded.as_str(), by.as_str()), ("X", "Y"));
            saw_supersede = true;
        }
    }
    assert!(saw_supersede);
    scheduler.stop().await;
}

#[tokio::test(start_paused = true)]
async fn slow_executions_shrink_the_limit_to_one() {
    let scheduler = Scheduler::new(config(2, 4, true));
    let mut events = scheduler.subscribe();
    let slow = |_ctx: ExecutionContext| async {
        tokio::time::sleep(Duration::from_secs(20)).await;
        anyhow::Ok(())
    };

    scheduler.run(slow, SubmitOptions::new()).await.expect("first run");
    assert_eq!(scheduler.status().limit, 1);

    scheduler.run(slow, SubmitOptions::new()).await.expect("second run");
    let status = scheduler.status();
    assert_eq!(status.limit, 1, "never below one");
    assert_eq!(status.processed, 2);

    let mut adjustments = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let RequestEventPayload::ConcurrencyAdjusted { from, to, .. } = event.payload {
            adjustments.push((from, to));
        }
    }
    assert_eq!(adjustments, vec![(2, 1)]);
    scheduler.stop().await;
}

#[tokio::test(start_paused = true)]
async fn fast_executions_grow_the_limit_to_the_ceiling() {
    let scheduler = Scheduler::new(config(2, 3, true));
    let fast = |_ctx: ExecutionContext| async {
        tokio::time::sleep(Duration::from_secs(2)).await;
        anyhow::Ok(())
    };

    scheduler.run(fast, SubmitOptions::new()).await.expect("first run");
    assert_eq!(scheduler.status().limit, 3);
    scheduler.run(fast, SubmitOptions::new()).await.expect("second run");
    assert_eq!(scheduler.status().limit, 3, "capped at the ceiling");
    scheduler.stop().await;
}

#[tokio::test(start_paused = true)]
async fn frozen_adaptation_keeps_the_limit() {
    let scheduler = Scheduler::new(config(2, 4, true));
    scheduler.set_adaptive(false);
    scheduler
        .run(
            |_ctx: ExecutionContext| async {
                tokio::time::sleep(Duration::from_secs(30)).await;
                anyhow::Ok(())
            },
            SubmitOptions::new(),
        )
        .await
        .expect("run");
    let status = scheduler.status();
    assert_eq!(status.limit, 2);
    assert!(!status.adaptive);
    scheduler.stop().await;
}

#[tokio::test(start_paused = true)]
async fn manual_limit_can_exceed_the_ceiling() {
    let scheduler = Scheduler::new(config(2, 4, false));
    assert_eq!(scheduler.set_max_workers(6), 6);
    let status = scheduler.status();
    assert_eq!((status.limit, status.ceiling), (6, 6));
    assert_eq!(scheduler.set_max_workers(0), 1);
    scheduler.stop().await;
}

#[tokio::test(start_paused = true)]
async fn cancel_before_dispatch_drops_the_request() {
    let scheduler = Scheduler::new(config(1, 1, false));
    let blocker = occupy(&scheduler).await;

    let ran = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&ran);
    let (done, mut finished) = mpsc::unbounded_channel();
    let id = scheduler
        .submit(
            move |_ctx: ExecutionContext| {
                flag.store(true, Ordering::SeqCst);
                futures::future::ready(anyhow::Ok(()))
            },
            SubmitOptions::new().on_complete(move |outcome| {
                let _ = done.send(outcome.state());
            }),
        )
        .expect("submit");
    assert_eq!(scheduler.status().pending, 1);

    assert!(scheduler.cancel(&id));
    assert_eq!(scheduler.status().pending, 0);
    assert_eq!(finished.recv().await, Some(RequestState::Cancelled));
    assert!(!scheduler.cancel(&id), "second cancel is a no-op");

    blocker.release.notify_one();
    scheduler.stop().await;
    assert!(!ran.load(Ordering::SeqCst));
}

#[tokio::test(start_paused = true)]
async fn cancel_reaches_running_work() {
    let scheduler = Scheduler::new(config(1, 1, false));
    let started = Arc::new(Notify::new());
    let s = Arc::clone(&started);
    let (done, mut finished) = mpsc::unbounded_channel();
    let id = scheduler
        .submit(
            move |ctx: ExecutionContext| {
                let s = Arc::clone(&s);
                async move {
                    s.notify_one();
                    ctx.cancelled().await;
                    anyhow::Ok(())
                }
            },
            SubmitOptions::new().on_complete(move |outcome| {
                let _ = done.send(outcome.state());
            }),
        )
        .expect("submit");
    started.notified().await;
    assert_eq!(scheduler.state(&id), Some(RequestState::Running));

    assert!(scheduler.cancel(&id));
    assert_eq!(finished.recv().await, Some(RequestState::Cancelled));
    assert_eq!(scheduler.state(&id), None);
    assert!(!scheduler.cancel(&id));

    let status = scheduler.status();
    assert_eq!((status.processed, status.errors), (0, 0), "cancellations are not measured");
    scheduler.stop().await;
}

#[tokio::test(start_paused = true)]
async fn cancel_by_category_only_touches_that_category() {
    let scheduler = Scheduler::new(config(1, 1, false));
    let blocker = occupy(&scheduler).await;

    let noop = |_ctx: ExecutionContext| futures::future::ready(anyhow::Ok(()));
    scheduler
        .submit(noop, SubmitOptions::new().category("reindex"))
        .expect("r1");
    scheduler
        .submit(noop, SubmitOptions::new().category("reindex"))
        .expect("r2");
    let chat = scheduler
        .submit(noop, SubmitOptions::new().category("chat"))
        .expect("chat");

    assert_eq!(scheduler.cancel_by_category("reindex"), 2);
    assert_eq!(scheduler.cancel_by_category("reindex"), 0);
    let queued: Vec<RequestId> = scheduler.queued().into_iter().map(|item| item.id).collect();
    assert_eq!(queued, vec![chat]);

    blocker.release.notify_one();
    scheduler.stop().await;
}

#[tokio::test(start_paused = true)]
async fn stop_waits_for_in_flight_work_and_rejects_new_submissions() {
    let scheduler = Scheduler::new(config(2, 2, false));
    let returned = Arc::new(AtomicUsize::new(0));
    let (ready, mut running) = mpsc::unbounded_channel::<()>();

    for _ in 0..2 {
        let (returned, ready) = (Arc::clone(&returned), ready.clone());
        scheduler
            .submit(
                move |ctx: ExecutionContext| {
                    let (returned, ready) = (Arc::clone(&returned), ready.clone());
                    async move {
                        let _ = ready.send(());
                        ctx.cancelled().await;
                        tokio::time::sleep(Duration::from_millis(250)).await;
                        returned.fetch_add(1, Ordering::SeqCst);
                        anyhow::Ok(())
                    }
                },
                SubmitOptions::new(),
            )
            .expect("submit");
    }
    running.recv().await.expect("first started");
    running.recv().await.expect("second started");

    let late_ran = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&late_ran);
    scheduler
        .submit(
            move |_ctx: ExecutionContext| {
                flag.store(true, Ordering::SeqCst);
                futures::future::ready(anyhow::Ok(()))
            },
            SubmitOptions::new(),
        )
        .expect("queued behind the running pair");

    scheduler.stop().await;
    assert_eq!(returned.load(Ordering::SeqCst), 2);
    assert!(!late_ran.load(Ordering::SeqCst));

    let status = scheduler.status();
    assert!(status.stopped);
    assert_eq!((status.pending, status.active, status.live), (0, 0, 0));

    let err = scheduler
        .submit(
            |_ctx: ExecutionContext| futures::future::ready(anyhow::Ok(())),
            SubmitOptions::new(),
        )
        .expect_err("stopped scheduler rejects work");
    assert!(matches!(err, SchedulerError::ShutDown));
    scheduler.stop().await;
}

#[tokio::test(start_paused = true)]
async fn duplicate_live_ids_are_rejected() {
    let scheduler = Scheduler::new(config(1, 1, false));
    let blocker = occupy(&scheduler).await;
    let noop = |_ctx: ExecutionContext| futures::future::ready(anyhow::Ok(()));

    let err = scheduler
        .submit(noop, SubmitOptions::new().id(blocker.id.clone()))
        .expect_err("running id is live");
    assert!(matches!(err, SchedulerError::DuplicateId(_)));

    blocker.release.notify_one();
    scheduler
        .run(noop, SubmitOptions::new().id("job"))
        .await
        .expect("first");
    scheduler
        .run(noop, SubmitOptions::new().id("job"))
        .await
        .expect("id is free again once finished");
    scheduler.stop().await;
}

#[tokio::test(start_paused = true)]
async fn active_counts_only_running_executions() {
    let scheduler = Scheduler::new(config(2, 2, false));
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(scheduler.status().active, 0, "idle dispatcher reserves no running slot");

    let blocker = occupy(&scheduler).await;
    let status = scheduler.status();
    assert_eq!((status.pending, status.active, status.live), (0, 1, 1));

    blocker.release.notify_one();
    scheduler
        .run(|_ctx: ExecutionContext| async { anyhow::Ok(()) }, SubmitOptions::new())
        .await
        .expect("runs");
    tokio::time::sleep(Duration::from_millis(10)).await;
    let status = scheduler.status();
    assert_eq!((status.pending, status.active, status.live), (0, 0, 0));
    assert_eq!(status.processed, 2);
    scheduler.stop().await;
}

#[tokio::test(start_paused = true)]
async fn run_surfaces_failures_and_timeouts() {
    let scheduler = Scheduler::new(config(2, 2, false));

    let err = scheduler
        .run(
            |_ctx: ExecutionContext| async { Err::<(), _>(anyhow::anyhow!("model unloaded")) },
            SubmitOptions::new(),
        )
        .await
        .expect_err("work failed");
    assert!(matches!(&err, SchedulerError::Execution(message) if message.contains("model unloaded")));

    let err = scheduler
        .run(
            |ctx: ExecutionContext| async move {
                ctx.cancelled().await;
                anyhow::Ok(())
            },
            SubmitOptions::new().timeout(Duration::from_secs(3)),
        )
        .await
        .expect_err("deadline passed");
    assert!(matches!(err, SchedulerError::Timeout(after) if after == Duration::from_secs(3)));

    let status = scheduler.status();
    assert_eq!((status.processed, status.errors), (2, 2));
    assert!((status.error_rate - 1.0).abs() < f64::EPSILON);
    scheduler.stop().await;
}

#[tokio::test(start_paused = true)]
async fn parent_token_cancels_the_request() {
    let scheduler = Scheduler::new(config(1, 1, false));
    let parent = CancellationToken::new();
    let trigger = parent.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(1)).await;
        trigger.cancel();
    });

    let err = scheduler
        .run(
            |ctx: ExecutionContext| async move {
                ctx.cancelled().await;
                anyhow::Ok(())
            },
            SubmitOptions::new().parent(parent),
        )
        .await
        .expect_err("parent cancelled");
    assert!(matches!(err, SchedulerError::Cancelled(_)));
    scheduler.stop().await;
}

#[tokio::test(start_paused = true)]
async fn events_follow_the_request_lifecycle() {
    let scheduler = Scheduler::new(config(1, 1, false));
    let mut events = scheduler.subscribe();
    scheduler
        .run(
            |_ctx: ExecutionContext| futures::future::ready(anyhow::Ok(())),
            SubmitOptions::new().id("traced").category("chat").priority(Priority::HIGH),
        )
        .await
        .expect("run");

    let mut kinds = Vec::new();
    while let Ok(event) = events.try_recv() {
        assert_eq!(event.request_id, Some(RequestId::from("traced")));
        kinds.push(match event.payload {
            RequestEventPayload::Queued { priority, category } => {
                assert_eq!((priority, category.as_str()), (Priority::HIGH, "chat"));
                "queued"
            }
            RequestEventPayload::Started { .. } => "started",
            RequestEventPayload::Completed { .. } => "completed",
            other => panic!("unexpected event {other:?}"),
        });
    }
    assert_eq!(kinds, vec!["queued", "started", "completed"]);

    let json = scheduler.status().to_json().expect("status serializes");
    assert!(json.contains("\"avg_latency_ms\""));
    assert!(json.contains("\"processed\":1"));
    scheduler.stop().await;
}
