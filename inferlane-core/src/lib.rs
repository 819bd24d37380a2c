//! # Inferlane Core
//!
//! Request scheduling for a single slow, capacity-limited inference backend
//! shared by several independent producers.
//!
//! ## Overview
//!
//! - **Change coalescing**: [`fs_watch::ChangeCoalescer`] turns bursts of file
//!   notifications into one batch per kind after a quiet period
//! - **Priority queue**: strict priority order, FIFO within a priority
//! - **Supersede and cancel**: newer work cancels the stale requests it names;
//!   cancellation is cooperative through [`ExecutionContext`]
//! - **Adaptive concurrency**: the processor shrinks or grows its limit from
//!   the moving average of execution latency
//!
//! ## Feature Flags
//!
//! - `fs-watch` (default): OS-level watching via `notify`. Manual injection
//!   into the coalescer works without it.
//!
//! ## Example
//!
//! ```no_run
//! use inferlane_core::{Priority, Scheduler, SchedulerConfig, SubmitOptions};
//!
//! # async fn demo() -> inferlane_core::Result<()> {
//! let scheduler = Scheduler::new(SchedulerConfig::default());
//! let id = scheduler.submit(
//!     |ctx: inferlane_core::ExecutionContext| async move {
//!         tokio::select! {
//!             _ = ctx.cancelled() => {}
//!             _ = tokio::time::sleep(std::time::Duration::from_secs(1)) => {}
//!         }
//!         anyhow::Ok(())
//!     },
//!     SubmitOptions::new().priority(Priority::HIGH).category("chat"),
//! )?;
//! println!("queued {id}");
//! scheduler.stop().await;
//! # Ok(())
//! # }
//! ```

#![cfg_attr(docsrs, feature(doc_cfg))]
#![allow(missing_docs)]

pub mod config;
pub mod error;
pub mod events;
pub mod fs_watch;
pub mod processor;
pub mod queue;
pub mod registry;
pub mod request;
pub mod scheduler;

pub use config::{AdaptiveConfig, EventConfig, ProcessorConfig, SchedulerConfig, WatchConfig};
pub use error::{Result, SchedulerError};
pub use events::{RequestEvent, RequestEventBus, RequestEventPayload};
pub use fs_watch::{ChangeCoalescer, ChangeEvent, ChangeKind, IgnoreRules};
pub use processor::{ProcessorMetrics, RequestLifecycle};
pub use queue::{PriorityQueue, QueuedItem};
pub use registry::CancellationRegistry;
pub use request::{
    DEFAULT_CATEGORY, ExecutionContext, Priority, Request, RequestId, RequestOutcome,
    RequestState, SubmitOptions, WorkUnit,
};
pub use scheduler::{Scheduler, SchedulerStatus};
