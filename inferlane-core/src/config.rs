use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::fs_watch::IgnoreRules;

/// Global knobs that tune scheduler behaviour.
///
/// All fields carry defaults so deployments can override a single value
/// without supplying a full configuration payload.
#[derive(Clone, Debug, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Execution limits and per-request deadlines.
    pub processor: ProcessorConfig,
    /// Latency watermarks that drive automatic concurrency tuning.
    pub adaptive: AdaptiveConfig,
    /// Lifecycle event fan-out sizing.
    pub events: EventConfig,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessorConfig {
    /// Concurrency limit the processor starts with.
    pub initial_concurrency: usize,
    /// Upper bound the adaptive policy may grow the limit to.
    pub max_concurrency: usize,
    /// Hard deadline applied to every execution unless the request overrides it.
    pub request_timeout_ms: u64,
    /// How long a cancelled execution may keep running before its future is
    /// dropped. `None` keeps cancellation purely cooperative.
    pub cancel_grace_ms: Option<u64>,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            initial_concurrency: 2,
            max_concurrency: 4,
            request_timeout_ms: 2 * 60 * 1_000,
            cancel_grace_ms: None,
        }
    }
}

impl ProcessorConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms.max(1))
    }

    pub fn cancel_grace(&self) -> Option<Duration> {
        self.cancel_grace_ms.map(Duration::from_millis)
    }

    /// Initial limit clamped into `1..=max_concurrency`.
    pub fn clamped_initial(&self) -> usize {
        let ceiling = self.max_concurrency.max(1);
        self.initial_concurrency.clamp(1, ceiling)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct AdaptiveConfig {
    /// Automatic tuning on/off. Manual `set_max_workers` always works.
    pub enabled: bool,
    /// Average latency above this shrinks the limit by one.
    pub high_latency_ms: u64,
    /// Average latency below this grows the limit by one.
    pub low_latency_ms: u64,
    /// Smoothing factor for the latency moving average, in `(0, 1]`.
    pub ema_alpha: f64,
}

impl Default for AdaptiveConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            high_latency_ms: 10_000,
            low_latency_ms: 5_000,
            ema_alpha: 0.3,
        }
    }
}

impl AdaptiveConfig {
    pub fn high_latency(&self) -> Duration {
        Duration::from_millis(self.high_latency_ms)
    }

    pub fn low_latency(&self) -> Duration {
        Duration::from_millis(self.low_latency_ms)
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct EventConfig {
    /// Broadcast buffer per subscriber; slow subscribers lag and skip events.
    pub channel_capacity: usize,
}

impl Default for EventConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 256,
        }
    }
}

/// Tuning controls for filesystem change coalescing.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchConfig {
    /// Quiet period in milliseconds before a burst is flushed.
    pub debounce_ms: u64,
    /// Paths and extensions that never reach subscribers.
    pub ignore: IgnoreRules,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            debounce_ms: 2_000,
            ignore: IgnoreRules::default(),
        }
    }
}

impl WatchConfig {
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms.max(1))
    }
}
