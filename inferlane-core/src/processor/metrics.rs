use std::time::Duration;

use serde::Serialize;

use crate::config::AdaptiveConfig;

/// Rolling execution statistics. Only the processor writes these.
#[derive(Clone, Copy, Debug, Default, Serialize)]
pub struct ProcessorMetrics {
    pub processed: u64,
    pub errors: u64,
    /// Exponential moving average over every recorded execution.
    pub avg_latency: Duration,
    pub last_latency: Option<Duration>,
}

impl ProcessorMetrics {
    /// Folds one finished execution into the averages. The first sample
    /// seeds the average directly.
    pub fn record(&mut self, latency: Duration, failed: bool, alpha: f64) {
        self.avg_latency = if self.processed == 0 {
            latency
        } else {
            let alpha = alpha.clamp(f64::EPSILON, 1.0);
            let blended =
                alpha * latency.as_secs_f64() + (1.0 - alpha) * self.avg_latency.as_secs_f64();
            Duration::from_secs_f64(blended.max(0.0))
        };
        self.last_latency = Some(latency);
        self.processed += 1;
        if failed {
            self.errors += 1;
        }
    }

    pub fn error_rate(&self) -> f64 {
        if self.processed == 0 {
            0.0
        } else {
            self.errors as f64 / self.processed as f64
        }
    }
}

/// Next concurrency limit for the observed average latency, or `None` to keep
/// the current one.
pub fn next_limit(
    avg_latency: Duration,
    current: usize,
    ceiling: usize,
    config: &AdaptiveConfig,
) -> Option<usize> {
    if avg_latency > config.high_latency() && current > 1 {
        Some(current - 1)
    } else if avg_latency < config.low_latency() && current < ceiling {
        Some(current + 1)
    } else {
        None
    }
}
