use thiserror::Error;

use crate::models::InferlaneConfig;

/// A single setting the scheduler refuses to start with.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigGuardRailError {
    #[error("scheduler.processor.max_concurrency must be at least 1")]
    ZeroCeiling,

    #[error("scheduler.processor.initial_concurrency must be at least 1")]
    ZeroInitial,

    #[error("scheduler.processor.request_timeout_ms must be greater than 0")]
    ZeroTimeout,

    #[error(
        "scheduler.adaptive.low_latency_ms ({low}) must be below high_latency_ms ({high})"
    )]
    WatermarksInverted { low: u64, high: u64 },

    #[error("scheduler.adaptive.ema_alpha must be in (0, 1], got {0}")]
    EmaAlphaOutOfRange(f64),

    #[error("scheduler.events.channel_capacity must be at least 1")]
    ZeroEventCapacity,

    #[error("watch.debounce_ms must be greater than 0")]
    ZeroDebounce,

    #[error("{} configuration problems: {}", .0.len(), join(.0))]
    Multiple(Vec<ConfigGuardRailError>),
}

fn join(errors: &[ConfigGuardRailError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Every guard rail violated by a configuration.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConfigGuardRails {
    pub violations: Vec<ConfigGuardRailError>,
}

impl ConfigGuardRails {
    pub fn check(config: &InferlaneConfig) -> Self {
        let processor = &config.scheduler.processor;
        let adaptive = &config.scheduler.adaptive;
        let mut violations = Vec::new();

        if processor.max_concurrency == 0 {
            violations.push(ConfigGuardRailError::ZeroCeiling);
        }
        if processor.initial_concurrency == 0 {
            violations.push(ConfigGuardRailError::ZeroInitial);
        }
        if processor.request_timeout_ms == 0 {
            violations.push(ConfigGuardRailError::ZeroTimeout);
        }
        if adaptive.low_latency_ms >= adaptive.high_latency_ms {
            violations.push(ConfigGuardRailError::WatermarksInverted {
                low: adaptive.low_latency_ms,
                high: adaptive.high_latency_ms,
            });
        }
        if !(adaptive.ema_alpha > 0.0 && adaptive.ema_alpha <= 1.0) {
            violations.push(ConfigGuardRailError::EmaAlphaOutOfRange(adaptive.ema_alpha));
        }
        if config.scheduler.events.channel_capacity == 0 {
            violations.push(ConfigGuardRailError::ZeroEventCapacity);
        }
        if config.watch.debounce_ms == 0 {
            violations.push(ConfigGuardRailError::ZeroDebounce);
        }

        Self { violations }
    }

    pub fn is_empty(&self) -> bool {
        self.violations.is_empty()
    }

    pub fn into_result(mut self) -> Result<(), ConfigGuardRailError> {
        match self.violations.len() {
            0 => Ok(()),
            1 => Err(self.violations.remove(0)),
            _ => Err(ConfigGuardRailError::Multiple(self.violations)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_pass() {
        assert!(ConfigGuardRails::check(&InferlaneConfig::default()).is_empty());
    }

    #[test]
    fn single_violation_is_reported_directly() {
        let mut config = InferlaneConfig::default();
        config.scheduler.adaptive.ema_alpha = 0.0;
        assert_eq!(
            ConfigGuardRails::check(&config).into_result(),
            Err(ConfigGuardRailError::EmaAlphaOutOfRange(0.0))
        );
    }

    #[test]
    fn several_violations_are_collected() {
        let mut config = InferlaneConfig::default();
        config.scheduler.processor.max_concurrency = 0;
        config.scheduler.adaptive.low_latency_ms = 20_000;
        let err = ConfigGuardRails::check(&config)
            .into_result()
            .expect_err("two problems");
        let ConfigGuardRailError::Multiple(errors) = &err else {
            panic!("expected Multiple, got {err:?}");
        };
        assert_eq!(errors.len(), 2);
        assert!(err.to_string().starts_with("2 configuration problems"));
    }
}
