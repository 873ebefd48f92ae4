//! Tracing setup for runwatch.
//!
//! Console output is human-readable by default; `json_logs` switches to one
//! JSON object per line for log shippers. `RUST_LOG` overrides the filter.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::Level;
use tracing_subscriber::{
    EnvFilter,
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
};

use crate::config::AppConfig;

#[derive(Debug, Clone, Copy, Default)]
pub struct LogConfig {
    pub json: bool,
    pub verbose: bool,
}

impl From<&AppConfig> for LogConfig {
    fn from(config: &AppConfig) -> Self {
        Self {
            json: config.json_logs,
            verbose: config.verbose,
        }
    }
}

/// Default filter: our own crate at info (debug when verbose), HTTP client
/// internals at warn.
pub fn default_filter(verbose: bool) -> String {
    let level = if verbose { Level::DEBUG } else { Level::INFO };
    format!(
        "runwatch={},reqwest=warn,hyper=warn",
        level.as_str().to_lowercase()
    )
}

/// Install the global subscriber. Call once, after config is loaded.
pub fn init(config: LogConfig) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_filter(config.verbose)));

    if config.json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(
                fmt::layer()
                    .json()
                    .with_span_events(FmtSpan::CLOSE)
                    .with_current_span(true)
                    .with_target(true),
            )
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().with_target(false).with_thread_ids(false))
            .init();
    }
}

/// Rate limiter for repetitive log lines such as poll retry warnings.
///
/// ```ignore
/// let throttle = LogThrottle::new(Duration::from_secs(30));
/// if let Some(suppressed) = throttle.check() {
///     warn!(suppressed, "Status poll failed");
/// }
/// ```
pub struct LogThrottle {
    interval_ms: u64,
    /// Last log time in ms since `start`, or `NEVER_LOGGED`.
    last_log_ms: AtomicU64,
    suppressed: AtomicU64,
    start: Instant,
}

const NEVER_LOGGED: u64 = u64::MAX;

impl LogThrottle {
    pub fn new(interval: std::time::Duration) -> Self {
        Self {
            interval_ms: interval.as_millis() as u64,
            last_log_ms: AtomicU64::new(NEVER_LOGGED),
            suppressed: AtomicU64::new(0),
            start: Instant::now(),
        }
    }

    /// `Some(n)` when a line may be logged now, where `n` is how many calls
    /// were suppressed since the previous one. `None` means stay quiet.
    pub fn check(&self) -> Option<u64> {
        let now_ms = self.start.elapsed().as_millis() as u64;
        let last = self.last_log_ms.load(Ordering::Relaxed);
        let due = last == NEVER_LOGGED || now_ms.saturating_sub(last) >= self.interval_ms;

        if due
            && self
                .last_log_ms
                .compare_exchange(last, now_ms, Ordering::Relaxed, Ordering::Relaxed)
                .is_ok()
        {
            return Some(self.suppressed.swap(0, Ordering::Relaxed));
        }
        self.suppressed.fetch_add(1, Ordering::Relaxed);
        None
    }

    pub fn reset(&self) {
        self.last_log_ms.store(NEVER_LOGGED, Ordering::Relaxed);
        self.suppressed.store(0, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn first_call_logs_and_repeats_are_counted() {
        let throttle = LogThrottle::new(Duration::from_secs(100));
        assert_eq!(throttle.check(), Some(0));
        assert_eq!(throttle.check(), None);
        assert_eq!(throttle.check(), None);

        throttle.reset();
        assert_eq!(throttle.check(), Some(0));
    }

    #[test]
    fn suppressed_count_is_reported_once_due() {
        let throttle = LogThrottle::new(Duration::ZERO);
        assert_eq!(throttle.check(), Some(0));
        assert_eq!(throttle.check(), Some(0));
    }

    #[test]
    fn verbose_filter_enables_debug() {
        assert!(default_filter(true).starts_with("runwatch=debug"));
        assert!(default_filter(false).starts_with("runwatch=info"));
    }
}
