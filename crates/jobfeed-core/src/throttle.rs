//! Request throttling for the job source.
//!
//! Wraps any [`JobSource`] with a minimum spacing between outgoing API
//! requests, so the poller stays under the provider's published limits even
//! when cooldowns are short.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::time::Duration;
//! use jobfeed_core::throttle::{ThrottleConfig, ThrottledSource};
//!
//! # use jobfeed_core::traits::JobSource;
//! # use jobfeed_core::models::SearchPage;
//! # #[derive(Clone)] struct MySource;
//! # impl JobSource for MySource {
//! #     async fn fetch(&self, _: &str, _: u32) -> Result<SearchPage, jobfeed_core::error::AppError> { todo!() }
//! # }
//! let config = ThrottleConfig::new(Duration::from_secs(1))
//!     .with_jitter(Duration::from_millis(250));
//! let source = ThrottledSource::new(MySource, config);
//! ```

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::error::AppError;
use crate::models::SearchPage;
use crate::traits::JobSource;

/// Configuration for the throttled source.
#[derive(Debug, Clone)]
pub struct ThrottleConfig {
    /// Minimum delay between consecutive requests.
    pub delay: Duration,

    /// Maximum random jitter added on top of `delay` (uniform [0, jitter]).
    /// Set to `Duration::ZERO` to disable.
    pub jitter: Duration,
}

impl ThrottleConfig {
    /// Create a new config with the given delay and no jitter.
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            jitter: Duration::ZERO,
        }
    }

    /// Add random jitter (uniform [0, jitter]) on top of the base delay.
    pub fn with_jitter(mut self, jitter: Duration) -> Self {
        self.jitter = jitter;
        self
    }

    /// Compute the effective delay for a single wait (delay + random jitter).
    fn effective_delay(&self) -> Duration {
        if self.jitter.is_zero() {
            return self.delay;
        }
        let jitter_ms = rand_jitter_ms(self.jitter.as_millis() as u64);
        self.delay + Duration::from_millis(jitter_ms)
    }
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            delay: Duration::from_secs(1),
            jitter: Duration::ZERO,
        }
    }
}

/// A [`JobSource`] wrapper that enforces a minimum request spacing.
///
/// Clones share the same clock, so concurrent callers are serialised.
#[derive(Clone)]
pub struct ThrottledSource<S> {
    inner: S,
    config: ThrottleConfig,
    last_request: Arc<Mutex<Option<Instant>>>,
}

impl<S: JobSource> ThrottledSource<S> {
    pub fn new(inner: S, config: ThrottleConfig) -> Self {
        Self {
            inner,
            config,
            last_request: Arc::new(Mutex::new(None)),
        }
    }

    /// Wait until the minimum delay has elapsed, then stamp the request time.
    ///
    /// The lock is held across the sleep so two callers cannot both slip in
    /// on the same slot.
    async fn wait_for_slot(&self) {
        let mut last = self.last_request.lock().await;

        if let Some(previous) = *last {
            let required = self.config.effective_delay();
            let elapsed = previous.elapsed();
            if elapsed < required {
                let sleep_duration = required - elapsed;
                tracing::debug!(
                    sleep_ms = %sleep_duration.as_millis(),
                    "Throttling source request"
                );
                tokio::time::sleep(sleep_duration).await;
            }
        }

        *last = Some(Instant::now());
    }
}

impl<S: JobSource> JobSource for ThrottledSource<S> {
    async fn fetch(&self, query: &str, page: u32) -> Result<SearchPage, AppError> {
        self.wait_for_slot().await;
        self.inner.fetch(query, page).await
    }
}

// Xorshift seeded from the clock; good enough for jitter.
fn rand_jitter_ms(max_ms: u64) -> u64 {
    if max_ms == 0 {
        return 0;
    }
    let mut x = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as u64;
    x ^= x << 13;
    x ^= x >> 7;
    x ^= x << 17;
    x % max_ms
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{MockSource, make_page};

    #[test]
    fn effective_delay_without_jitter() {
        let config = ThrottleConfig::new(Duration::from_secs(1));
        assert_eq!(config.effective_delay(), Duration::from_secs(1));
    }

    #[test]
    fn effective_delay_with_jitter_is_bounded() {
        let config =
            ThrottleConfig::new(Duration::from_millis(100)).with_jitter(Duration::from_millis(50));
        for _ in 0..100 {
            let d = config.effective_delay();
            assert!(d >= Duration::from_millis(100));
            assert!(d < Duration::from_millis(150));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn throttle_spaces_consecutive_requests() {
        let source = MockSource::with_pages(vec![
            Ok(make_page(&["A"], true)),
            Ok(make_page(&["B"], false)),
        ]);
        let throttled = ThrottledSource::new(source, ThrottleConfig::new(Duration::from_secs(2)));

        let start = Instant::now();
        throttled.fetch("rust", 1).await.unwrap();
        assert_eq!(start.elapsed(), Duration::ZERO);
        throttled.fetch("rust", 2).await.unwrap();
        assert!(start.elapsed() >= Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn throttle_skips_wait_when_already_idle() {
        let source = MockSource::with_pages(vec![
            Ok(make_page(&["A"], true)),
            Ok(make_page(&["B"], false)),
        ]);
        let throttled = ThrottledSource::new(source, ThrottleConfig::new(Duration::from_secs(2)));

        throttled.fetch("rust", 1).await.unwrap();
        tokio::time::advance(Duration::from_secs(5)).await;
        let before = Instant::now();
        throttled.fetch("rust", 2).await.unwrap();
        assert_eq!(before.elapsed(), Duration::ZERO);
    }

    #[tokio::test]
    async fn throttle_passes_through_errors() {
        let source = MockSource::with_pages(vec![Err(AppError::AuthError("401".into()))]);
        let throttled = ThrottledSource::new(source, ThrottleConfig::new(Duration::ZERO));

        let err = throttled.fetch("rust", 1).await.unwrap_err();
        assert!(matches!(err, AppError::AuthError(_)));
    }
}
