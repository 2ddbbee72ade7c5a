use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;

use crate::error::{AppError, ErrorKind};
use crate::models::{FetchCursor, JobRecord};
use crate::retry::Cooldown;
use crate::traits::JobSource;

/// Poll timing configuration.
#[derive(Debug, Clone)]
pub struct PollConfig {
    /// Delay between healthy cycles.
    pub base_interval: Duration,
    /// Upper bound for the cooldown after repeated pressure.
    pub max_backoff: Duration,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            base_interval: Duration::from_secs(60),
            max_backoff: Duration::from_secs(15 * 60),
        }
    }
}

/// Where the poller is in its fetch cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollerState {
    Idle,
    Fetching,
    CoolingDown,
    /// Terminal. Reached only from a fatal source error.
    Faulted,
}

impl std::fmt::Display for PollerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PollerState::Idle => write!(f, "idle"),
            PollerState::Fetching => write!(f, "fetching"),
            PollerState::CoolingDown => write!(f, "cooling-down"),
            PollerState::Faulted => write!(f, "faulted"),
        }
    }
}

/// What one fetch cycle produced.
#[derive(Debug)]
pub enum PollOutcome {
    /// A page was fetched; `next_page` is where the following cycle starts.
    Fetched {
        page: u32,
        records: Vec<JobRecord>,
        next_page: u32,
    },
    /// The source throttled us; the cooldown was raised.
    RateLimited { delay: Duration },
    /// The source was unreachable; same page will be retried after `delay`.
    Unavailable { error: AppError, delay: Duration },
    /// The page could not be read and was skipped.
    PageDropped { page: u32, error: AppError },
}

/// Drives fetch cycles against a [`JobSource`] and owns the cursor and cooldown.
pub struct Poller<S: JobSource> {
    source: S,
    cursor: FetchCursor,
    cooldown: Cooldown,
    state: PollerState,
}

impl<S: JobSource> Poller<S> {
    pub fn new(source: S, query: impl Into<String>, config: &PollConfig) -> Self {
        Self {
            source,
            cursor: FetchCursor::new(query),
            cooldown: Cooldown::new(config.base_interval, config.max_backoff),
            state: PollerState::Idle,
        }
    }

    pub fn state(&self) -> PollerState {
        self.state
    }

    pub fn cursor(&self) -> &FetchCursor {
        &self.cursor
    }

    /// Delay the next cooldown will wait.
    pub fn current_delay(&self) -> Duration {
        self.cooldown.current()
    }

    /// Run one fetch cycle.
    ///
    /// Only fatal errors are returned as `Err`; everything else is folded
    /// into a [`PollOutcome`] and the poller ends up cooling down.
    pub async fn poll(&mut self) -> Result<PollOutcome, AppError> {
        if self.state == PollerState::Faulted {
            return Err(AppError::PollerFaulted(
                "poller is faulted and refuses further cycles".into(),
            ));
        }

        self.state = PollerState::Fetching;
        self.cursor.last_attempt = Some(Utc::now());
        let page = self.cursor.page;

        let result = self.source.fetch(&self.cursor.query, page).await;

        let outcome = match result {
            Ok(search_page) => {
                self.cooldown.reset();
                if search_page.has_more && search_page.received > 0 {
                    self.cursor.advance();
                } else {
                    self.cursor.restart();
                }
                PollOutcome::Fetched {
                    page,
                    records: search_page.records,
                    next_page: self.cursor.page,
                }
            }
            Err(AppError::RateLimitExceeded { retry_after }) => {
                let delay = self.cooldown.escalate(retry_after);
                PollOutcome::RateLimited { delay }
            }
            Err(error) if error.is_fatal() => {
                self.state = PollerState::Faulted;
                return Err(error);
            }
            Err(error) if error.kind() == ErrorKind::DataQuality => {
                self.cooldown.reset();
                self.cursor.advance();
                PollOutcome::PageDropped { page, error }
            }
            Err(error) => {
                let delay = self.cooldown.escalate(None);
                PollOutcome::Unavailable { error, delay }
            }
        };

        self.state = PollerState::CoolingDown;
        Ok(outcome)
    }

    /// Wait out the current cooldown.
    ///
    /// Returns `false` if cancelled before the delay elapsed.
    pub async fn cool_down(&mut self, cancel: &CancellationToken) -> bool {
        let delay = self.cooldown.current();
        let completed = tokio::select! {
            () = tokio::time::sleep(delay) => true,
            () = cancel.cancelled() => false,
        };
        if completed && self.state == PollerState::CoolingDown {
            self.state = PollerState::Idle;
        }
        completed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::SearchPage;
    use crate::testutil::{MockSource, make_page};

    fn config(base: u64, max: u64) -> PollConfig {
        PollConfig {
            base_interval: Duration::from_secs(base),
            max_backoff: Duration::from_secs(max),
        }
    }

    #[tokio::test]
    async fn success_with_more_results_advances_page() {
        let source = MockSource::with_pages(vec![Ok(make_page(&["A", "B"], true))]);
        let mut poller = Poller::new(source, "rust", &config(60, 900));

        let outcome = poller.poll().await.unwrap();

        match outcome {
            PollOutcome::Fetched {
                page,
                records,
                next_page,
            } => {
                assert_eq!(page, 1);
                assert_eq!(records.len(), 2);
                assert_eq!(next_page, 2);
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert_eq!(poller.state(), PollerState::CoolingDown);
        assert!(poller.cursor().last_attempt.is_some());
    }

    #[tokio::test]
    async fn last_page_restarts_scan() {
        let source = MockSource::with_pages(vec![
            Ok(make_page(&["A"], true)),
            Ok(make_page(&["B"], false)),
        ]);
        let mut poller = Poller::new(source.clone(), "rust", &config(60, 900));

        poller.poll().await.unwrap();
        assert_eq!(poller.cursor().page, 2);
        poller.poll().await.unwrap();
        assert_eq!(poller.cursor().page, 1);
        assert_eq!(source.requested_pages(), vec![1, 2]);
    }

    #[tokio::test]
    async fn page_with_only_unusable_results_still_advances() {
        let source = MockSource::with_pages(vec![
            Ok(SearchPage::new(Vec::new(), true).with_received(20)),
            Ok(make_page(&["C"], false)),
        ]);
        let mut poller = Poller::new(source.clone(), "rust", &config(60, 900));

        poller.poll().await.unwrap();
        assert_eq!(poller.cursor().page, 2);
        poller.poll().await.unwrap();
        assert_eq!(source.requested_pages(), vec![1, 2]);
    }

    #[tokio::test]
    async fn empty_page_restarts_scan_even_if_more_claimed() {
        let source = MockSource::with_pages(vec![Ok(SearchPage::new(Vec::new(), true))]);
        let mut poller = Poller::new(source, "rust", &config(60, 900));

        poller.poll().await.unwrap();
        assert_eq!(poller.cursor().page, 1);
    }

    #[tokio::test]
    async fn rate_limit_doubles_delay_up_to_cap() {
        let source = MockSource::with_pages(vec![
            Err(AppError::RateLimitExceeded { retry_after: None }),
            Err(AppError::RateLimitExceeded { retry_after: None }),
            Err(AppError::RateLimitExceeded { retry_after: None }),
            Ok(make_page(&["A"], false)),
        ]);
        let mut poller = Poller::new(source, "rust", &config(60, 200));

        let previous = poller.current_delay();
        poller.poll().await.unwrap();
        assert_eq!(poller.current_delay(), previous * 2);

        poller.poll().await.unwrap();
        assert_eq!(poller.current_delay(), Duration::from_secs(200));
        poller.poll().await.unwrap();
        assert_eq!(poller.current_delay(), Duration::from_secs(200));

        poller.poll().await.unwrap();
        assert_eq!(poller.current_delay(), Duration::from_secs(60));
    }

    #[tokio::test]
    async fn network_error_backs_off_and_keeps_page() {
        let source = MockSource::with_pages(vec![
            Ok(make_page(&["A"], true)),
            Err(AppError::NetworkError("reset".into())),
        ]);
        let mut poller = Poller::new(source, "rust", &config(10, 900));

        poller.poll().await.unwrap();
        let outcome = poller.poll().await.unwrap();

        assert!(matches!(outcome, PollOutcome::Unavailable { .. }));
        assert_eq!(poller.cursor().page, 2);
        assert_eq!(poller.current_delay(), Duration::from_secs(20));
    }

    #[tokio::test]
    async fn malformed_page_is_dropped_and_skipped() {
        let source = MockSource::with_pages(vec![Err(AppError::MalformedResponse(
            "not json".into(),
        ))]);
        let mut poller = Poller::new(source, "rust", &config(10, 900));

        let outcome = poller.poll().await.unwrap();

        assert!(matches!(outcome, PollOutcome::PageDropped { page: 1, .. }));
        assert_eq!(poller.cursor().page, 2);
        assert_eq!(poller.current_delay(), Duration::from_secs(10));
    }

    #[tokio::test]
    async fn auth_error_faults_poller_permanently() {
        let source = MockSource::with_pages(vec![
            Err(AppError::AuthError("401".into())),
            Ok(make_page(&["A"], false)),
        ]);
        let mut poller = Poller::new(source.clone(), "rust", &config(10, 900));

        let err = poller.poll().await.unwrap_err();
        assert!(matches!(err, AppError::AuthError(_)));
        assert_eq!(poller.state(), PollerState::Faulted);

        let err = poller.poll().await.unwrap_err();
        assert!(matches!(err, AppError::PollerFaulted(_)));
        assert_eq!(source.fetch_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cool_down_waits_for_current_delay() {
        let source = MockSource::with_pages(vec![Ok(make_page(&["A"], false))]);
        let mut poller = Poller::new(source, "rust", &config(30, 900));
        poller.poll().await.unwrap();

        let start = tokio::time::Instant::now();
        assert!(poller.cool_down(&CancellationToken::new()).await);
        assert_eq!(start.elapsed(), Duration::from_secs(30));
        assert_eq!(poller.state(), PollerState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn cool_down_returns_early_on_cancel() {
        let source = MockSource::with_pages(vec![Ok(make_page(&["A"], false))]);
        let mut poller = Poller::new(source, "rust", &config(30, 900));
        poller.poll().await.unwrap();

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            trigger.cancel();
        });

        let start = tokio::time::Instant::now();
        assert!(!poller.cool_down(&cancel).await);
        assert!(start.elapsed() < Duration::from_secs(30));
        assert_eq!(poller.state(), PollerState::CoolingDown);
    }
}
