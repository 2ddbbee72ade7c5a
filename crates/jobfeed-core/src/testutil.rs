//! Test utilities: mock implementations of the core traits.
//!
//! Handwritten mocks for dependency injection in unit and scenario tests.
//! All mocks use `Arc<Mutex<_>>` for interior mutability, allowing
//! test assertions on recorded calls.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{TimeZone, Utc};
use tokio_util::sync::CancellationToken;

use crate::error::AppError;
use crate::models::{JobRecord, OutboundMessage, SearchPage};
use crate::supervisor::{ProducerEvent, ProducerReporter};
use crate::traits::{JobSource, MessageBus};

// ---------------------------------------------------------------------------
// MockSource
// ---------------------------------------------------------------------------

/// Mock source that replays a script of pages and errors.
#[derive(Clone)]
pub struct MockSource {
    /// Each call pops the first element. Once empty, returns an empty page.
    responses: Arc<Mutex<Vec<Result<SearchPage, AppError>>>>,
    requests: Arc<Mutex<Vec<(String, u32)>>>,
    on_exhausted: Option<CancellationToken>,
}

impl MockSource {
    pub fn with_pages(responses: Vec<Result<SearchPage, AppError>>) -> Self {
        Self {
            responses: Arc::new(Mutex::new(responses)),
            requests: Arc::new(Mutex::new(Vec::new())),
            on_exhausted: None,
        }
    }

    /// Cancel `token` on the first fetch after the script runs out.
    pub fn cancel_when_exhausted(mut self, token: CancellationToken) -> Self {
        self.on_exhausted = Some(token);
        self
    }

    pub fn fetch_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    pub fn requested_pages(&self) -> Vec<u32> {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .map(|(_, page)| *page)
            .collect()
    }

    pub fn requested_queries(&self) -> Vec<String> {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .map(|(query, _)| query.clone())
            .collect()
    }
}

impl JobSource for MockSource {
    async fn fetch(&self, query: &str, page: u32) -> Result<SearchPage, AppError> {
        self.requests
            .lock()
            .unwrap()
            .push((query.to_string(), page));

        let next = {
            let mut responses = self.responses.lock().unwrap();
            if responses.is_empty() {
                None
            } else {
                Some(responses.remove(0))
            }
        };

        match next {
            Some(response) => response,
            None => {
                if let Some(token) = &self.on_exhausted {
                    token.cancel();
                }
                Ok(SearchPage::empty())
            }
        }
    }
}

// ---------------------------------------------------------------------------
// MockBus
// ---------------------------------------------------------------------------

/// Mock bus that records sends and replays scripted responses.
#[derive(Clone)]
pub struct MockBus {
    /// Each send pops the first element; once empty, `fallback` decides.
    responses: Arc<Mutex<Vec<Result<(), AppError>>>>,
    fallback_healthy: bool,
    latency: Option<Duration>,
    sent: Arc<Mutex<Vec<OutboundMessage>>>,
    send_count: Arc<Mutex<usize>>,
    /// (currently inside `send`, highest value seen)
    concurrency: Arc<Mutex<(usize, usize)>>,
    flushes: Arc<Mutex<Vec<Duration>>>,
}

impl MockBus {
    /// Bus that accepts every message.
    pub fn healthy() -> Self {
        Self::with_responses(Vec::new())
    }

    /// Bus that is unreachable for every send.
    pub fn failing() -> Self {
        Self {
            fallback_healthy: false,
            ..Self::healthy()
        }
    }

    /// Scripted responses first, then healthy.
    pub fn with_responses(responses: Vec<Result<(), AppError>>) -> Self {
        Self {
            responses: Arc::new(Mutex::new(responses)),
            fallback_healthy: true,
            latency: None,
            sent: Arc::new(Mutex::new(Vec::new())),
            send_count: Arc::new(Mutex::new(0)),
            concurrency: Arc::new(Mutex::new((0, 0))),
            flushes: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Every send sleeps this long before answering.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Messages the bus acknowledged, in acknowledgement order.
    pub fn sent(&self) -> Vec<OutboundMessage> {
        self.sent.lock().unwrap().clone()
    }

    pub fn sent_keys(&self) -> Vec<String> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .map(|m| m.key.clone())
            .collect()
    }

    /// Every send call, including failed ones.
    pub fn send_count(&self) -> usize {
        *self.send_count.lock().unwrap()
    }

    pub fn flush_count(&self) -> usize {
        self.flushes.lock().unwrap().len()
    }

    /// Timeout passed to each `flush` call.
    pub fn flush_timeouts(&self) -> Vec<Duration> {
        self.flushes.lock().unwrap().clone()
    }

    /// Most `send` calls ever running at the same time.
    pub fn peak_concurrent_sends(&self) -> usize {
        self.concurrency.lock().unwrap().1
    }
}

impl MessageBus for MockBus {
    async fn send(&self, message: &OutboundMessage) -> Result<(), AppError> {
        *self.send_count.lock().unwrap() += 1;
        {
            let mut concurrency = self.concurrency.lock().unwrap();
            concurrency.0 += 1;
            concurrency.1 = concurrency.1.max(concurrency.0);
        }

        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        self.concurrency.lock().unwrap().0 -= 1;

        let scripted = {
            let mut responses = self.responses.lock().unwrap();
            if responses.is_empty() {
                None
            } else {
                Some(responses.remove(0))
            }
        };
        let result = match scripted {
            Some(result) => result,
            None if self.fallback_healthy => Ok(()),
            None => Err(AppError::BusUnavailable("broker unreachable".into())),
        };

        if result.is_ok() {
            self.sent.lock().unwrap().push(message.clone());
        }
        result
    }

    async fn flush(&self, timeout: Duration) -> Result<(), AppError> {
        self.flushes.lock().unwrap().push(timeout);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// MockReporter
// ---------------------------------------------------------------------------

/// Reporter that records event names for assertions.
#[derive(Clone, Default)]
pub struct MockReporter {
    events: Arc<Mutex<Vec<String>>>,
}

impl MockReporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn labels(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }

    pub fn count(&self, label: &str) -> usize {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|l| l.as_str() == label)
            .count()
    }
}

impl ProducerReporter for MockReporter {
    fn report(&self, event: ProducerEvent<'_>) {
        let label = match event {
            ProducerEvent::Started { .. } => "Started",
            ProducerEvent::Polling { .. } => "Polling",
            ProducerEvent::PageFetched { .. } => "PageFetched",
            ProducerEvent::RateLimited { .. } => "RateLimited",
            ProducerEvent::SourceUnavailable { .. } => "SourceUnavailable",
            ProducerEvent::PageDropped { .. } => "PageDropped",
            ProducerEvent::Suppressed { .. } => "Suppressed",
            ProducerEvent::Delivered { .. } => "Delivered",
            ProducerEvent::Rejected { .. } => "Rejected",
            ProducerEvent::Abandoned { .. } => "Abandoned",
            ProducerEvent::ShuttingDown { .. } => "ShuttingDown",
            ProducerEvent::Fatal { .. } => "Fatal",
            ProducerEvent::Stopped { .. } => "Stopped",
        };
        self.events.lock().unwrap().push(label.to_string());
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// A record with a fixed fetch time and a small payload.
pub fn make_record(id: &str) -> JobRecord {
    let mut payload = serde_json::Map::new();
    payload.insert("company".into(), serde_json::json!({"display_name": "Acme"}));
    let fetched_at = Utc
        .with_ymd_and_hms(2025, 3, 1, 12, 0, 0)
        .single()
        .unwrap_or_else(Utc::now);
    JobRecord::new(id, format!("Job {id}"), payload, fetched_at).unwrap()
}

pub fn make_page(ids: &[&str], has_more: bool) -> SearchPage {
    SearchPage::new(ids.iter().map(|id| make_record(id)).collect(), has_more)
}
