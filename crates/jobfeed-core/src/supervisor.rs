use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::ProducerConfig;
use crate::dedup::DedupWindow;
use crate::error::AppError;
use crate::models::{DeliveryOutcome, DeliveryReport, JobRecord};
use crate::poller::{PollOutcome, Poller};
use crate::publisher::Publisher;
use crate::retry::RetryConfig;
use crate::traits::{JobSource, MessageBus};

/// Counters collected over one supervisor run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub cycles: u64,
    pub fetched: u64,
    pub suppressed: u64,
    pub delivered: u64,
    pub rejected: u64,
    pub abandoned: u64,
}

/// Events emitted by the supervisor for monitoring/logging.
#[derive(Debug, Clone)]
pub enum ProducerEvent<'a> {
    Started {
        query: &'a str,
    },
    Polling {
        page: u32,
    },
    PageFetched {
        page: u32,
        records: usize,
        next_page: u32,
    },
    RateLimited {
        delay: Duration,
    },
    SourceUnavailable {
        error: &'a AppError,
        delay: Duration,
    },
    PageDropped {
        page: u32,
        error: &'a AppError,
    },
    Suppressed {
        record_id: &'a str,
    },
    Delivered {
        record_id: &'a str,
        attempts: u32,
    },
    Rejected {
        record_id: &'a str,
        error: &'a str,
    },
    Abandoned {
        record_id: &'a str,
        attempts: u32,
        error: &'a str,
    },
    ShuttingDown {
        in_flight: usize,
    },
    Fatal {
        error: &'a AppError,
    },
    Stopped {
        summary: &'a RunSummary,
    },
}

/// Trait for receiving producer events (decoupled logging).
pub trait ProducerReporter: Send + Sync {
    fn report(&self, event: ProducerEvent<'_>) {
        let _ = event;
    }
}

/// Reporter that uses the `tracing` crate.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingReporter;

impl ProducerReporter for TracingReporter {
    fn report(&self, event: ProducerEvent<'_>) {
        match event {
            ProducerEvent::Started { query } => {
                tracing::info!(%query, "Producer started");
            }
            ProducerEvent::Polling { page } => {
                tracing::debug!(page, "Polling source");
            }
            ProducerEvent::PageFetched {
                page,
                records,
                next_page,
            } => {
                tracing::info!(page, records, next_page, "Page fetched");
            }
            ProducerEvent::RateLimited { delay } => {
                tracing::warn!(delay_secs = delay.as_secs(), "Source rate limited, backing off");
            }
            ProducerEvent::SourceUnavailable { error, delay } => {
                tracing::warn!(%error, delay_secs = delay.as_secs(), "Source unavailable, backing off");
            }
            ProducerEvent::PageDropped { page, error } => {
                tracing::warn!(page, %error, "Dropped unreadable page");
            }
            ProducerEvent::Suppressed { record_id } => {
                tracing::debug!(%record_id, "Duplicate suppressed");
            }
            ProducerEvent::Delivered {
                record_id,
                attempts,
            } => {
                tracing::info!(%record_id, attempts, "Record delivered");
            }
            ProducerEvent::Rejected { record_id, error } => {
                tracing::warn!(%record_id, %error, "Record rejected, dropping");
            }
            ProducerEvent::Abandoned {
                record_id,
                attempts,
                error,
            } => {
                tracing::warn!(%record_id, attempts, %error, "Delivery abandoned");
            }
            ProducerEvent::ShuttingDown { in_flight } => {
                tracing::info!(in_flight, "Producer shutting down");
            }
            ProducerEvent::Fatal { error } => {
                tracing::error!(
                    %error,
                    kind = ?error.kind(),
                    exit_code = error.exit_code(),
                    "Fatal error, escalating"
                );
            }
            ProducerEvent::Stopped { summary } => {
                tracing::info!(
                    cycles = summary.cycles,
                    fetched = summary.fetched,
                    suppressed = summary.suppressed,
                    delivered = summary.delivered,
                    rejected = summary.rejected,
                    abandoned = summary.abandoned,
                    "Producer stopped"
                );
            }
        }
    }
}

/// Deliver one record, retrying transient failures with capped backoff.
///
/// The backoff sleep is the only wait; cancelling `cancel` ends the loop
/// with the last transient failure as the final result.
pub async fn deliver_with_retry<B: MessageBus>(
    publisher: &Publisher<B>,
    record: &JobRecord,
    retry: &RetryConfig,
    cancel: &CancellationToken,
) -> DeliveryReport {
    let mut report = DeliveryReport::new(record.id());
    let mut attempt = 1;

    loop {
        let result = publisher.publish(record, attempt).await;
        let outcome = result.outcome;
        let error = result.error.clone();
        report.results.push(result);

        if outcome != DeliveryOutcome::TransientFailure || !retry.can_retry(attempt) {
            break;
        }

        let delay = retry.delay_after_attempt(attempt);
        tracing::debug!(
            record_id = %record.id(),
            attempt,
            delay_ms = delay.as_millis() as u64,
            error = error.as_deref().unwrap_or_default(),
            "Publish failed, retrying"
        );

        tokio::select! {
            () = tokio::time::sleep(delay) => {}
            () = cancel.cancelled() => {
                tracing::info!(record_id = %record.id(), attempt, "Retry cancelled by shutdown");
                break;
            }
        }
        attempt += 1;
    }

    report
}

/// Owns every component and runs the fetch → dedup → publish loop.
pub struct Supervisor<S, B>
where
    S: JobSource,
    B: MessageBus,
{
    poller: Poller<S>,
    dedup: DedupWindow,
    publisher: Publisher<B>,
    config: ProducerConfig,
}

impl<S, B> Supervisor<S, B>
where
    S: JobSource,
    B: MessageBus,
{
    pub fn new(source: S, bus: B, config: ProducerConfig) -> Self {
        Self {
            poller: Poller::new(source, config.query.clone(), &config.poll),
            dedup: DedupWindow::new(config.dedup.clone()),
            publisher: Publisher::new(bus, &config.publish),
            config,
        }
    }

    pub fn dedup(&self) -> &DedupWindow {
        &self.dedup
    }

    /// Run until cancellation or a fatal error.
    ///
    /// Returns the run summary on graceful shutdown and the escalated error
    /// otherwise. In both cases in-flight publishes are drained first.
    pub async fn run<R: ProducerReporter>(
        mut self,
        cancel: CancellationToken,
        reporter: &R,
    ) -> Result<RunSummary, AppError> {
        reporter.report(ProducerEvent::Started {
            query: &self.config.query,
        });

        let permits = Arc::new(Semaphore::new(self.config.publish.concurrency));
        let deliveries = cancel.child_token();
        let mut in_flight: JoinSet<DeliveryReport> = JoinSet::new();
        let mut summary = RunSummary::default();
        let mut fatal: Option<AppError> = None;

        'cycles: loop {
            if cancel.is_cancelled() {
                break;
            }

            summary.cycles += 1;
            reporter.report(ProducerEvent::Polling {
                page: self.poller.cursor().page,
            });

            // A fetch may sit in the request throttle; shutdown must not wait for it.
            let polled = tokio::select! {
                polled = self.poller.poll() => polled,
                () = cancel.cancelled() => break,
            };

            match polled {
                Ok(PollOutcome::Fetched {
                    page,
                    records,
                    next_page,
                }) => {
                    reporter.report(ProducerEvent::PageFetched {
                        page,
                        records: records.len(),
                        next_page,
                    });
                    summary.fetched += records.len() as u64;

                    for record in records {
                        if !self.dedup.try_claim(record.id()) {
                            summary.suppressed += 1;
                            reporter.report(ProducerEvent::Suppressed {
                                record_id: record.id(),
                            });
                            continue;
                        }

                        let permit = tokio::select! {
                            permit = permits.clone().acquire_owned() => permit,
                            () = cancel.cancelled() => {
                                self.dedup.release(record.id());
                                break 'cycles;
                            }
                        };
                        let Ok(permit) = permit else {
                            self.dedup.release(record.id());
                            break 'cycles;
                        };

                        let publisher = self.publisher.clone();
                        let dedup = self.dedup.clone();
                        let retry = self.config.publish.retry.clone();
                        let token = deliveries.clone();
                        in_flight.spawn(async move {
                            let _permit = permit;
                            let report =
                                deliver_with_retry(&publisher, &record, &retry, &token).await;
                            if report.final_outcome() == Some(DeliveryOutcome::Delivered) {
                                dedup.mark_seen(record.id());
                            } else {
                                dedup.release(record.id());
                            }
                            report
                        });

                        self.reap_finished(&mut in_flight, &mut summary, reporter);
                    }
                }
                Ok(PollOutcome::RateLimited { delay }) => {
                    reporter.report(ProducerEvent::RateLimited { delay });
                }
                Ok(PollOutcome::Unavailable { error, delay }) => {
                    reporter.report(ProducerEvent::SourceUnavailable {
                        error: &error,
                        delay,
                    });
                }
                Ok(PollOutcome::PageDropped { page, error }) => {
                    reporter.report(ProducerEvent::PageDropped {
                        page,
                        error: &error,
                    });
                }
                Err(error) => {
                    fatal = Some(error);
                    break;
                }
            }

            self.reap_finished(&mut in_flight, &mut summary, reporter);
            if let Some(error) = self.check_bus_health() {
                fatal = Some(error);
                break;
            }

            let swept = self.dedup.sweep();
            if swept > 0 {
                tracing::debug!(swept, "Expired ids swept from dedup window");
            }

            if !self.poller.cool_down(&cancel).await {
                break;
            }

            self.reap_finished(&mut in_flight, &mut summary, reporter);
            if let Some(error) = self.check_bus_health() {
                fatal = Some(error);
                break;
            }
        }

        if let Some(error) = &fatal {
            reporter.report(ProducerEvent::Fatal { error });
            deliveries.cancel();
        }
        reporter.report(ProducerEvent::ShuttingDown {
            in_flight: in_flight.len(),
        });

        let shutdown_started = Instant::now();
        self.drain(&mut in_flight, &mut summary, reporter).await;

        let flush_budget = self
            .config
            .shutdown_timeout
            .saturating_sub(shutdown_started.elapsed());
        if let Err(e) = self.publisher.flush(flush_budget).await {
            tracing::warn!(error = %e, "Failed to flush message bus on shutdown");
        }

        reporter.report(ProducerEvent::Stopped { summary: &summary });

        match fatal {
            Some(error) => Err(error),
            None => Ok(summary),
        }
    }

    /// Escalate when the bus has been failing for longer than allowed.
    fn check_bus_health(&self) -> Option<AppError> {
        let span = self.publisher.breaker().failure_span();
        let limit = self.config.publish.bus_failure_limit;
        if span <= limit {
            return None;
        }
        let last_error = self
            .publisher
            .breaker()
            .stats()
            .last_error
            .unwrap_or_else(|| "unknown".to_string());
        Some(AppError::BusUnavailable(format!(
            "bus failing for {}s, limit is {}s; last error: {last_error}",
            span.as_secs(),
            limit.as_secs()
        )))
    }

    /// Wait for in-flight deliveries up to the shutdown timeout, then abort the rest.
    async fn drain<R: ProducerReporter>(
        &self,
        in_flight: &mut JoinSet<DeliveryReport>,
        summary: &mut RunSummary,
        reporter: &R,
    ) {
        let drained = tokio::time::timeout(self.config.shutdown_timeout, async {
            while let Some(joined) = in_flight.join_next().await {
                self.settle(joined, summary, reporter);
            }
        })
        .await;

        if drained.is_err() {
            tracing::warn!(
                remaining = in_flight.len(),
                timeout_secs = self.config.shutdown_timeout.as_secs(),
                "Shutdown timeout reached, aborting in-flight publishes"
            );
            in_flight.abort_all();
            while in_flight.join_next().await.is_some() {}
        }
    }

    fn reap_finished<R: ProducerReporter>(
        &self,
        in_flight: &mut JoinSet<DeliveryReport>,
        summary: &mut RunSummary,
        reporter: &R,
    ) {
        while let Some(joined) = in_flight.try_join_next() {
            self.settle(joined, summary, reporter);
        }
    }

    /// Fold a finished delivery into the counters.
    ///
    /// The publish task has already settled its dedup claim. An aborted task
    /// keeps its claim until restart.
    fn settle<R: ProducerReporter>(
        &self,
        joined: Result<DeliveryReport, tokio::task::JoinError>,
        summary: &mut RunSummary,
        reporter: &R,
    ) {
        let report = match joined {
            Ok(report) => report,
            Err(e) => {
                tracing::error!(error = %e, "Publish task did not complete");
                return;
            }
        };
        let record_id = report.record_id.as_str();

        match report.final_outcome() {
            Some(DeliveryOutcome::Delivered) => {
                summary.delivered += 1;
                reporter.report(ProducerEvent::Delivered {
                    record_id,
                    attempts: report.attempts(),
                });
            }
            Some(DeliveryOutcome::Rejected) => {
                summary.rejected += 1;
                reporter.report(ProducerEvent::Rejected {
                    record_id,
                    error: report.last_error().unwrap_or_default(),
                });
            }
            Some(DeliveryOutcome::TransientFailure) | None => {
                summary.abandoned += 1;
                reporter.report(ProducerEvent::Abandoned {
                    record_id,
                    attempts: report.attempts(),
                    error: report.last_error().unwrap_or_default(),
                });
            }
        }
    }
}
