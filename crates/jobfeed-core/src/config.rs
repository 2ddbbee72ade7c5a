use std::time::Duration;

use crate::dedup::DedupConfig;
use crate::error::AppError;
use crate::poller::PollConfig;
use crate::publisher::PublishConfig;
use crate::throttle::ThrottleConfig;

/// Everything the supervisor needs, built once at startup.
#[derive(Debug, Clone)]
pub struct ProducerConfig {
    pub query: String,
    pub poll: PollConfig,
    pub throttle: ThrottleConfig,
    pub dedup: DedupConfig,
    pub publish: PublishConfig,
    /// How long in-flight publishes get to finish after shutdown starts.
    pub shutdown_timeout: Duration,
}

impl Default for ProducerConfig {
    fn default() -> Self {
        Self {
            query: "data engineer".to_string(),
            poll: PollConfig::default(),
            throttle: ThrottleConfig::default(),
            dedup: DedupConfig::default(),
            publish: PublishConfig::default(),
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

impl ProducerConfig {
    pub fn with_query(mut self, query: impl Into<String>) -> Self {
        self.query = query.into();
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll.base_interval = interval;
        self
    }

    pub fn with_max_backoff(mut self, max_backoff: Duration) -> Self {
        self.poll.max_backoff = max_backoff;
        self
    }

    pub fn with_dedup(mut self, dedup: DedupConfig) -> Self {
        self.dedup = dedup;
        self
    }

    pub fn with_publish(mut self, publish: PublishConfig) -> Self {
        self.publish = publish;
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// Reject settings that would make the producer misbehave.
    pub fn validate(&self) -> Result<(), AppError> {
        if self.query.trim().is_empty() {
            return Err(AppError::ConfigError("query must not be empty".into()));
        }
        if self.poll.base_interval.is_zero() {
            return Err(AppError::ConfigError(
                "poll interval must be greater than zero".into(),
            ));
        }
        if self.poll.max_backoff < self.poll.base_interval {
            return Err(AppError::ConfigError(format!(
                "max backoff ({}s) must not be shorter than the poll interval ({}s)",
                self.poll.max_backoff.as_secs(),
                self.poll.base_interval.as_secs()
            )));
        }
        if self.dedup.capacity == 0 {
            return Err(AppError::ConfigError(
                "dedup capacity must be at least 1".into(),
            ));
        }
        if self.dedup.retention.is_zero() {
            return Err(AppError::ConfigError(
                "dedup retention must be greater than zero".into(),
            ));
        }
        if self.publish.retry.max_attempts == 0 {
            return Err(AppError::ConfigError(
                "max publish attempts must be at least 1".into(),
            ));
        }
        if self.publish.concurrency == 0 {
            return Err(AppError::ConfigError(
                "publish concurrency must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(ProducerConfig::default().validate().is_ok());
    }

    #[test]
    fn test_empty_query_is_rejected() {
        let err = ProducerConfig::default()
            .with_query("   ")
            .validate()
            .unwrap_err();
        assert!(matches!(err, AppError::ConfigError(_)));
    }

    #[test]
    fn test_backoff_shorter_than_interval_is_rejected() {
        let err = ProducerConfig::default()
            .with_poll_interval(Duration::from_secs(120))
            .with_max_backoff(Duration::from_secs(60))
            .validate()
            .unwrap_err();
        assert!(err.to_string().contains("max backoff"));
    }

    #[test]
    fn test_zero_attempts_is_rejected() {
        let mut publish = PublishConfig::default();
        publish.retry.max_attempts = 0;
        let err = ProducerConfig::default()
            .with_publish(publish)
            .validate()
            .unwrap_err();
        assert!(err.is_fatal());
    }
}
