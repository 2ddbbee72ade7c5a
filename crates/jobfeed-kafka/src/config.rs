use std::time::Duration;

use jobfeed_core::AppError;

/// Configuration for the Kafka producer.
#[derive(Debug, Clone)]
pub struct KafkaConfig {
    /// Comma-separated `host:port` list.
    pub brokers: String,
    pub topic: String,
    pub client_id: String,
    /// How long librdkafka keeps retrying a message before reporting failure.
    pub message_timeout: Duration,
    /// How long `send` waits for room in a full local queue.
    pub queue_timeout: Duration,
}

impl Default for KafkaConfig {
    fn default() -> Self {
        Self {
            brokers: "kafka:9092".to_string(),
            topic: "jobs_data".to_string(),
            client_id: "jobfeed".to_string(),
            message_timeout: Duration::from_secs(30),
            queue_timeout: Duration::from_secs(5),
        }
    }
}

impl KafkaConfig {
    pub fn new(brokers: impl Into<String>, topic: impl Into<String>) -> Self {
        Self {
            brokers: brokers.into(),
            topic: topic.into(),
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<(), AppError> {
        if self.brokers.split(',').all(|b| b.trim().is_empty()) {
            return Err(AppError::ConfigError(
                "at least one Kafka broker is required".into(),
            ));
        }
        if self.topic.is_empty() || self.topic.len() > 249 {
            return Err(AppError::ConfigError(format!(
                "invalid topic name '{}': must be 1-249 characters",
                self.topic
            )));
        }
        if !self
            .topic
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
        {
            return Err(AppError::ConfigError(format!(
                "invalid topic name '{}': only [a-zA-Z0-9._-] allowed",
                self.topic
            )));
        }
        if self.message_timeout.is_zero() {
            return Err(AppError::ConfigError(
                "message timeout must be greater than zero".into(),
            ));
        }
        Ok(())
    }
}
