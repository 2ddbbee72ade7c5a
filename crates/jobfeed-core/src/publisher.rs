use std::time::Duration;

use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerError};
use crate::error::{AppError, ErrorKind};
use crate::models::{DeliveryResult, JobRecord, OutboundMessage};
use crate::retry::RetryConfig;
use crate::traits::MessageBus;

/// Publish-side configuration.
#[derive(Debug, Clone)]
pub struct PublishConfig {
    pub retry: RetryConfig,
    /// Maximum number of publishes in flight at once.
    pub concurrency: usize,
    /// Encoded messages above this size are rejected without touching the bus.
    pub max_message_bytes: usize,
    /// A bus failure streak longer than this escalates to a fatal error.
    pub bus_failure_limit: Duration,
    pub circuit: CircuitBreakerConfig,
}

impl Default for PublishConfig {
    fn default() -> Self {
        Self {
            retry: RetryConfig::default(),
            concurrency: 8,
            max_message_bytes: 1_000_000,
            bus_failure_limit: Duration::from_secs(5 * 60),
            circuit: CircuitBreakerConfig::default(),
        }
    }
}

/// Encodes records and hands them to the bus through a circuit breaker.
///
/// Cheap to clone; clones share the breaker.
#[derive(Clone)]
pub struct Publisher<B: MessageBus> {
    bus: B,
    breaker: CircuitBreaker,
    max_message_bytes: usize,
}

impl<B: MessageBus> Publisher<B> {
    pub fn new(bus: B, config: &PublishConfig) -> Self {
        Self {
            bus,
            breaker: CircuitBreaker::new("message-bus", config.circuit.clone()),
            max_message_bytes: config.max_message_bytes,
        }
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    /// Make a single delivery attempt.
    pub async fn publish(&self, record: &JobRecord, attempt: u32) -> DeliveryResult {
        let message = match OutboundMessage::encode(record) {
            Ok(message) => message,
            Err(e) => {
                tracing::warn!(record_id = %record.id(), error = %e, "Failed to encode record");
                return DeliveryResult::rejected(record.id(), attempt, &e);
            }
        };

        if message.payload.len() > self.max_message_bytes {
            let e = AppError::MessageRejected(format!(
                "message is {} bytes, limit is {}",
                message.payload.len(),
                self.max_message_bytes
            ));
            return DeliveryResult::rejected(record.id(), attempt, &e);
        }

        match self.breaker.call(|| self.bus.send(&message)).await {
            Ok(()) => DeliveryResult::delivered(record.id(), attempt),
            Err(CircuitBreakerError::Inner(e)) if e.kind() == ErrorKind::DataQuality => {
                DeliveryResult::rejected(record.id(), attempt, &e)
            }
            Err(e) => DeliveryResult::transient(record.id(), attempt, e),
        }
    }

    pub async fn flush(&self, timeout: Duration) -> Result<(), AppError> {
        self.bus.flush(timeout).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::DeliveryOutcome;
    use crate::testutil::{MockBus, make_record};

    #[tokio::test]
    async fn publish_delivers_canonical_message() {
        let bus = MockBus::healthy();
        let publisher = Publisher::new(bus.clone(), &PublishConfig::default());

        let result = publisher.publish(&make_record("J1"), 1).await;

        assert_eq!(result.outcome, DeliveryOutcome::Delivered);
        assert_eq!(result.attempt, 1);
        let sent = bus.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].key, "J1");
        assert!(String::from_utf8(sent[0].payload.clone())
            .unwrap()
            .starts_with(r#"{"fetchedAt":"#));
    }

    #[tokio::test]
    async fn oversized_message_is_rejected_before_bus() {
        let bus = MockBus::healthy();
        let config = PublishConfig {
            max_message_bytes: 10,
            ..Default::default()
        };
        let publisher = Publisher::new(bus.clone(), &config);

        let result = publisher.publish(&make_record("J1"), 1).await;

        assert_eq!(result.outcome, DeliveryOutcome::Rejected);
        assert_eq!(bus.send_count(), 0);
    }

    #[tokio::test]
    async fn bus_rejection_maps_to_rejected() {
        let bus = MockBus::with_responses(vec![Err(AppError::MessageRejected(
            "invalid message".into(),
        ))]);
        let publisher = Publisher::new(bus, &PublishConfig::default());

        let result = publisher.publish(&make_record("J1"), 1).await;

        assert_eq!(result.outcome, DeliveryOutcome::Rejected);
        assert!(result.error.unwrap().contains("invalid message"));
    }

    #[tokio::test]
    async fn bus_outage_maps_to_transient_failure() {
        let bus = MockBus::with_responses(vec![Err(AppError::BusUnavailable("down".into()))]);
        let publisher = Publisher::new(bus, &PublishConfig::default());

        let result = publisher.publish(&make_record("J1"), 2).await;

        assert_eq!(result.outcome, DeliveryOutcome::TransientFailure);
        assert_eq!(result.attempt, 2);
        assert_eq!(publisher.breaker().stats().failure_count, 1);
    }

    #[tokio::test]
    async fn open_circuit_fails_fast_without_sending() {
        let bus = MockBus::failing();
        let config = PublishConfig {
            circuit: CircuitBreakerConfig {
                failure_threshold: 1,
                ..Default::default()
            },
            ..Default::default()
        };
        let publisher = Publisher::new(bus.clone(), &config);

        publisher.publish(&make_record("J1"), 1).await;
        let result = publisher.publish(&make_record("J2"), 1).await;

        assert_eq!(result.outcome, DeliveryOutcome::TransientFailure);
        assert_eq!(bus.send_count(), 1);
    }
}
