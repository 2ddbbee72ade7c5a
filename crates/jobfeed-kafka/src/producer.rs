use std::time::Duration;

use jobfeed_core::AppError;
use jobfeed_core::models::OutboundMessage;
use jobfeed_core::traits::MessageBus;
use rdkafka::ClientConfig;
use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use rdkafka::message::{Header, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};

use crate::config::KafkaConfig;

/// [`MessageBus`] backed by an idempotent rdkafka producer.
#[derive(Clone)]
pub struct KafkaBus {
    producer: FutureProducer,
    topic: String,
    queue_timeout: Duration,
}

impl KafkaBus {
    /// Build the producer. Does not contact the brokers.
    pub fn new(config: &KafkaConfig) -> Result<Self, AppError> {
        config.validate()?;

        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", &config.brokers)
            .set("client.id", &config.client_id)
            .set("acks", "all")
            .set("enable.idempotence", "true")
            .set(
                "message.timeout.ms",
                config.message_timeout.as_millis().to_string(),
            )
            .create()
            .map_err(|e| AppError::ConfigError(format!("Failed to create Kafka producer: {e}")))?;

        Ok(Self {
            producer,
            topic: config.topic.clone(),
            queue_timeout: config.queue_timeout,
        })
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Fetch topic metadata to check the brokers are reachable.
    pub async fn probe(&self, timeout: Duration) -> Result<usize, AppError> {
        let producer = self.producer.clone();
        let topic = self.topic.clone();
        let partitions = tokio::task::spawn_blocking(move || {
            producer
                .client()
                .fetch_metadata(Some(topic.as_str()), timeout)
                .map(|metadata| {
                    metadata
                        .topics()
                        .iter()
                        .map(|t| t.partitions().len())
                        .sum::<usize>()
                })
        })
        .await
        .map_err(|e| AppError::Generic(format!("Metadata probe task failed: {e}")))?
        .map_err(|e| classify_kafka_error(&e))?;

        tracing::debug!(topic = %self.topic, partitions, "Kafka metadata probe succeeded");
        Ok(partitions)
    }
}

impl MessageBus for KafkaBus {
    async fn send(&self, message: &OutboundMessage) -> Result<(), AppError> {
        let headers = OwnedHeaders::new().insert(Header {
            key: OutboundMessage::CONTENT_HASH_HEADER,
            value: Some(message.content_hash.as_str()),
        });
        let record = FutureRecord::to(&self.topic)
            .key(message.key.as_str())
            .payload(message.payload.as_slice())
            .headers(headers);

        match self.producer.send(record, self.queue_timeout).await {
            Ok(_) => {
                tracing::trace!(key = %message.key, topic = %self.topic, "Message acknowledged");
                Ok(())
            }
            Err((e, _)) => Err(classify_kafka_error(&e)),
        }
    }

    async fn flush(&self, timeout: Duration) -> Result<(), AppError> {
        let producer = self.producer.clone();
        let pending = producer.in_flight_count();
        if pending > 0 {
            tracing::info!(pending, "Flushing Kafka producer");
        }
        tokio::task::spawn_blocking(move || producer.flush(timeout))
            .await
            .map_err(|e| AppError::Generic(format!("Flush task failed: {e}")))?
            .map_err(|e| AppError::BusUnavailable(format!("Flush failed: {e}")))
    }
}

/// Split Kafka errors into "this message can never be accepted" and
/// "the cluster is not accepting anything right now".
pub fn classify_kafka_error(error: &KafkaError) -> AppError {
    match error.rdkafka_error_code() {
        Some(
            RDKafkaErrorCode::MessageSizeTooLarge
            | RDKafkaErrorCode::InvalidMessageSize
            | RDKafkaErrorCode::InvalidMessage
            | RDKafkaErrorCode::InvalidRecord
            | RDKafkaErrorCode::MessageBatchTooLarge
            | RDKafkaErrorCode::BadMessage,
        ) => AppError::MessageRejected(error.to_string()),
        _ => AppError::BusUnavailable(error.to_string()),
    }
}
