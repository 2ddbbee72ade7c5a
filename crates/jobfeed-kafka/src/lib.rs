pub mod config;
pub mod producer;

pub use config::KafkaConfig;
pub use producer::{KafkaBus, classify_kafka_error};
