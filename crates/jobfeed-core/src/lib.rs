pub mod circuit_breaker;
pub mod config;
pub mod dedup;
pub mod error;
pub mod models;
pub mod poller;
pub mod publisher;
pub mod retry;
pub mod supervisor;
#[doc(hidden)]
pub mod testutil;
pub mod throttle;
pub mod traits;

pub use config::ProducerConfig;
pub use dedup::{DedupConfig, DedupWindow};
pub use error::{AppError, ErrorKind};
pub use models::{JobRecord, OutboundMessage, SearchPage, compute_hash};
pub use supervisor::{RunSummary, Supervisor, TracingReporter};
pub use traits::{JobSource, MessageBus};
