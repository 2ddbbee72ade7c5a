use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

use crate::error::AppError;

/// One job posting as returned by the source.
///
/// Immutable once built: fields are private and only exposed by reference.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", try_from = "RawJobRecord")]
pub struct JobRecord {
    id: String,
    title: String,
    payload: Map<String, Value>,
    fetched_at: DateTime<Utc>,
}

/// Wire shape of [`JobRecord`]; deserialization goes through [`JobRecord::new`].
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawJobRecord {
    id: String,
    title: String,
    payload: Map<String, Value>,
    fetched_at: DateTime<Utc>,
}

impl TryFrom<RawJobRecord> for JobRecord {
    type Error = AppError;

    fn try_from(raw: RawJobRecord) -> Result<Self, Self::Error> {
        JobRecord::new(raw.id, raw.title, raw.payload, raw.fetched_at)
    }
}

impl JobRecord {
    /// Build a record, rejecting an empty or whitespace-only id.
    pub fn new(
        id: impl Into<String>,
        title: impl Into<String>,
        payload: Map<String, Value>,
        fetched_at: DateTime<Utc>,
    ) -> Result<Self, AppError> {
        let id = id.into();
        if id.trim().is_empty() {
            return Err(AppError::InvalidRecord("record id must not be empty".into()));
        }
        Ok(Self {
            id,
            title: title.into(),
            payload,
            fetched_at,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn title(&self) -> &str {
        &self.title
    }

    pub fn payload(&self) -> &Map<String, Value> {
        &self.payload
    }

    pub fn fetched_at(&self) -> DateTime<Utc> {
        self.fetched_at
    }
}

/// Where the poller is in its scan of the result set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchCursor {
    pub page: u32,
    pub query: String,
    pub last_attempt: Option<DateTime<Utc>>,
}

impl FetchCursor {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            page: 1,
            query: query.into(),
            last_attempt: None,
        }
    }

    pub(crate) fn advance(&mut self) {
        self.page = self.page.saturating_add(1);
    }

    pub(crate) fn restart(&mut self) {
        self.page = 1;
    }
}

/// One page of search results.
#[derive(Debug, Clone, Default)]
pub struct SearchPage {
    pub records: Vec<JobRecord>,
    /// Whether the source reports more results past this page.
    pub has_more: bool,
    /// Results the source sent, including ones dropped before becoming records.
    pub received: usize,
}

impl SearchPage {
    pub fn new(records: Vec<JobRecord>, has_more: bool) -> Self {
        let received = records.len();
        Self {
            records,
            has_more,
            received,
        }
    }

    pub fn with_received(mut self, received: usize) -> Self {
        self.received = received;
        self
    }

    pub fn empty() -> Self {
        Self::default()
    }
}

/// Outcome of a single delivery attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryOutcome {
    Delivered,
    Rejected,
    TransientFailure,
}

impl DeliveryOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryOutcome::Delivered => "delivered",
            DeliveryOutcome::Rejected => "rejected",
            DeliveryOutcome::TransientFailure => "transient_failure",
        }
    }
}

impl std::fmt::Display for DeliveryOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Result of one publish attempt for one record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryResult {
    pub record_id: String,
    pub outcome: DeliveryOutcome,
    /// 1-based attempt number.
    pub attempt: u32,
    pub error: Option<String>,
}

impl DeliveryResult {
    pub fn delivered(record_id: impl Into<String>, attempt: u32) -> Self {
        Self {
            record_id: record_id.into(),
            outcome: DeliveryOutcome::Delivered,
            attempt,
            error: None,
        }
    }

    pub fn rejected(record_id: impl Into<String>, attempt: u32, error: &AppError) -> Self {
        Self {
            record_id: record_id.into(),
            outcome: DeliveryOutcome::Rejected,
            attempt,
            error: Some(error.to_string()),
        }
    }

    pub fn transient(record_id: impl Into<String>, attempt: u32, error: impl ToString) -> Self {
        Self {
            record_id: record_id.into(),
            outcome: DeliveryOutcome::TransientFailure,
            attempt,
            error: Some(error.to_string()),
        }
    }
}

/// Every attempt made for one record, oldest first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryReport {
    pub record_id: String,
    pub results: Vec<DeliveryResult>,
}

impl DeliveryReport {
    pub fn new(record_id: impl Into<String>) -> Self {
        Self {
            record_id: record_id.into(),
            results: Vec::new(),
        }
    }

    pub fn attempts(&self) -> u32 {
        self.results.last().map_or(0, |r| r.attempt)
    }

    pub fn final_outcome(&self) -> Option<DeliveryOutcome> {
        self.results.last().map(|r| r.outcome)
    }

    pub fn last_error(&self) -> Option<&str> {
        self.results.last().and_then(|r| r.error.as_deref())
    }
}

/// A record encoded for the bus.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    /// Partitioning key; the record id.
    pub key: String,
    /// Canonical UTF-8 JSON.
    pub payload: Vec<u8>,
    /// SHA-256 hex of `payload`, sent as the `content-sha256` header.
    pub content_hash: String,
}

impl OutboundMessage {
    pub const CONTENT_HASH_HEADER: &'static str = "content-sha256";

    /// Encode a record with sorted keys at every nesting level.
    pub fn encode(record: &JobRecord) -> Result<Self, AppError> {
        let value = canonicalize(serde_json::to_value(record)?);
        let payload = serde_json::to_vec(&value)?;
        let content_hash = compute_hash(&payload);
        Ok(Self {
            key: record.id().to_string(),
            payload,
            content_hash,
        })
    }
}

fn canonicalize(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(String, Value)> = map.into_iter().collect();
            entries.sort_by(|a, b| a.0.cmp(&b.0));
            Value::Object(
                entries
                    .into_iter()
                    .map(|(k, v)| (k, canonicalize(v)))
                    .collect(),
            )
        }
        Value::Array(items) => Value::Array(items.into_iter().map(canonicalize).collect()),
        other => other,
    }
}

/// Compute a SHA-256 hash of some bytes, returned as 64-char hex.
pub fn compute_hash(content: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content);
    format!("{:x}", hasher.finalize())
}
