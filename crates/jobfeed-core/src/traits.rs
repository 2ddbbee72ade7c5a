use std::future::Future;
use std::time::Duration;

use crate::error::AppError;
use crate::models::{OutboundMessage, SearchPage};

/// Fetches one page of job search results.
///
/// Implementations keep no state across calls beyond connection pooling.
/// Errors are classified through [`AppError`]: `AuthError` is fatal,
/// `RateLimitExceeded` asks the caller to back off, network errors are
/// retryable and `MalformedResponse` drops the page.
pub trait JobSource: Send + Sync + Clone {
    fn fetch(
        &self,
        query: &str,
        page: u32,
    ) -> impl Future<Output = Result<SearchPage, AppError>> + Send;
}

/// Delivers encoded records to a message bus topic.
pub trait MessageBus: Send + Sync + Clone + 'static {
    /// Send one message and wait for the broker's acknowledgement.
    ///
    /// `MessageRejected` means the bus will never accept this message;
    /// anything else is treated as transient.
    fn send(
        &self,
        message: &OutboundMessage,
    ) -> impl Future<Output = Result<(), AppError>> + Send;

    /// Wait for queued messages to be acknowledged, up to `timeout`.
    fn flush(&self, timeout: Duration) -> impl Future<Output = Result<(), AppError>> + Send;
}
