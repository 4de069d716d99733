use std::time::Duration;

use async_trait::async_trait;

use courier_common::types::{MessageContent, SendMethod};

/// Why a provider call failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchFailure {
    pub reason: String,
    /// Retrying the same request cannot succeed (bad request, bot blocked, ...).
    pub permanent: bool,
}

impl DispatchFailure {
    pub fn retryable(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            permanent: false,
        }
    }

    pub fn permanent(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            permanent: true,
        }
    }
}

/// Outcome of a single provider call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchResult {
    /// Delivered; carries the provider's message id when it returned one.
    Ok(Option<i64>),
    /// Provider throttled the call, optionally saying how long to wait.
    RateLimited(Option<Duration>),
    Failed(DispatchFailure),
}

/// Delivery backend for outbox messages.
#[async_trait]
pub trait Dispatcher: Send + Sync {
    async fn send(
        &self,
        method: SendMethod,
        chat_id: i64,
        content: &MessageContent,
        thread_id: Option<i32>,
    ) -> DispatchResult;
}
