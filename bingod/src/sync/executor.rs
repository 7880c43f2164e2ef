use std::time::Duration;

use async_trait::async_trait;
use bingo_core::{ApiErrorClass, BingoClient, Delivery, MutationResponse};
use reqwest::StatusCode;

use super::queue::QueueItem;

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(20);

/// Result of a single delivery attempt. Failures are values here, not errors:
/// the caller decides what happens to the item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Success,
    RetryableFailure {
        reason: String,
        retry_after: Option<Duration>,
    },
    PermanentFailure {
        reason: String,
    },
}

impl Outcome {
    pub fn retryable(reason: impl Into<String>) -> Self {
        Outcome::RetryableFailure {
            reason: reason.into(),
            retry_after: None,
        }
    }

    pub fn permanent(reason: impl Into<String>) -> Self {
        Outcome::PermanentFailure {
            reason: reason.into(),
        }
    }
}

#[async_trait]
pub trait SyncExecutor: Send + Sync {
    async fn attempt_sync(&self, item: &QueueItem) -> Outcome;
}

/// Delivers items to the remote bingo API.
pub struct HttpSyncExecutor {
    client: BingoClient,
    timeout: Duration,
}

impl HttpSyncExecutor {
    pub fn new(client: BingoClient, timeout: Duration) -> Self {
        Self { client, timeout }
    }
}

#[async_trait]
impl SyncExecutor for HttpSyncExecutor {
    async fn attempt_sync(&self, item: &QueueItem) -> Outcome {
        let request = self.client.submit_mutation(item.kind, &item.payload);
        let outcome = match tokio::time::timeout(self.timeout, request).await {
            Err(_) => Outcome::retryable(format!(
                "timed out after {}s",
                self.timeout.as_secs_f32()
            )),
            Ok(Ok(delivery)) => classify_delivery(delivery),
            Ok(Err(err)) => match err.classification() {
                ApiErrorClass::Validation => Outcome::permanent(err.to_string()),
                _ => Outcome::RetryableFailure {
                    reason: err.to_string(),
                    retry_after: err.retry_after(),
                },
            },
        };
        tracing::debug!(id = %item.id, kind = %item.kind, ?outcome, "sync attempt finished");
        outcome
    }
}

pub fn classify_delivery(delivery: Delivery) -> Outcome {
    match delivery {
        Delivery::Confirmed {
            status,
            response,
            retry_after,
        } => classify_response(status, &response, retry_after),
        Delivery::Unconfirmed { status } => {
            Outcome::retryable(format!("unconfirmed delivery (HTTP {status})"))
        }
    }
}

fn classify_response(
    status: StatusCode,
    response: &MutationResponse,
    retry_after: Option<Duration>,
) -> Outcome {
    if response.success {
        return Outcome::Success;
    }
    let rejected_as_invalid = response.is_validation_error()
        || matches!(
            status,
            StatusCode::BAD_REQUEST | StatusCode::UNPROCESSABLE_ENTITY
        );
    if rejected_as_invalid && response.retryable != Some(true) {
        Outcome::permanent(response.reason())
    } else {
        Outcome::RetryableFailure {
            reason: response.reason(),
            retry_after,
        }
    }
}
