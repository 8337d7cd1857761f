use std::time;

use analytics_core::error::ValidationError;
use http::StatusCode;
use thiserror::Error;

use crate::http_client::HttpResponse;

/// Errors returned by the caller-facing `Analytics` operations.
#[derive(Error, Debug)]
pub enum AnalyticsError {
    #[error("invalid settings: {0}")]
    Validation(#[from] ValidationError),
    #[error("failed to read configuration from the environment: {0}")]
    Config(#[from] envconfig::Error),
    #[error("failed to construct http client: {0}")]
    HttpClient(#[from] reqwest::Error),
    #[error("timed out after {0:?} waiting for pending events to settle")]
    CloseTimeout(time::Duration),
}

/// Failures of a single transport call, before any response is received.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("request timed out")]
    Timeout,
    #[error("request was cancelled")]
    Cancelled,
    #[error("request failed: {0}")]
    Request(String),
}

/// The outcome of a failed batch delivery attempt.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeliveryError {
    #[error("{reason}")]
    Retryable {
        status: Option<u16>,
        reason: String,
        retry_after: Option<time::Duration>,
    },
    #[error("{reason}")]
    Terminal { status: Option<u16>, reason: String },
}

impl DeliveryError {
    pub fn status(&self) -> Option<u16> {
        match self {
            DeliveryError::Retryable { status, .. } | DeliveryError::Terminal { status, .. } => {
                *status
            }
        }
    }
}

/// 4xx responses are rejections of the payload itself, except for 429.
pub fn is_retryable_status(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS || !status.is_client_error()
}

/// Sort the result of a transport call into success, retryable or terminal failure.
pub fn classify(result: Result<HttpResponse, TransportError>) -> Result<(), DeliveryError> {
    let response = match result {
        Ok(response) => response,
        Err(error) => {
            return Err(DeliveryError::Retryable {
                status: None,
                reason: error.to_string(),
                retry_after: None,
            })
        }
    };

    let status = response.status;
    if status.is_success() {
        return Ok(());
    }

    let reason = format!(
        "[{}] {}",
        status.as_u16(),
        status.canonical_reason().unwrap_or("Unknown")
    );
    if is_retryable_status(status) {
        Err(DeliveryError::Retryable {
            status: Some(status.as_u16()),
            reason,
            retry_after: response.retry_after,
        })
    } else {
        Err(DeliveryError::Terminal {
            status: Some(status.as_u16()),
            reason,
        })
    }
}
