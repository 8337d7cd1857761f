use std::time;

use thiserror::Error;

/// A field failed validation, either in the settings handed to the client or in the
/// parameters of a tracking call.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{field}: {message}")]
pub struct ValidationError {
    pub field: String,
    pub message: String,
}

impl ValidationError {
    pub fn new(field: &str, message: &str) -> Self {
        Self {
            field: field.to_owned(),
            message: message.to_owned(),
        }
    }
}

/// Errors a `Plugin` may return from any of its capabilities.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PluginError {
    #[error("{0}")]
    Failed(String),
    #[error("cancelled: {0}")]
    Cancelled(String),
    #[error("timed out after {0:?} waiting for the plugin to load")]
    LoadTimeout(time::Duration),
}

impl PluginError {
    pub fn failed(message: &str) -> Self {
        PluginError::Failed(message.to_owned())
    }
}

/// The reason a `Context` was settled as failed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ContextError {
    #[error("invalid event: {0}")]
    Validation(#[from] ValidationError),
    #[error("plugin {plugin} failed: {message}")]
    Pipeline { plugin: String, message: String },
    #[error("dropped by plugin {plugin}: {reason}")]
    Cancelled { plugin: String, reason: String },
    #[error("delivery failed after {attempts} attempt(s): {message}")]
    Delivery {
        attempts: u32,
        status: Option<u16>,
        message: String,
    },
    #[error("event of {size} bytes exceeds the maximum event size of {limit} bytes")]
    EventTooLarge { size: usize, limit: usize },
    #[error("analytics client is closed")]
    Closed,
    #[error("discarded before it could be delivered")]
    Discarded,
}

impl ContextError {
    /// Whether this failure happened before the event reached the delivery queue.
    pub fn is_pipeline_failure(&self) -> bool {
        matches!(
            self,
            ContextError::Validation(_)
                | ContextError::Pipeline { .. }
                | ContextError::Cancelled { .. }
        )
    }
}
