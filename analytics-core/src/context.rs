use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context as TaskContext, Poll};

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::warn;
use uuid::Uuid;

use crate::error::ContextError;
use crate::event::Event;

/// What a caller's `Delivery` resolves to.
pub type Settled = Result<Context, Failure>;

/// A settled failure, carrying the final state of the `Context` when one is available.
#[derive(Error, Debug, Clone)]
#[error("{error}")]
pub struct Failure {
    pub error: ContextError,
    pub context: Option<Box<Context>>,
}

impl Failure {
    /// Build a failure for an event that never got a `Context` settled on its behalf.
    pub fn without_context(error: ContextError) -> Self {
        Self {
            error,
            context: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

/// A diagnostic record of something that happened to a `Context`.
#[derive(Debug, Clone, Serialize)]
pub struct LogEntry {
    pub level: LogLevel,
    pub message: String,
    pub time: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extras: Option<Value>,
}

/// The settle-once half of a `Context`'s completion signal.
///
/// Cloning yields a detached completion: only the `Context` created alongside the `Delivery`
/// can settle it.
struct Completion(Arc<Mutex<Option<oneshot::Sender<Settled>>>>);

impl Completion {
    fn new(sender: oneshot::Sender<Settled>) -> Self {
        Self(Arc::new(Mutex::new(Some(sender))))
    }

    fn detached() -> Self {
        Self(Arc::new(Mutex::new(None)))
    }

    fn take(&self) -> Option<oneshot::Sender<Settled>> {
        match self.0.lock() {
            Ok(mut sender) => sender.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        }
    }

    fn is_settled(&self) -> bool {
        match self.0.lock() {
            Ok(sender) => sender.is_none(),
            Err(poisoned) => poisoned.into_inner().is_none(),
        }
    }
}

impl Clone for Completion {
    fn clone(&self) -> Self {
        Completion::detached()
    }
}

impl fmt::Debug for Completion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Completion")
            .field("settled", &self.is_settled())
            .finish()
    }
}

/// The lifecycle wrapper around one `Event`, from the tracking call until it is delivered
/// or terminally failed.
///
/// Clones are detached snapshots: they own a copy of the envelope and cannot settle the
/// caller's `Delivery`.
#[derive(Debug, Clone)]
pub struct Context {
    id: Uuid,
    event: Event,
    attempts: u32,
    failure: Option<ContextError>,
    cancelled: Option<String>,
    logs: Vec<LogEntry>,
    completion: Completion,
}

impl Context {
    /// Wrap an event in a new `Context`, returning the `Delivery` handle that settles with it.
    pub fn new(event: Event) -> (Context, Delivery) {
        let (tx, rx) = oneshot::channel();
        let id = Uuid::now_v7();
        let context = Context {
            id,
            event,
            attempts: 0,
            failure: None,
            cancelled: None,
            logs: Vec::new(),
            completion: Completion::new(tx),
        };

        (context, Delivery { id, rx })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn event(&self) -> &Event {
        &self.event
    }

    pub fn event_mut(&mut self) -> &mut Event {
        &mut self.event
    }

    /// Number of delivery attempts made so far.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Count one more delivery attempt, returning the new total.
    pub fn record_attempt(&mut self) -> u32 {
        self.attempts += 1;
        self.attempts
    }

    pub fn failure(&self) -> Option<&ContextError> {
        self.failure.as_ref()
    }

    pub fn set_failure(&mut self, error: ContextError) {
        self.failure = Some(error);
    }

    pub fn clear_failure(&mut self) {
        self.failure = None;
    }

    /// Mark this context as dropped. The pipeline stops at the next plugin boundary and the
    /// event never reaches the delivery queue.
    pub fn cancel(&mut self, reason: &str) {
        if self.cancelled.is_none() {
            self.cancelled = Some(reason.to_owned());
            self.log(LogLevel::Warn, "cancelled", Some(Value::from(reason)));
        }
    }

    pub fn cancelled(&self) -> Option<&str> {
        self.cancelled.as_deref()
    }

    pub fn log(&mut self, level: LogLevel, message: &str, extras: Option<Value>) {
        self.logs.push(LogEntry {
            level,
            message: message.to_owned(),
            time: Utc::now(),
            extras,
        });
    }

    pub fn logs(&self) -> &[LogEntry] {
        &self.logs
    }

    pub fn is_settled(&self) -> bool {
        self.completion.is_settled()
    }

    /// Settle the caller's `Delivery` as successful.
    /// Returns false, doing nothing, when the context was already settled or is a detached clone.
    pub fn resolve(&mut self) -> bool {
        let Some(sender) = self.completion.take() else {
            return false;
        };
        self.failure = None;
        self.log(LogLevel::Debug, "resolved", None);

        if sender.send(Ok(self.clone())).is_err() {
            tracing::debug!(context = %self.id, "delivery handle dropped before settlement");
        }
        true
    }

    /// Settle the caller's `Delivery` as failed.
    /// Returns false, doing nothing, when the context was already settled or is a detached clone.
    pub fn resolve_failed(&mut self, error: ContextError) -> bool {
        let Some(sender) = self.completion.take() else {
            return false;
        };
        self.failure = Some(error.clone());
        self.log(LogLevel::Error, "failed", Some(Value::from(error.to_string())));

        let failure = Failure {
            error,
            context: Some(Box::new(self.clone())),
        };
        if sender.send(Err(failure)).is_err() {
            tracing::debug!(context = %self.id, "delivery handle dropped before settlement");
        }
        true
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        if let Some(sender) = self.completion.take() {
            warn!(context = %self.id, "context dropped without being settled");
            if sender
                .send(Err(Failure::without_context(ContextError::Discarded)))
                .is_err()
            {
                tracing::debug!(context = %self.id, "delivery handle dropped before settlement");
            }
        }
    }
}

/// The caller's handle on a tracked event. Resolves once the event is delivered or has
/// terminally failed.
///
/// Dropping a `Delivery` does not cancel the event.
#[derive(Debug)]
pub struct Delivery {
    id: Uuid,
    rx: oneshot::Receiver<Settled>,
}

impl Delivery {
    /// A handle that is already settled with the provided failure.
    pub fn failed(error: ContextError) -> Self {
        let (tx, rx) = oneshot::channel();
        drop(tx.send(Err(Failure::without_context(error))));
        Self {
            id: Uuid::now_v7(),
            rx,
        }
    }

    /// The id of the `Context` this handle settles with.
    pub fn id(&self) -> Uuid {
        self.id
    }
}

impl Future for Delivery {
    type Output = Settled;

    fn poll(mut self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx).poll(cx).map(|settled| {
            settled.unwrap_or_else(|_| Err(Failure::without_context(ContextError::Discarded)))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventType;

    fn event() -> Event {
        Event::builder(EventType::Track)
            .user_id(Some("some-user".to_owned()))
            .event("some-event")
            .build()
    }

    #[tokio::test]
    async fn resolve_settles_the_delivery() {
        let (mut context, delivery) = Context::new(event());
        assert_eq!(delivery.id(), context.id());
        assert_eq!(context.attempts(), 0);
        assert!(context.failure().is_none());

        assert!(context.resolve());
        assert!(context.is_settled());

        let settled = delivery.await.expect("delivery should succeed");
        assert_eq!(settled.id(), context.id());
    }

    #[tokio::test]
    async fn settlement_happens_at_most_once() {
        let (mut context, delivery) = Context::new(event());

        assert!(context.resolve_failed(ContextError::Closed));
        assert!(!context.resolve());
        assert!(!context.resolve_failed(ContextError::Discarded));

        let failure = delivery.await.expect_err("delivery should fail");
        assert_eq!(failure.error, ContextError::Closed);
        let snapshot = failure.context.expect("failure carries the context");
        assert_eq!(snapshot.failure(), Some(&ContextError::Closed));
    }

    #[tokio::test]
    async fn clones_are_detached_snapshots() {
        let (mut context, delivery) = Context::new(event());
        let mut copy = context.clone();

        assert!(!copy.resolve());
        copy.event_mut().set_message_id("rewritten");
        assert_ne!(copy.event().message_id(), context.event().message_id());

        assert!(context.resolve());
        assert!(delivery.await.is_ok());
    }

    #[tokio::test]
    async fn dropping_an_unsettled_context_discards_it() {
        let (context, delivery) = Context::new(event());
        drop(context);

        let failure = delivery.await.expect_err("delivery should fail");
        assert_eq!(failure.error, ContextError::Discarded);
    }

    #[test]
    fn attempts_and_logs_accumulate() {
        let (mut context, _delivery) = Context::new(event());
        assert_eq!(context.record_attempt(), 1);
        assert_eq!(context.record_attempt(), 2);

        context.cancel("consent missing");
        context.cancel("second reason is ignored");
        assert_eq!(context.cancelled(), Some("consent missing"));
        assert_eq!(context.logs().len(), 1);
        assert_eq!(context.logs()[0].level, LogLevel::Warn);

        // Settle to keep the drop guard quiet.
        context.resolve();
    }

    #[tokio::test]
    async fn pre_failed_delivery_resolves_immediately() {
        let failure = Delivery::failed(ContextError::Closed)
            .await
            .expect_err("should be failed");
        assert_eq!(failure.error, ContextError::Closed);
        assert!(failure.context.is_none());
    }
}
