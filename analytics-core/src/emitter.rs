use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, RwLock};
use std::time;

use tracing::error;

use crate::context::Context;
use crate::error::ContextError;
use crate::event::Event;

/// Lifecycle notifications published by the pipeline and the delivery queue.
#[derive(Debug, Clone)]
pub enum Notification {
    /// A context entered the plugin pipeline.
    Dispatched { context: Context },
    /// A `before` plugin dropped the context.
    Cancelled { context: Context, reason: String },
    /// A `before` or `enrichment` plugin failed; the context never reaches the queue.
    PipelineFailed { context: Context, error: ContextError },
    /// A destination (or its middleware) rejected its copy of the context.
    DestinationFailed {
        context: Context,
        destination: String,
        error: String,
    },
    /// The context was admitted to the delivery queue.
    Queued { context: Context },
    /// A batch was handed to the transport.
    Flushed { attempt: u32, events: Vec<Event> },
    Delivered { context: Context },
    RetryScheduled {
        context: Context,
        attempt: u32,
        wait: time::Duration,
    },
    RetryExhausted { context: Context, error: ContextError },
    HttpError { status: Option<u16>, message: String },
    /// Any other terminal failure: non-retryable response, oversized event, close or discard.
    Failed { context: Context, error: ContextError },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NotificationKind {
    Dispatched,
    Cancelled,
    PipelineFailed,
    DestinationFailed,
    Queued,
    Flushed,
    Delivered,
    RetryScheduled,
    RetryExhausted,
    HttpError,
    Failed,
}

impl Notification {
    pub fn kind(&self) -> NotificationKind {
        match self {
            Notification::Dispatched { .. } => NotificationKind::Dispatched,
            Notification::Cancelled { .. } => NotificationKind::Cancelled,
            Notification::PipelineFailed { .. } => NotificationKind::PipelineFailed,
            Notification::DestinationFailed { .. } => NotificationKind::DestinationFailed,
            Notification::Queued { .. } => NotificationKind::Queued,
            Notification::Flushed { .. } => NotificationKind::Flushed,
            Notification::Delivered { .. } => NotificationKind::Delivered,
            Notification::RetryScheduled { .. } => NotificationKind::RetryScheduled,
            Notification::RetryExhausted { .. } => NotificationKind::RetryExhausted,
            Notification::HttpError { .. } => NotificationKind::HttpError,
            Notification::Failed { .. } => NotificationKind::Failed,
        }
    }
}

type Handler = Arc<dyn Fn(&Notification) + Send + Sync>;

/// Synchronous publish/subscribe channel for lifecycle notifications.
///
/// Handlers run on the emitting task, in registration order. A panicking handler is logged
/// and skipped; it never reaches the emitter's caller nor prevents later handlers from running.
#[derive(Default)]
pub struct Emitter {
    handlers: RwLock<Vec<(Option<NotificationKind>, Handler)>>,
}

impl Emitter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to one kind of notification.
    pub fn on<F>(&self, kind: NotificationKind, handler: F)
    where
        F: Fn(&Notification) + Send + Sync + 'static,
    {
        self.subscribe(Some(kind), Arc::new(handler));
    }

    /// Subscribe to every notification.
    pub fn on_any<F>(&self, handler: F)
    where
        F: Fn(&Notification) + Send + Sync + 'static,
    {
        self.subscribe(None, Arc::new(handler));
    }

    fn subscribe(&self, kind: Option<NotificationKind>, handler: Handler) {
        match self.handlers.write() {
            Ok(mut handlers) => handlers.push((kind, handler)),
            Err(poisoned) => poisoned.into_inner().push((kind, handler)),
        }
    }

    fn handlers_for(&self, kind: NotificationKind) -> Vec<Handler> {
        let handlers = match self.handlers.read() {
            Ok(handlers) => handlers,
            Err(poisoned) => poisoned.into_inner(),
        };

        handlers
            .iter()
            .filter(|(filter, _)| filter.map_or(true, |k| k == kind))
            .map(|(_, handler)| handler.clone())
            .collect()
    }

    pub fn is_listening(&self, kind: NotificationKind) -> bool {
        !self.handlers_for(kind).is_empty()
    }

    pub fn emit(&self, notification: Notification) {
        let handlers = self.handlers_for(notification.kind());
        Self::dispatch(&handlers, &notification);
    }

    /// Emit a notification built lazily: `build` only runs when someone listens to `kind`.
    pub fn emit_with<F>(&self, kind: NotificationKind, build: F)
    where
        F: FnOnce() -> Notification,
    {
        let handlers = self.handlers_for(kind);
        if handlers.is_empty() {
            return;
        }
        Self::dispatch(&handlers, &build());
    }

    fn dispatch(handlers: &[Handler], notification: &Notification) {
        for handler in handlers {
            if catch_unwind(AssertUnwindSafe(|| handler(notification))).is_err() {
                error!(
                    kind = ?notification.kind(),
                    "emitter handler panicked, continuing with the remaining handlers"
                );
            }
        }
    }
}
