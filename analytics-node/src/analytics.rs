use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time;

use analytics_core::context::{Context, Delivery};
use analytics_core::emitter::{Emitter, Notification, NotificationKind};
use analytics_core::error::{ContextError, PluginError};
use analytics_core::event::Event;
use analytics_core::pipeline::Plugins;
use analytics_core::plugin::Plugin;
use envconfig::Envconfig;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::config::{Config, Settings};
use crate::dispatcher::{self, Dispatch};
use crate::error::AnalyticsError;
use crate::factory::{
    AliasParams, EventFactory, GroupParams, IdentifyParams, PageParams, ScreenParams,
    TrackParams,
};
use crate::http_client::{batch_headers, HttpClient, ReqwestClient};
use crate::publisher::{Command, Publisher, PublisherSettings};

/// A client for the analytics ingestion API.
///
/// Tracking calls return immediately with a `Delivery` that resolves once the event has been
/// delivered or has terminally failed. Events are delivered in the background and are lost if
/// the client is dropped before `close_and_flush` completes.
pub struct Analytics {
    factory: EventFactory,
    plugins: Arc<Plugins>,
    emitter: Arc<Emitter>,
    dispatch: mpsc::UnboundedSender<Dispatch>,
    publisher: mpsc::UnboundedSender<Command>,
    /// Held while admitting an event or closing, so no event is admitted behind the close.
    closed: Mutex<bool>,
    close_timeout: time::Duration,
    disable: bool,
}

impl Analytics {
    /// Start a client. Must be called from within a Tokio runtime.
    pub fn new(settings: Settings) -> Result<Self, AnalyticsError> {
        settings.validate()?;

        let client: Arc<dyn HttpClient> = match settings.http_client.clone() {
            Some(client) => client,
            None => Arc::new(ReqwestClient::new(settings.http_request_timeout)?),
        };
        let publisher_settings = PublisherSettings {
            endpoint: settings.endpoint()?,
            headers: batch_headers(&settings.write_key)?,
            batch_size: settings.batch_size(),
            max_retries: settings.max_retries,
            flush_interval: settings.flush_interval,
            request_timeout: settings.http_request_timeout,
            max_in_flight: settings.max_in_flight,
            retry_policy: settings.retry_policy.clone(),
        };

        let emitter = Arc::new(Emitter::new());
        let plugins = Arc::new(Plugins::new(emitter.clone(), settings.pipeline.clone()));

        let (publisher_tx, publisher_rx) = mpsc::unbounded_channel();
        let (dispatch_tx, dispatch_rx) = mpsc::unbounded_channel();

        let publisher = Publisher::new(
            publisher_settings,
            client,
            plugins.clone(),
            emitter.clone(),
        );
        tokio::spawn(publisher.run(publisher_rx));
        tokio::spawn(dispatcher::run(
            plugins.clone(),
            dispatch_rx,
            publisher_tx.clone(),
        ));

        info!(
            batch_size = settings.batch_size(),
            max_in_flight = settings.max_in_flight,
            disable = settings.disable,
            "analytics client started"
        );

        Ok(Self {
            factory: EventFactory::new(),
            plugins,
            emitter,
            dispatch: dispatch_tx,
            publisher: publisher_tx,
            closed: Mutex::new(false),
            close_timeout: settings.close_timeout(),
            disable: settings.disable,
        })
    }

    /// Start a client configured from `ANALYTICS_*` environment variables.
    pub fn from_env() -> Result<Self, AnalyticsError> {
        let config = Config::init_from_env()?;
        Self::new(config.into())
    }

    pub fn emitter(&self) -> &Arc<Emitter> {
        &self.emitter
    }

    /// Subscribe to one kind of lifecycle notification.
    pub fn on<F>(&self, kind: NotificationKind, handler: F)
    where
        F: Fn(&Notification) + Send + Sync + 'static,
    {
        self.emitter.on(kind, handler);
    }

    /// Register a plugin. It applies to every event tracked after this returns.
    pub async fn register(&self, plugin: Arc<dyn Plugin>) -> Result<(), PluginError> {
        self.plugins.register(plugin).await
    }

    pub async fn deregister(&self, name: &str) -> bool {
        self.plugins.deregister(name).await
    }

    pub fn track(&self, params: TrackParams) -> Delivery {
        self.dispatch(self.factory.track(params))
    }

    pub fn page(&self, params: PageParams) -> Delivery {
        self.dispatch(self.factory.page(params))
    }

    pub fn screen(&self, params: ScreenParams) -> Delivery {
        self.dispatch(self.factory.screen(params))
    }

    pub fn identify(&self, params: IdentifyParams) -> Delivery {
        self.dispatch(self.factory.identify(params))
    }

    pub fn group(&self, params: GroupParams) -> Delivery {
        self.dispatch(self.factory.group(params))
    }

    pub fn alias(&self, params: AliasParams) -> Delivery {
        self.dispatch(self.factory.alias(params))
    }

    fn dispatch(&self, event: Event) -> Delivery {
        let (mut ctx, delivery) = Context::new(event);

        if let Err(error) = ctx.event().validate() {
            warn!(context = %ctx.id(), "rejecting invalid event: {}", error);
            let error = ContextError::from(error);
            self.emitter
                .emit_with(NotificationKind::Failed, || Notification::Failed {
                    context: ctx.clone(),
                    error: error.clone(),
                });
            ctx.resolve_failed(error);
            return delivery;
        }

        let closed = self.lock_closed();
        if *closed {
            debug!("rejecting event, client is closed");
            ctx.resolve_failed(ContextError::Closed);
            return delivery;
        }

        if self.disable {
            ctx.resolve();
            return delivery;
        }

        if let Err(mpsc::error::SendError(Dispatch::Event(mut ctx))) =
            self.dispatch.send(Dispatch::Event(ctx))
        {
            ctx.resolve_failed(ContextError::Closed);
        }

        delivery
    }

    /// Deliver everything tracked so far, regardless of batching thresholds, and wait until it
    /// is settled. Tracking may continue meanwhile.
    pub async fn flush(&self) {
        _ = self.request_flush().await;
    }

    /// Queue a flush marker behind every event admitted so far. The receiver errors
    /// immediately when the dispatcher is gone.
    fn request_flush(&self) -> oneshot::Receiver<()> {
        let (done, flushed) = oneshot::channel();
        if self.dispatch.send(Dispatch::Flush(done)).is_err() {
            debug!("dispatcher already stopped");
        }
        flushed
    }

    /// Stop accepting events and wait for everything already tracked to settle, for at most
    /// `flush_interval * 1.25`.
    pub async fn close_and_flush(&self) -> Result<(), AnalyticsError> {
        self.close_and_flush_timeout(self.close_timeout).await
    }

    /// Stop accepting events and wait for everything already tracked to settle. Events still
    /// unsettled after `timeout` are discarded.
    pub async fn close_and_flush_timeout(
        &self,
        timeout: time::Duration,
    ) -> Result<(), AnalyticsError> {
        let flushed = {
            let mut closed = self.lock_closed();
            *closed = true;
            self.request_flush()
        };

        match tokio::time::timeout(timeout, flushed).await {
            Ok(_) => {
                info!("analytics client closed");
                Ok(())
            }
            Err(_) => {
                warn!(?timeout, "timed out waiting for events to settle, discarding the rest");
                if self.publisher.send(Command::Discard).is_err() {
                    debug!("publisher already stopped");
                }
                Err(AnalyticsError::CloseTimeout(timeout))
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        *self.lock_closed()
    }

    fn lock_closed(&self) -> MutexGuard<'_, bool> {
        self.closed.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
