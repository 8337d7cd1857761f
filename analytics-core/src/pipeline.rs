//! # Pipeline
//!
//! Ordered registry of plugins and the per-context run over it.
//!
//! Stages always run in the order of `PluginType`: `before`, `enrichment`, then a fan-out to
//! `destination-middleware` and `destination` plugins that never blocks the primary path.
//! `after` plugins run once the context is settled. Within a stage, plugins run sequentially in
//! registration order, so only one plugin mutates the envelope at a time.
use std::sync::{Arc, RwLock};
use std::time;

use serde_json::json;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

use crate::context::{Context, LogLevel};
use crate::emitter::{Emitter, Notification, NotificationKind};
use crate::error::{ContextError, PluginError};
use crate::plugin::{Plugin, PluginType};

type Registry = Arc<Vec<Arc<dyn Plugin>>>;

#[derive(Debug, Clone)]
pub struct PipelineOptions {
    /// When set, a plugin that is not loaded yet blocks the run until it is, or until
    /// `load_timeout` elapses and the plugin is treated as failed.
    pub strict: bool,
    pub load_timeout: time::Duration,
    pub load_poll_interval: time::Duration,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            strict: false,
            load_timeout: time::Duration::from_secs(5),
            load_poll_interval: time::Duration::from_millis(25),
        }
    }
}

pub struct Plugins {
    registry: RwLock<Registry>,
    /// Serializes registrations so a plugin is loaded at most once per name.
    registering: Mutex<()>,
    emitter: Arc<Emitter>,
    options: PipelineOptions,
}

impl Plugins {
    pub fn new(emitter: Arc<Emitter>, options: PipelineOptions) -> Self {
        Self {
            registry: RwLock::new(Arc::new(Vec::new())),
            registering: Mutex::new(()),
            emitter,
            options,
        }
    }

    /// A stable view of the registered plugins. Later registrations do not alter it.
    pub fn snapshot(&self) -> Registry {
        match self.registry.read() {
            Ok(registry) => registry.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn names(&self) -> Vec<String> {
        self.snapshot()
            .iter()
            .map(|plugin| plugin.name().to_owned())
            .collect()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.snapshot().iter().any(|plugin| plugin.name() == name)
    }

    fn replace(&self, update: impl FnOnce(&mut Vec<Arc<dyn Plugin>>)) {
        let mut registry = match self.registry.write() {
            Ok(registry) => registry,
            Err(poisoned) => poisoned.into_inner(),
        };
        let mut next = registry.as_ref().clone();
        update(&mut next);
        *registry = Arc::new(next);
    }

    /// Load a plugin and append it to its stage. Registering a name twice is a no-op.
    pub async fn register(&self, plugin: Arc<dyn Plugin>) -> Result<(), PluginError> {
        let _registering = self.registering.lock().await;

        if self.contains(plugin.name()) {
            debug!(plugin = plugin.name(), "plugin already registered");
            return Ok(());
        }

        if let Err(error) = plugin.load().await {
            warn!(plugin = plugin.name(), "failed to load plugin: {}", error);
            return Err(error);
        }

        info!(
            plugin = plugin.name(),
            version = plugin.version(),
            stage = plugin.plugin_type().as_str(),
            "registered plugin"
        );
        self.replace(|plugins| plugins.push(plugin));

        Ok(())
    }

    /// Remove a plugin for contexts created from now on and unload it.
    /// Returns false when no plugin with this name is registered.
    pub async fn deregister(&self, name: &str) -> bool {
        let _registering = self.registering.lock().await;

        let Some(plugin) = self
            .snapshot()
            .iter()
            .find(|plugin| plugin.name() == name)
            .cloned()
        else {
            return false;
        };

        self.replace(|plugins| plugins.retain(|p| p.name() != name));
        if let Err(error) = plugin.unload().await {
            warn!(plugin = name, "failed to unload plugin: {}", error);
        }

        true
    }

    /// Run a context through the primary stages and fan it out to destinations.
    ///
    /// Returns the context when it should be handed to the delivery queue. Otherwise the context
    /// has already been settled as failed.
    #[instrument(skip_all, fields(context = %ctx.id(), event_type = %ctx.event().event_type()))]
    pub async fn run(&self, mut ctx: Context) -> Option<Context> {
        let snapshot = self.snapshot();

        self.emitter
            .emit_with(NotificationKind::Dispatched, || Notification::Dispatched {
                context: ctx.clone(),
            });

        for stage in PluginType::PRIMARY {
            for plugin in snapshot.iter().filter(|p| p.plugin_type() == stage) {
                if let Err(error) = self.apply(plugin.as_ref(), &mut ctx).await {
                    self.reject(&snapshot, ctx, error);
                    return None;
                }
            }
        }

        self.fan_out(&snapshot, &ctx);

        Some(ctx)
    }

    async fn apply(&self, plugin: &dyn Plugin, ctx: &mut Context) -> Result<(), ContextError> {
        let name = plugin.name().to_owned();
        let stage = plugin.plugin_type();

        match ensure_loaded(plugin, &self.options).await {
            Ok(true) => {}
            Ok(false) => {
                ctx.log(
                    LogLevel::Debug,
                    "plugin skipped, not loaded",
                    Some(json!({ "plugin": name })),
                );
                return Ok(());
            }
            Err(error) => {
                return Err(ContextError::Pipeline {
                    plugin: name,
                    message: error.to_string(),
                })
            }
        }

        let reason = match plugin.process(ctx).await {
            Ok(()) => ctx.cancelled().map(str::to_owned),
            Err(PluginError::Cancelled(reason)) => Some(reason),
            Err(error) => {
                return Err(ContextError::Pipeline {
                    plugin: name,
                    message: error.to_string(),
                })
            }
        };

        match reason {
            None => {
                ctx.log(
                    LogLevel::Debug,
                    "plugin processed",
                    Some(json!({ "plugin": name, "type": stage.as_str() })),
                );
                Ok(())
            }
            Some(reason) if stage == PluginType::Before => Err(ContextError::Cancelled {
                plugin: name,
                reason,
            }),
            Some(reason) => Err(ContextError::Pipeline {
                plugin: name,
                message: format!("{} plugins cannot drop events: {}", stage.as_str(), reason),
            }),
        }
    }

    fn reject(&self, snapshot: &Registry, mut ctx: Context, error: ContextError) {
        warn!(context = %ctx.id(), "event rejected by the plugin pipeline: {}", error);
        ctx.set_failure(error.clone());

        match &error {
            ContextError::Cancelled { reason, .. } => {
                self.emitter
                    .emit_with(NotificationKind::Cancelled, || Notification::Cancelled {
                        context: ctx.clone(),
                        reason: reason.clone(),
                    })
            }
            _ => self
                .emitter
                .emit_with(NotificationKind::PipelineFailed, || {
                    Notification::PipelineFailed {
                        context: ctx.clone(),
                        error: error.clone(),
                    }
                }),
        }

        spawn_after(after_plugins(snapshot), ctx.clone());
        ctx.resolve_failed(error);
    }

    /// Hand a copy of the context to every destination. Each destination runs in its own task,
    /// so a failing or slow destination affects neither its siblings nor the primary path.
    fn fan_out(&self, snapshot: &Registry, ctx: &Context) {
        let destinations: Vec<_> = snapshot
            .iter()
            .filter(|p| p.plugin_type() == PluginType::Destination)
            .cloned()
            .collect();
        if destinations.is_empty() {
            return;
        }

        let middleware: Vec<_> = snapshot
            .iter()
            .filter(|p| p.plugin_type() == PluginType::DestinationMiddleware)
            .cloned()
            .collect();
        let emitter = self.emitter.clone();
        let options = self.options.clone();
        let mut copy = ctx.clone();

        tokio::spawn(async move {
            for plugin in &middleware {
                let result = match ensure_loaded(plugin.as_ref(), &options).await {
                    Ok(true) => plugin.process(&mut copy).await,
                    Ok(false) => continue,
                    Err(error) => Err(error),
                };

                match result {
                    Ok(()) if copy.cancelled().is_none() => {}
                    Ok(()) | Err(PluginError::Cancelled(_)) => {
                        debug!(
                            plugin = plugin.name(),
                            "destination middleware dropped the event for destinations"
                        );
                        return;
                    }
                    Err(error) => {
                        report_destination_failure(&emitter, &copy, plugin.name(), &error);
                        return;
                    }
                }
            }

            for destination in destinations {
                let emitter = emitter.clone();
                let options = options.clone();
                let mut copy = copy.clone();

                tokio::spawn(async move {
                    let result = match ensure_loaded(destination.as_ref(), &options).await {
                        Ok(true) => destination.process(&mut copy).await,
                        Ok(false) => {
                            debug!(
                                destination = destination.name(),
                                "skipping destination that is not loaded"
                            );
                            return;
                        }
                        Err(error) => Err(error),
                    };

                    if let Err(error) = result {
                        report_destination_failure(&emitter, &copy, destination.name(), &error);
                    }
                });
            }
        });
    }

    /// Let `after` plugins observe a settled context. Errors are logged and swallowed.
    pub fn run_after(&self, ctx: &Context) {
        spawn_after(after_plugins(&self.snapshot()), ctx.clone());
    }
}

fn after_plugins(snapshot: &Registry) -> Vec<Arc<dyn Plugin>> {
    snapshot
        .iter()
        .filter(|p| p.plugin_type() == PluginType::After)
        .cloned()
        .collect()
}

fn spawn_after(plugins: Vec<Arc<dyn Plugin>>, mut ctx: Context) {
    if plugins.is_empty() {
        return;
    }

    tokio::spawn(async move {
        for plugin in plugins {
            if !plugin.is_loaded() {
                continue;
            }
            if let Err(error) = plugin.process(&mut ctx).await {
                warn!(plugin = plugin.name(), "after plugin failed: {}", error);
            }
        }
    });
}

fn report_destination_failure(
    emitter: &Emitter,
    ctx: &Context,
    destination: &str,
    error: &PluginError,
) {
    warn!(
        context = %ctx.id(),
        destination,
        "destination failed to process event: {}",
        error
    );
    emitter.emit_with(NotificationKind::DestinationFailed, || {
        Notification::DestinationFailed {
            context: ctx.clone(),
            destination: destination.to_owned(),
            error: error.to_string(),
        }
    });
}

/// Wait for a plugin to report it is loaded.
/// Returns `Ok(false)` when the plugin should be skipped for this run.
async fn ensure_loaded(plugin: &dyn Plugin, options: &PipelineOptions) -> Result<bool, PluginError> {
    if plugin.is_loaded() {
        return Ok(true);
    }
    if !options.strict {
        return Ok(false);
    }

    let wait = async {
        let mut interval = tokio::time::interval(options.load_poll_interval);
        loop {
            interval.tick().await;
            if plugin.is_loaded() {
                return;
            }
        }
    };

    tokio::time::timeout(options.load_timeout, wait)
        .await
        .map(|_| true)
        .map_err(|_| PluginError::LoadTimeout(options.load_timeout))
}
