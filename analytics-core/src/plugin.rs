use async_trait::async_trait;

use crate::context::Context;
use crate::error::PluginError;

/// The stage a plugin runs in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PluginType {
    /// Inspects, rewrites or drops a context before anything else runs.
    Before,
    /// Rewrites the envelope. Cannot drop.
    Enrichment,
    /// Rewrites the copy of the context handed to destinations.
    DestinationMiddleware,
    /// Forwards a copy of the context to a third party. Failures are isolated.
    Destination,
    /// Observes the settled context. Errors are logged and swallowed.
    After,
}

impl PluginType {
    /// Stages a context goes through before it is handed to the delivery queue, in order.
    pub const PRIMARY: [PluginType; 2] = [PluginType::Before, PluginType::Enrichment];

    pub fn as_str(&self) -> &'static str {
        match self {
            PluginType::Before => "before",
            PluginType::Enrichment => "enrichment",
            PluginType::DestinationMiddleware => "destination-middleware",
            PluginType::Destination => "destination",
            PluginType::After => "after",
        }
    }
}

/// A stage-tagged transformer, gatekeeper, forwarder or observer of contexts.
///
/// A plugin's identity is its name: registering a second plugin under the same name is a no-op.
#[async_trait]
pub trait Plugin: Send + Sync {
    fn name(&self) -> &str;

    fn version(&self) -> &str {
        "0.0.0"
    }

    fn plugin_type(&self) -> PluginType;

    /// Whether the plugin is ready to process contexts. Plugins that are not ready are skipped,
    /// unless the pipeline runs in strict mode.
    fn is_loaded(&self) -> bool {
        true
    }

    async fn load(&self) -> Result<(), PluginError> {
        Ok(())
    }

    async fn unload(&self) -> Result<(), PluginError> {
        Ok(())
    }

    /// Process a context. A plugin drops the context by calling `Context::cancel` or returning
    /// `PluginError::Cancelled`.
    async fn process(&self, ctx: &mut Context) -> Result<(), PluginError>;
}
