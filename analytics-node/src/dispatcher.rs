use std::sync::Arc;

use analytics_core::context::Context;
use analytics_core::error::ContextError;
use analytics_core::pipeline::Plugins;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use crate::publisher::Command;

pub(crate) enum Dispatch {
    Event(Context),
    /// Forwarded to the publisher once every context admitted before it has been enqueued.
    Flush(oneshot::Sender<()>),
}

/// Run admitted contexts through the plugin pipeline one at a time, in admission order, and
/// hand the survivors to the publisher.
///
/// Returns once every `Analytics` handle is gone. Dropping the publisher's sender then lets it
/// discard whatever it still holds.
pub(crate) async fn run(
    plugins: Arc<Plugins>,
    mut dispatches: mpsc::UnboundedReceiver<Dispatch>,
    publisher: mpsc::UnboundedSender<Command>,
) {
    while let Some(dispatch) = dispatches.recv().await {
        match dispatch {
            Dispatch::Event(ctx) => {
                let Some(ctx) = plugins.run(ctx).await else {
                    continue;
                };

                if let Err(mpsc::error::SendError(Command::Enqueue(mut ctx))) =
                    publisher.send(Command::Enqueue(ctx))
                {
                    ctx.resolve_failed(ContextError::Closed);
                }
            }
            Dispatch::Flush(done) => {
                if let Err(mpsc::error::SendError(Command::Flush(done))) =
                    publisher.send(Command::Flush(done))
                {
                    _ = done.send(());
                }
            }
        }
    }

    debug!("dispatcher stopped");
}
