use super::{context::CallContext, queue::CompletionQueue};
use callflow_core::{Error, Result};
use std::sync::Arc;

/// Dispatch loop draining the shared [`CompletionQueue`].
///
/// Blocks on the next completion and advances the pending call it is tagged
/// with. Several loops may share one queue; the queue hands each completion
/// to exactly one of them.
///
/// # Errors
///
/// Returns [`Error::QueueClosed`] if the queue closes without having been
/// shut down. A requested shutdown ends the loop with `Ok(())`.
pub async fn dispatch_loop(
    dispatcher_id: usize,
    queue: CompletionQueue,
    ctx: Arc<CallContext>,
) -> Result<()> {
    tracing::trace!("Dispatcher {dispatcher_id} started");

    while let Some(completion) = queue.next().await {
        ctx.dispatch(completion);
    }

    if queue.is_shutdown() {
        tracing::trace!("Dispatcher {dispatcher_id} stopped");
        Ok(())
    } else {
        tracing::error!("Dispatcher {dispatcher_id} lost its completion queue");
        Err(Error::QueueClosed)
    }
}
