use super::{
    acceptor::AcceptorRegistry,
    call::Transition,
    queue::{CallId, Completion, CompletionSender},
    stats::StatsCounters,
    table::CallTable,
};
use crate::server::{
    service::reply::{ReplyHandler, validate_request},
    telemetry::increment_calls_live,
};
use callflow_core::{
    Error, Result,
    proto::{ReplyMessage, RequestMessage},
};
use std::{
    any::Any,
    panic::{self, AssertUnwindSafe},
    sync::Arc,
};

/// Everything a pending call needs to advance: the table it lives in, the
/// acceptor registry it registers with, the queue it posts to and the reply
/// handler. One context exists per engine run and is shared by all dispatch
/// loops.
pub struct CallContext {
    table: CallTable,
    acceptors: Arc<AcceptorRegistry>,
    sender: CompletionSender,
    handler: Arc<dyn ReplyHandler>,
    max_request_bytes: usize,
    stats: Arc<StatsCounters>,
}

impl CallContext {
    pub fn new(
        acceptors: Arc<AcceptorRegistry>,
        sender: CompletionSender,
        handler: Arc<dyn ReplyHandler>,
        max_request_bytes: usize,
        stats: Arc<StatsCounters>,
    ) -> Self {
        Self {
            table: CallTable::new(),
            acceptors,
            sender,
            handler,
            max_request_bytes,
            stats,
        }
    }

    /// Creates a new pending call and runs its CREATE entry action.
    ///
    /// The call is in the table before it registers, so a completion for it
    /// can never overtake its insertion.
    pub fn spawn_call(&self) -> CallId {
        let id = self.table.create();
        self.stats.call_created();
        increment_calls_live();
        self.acceptors.register(id);
        id
    }

    /// Validates the request and runs the reply handler on it.
    ///
    /// A panicking handler fails only this request, with [`Error::Handler`].
    pub fn reply_for(&self, request: &RequestMessage) -> Result<ReplyMessage> {
        validate_request(request, self.max_request_bytes)?;
        panic::catch_unwind(AssertUnwindSafe(|| self.handler.handle(request))).unwrap_or_else(
            |payload| {
                let context = format!("handler panicked: {}", panic_message(&*payload));
                tracing::error!("{context}");
                Err(Error::Handler { context })
            },
        )
    }

    /// Advances the call named by the completion's tag.
    pub fn dispatch(&self, completion: Completion) {
        let tag = completion.tag;
        let Some(mut call) = self.table.checkout(tag) else {
            tracing::error!("Dropping completion for unknown call {tag}");
            return;
        };

        match call.advance(completion, self) {
            Transition::Keep { post } => {
                self.table.restore(call);
                if let Some(completion) = post {
                    if let Err((e, _)) = self.sender.post(completion) {
                        tracing::warn!("Failed to post completion for call {tag}: {e}");
                    }
                }
            }
            Transition::Release => {
                tracing::trace!("Released call {tag}");
            }
        }
    }

    /// Releases every call still in the table. Only valid once no dispatch
    /// loop is running. Returns the number of calls released.
    pub fn release_all(&self) -> usize {
        let calls = self.table.drain();
        let released = calls.len();
        for mut call in calls {
            call.release(self);
        }
        released
    }

    pub const fn table(&self) -> &CallTable {
        &self.table
    }

    pub fn acceptors(&self) -> &AcceptorRegistry {
        &self.acceptors
    }

    pub fn stats(&self) -> &StatsCounters {
        &self.stats
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("unknown panic")
}
