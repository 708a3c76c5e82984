//! One client request's journey through the engine.
//!
//! ```text
//!   CREATE ──RequestArrived──▶ PROCESSING ──SendComplete──▶ FINISHED
//! ```
//!
//! Every transition is driven by a completion for the call's own tag, and
//! [`PendingCall::advance`] performs exactly one transition per completion:
//!
//! - entering CREATE registers the call as an acceptor; a cancelled accept
//!   still spawns a replacement before the call is released;
//! - entering PROCESSING spawns a replacement acceptor, computes the reply,
//!   hands it to the transport and stages a `SendComplete` for the call;
//! - entering FINISHED releases the call.

use super::{
    acceptor::IncomingCall,
    context::CallContext,
    queue::{CallId, Completion, CompletionKind},
};
use crate::server::telemetry::{
    decrement_calls_live, increment_request_errors, increment_requests, record_call_duration,
};
use callflow_core::{
    Error,
    proto::{ReplyMessage, RequestMessage},
};
use std::time::Instant;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CallState {
    /// Registered as an acceptor, waiting for a request.
    Create,
    /// Reply handed to the transport, waiting for the send to complete.
    Processing,
    /// Done; the call is released.
    Finished,
}

/// What the dispatch loop does with a call after advancing it.
#[derive(Debug)]
pub enum Transition {
    /// Put the call back in the table, then post `post` if present.
    Keep { post: Option<Completion> },
    /// The call reached FINISHED; drop it.
    Release,
}

#[derive(Debug)]
pub struct PendingCall {
    id: CallId,
    state: CallState,
    // What we get from the client.
    request: RequestMessage,
    // What we send back to the client.
    reply: Option<ReplyMessage>,
    error: Option<Error>,
    started: Option<Instant>,
}

impl PendingCall {
    pub(crate) fn new(id: CallId) -> Self {
        Self {
            id,
            state: CallState::Create,
            request: RequestMessage::default(),
            reply: None,
            error: None,
            started: None,
        }
    }

    pub const fn id(&self) -> CallId {
        self.id
    }

    pub const fn state(&self) -> CallState {
        self.state
    }

    pub const fn request(&self) -> &RequestMessage {
        &self.request
    }

    pub const fn reply(&self) -> Option<&ReplyMessage> {
        self.reply.as_ref()
    }

    pub const fn error(&self) -> Option<&Error> {
        self.error.as_ref()
    }

    /// Applies one completion for this call.
    #[tracing::instrument(level = "trace", skip_all, fields(call = self.id, state = ?self.state))]
    pub(crate) fn advance(&mut self, completion: Completion, ctx: &CallContext) -> Transition {
        debug_assert_eq!(completion.tag, self.id);
        let Completion { ok, kind, .. } = completion;

        match (self.state, kind) {
            (CallState::Create, CompletionKind::RequestArrived(incoming)) => {
                if ok {
                    self.process(incoming, ctx)
                } else {
                    tracing::debug!("Accept for call {} was cancelled", self.id);
                    ctx.spawn_call();
                    self.finish(ctx)
                }
            }
            (CallState::Processing, CompletionKind::SendComplete) => {
                if !ok {
                    tracing::debug!("Client left before call {} was answered", self.id);
                    self.error.get_or_insert(Error::RequestCancelled);
                }
                self.finish(ctx)
            }
            (state, kind) => {
                tracing::error!(
                    "Call {} ignoring unexpected {:?} in state {state:?}",
                    self.id,
                    kind
                );
                Transition::Keep { post: None }
            }
        }
    }

    fn process(&mut self, incoming: IncomingCall, ctx: &CallContext) -> Transition {
        // Spawn the next acceptor before leaving CREATE so the server keeps
        // accepting while this call is busy.
        ctx.spawn_call();

        self.state = CallState::Processing;
        self.started = Some(Instant::now());
        ctx.stats().call_started();
        increment_requests();

        let IncomingCall { request, responder } = incoming;
        self.request = request;

        let outcome = match ctx.reply_for(&self.request) {
            Ok(reply) => {
                self.reply = Some(reply.clone());
                Ok(reply)
            }
            Err(e) => {
                tracing::debug!("Call {} failed: {e}", self.id);
                self.error = Some(e.clone());
                Err(e.into())
            }
        };

        let delivered = responder.finish(outcome);
        Transition::Keep {
            post: Some(Completion::send_complete(self.id, delivered)),
        }
    }

    fn finish(&mut self, ctx: &CallContext) -> Transition {
        self.release(ctx);
        Transition::Release
    }

    /// Moves the call to FINISHED and accounts for it. Used by the state
    /// machine and when the engine discards calls on shutdown.
    pub(crate) fn release(&mut self, ctx: &CallContext) {
        let from = core::mem::replace(&mut self.state, CallState::Finished);
        let failed = self.error.is_some();

        if from == CallState::Processing {
            if failed {
                increment_request_errors();
            }
            if let Some(started) = self.started {
                record_call_duration(started.elapsed().as_secs_f64() * 1000.0);
            }
        }
        if from != CallState::Finished {
            decrement_calls_live();
        }

        ctx.stats().call_released(from, failed);
    }
}
