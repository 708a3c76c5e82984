//! Rendezvous between pending calls waiting for a request and requests
//! waiting for a pending call.
//!
//! A pending call entering CREATE registers its tag here. The transport hands
//! every incoming RPC to [`AcceptorRegistry::deliver`]. Whichever side arrives
//! second completes the match by posting
//! [`CompletionKind::RequestArrived`](super::queue::CompletionKind) for the
//! acceptor's tag. Both sides are matched first-in, first-out.

use super::queue::{CallId, Completion, CompletionSender};
use callflow_core::{
    Error,
    proto::{ReplyMessage, RequestMessage},
};
use parking_lot::Mutex;
use std::collections::VecDeque;
use tokio::sync::oneshot;
use tonic::Status;

/// The means to get back to the client.
#[derive(Debug)]
pub struct Responder {
    tx: oneshot::Sender<Result<ReplyMessage, Status>>,
}

impl Responder {
    /// Creates a responder and the receiver the transport waits on.
    pub fn new() -> (Self, oneshot::Receiver<Result<ReplyMessage, Status>>) {
        let (tx, rx) = oneshot::channel();
        (Self { tx }, rx)
    }

    /// Hands the reply (or error status) to the transport.
    ///
    /// Returns `false` if the client is no longer waiting for it.
    pub fn finish(self, reply: Result<ReplyMessage, Status>) -> bool {
        self.tx.send(reply).is_ok()
    }
}

/// An RPC received by the transport and not yet owned by a pending call.
#[derive(Debug)]
pub struct IncomingCall {
    pub request: RequestMessage,
    pub responder: Responder,
}

#[derive(Default)]
struct RegistryState {
    acceptors: VecDeque<CallId>,
    parked: VecDeque<IncomingCall>,
    closed: bool,
}

/// FIFO matcher of registered acceptors and incoming calls.
pub struct AcceptorRegistry {
    sender: CompletionSender,
    state: Mutex<RegistryState>,
}

impl AcceptorRegistry {
    pub fn new(sender: CompletionSender) -> Self {
        Self {
            sender,
            state: Mutex::new(RegistryState::default()),
        }
    }

    /// Registers `tag` as ready to accept the next incoming call.
    ///
    /// If a call is already parked the match completes immediately. After
    /// [`close`](Self::close) registrations are ignored; the call stays in
    /// CREATE until the engine releases it.
    pub fn register(&self, tag: CallId) {
        let mut state = self.state.lock();
        if state.closed {
            tracing::debug!("Ignoring accept for call {tag}: registry closed");
            return;
        }

        match state.parked.pop_front() {
            Some(call) => {
                if let Err((e, completion)) =
                    self.sender.post(Completion::request_arrived(tag, call))
                {
                    tracing::warn!("Failed to deliver parked call to {tag}: {e}");
                    if let Some(call) = completion.into_incoming() {
                        reject(call);
                    }
                }
            }
            None => state.acceptors.push_back(tag),
        }
    }

    /// Hands an incoming call to the oldest registered acceptor, or parks it
    /// until one registers.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ServiceShutdown`] if the registry is closed or the
    /// completion queue is gone. The call's responder is dropped in that case.
    pub fn deliver(&self, call: IncomingCall) -> Result<(), Error> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(Error::ServiceShutdown);
        }

        match state.acceptors.pop_front() {
            Some(tag) => self
                .sender
                .post(Completion::request_arrived(tag, call))
                .map_err(|(e, _)| e),
            None => {
                state.parked.push_back(call);
                Ok(())
            }
        }
    }

    /// Refuses further calls and answers every parked call with
    /// `UNAVAILABLE`. Returns how many parked calls were rejected.
    /// Idempotent.
    pub fn close(&self) -> usize {
        let parked = {
            let mut state = self.state.lock();
            state.closed = true;
            state.acceptors.clear();
            core::mem::take(&mut state.parked)
        };

        let rejected = parked.len();
        parked.into_iter().for_each(reject);
        rejected
    }

    /// Number of acceptors currently waiting for a call.
    pub fn waiting_acceptors(&self) -> usize {
        self.state.lock().acceptors.len()
    }

    /// Number of calls currently waiting for an acceptor.
    pub fn parked_calls(&self) -> usize {
        self.state.lock().parked.len()
    }
}

fn reject(call: IncomingCall) {
    call.responder.finish(Err(Error::ServiceShutdown.into()));
}
