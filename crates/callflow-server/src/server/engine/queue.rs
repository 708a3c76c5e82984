//! The completion queue shared by every pending call.
//!
//! Producers (the acceptor registry and the dispatch loops themselves) post
//! [`Completion`]s through a cloneable [`CompletionSender`]; one or more
//! dispatch loops pull them out of the [`CompletionQueue`]. Each completion
//! carries the [`CallId`] of the pending call it belongs to, and exactly one
//! completion is posted per registered wait, so a given tag is never handed to
//! two dispatch loops at once.
//!
//! Shutting the queue down makes every blocked and future [`next`] call
//! return `None` without draining what is still buffered.
//!
//! [`next`]: CompletionQueue::next

use super::acceptor::IncomingCall;
use callflow_core::Error;
use std::sync::Arc;
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;

/// Stable identity of a pending call, used as the correlation tag on the
/// queue. Identities are never reused within one engine run.
pub type CallId = u64;

/// What finished for the tagged call.
#[derive(Debug)]
pub enum CompletionKind {
    /// A client request was matched with the call's registered accept.
    RequestArrived(IncomingCall),
    /// The reply staged by the call has been handed to the transport.
    SendComplete,
}

/// A tagged notification delivered through the [`CompletionQueue`].
#[derive(Debug)]
pub struct Completion {
    pub tag: CallId,
    /// `false` when the operation did not succeed, e.g. the client went away
    /// before its reply could be delivered.
    pub ok: bool,
    pub kind: CompletionKind,
}

impl Completion {
    pub fn request_arrived(tag: CallId, call: IncomingCall) -> Self {
        Self {
            tag,
            ok: true,
            kind: CompletionKind::RequestArrived(call),
        }
    }

    pub const fn send_complete(tag: CallId, ok: bool) -> Self {
        Self {
            tag,
            ok,
            kind: CompletionKind::SendComplete,
        }
    }

    /// Takes back the incoming call carried by a `RequestArrived` completion.
    pub fn into_incoming(self) -> Option<IncomingCall> {
        match self.kind {
            CompletionKind::RequestArrived(call) => Some(call),
            CompletionKind::SendComplete => None,
        }
    }
}

/// Creates a connected sender/queue pair.
pub fn completion_queue() -> (CompletionSender, CompletionQueue) {
    let (tx, rx) = mpsc::unbounded_channel();
    let shutdown = CancellationToken::new();
    let sender = CompletionSender { tx };
    let queue = CompletionQueue {
        rx: Arc::new(Mutex::new(rx)),
        shutdown,
    };
    (sender, queue)
}

/// Producer half of the completion queue.
#[derive(Clone, Debug)]
pub struct CompletionSender {
    tx: mpsc::UnboundedSender<Completion>,
}

impl CompletionSender {
    /// Posts a completion.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ServiceShutdown`] together with the completion if the
    /// consumer side has been dropped.
    #[allow(clippy::result_large_err)]
    pub fn post(&self, completion: Completion) -> Result<(), (Error, Completion)> {
        self.tx
            .send(completion)
            .map_err(|e| (Error::ServiceShutdown, e.0))
    }
}

/// Consumer half of the completion queue. Clones share the same underlying
/// channel, so several dispatch loops can drain it.
#[derive(Clone, Debug)]
pub struct CompletionQueue {
    rx: Arc<Mutex<mpsc::UnboundedReceiver<Completion>>>,
    shutdown: CancellationToken,
}

impl CompletionQueue {
    /// Waits for the next completion.
    ///
    /// Returns `None` once the queue has been shut down, or when every
    /// [`CompletionSender`] has been dropped. Use [`is_shutdown`] to tell the
    /// two apart.
    ///
    /// [`is_shutdown`]: Self::is_shutdown
    pub async fn next(&self) -> Option<Completion> {
        tokio::select! {
            biased;
            () = self.shutdown.cancelled() => None,
            completion = async { self.rx.lock().await.recv().await } => completion,
        }
    }

    /// Stops delivery. Idempotent.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.is_cancelled()
    }
}
