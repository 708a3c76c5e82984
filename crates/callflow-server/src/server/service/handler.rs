//! gRPC service implementation for unary request dispatch.
//!
//! [`DispatchService`] implements the generated [`Dispatcher`] trait. It does
//! no work of its own: every RPC becomes an [`IncomingCall`] handed to the
//! engine's acceptor registry, and the handler then waits for the pending
//! call that picked it up to send the reply back.

use crate::server::engine::acceptor::{AcceptorRegistry, IncomingCall, Responder};
use callflow_core::{
    Error,
    proto::{ReplyMessage, RequestMessage, dispatcher_server::Dispatcher},
};
use std::sync::Arc;
use tonic::{Request, Response, Status};

#[derive(Clone)]
pub struct DispatchService {
    acceptors: Arc<AcceptorRegistry>,
}

impl DispatchService {
    pub const fn new(acceptors: Arc<AcceptorRegistry>) -> Self {
        Self { acceptors }
    }
}

#[tonic::async_trait]
impl Dispatcher for DispatchService {
    /// Hands the request to the engine and awaits its reply.
    ///
    /// Returns `UNAVAILABLE` if the engine is shutting down or discarded the
    /// call; per-request failures arrive as whatever status the pending call
    /// attached to its reply.
    #[tracing::instrument(level = "debug", skip_all, fields(len = req.get_ref().request_string.len()))]
    async fn handle_request(
        &self,
        req: Request<RequestMessage>,
    ) -> Result<Response<ReplyMessage>, Status> {
        let (responder, reply_rx) = Responder::new();

        self.acceptors.deliver(IncomingCall {
            request: req.into_inner(),
            responder,
        })?;

        match reply_rx.await {
            Ok(Ok(reply)) => Ok(Response::new(reply)),
            Ok(Err(status)) => Err(status),
            Err(_) => Err(Error::ServiceShutdown.into()),
        }
    }
}
