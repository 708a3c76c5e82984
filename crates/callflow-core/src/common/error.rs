//! Error types for the callflow dispatcher.
//!
//! This module defines the central `Error` enum. Per-request variants are
//! turned into a `tonic::Status` and travel back to the client inside the
//! reply of the call that produced them; engine-level variants surface from
//! `Engine::run` and end the process.
//!
//! ## Error Cases
//! - `InvalidRequest`: The request was malformed or exceeded bounds.
//! - `Handler`: The reply handler failed to build a reply.
//! - `RequestCancelled`: The client went away before its reply was sent.
//! - `ServiceShutdown`: A request arrived while the engine was stopping.
//! - `Bind`: The listener could not be bound at startup.
//! - `Transport`: The gRPC transport stopped with an error.
//! - `QueueClosed`: The completion queue was lost without a shutdown request.
//! - `AlreadyRunning`: `run` was called on an engine that is already serving.

use std::sync::Arc;
use tonic::Status;

pub type Result<T> = core::result::Result<T, Error>;

/// Unified error type for the dispatcher.
#[derive(Clone, thiserror::Error, Debug)]
pub enum Error {
    /// The client request was invalid or exceeded constraints.
    #[error("Invalid request: {reason}")]
    InvalidRequest { reason: String },

    /// The reply handler could not produce a reply.
    #[error("Handler error: {context}")]
    Handler { context: String },

    /// The client aborted the request.
    #[error("Request cancelled by client")]
    RequestCancelled,

    /// The engine is in the process of shutting down.
    #[error("Service is shutting down")]
    ServiceShutdown,

    /// Binding the listening socket failed.
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: Arc<std::io::Error>,
    },

    /// The gRPC transport terminated with an error.
    #[error("Transport error: {context}")]
    Transport { context: String },

    /// The completion queue closed while no shutdown was requested.
    #[error("Completion queue closed unexpectedly")]
    QueueClosed,

    /// The engine is already serving.
    #[error("Engine is already running")]
    AlreadyRunning,
}

impl Error {
    /// Returns `true` for errors that end the engine rather than a single
    /// call.
    pub const fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Bind { .. } | Self::Transport { .. } | Self::QueueClosed | Self::AlreadyRunning
        )
    }
}

impl From<Error> for Status {
    fn from(err: Error) -> Self {
        match err {
            Error::InvalidRequest { reason } => Status::invalid_argument(reason),
            Error::Handler { context } => Status::internal(format!("Handler error: {context}")),
            Error::RequestCancelled => Status::cancelled("Request was cancelled"),
            Error::ServiceShutdown => Status::unavailable("Service is shutting down"),
            Error::Bind { addr, source } => {
                Status::internal(format!("Failed to bind {addr}: {source}"))
            }
            Error::Transport { context } => {
                Status::internal(format!("Transport error: {context}"))
            }
            Error::QueueClosed => Status::unavailable("Completion queue closed"),
            Error::AlreadyRunning => Status::failed_precondition("Engine is already running"),
        }
    }
}
