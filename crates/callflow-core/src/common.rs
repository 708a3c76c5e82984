//! Types shared between the callflow server and its clients.
//!
//! - [`error`] - the service-wide error enum and its gRPC status mapping.
//! - [`types`] - wire-level constants.
//! - [`proto`] - generated message, client and server bindings.

pub mod error;
pub mod types;

pub use error::{Error, Result};

/// gRPC bindings generated from `proto/callflow.proto`.
///
/// - [`Dispatcher`](proto::dispatcher_server::Dispatcher) - the server trait.
/// - [`DispatcherClient`](proto::dispatcher_client::DispatcherClient) - the
///   generated client.
/// - [`RequestMessage`](proto::RequestMessage) /
///   [`ReplyMessage`](proto::ReplyMessage) - the unary payloads.
pub mod proto {
    tonic::include_proto!("callflow");
    pub const FILE_DESCRIPTOR_SET: &[u8] = tonic::include_file_descriptor_set!("callflow_descriptor");
}
