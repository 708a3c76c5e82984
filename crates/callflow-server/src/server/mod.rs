//! Server internals: configuration, the request-lifecycle engine, the gRPC
//! service front and telemetry.

pub mod config;
pub mod engine;
pub mod service;
pub mod telemetry;
