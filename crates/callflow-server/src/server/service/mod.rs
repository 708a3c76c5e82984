//! gRPC-facing side of the dispatcher.
//!
//! ## Structure
//!
//! - [`handler`] - tonic entry point (`DispatchService`) that turns each RPC
//!   into an incoming call for the engine.
//! - [`reply`] - the business-logic hook that computes replies.

pub mod handler;
pub mod reply;
