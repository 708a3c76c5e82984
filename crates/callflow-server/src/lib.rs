#![doc = include_str!("../README.md")]

pub mod server;

pub use server::engine::{Engine, EngineConfig, EngineStats};
pub use server::service::reply::{DispatchHandler, ReplyHandler};
