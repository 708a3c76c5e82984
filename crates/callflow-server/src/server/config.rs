use crate::server::engine::EngineConfig;
use anyhow::bail;
use callflow_core::types::{DEFAULT_MAX_REQUEST_BYTES, DEFAULT_PORT};
use clap::Parser;
use core::time::Duration;
use std::path::PathBuf;

/// Runtime configuration for the `callflow-server` binary.
///
/// All values are parsed from CLI arguments or environment variables (a
/// `.env` file is loaded first), with defaults suitable for a local
/// deployment.
#[derive(Parser, Debug, Clone)]
#[command(
    name = "callflow-server",
    version,
    about = "A gRPC unary dispatcher driven by a shared completion queue"
)]
pub struct CliArgs {
    /// TCP port to listen on. The server always binds `0.0.0.0`.
    ///
    /// Environment variable: `PORT`
    #[arg(short, long, env = "PORT", default_value_t = DEFAULT_PORT)]
    pub port: u16,

    /// Number of dispatch loops draining the shared completion queue.
    ///
    /// Each loop advances one pending call at a time; more loops let
    /// independent calls progress in parallel on the multi-threaded runtime.
    ///
    /// Environment variable: `DISPATCHERS`
    #[arg(long, env = "DISPATCHERS", default_value_t = 1)]
    pub dispatchers: usize,

    /// Largest accepted `request_string`, in bytes. Longer requests are
    /// answered with `INVALID_ARGUMENT`.
    ///
    /// Environment variable: `MAX_REQUEST_BYTES`
    #[arg(long, env = "MAX_REQUEST_BYTES", default_value_t = DEFAULT_MAX_REQUEST_BYTES)]
    pub max_request_bytes: usize,

    /// Seconds to wait for the listener to stop during shutdown before
    /// in-flight connections are abandoned.
    ///
    /// Environment variable: `SHUTDOWN_TIMEOUT`
    #[arg(long, env = "SHUTDOWN_TIMEOUT", default_value_t = 5)]
    pub shutdown_timeout: u64,

    /// Listen on this Unix domain socket path instead of TCP.
    ///
    /// Environment variable: `UDS_PATH`
    #[arg(long, env = "UDS_PATH")]
    pub uds: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub dispatchers: usize,
    pub max_request_bytes: usize,
    pub shutdown_timeout: Duration,
    pub uds: Option<PathBuf>,
}

impl ServerConfig {
    /// The subset of settings the engine itself consumes.
    pub const fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            dispatchers: self.dispatchers,
            max_request_bytes: self.max_request_bytes,
            shutdown_timeout: self.shutdown_timeout,
        }
    }
}

impl TryFrom<CliArgs> for ServerConfig {
    type Error = anyhow::Error;

    fn try_from(args: CliArgs) -> Result<Self, Self::Error> {
        if args.port == 0 && args.uds.is_none() {
            bail!("PORT must be greater than 0");
        }

        if args.dispatchers == 0 {
            bail!("DISPATCHERS must be greater than 0");
        }

        if args.max_request_bytes == 0 {
            bail!("MAX_REQUEST_BYTES must be greater than 0");
        }

        Ok(Self {
            port: args.port,
            dispatchers: args.dispatchers,
            max_request_bytes: args.max_request_bytes,
            shutdown_timeout: Duration::from_secs(args.shutdown_timeout),
            uds: args.uds,
        })
    }
}
