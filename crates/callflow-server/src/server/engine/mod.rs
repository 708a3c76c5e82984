//! The request-lifecycle engine.
//!
//! [`Engine`] serves the `Dispatcher` service with a pool of self-replicating
//! pending calls over one shared completion queue:
//!
//! 1. `run` binds the listener, registers the services, creates the queue,
//!    starts the dispatch loops and seeds a single call in CREATE.
//! 2. Each incoming RPC is matched with a CREATE call; that call spawns its
//!    own replacement, computes the reply and finishes.
//! 3. `shutdown` stops the listener first, then the queue; every call still
//!    live afterwards is released before `run` returns.
//!
//! There is no upper bound on live calls: one is spawned per request in
//! flight.
//!
//! ## Submodules
//!
//! - [`queue`] - completion queue and its tagged notifications.
//! - [`acceptor`] - matching of CREATE calls with incoming RPCs.
//! - [`call`] - `PendingCall` and its state machine.
//! - [`table`] - handle table owning live calls.
//! - [`context`] - per-run environment shared by the dispatch loops.
//! - [`dispatch`] - the dispatch loop.
//! - [`stats`] - call counters.

pub mod acceptor;
pub mod call;
pub mod context;
pub mod dispatch;
pub mod queue;
pub mod stats;
pub mod table;

#[cfg(test)]
mod tests;

use crate::server::service::{
    handler::DispatchService,
    reply::{DispatchHandler, ReplyHandler},
};
use acceptor::AcceptorRegistry;
use callflow_core::{
    Error, Result,
    proto::{FILE_DESCRIPTOR_SET, dispatcher_server::DispatcherServer},
    types::DEFAULT_MAX_REQUEST_BYTES,
};
use context::CallContext;
use core::time::Duration;
use dispatch::dispatch_loop;
use futures::Stream;
use portable_atomic::{AtomicBool, Ordering};
use stats::StatsCounters;
use std::sync::Arc;
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::TcpListener,
    task::JoinSet,
    time::timeout,
};
use tokio_stream::wrappers::TcpListenerStream;
use tokio_util::sync::CancellationToken;
use tonic::{
    codec::CompressionEncoding,
    transport::{Server, server::Connected},
};
use tonic_reflection::server::Builder;
use tonic_web::GrpcWebLayer;
use tower::ServiceBuilder;
use tower_http::cors::{Any, CorsLayer};

pub use stats::EngineStats;

/// Settings consumed by the [`Engine`].
#[derive(Clone, Debug)]
pub struct EngineConfig {
    /// Number of dispatch loops sharing the completion queue.
    pub dispatchers: usize,
    /// Largest accepted `request_string`, in bytes.
    pub max_request_bytes: usize,
    /// How long to wait for the listener to stop on shutdown.
    pub shutdown_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            dispatchers: 1,
            max_request_bytes: DEFAULT_MAX_REQUEST_BYTES,
            shutdown_timeout: Duration::from_secs(5),
        }
    }
}

/// Handle to a request-lifecycle engine.
///
/// Cheap to clone; every clone controls the same engine, so one clone can be
/// running while another calls [`shutdown`](Self::shutdown) from a signal
/// handler task or another thread.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

struct EngineInner {
    config: EngineConfig,
    handler: Arc<dyn ReplyHandler>,
    shutdown: CancellationToken,
    running: AtomicBool,
    stats: Arc<StatsCounters>,
}

/// Clears the running flag however `run` exits.
struct RunGuard<'a>(&'a AtomicBool);

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl Default for Engine {
    fn default() -> Self {
        Self::new(EngineConfig::default(), DispatchHandler)
    }
}

impl Engine {
    /// Creates an idle engine that answers requests with `handler`.
    pub fn new<H: ReplyHandler>(config: EngineConfig, handler: H) -> Self {
        Self {
            inner: Arc::new(EngineInner {
                config,
                handler: Arc::new(handler),
                shutdown: CancellationToken::new(),
                running: AtomicBool::new(false),
                stats: Arc::new(StatsCounters::default()),
            }),
        }
    }

    /// Settings the engine was created with.
    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    /// Snapshot of the engine's call counters.
    pub fn stats(&self) -> EngineStats {
        self.inner.stats.snapshot()
    }

    /// Whether a `run` is in progress.
    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::Acquire)
    }

    /// Requests shutdown. Idempotent; safe to call before `run`, from another
    /// task or from another thread. A shut-down engine cannot be restarted.
    pub fn shutdown(&self) {
        if !self.inner.shutdown.is_cancelled() {
            tracing::info!("Engine shutdown requested");
        }
        self.inner.shutdown.cancel();
    }

    /// Whether [`shutdown`](Self::shutdown) has been requested.
    pub fn is_shutdown(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }

    /// Serves on `0.0.0.0:<port>` until [`shutdown`](Self::shutdown).
    ///
    /// # Errors
    ///
    /// - [`Error::Bind`] if the port cannot be bound.
    /// - Any error of [`run_with_incoming`](Self::run_with_incoming).
    pub async fn run(&self, port: u16) -> Result<()> {
        let addr = format!("0.0.0.0:{port}");
        let listener = TcpListener::bind(&addr).await.map_err(|e| Error::Bind {
            addr: addr.clone(),
            source: Arc::new(e),
        })?;

        tracing::info!("Server listening on {addr}");
        self.run_with_incoming(TcpListenerStream::new(listener)).await
    }

    /// Serves connections from `incoming` until
    /// [`shutdown`](Self::shutdown), or until the engine fails.
    ///
    /// # Errors
    ///
    /// - [`Error::AlreadyRunning`] if another `run` is in progress.
    /// - [`Error::Transport`] if the gRPC server fails.
    /// - [`Error::QueueClosed`] if the completion queue is lost.
    pub async fn run_with_incoming<I, IO, IE>(&self, incoming: I) -> Result<()>
    where
        I: Stream<Item = core::result::Result<IO, IE>>,
        IO: AsyncRead + AsyncWrite + Connected + Unpin + Send + 'static,
        IE: Into<tower::BoxError>,
    {
        let inner = &self.inner;
        if inner.running.swap(true, Ordering::AcqRel) {
            return Err(Error::AlreadyRunning);
        }
        let _guard = RunGuard(&inner.running);

        if inner.shutdown.is_cancelled() {
            tracing::info!("Engine was shut down before it started");
            return Ok(());
        }

        let (sender, queue) = queue::completion_queue();
        let acceptors = Arc::new(AcceptorRegistry::new(sender.clone()));
        let ctx = Arc::new(CallContext::new(
            Arc::clone(&acceptors),
            sender,
            Arc::clone(&inner.handler),
            inner.config.max_request_bytes,
            Arc::clone(&inner.stats),
        ));

        let (health_reporter, health_service) = tonic_health::server::health_reporter();
        health_reporter
            .set_serving::<DispatcherServer<DispatchService>>()
            .await;

        let reflection = Builder::configure()
            .register_encoded_file_descriptor_set(FILE_DESCRIPTOR_SET)
            .build_v1()
            .map_err(|e| Error::Transport {
                context: format!("reflection: {e}"),
            })?;

        let server = Server::builder()
            .accept_http1(true)
            .http2_adaptive_window(Some(true))
            .layer(
                ServiceBuilder::new()
                    .layer(
                        CorsLayer::new()
                            .allow_origin(Any)
                            .allow_methods(Any)
                            .allow_headers(Any),
                    )
                    .layer(GrpcWebLayer::new()),
            )
            .add_service(health_service)
            .add_service(reflection)
            .add_service(build_dispatch_service(DispatchService::new(Arc::clone(
                &acceptors,
            ))))
            .serve_with_incoming_shutdown(incoming, inner.shutdown.clone().cancelled_owned());
        tokio::pin!(server);

        let mut loops = JoinSet::new();
        for dispatcher_id in 0..inner.config.dispatchers.max(1) {
            loops.spawn(dispatch_loop(dispatcher_id, queue.clone(), Arc::clone(&ctx)));
        }

        // Seed the first acceptor; from here on every call replaces itself.
        ctx.spawn_call();
        tracing::info!(
            "Engine started with {} dispatcher(s)",
            inner.config.dispatchers.max(1)
        );

        let mut outcome = Ok(());
        let mut server_stopped = false;

        tokio::select! {
            () = inner.shutdown.cancelled() => {}
            res = &mut server => {
                server_stopped = true;
                merge(&mut outcome, transport_result(res));
                tracing::warn!("Listener stopped before shutdown was requested");
            }
            Some(res) = loops.join_next() => {
                merge(&mut outcome, loop_result(res));
            }
        }

        // === Phase 1: Stop the listener ===
        inner.shutdown.cancel();
        health_reporter
            .set_not_serving::<DispatcherServer<DispatchService>>()
            .await;

        if !server_stopped {
            match timeout(inner.config.shutdown_timeout, &mut server).await {
                Ok(res) => merge(&mut outcome, transport_result(res)),
                Err(_) => tracing::warn!(
                    "Listener did not stop within {:?}, abandoning open connections",
                    inner.config.shutdown_timeout
                ),
            }
        }

        // === Phase 2: Stop the queue and the dispatch loops ===
        queue.shutdown();
        while let Some(res) = loops.join_next().await {
            merge(&mut outcome, loop_result(res));
        }

        // === Phase 3: Release what is left ===
        let rejected = ctx.acceptors().close();
        let released = ctx.release_all();
        tracing::debug!("Rejected {rejected} parked call(s), released {released} pending call(s)");

        match &outcome {
            Ok(()) => tracing::info!("Engine shut down successfully"),
            Err(e) => tracing::error!("Engine stopped with error: {e}"),
        }
        outcome
    }
}

fn build_dispatch_service(service: DispatchService) -> DispatcherServer<DispatchService> {
    DispatcherServer::new(service)
        .send_compressed(CompressionEncoding::Zstd)
        .send_compressed(CompressionEncoding::Gzip)
        .send_compressed(CompressionEncoding::Deflate)
        .accept_compressed(CompressionEncoding::Zstd)
        .accept_compressed(CompressionEncoding::Gzip)
        .accept_compressed(CompressionEncoding::Deflate)
}

/// Keeps the first error.
fn merge(outcome: &mut Result<()>, res: Result<()>) {
    if outcome.is_ok() {
        *outcome = res;
    }
}

fn transport_result(res: core::result::Result<(), tonic::transport::Error>) -> Result<()> {
    res.map_err(|e| Error::Transport {
        context: e.to_string(),
    })
}

fn loop_result(res: core::result::Result<Result<()>, tokio::task::JoinError>) -> Result<()> {
    res.map_err(|e| Error::Transport {
        context: format!("dispatcher task failed: {e}"),
    })?
}
