use callflow_server::{
    DispatchHandler, Engine,
    server::{
        config::{CliArgs, ServerConfig},
        telemetry::init_telemetry,
    },
};
use clap::Parser;
use tokio::signal;

// Using mimalloc for better performance under contention, especially in musl
// environments.
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load from .env
    let _ = dotenvy::dotenv();
    let args = CliArgs::parse();
    let config = ServerConfig::try_from(args)?;

    let providers = init_telemetry()?;
    log_startup_info(&config);

    let engine = Engine::new(config.engine_config(), DispatchHandler);
    tokio::spawn(shutdown_signal(engine.clone()));

    // Flush exporters whichever way serving ends, startup errors included.
    let res = serve(&engine, &config).await;
    providers.shutdown();
    res
}

async fn serve(engine: &Engine, config: &ServerConfig) -> anyhow::Result<()> {
    match &config.uds {
        #[cfg(unix)]
        Some(uds_path) => {
            use tokio::net::UnixListener;
            use tokio_stream::wrappers::UnixListenerStream;
            let uds = UnixListener::bind(uds_path)?;
            tracing::info!("Server listening on {}", uds_path.display());
            let res = engine
                .run_with_incoming(UnixListenerStream::new(uds))
                .await;
            // Best effort: a panic may still leave the socket file behind.
            let _ = std::fs::remove_file(uds_path);
            Ok(res?)
        }
        #[cfg(not(unix))]
        Some(_) => anyhow::bail!("Unix domain sockets are not supported on this platform"),
        None => Ok(engine.run(config.port).await?),
    }
}

fn log_startup_info(config: &ServerConfig) {
    if cfg!(debug_assertions) {
        tracing::info!("Starting dispatcher with full config: {config:#?}");
    } else {
        tracing::info!(
            "Starting dispatcher on port {} with {} dispatch loop(s)",
            config.port,
            config.dispatchers
        );
    }
}

async fn shutdown_signal(engine: Engine) {
    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    tokio::select! {
        () = ctrl_c => tracing::info!("Received Ctrl+C signal"),
        () = terminate => tracing::info!("Received SIGTERM signal"),
    }

    tracing::info!("Shutdown signal received, terminating gracefully...");
    engine.shutdown();
}
