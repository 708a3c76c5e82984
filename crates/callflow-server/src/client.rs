use anyhow::{Context, bail};
use callflow_core::{
    proto::{RequestMessage, dispatcher_client::DispatcherClient},
    types::{DEFAULT_PORT, DEFAULT_REQUEST},
};
use clap::Parser;
use futures::stream::{FuturesUnordered, StreamExt};

/// Sends `HandleRequest` calls to a running `callflow-server`.
#[derive(Parser, Debug)]
#[command(name = "callflow-client", version, about)]
struct ClientArgs {
    /// Host of the server.
    #[arg(short, long, default_value = "localhost")]
    server: String,

    /// Port of the server.
    #[arg(short, long, default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Number of requests sent concurrently.
    #[arg(long, default_value_t = 1)]
    count: usize,

    /// The `request_string` of every request.
    #[arg(long, default_value = DEFAULT_REQUEST)]
    message: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = ClientArgs::parse();
    let target = format!("http://{}:{}", args.server, args.port);

    let client = DispatcherClient::connect(target.clone())
        .await
        .with_context(|| format!("failed to connect to {target}"))?;

    let mut calls: FuturesUnordered<_> = (0..args.count)
        .map(|_| {
            let mut client = client.clone();
            let request = RequestMessage {
                request_string: args.message.clone(),
            };
            async move { client.handle_request(request).await }
        })
        .collect();

    let mut failed = 0usize;
    while let Some(res) = calls.next().await {
        match res {
            Ok(reply) => println!("Answer received: {}", reply.into_inner().reply_string),
            Err(status) => {
                failed += 1;
                eprintln!("RPC failed: {:?}: {}", status.code(), status.message());
            }
        }
    }

    if failed > 0 {
        bail!("{failed} of {} request(s) failed", args.count);
    }
    Ok(())
}
