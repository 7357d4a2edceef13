use anyhow::Context;
use std::sync::Arc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::{executor::RequestExecutor, link::ConnectorLink};

mod backoff;
mod cli;
mod error;
mod executor;
mod link;
mod tls;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tls::init()?;
    tracing_subscriber::fmt::init();

    let args = Arc::new(cli::args());
    let http_client = tls::http_client(&args.ca_cert)?;
    let tls_config = tls::client_config(&args.ca_cert)?;
    let executor = Arc::new(RequestExecutor::new(
        &args.target,
        &args.http_url(),
        http_client,
        args.inline_body_limit,
    ));

    tracing::info!(
        "🚀 rusty-relay-connector v{} relaying {} for tenant {} through {} link(s)",
        env!("CARGO_PKG_VERSION"),
        args.target,
        args.tenant,
        args.connections
    );

    let shutdown = CancellationToken::new();
    let mut links = JoinSet::new();
    for index in 0..args.connections.max(1) {
        let link = ConnectorLink::new(
            index,
            args.clone(),
            executor.clone(),
            tls_config.clone(),
            shutdown.clone(),
        );
        links.spawn(link.run());
    }

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;
    tracing::info!("🛑 shutting down, finishing in-flight requests");
    shutdown.cancel();

    while links.join_next().await.is_some() {}
    Ok(())
}
