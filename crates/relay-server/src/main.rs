use rusty_relay_server::{AppState, app, config::RelayConfig, tls, util::from_env_or_else};
use std::{net::SocketAddr, sync::Arc};
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();
    tls::init();

    tracing::info!(
        "🦀 Rusty Relay Server :: {} ::",
        from_env_or_else("VERSION", || "0.0.0".to_string())
    );

    let config = RelayConfig::from_env();
    let state = Arc::new(AppState::from_config(config.clone()).await?);
    tracing::info!(
        instance_id = %config.instance_id,
        tenants = config.tenants.len(),
        policy = %config.selection_policy,
        "relay instance ready"
    );

    let sweeper_token = CancellationToken::new();
    let sweeper = state
        .dispatcher
        .clone()
        .spawn_sweeper(config.sweep_interval, sweeper_token.clone());

    let stopped = CancellationToken::new();
    {
        let state = state.clone();
        let stopped = stopped.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_err() {
                tracing::error!("failed to listen for shutdown signal");
            }
            tracing::info!("🛑 shutting down, draining connector links");
            state.dispatcher.shutdown(state.config.shutdown_grace).await;
            stopped.cancel();
        });
    }

    let service = app(state.clone()).into_make_service_with_connect_info::<SocketAddr>();

    if let Some(tls_config) = tls::config(&config).await {
        let addr = SocketAddr::from(([0, 0, 0, 0], config.https_port));
        tracing::info!("🚀 server running (https) on https://{addr}/health");

        let handle = axum_server::Handle::new();
        {
            let handle = handle.clone();
            let stopped = stopped.clone();
            let grace = config.shutdown_grace;
            tokio::spawn(async move {
                stopped.cancelled().await;
                handle.graceful_shutdown(Some(grace));
            });
        }
        axum_server::bind_rustls(addr, tls_config)
            .handle(handle)
            .serve(service)
            .await?;
    } else {
        let addr = SocketAddr::from(([0, 0, 0, 0], config.http_port));
        tracing::info!("🚀 server running (http) on http://{addr}/health");

        axum::serve(tokio::net::TcpListener::bind(addr).await?, service)
            .with_graceful_shutdown(async move { stopped.cancelled().await })
            .await?;
    }

    sweeper_token.cancel();
    let _ = sweeper.await;
    tracing::info!("👋 relay stopped");
    Ok(())
}
