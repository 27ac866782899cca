use std::net::SocketAddr;
use std::sync::Arc;

use tokio::sync::watch;
use tracing::info;

use pulse_api::logging::{init_tracing, LogSettings};
use pulse_api::{AppState, GatewayHeaderResolver, StreamSettings};
use pulse_core::PulseConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    //   LOG_FORMAT  - "json" or "text" (default: "text")
    //   LOG_FILE    - path to log file (optional, enables file logging)
    //   LOG_ANSI    - "true"/"false" override ANSI colors
    //   RUST_LOG    - standard env filter
    let _file_guard = init_tracing(&LogSettings::from_env());

    let config = PulseConfig::from_env()?;
    let broker = pulse_api::broker::global_broker(&config)?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let state = AppState::new(
        broker,
        Arc::new(GatewayHeaderResolver::new()),
        StreamSettings::from_config(&config),
    )
    .with_shutdown(shutdown_rx);
    let app = pulse_api::app(state, &config.allowed_origins);

    let addr: SocketAddr = config.bind_address().parse()?;
    info!(
        backend = %config.broker,
        stream_buffer = config.stream_buffer,
        idle_timeout_secs = config.stream_idle_timeout.map(|d| d.as_secs()).unwrap_or(0),
        "Starting server on {}",
        addr
    );
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown_tx))
        .await?;

    info!("Server stopped");
    Ok(())
}

/// Wait for ctrl-c or SIGTERM, then tell open streams to close so the
/// graceful shutdown does not wait on them.
async fn shutdown_signal(streams: watch::Sender<bool>) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for ctrl-c");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("Shutdown signal received, closing streams");
    let _ = streams.send(true);
}
