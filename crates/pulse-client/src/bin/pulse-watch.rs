//! pulse-watch: follow an organization's event stream from the terminal.
//!
//! Logs every cache invalidation the stream would cause. Useful for smoke
//! testing a deployment.

use std::sync::Arc;

use clap::Parser;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use pulse_client::{ConsumerState, EventConsumer, HttpEventSource, QueryKey};

#[derive(Parser)]
#[command(name = "pulse-watch")]
#[command(author, version, about = "Watch an organization's pulse event stream")]
struct Cli {
    /// Server base URL
    #[arg(long, env = "PULSE_URL", default_value = "http://localhost:3000")]
    url: String,

    /// Organization to follow
    #[arg(long)]
    org: String,

    /// Bearer token sent to the server
    #[arg(long, env = "PULSE_TOKEN")]
    token: Option<String>,

    /// Send gateway identity headers for this user (direct access without
    /// an authenticating proxy)
    #[arg(long)]
    user_id: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "pulse_watch=info,pulse_client=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    let mut source = HttpEventSource::new(&cli.url)?;
    if let Some(token) = &cli.token {
        source = source.with_bearer_token(token)?;
    }
    if let Some(user_id) = &cli.user_id {
        source = source
            .with_header("x-user-id", user_id)?
            .with_header("x-organization-ids", &cli.org)?;
    }

    let invalidate = |key: &QueryKey| info!(key = %key, "Invalidate");
    let mut consumer = EventConsumer::new(source, Arc::new(invalidate));
    let mut state = consumer.watch_state();
    consumer.mount(&cli.org).await?;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
                break;
            }
            changed = state.changed() => {
                if changed.is_err() {
                    break;
                }
                let current = state.borrow_and_update().clone();
                info!(state = %current, "Connection state");
                if current == ConsumerState::Disconnected {
                    anyhow::bail!("gave up reconnecting to {}", cli.url);
                }
            }
        }
    }

    consumer.unmount().await;
    Ok(())
}
