//! Tracing initialisation for the server binary.
//!
//! Every log site carries `subsystem` (`broker`, `stream`, `api`, `db`,
//! `client`, `config`) and, where it applies, `component`, `op`, `org_id`
//! and `event_type`.
//!
//! | Level | Usage |
//! |-------|-------|
//! | ERROR | Degraded service, requires operator attention |
//! | WARN  | Recoverable issue, automatic fallback applied |
//! | INFO  | Lifecycle events (startup, shutdown, transport connected) |
//! | DEBUG | Decision points, subscribe/unsubscribe, state transitions |
//! | TRACE | Per-event dispatch |

use std::path::Path;

use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Default filter when `RUST_LOG` is unset.
pub const DEFAULT_FILTER: &str = "pulse_api=debug,pulse_core=debug,pulse_db=debug,tower_http=debug";

/// Output settings read from the environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogSettings {
    /// `json` or `text`.
    pub format: String,
    /// Log file path; enables daily-rotated file output.
    pub file: Option<String>,
    /// ANSI color override (auto-detected when unset).
    pub ansi: Option<bool>,
}

impl LogSettings {
    /// Reads `LOG_FORMAT`, `LOG_FILE` and `LOG_ANSI`.
    pub fn from_env() -> Self {
        Self {
            format: std::env::var("LOG_FORMAT").unwrap_or_else(|_| "text".to_string()),
            file: std::env::var("LOG_FILE").ok().filter(|p| !p.trim().is_empty()),
            ansi: std::env::var("LOG_ANSI")
                .ok()
                .map(|v| v == "true" || v == "1"),
        }
    }

    pub fn is_json(&self) -> bool {
        self.format.eq_ignore_ascii_case("json")
    }
}

/// Install the global subscriber. The returned guard must live as long as
/// file logging is needed.
pub fn init_tracing(settings: &LogSettings) -> Option<WorkerGuard> {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| DEFAULT_FILTER.into());

    let registry = tracing_subscriber::registry().with(env_filter);

    let guard = if let Some(ref path) = settings.file {
        let file_dir = Path::new(path).parent().unwrap_or(Path::new("."));
        let file_name = Path::new(path)
            .file_name()
            .and_then(|f| f.to_str())
            .unwrap_or("pulse-api.log");
        let file_appender = tracing_appender::rolling::daily(file_dir, file_name);
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

        if settings.is_json() {
            registry
                .with(
                    tracing_subscriber::fmt::layer()
                        .json()
                        .with_writer(non_blocking),
                )
                .init();
        } else {
            let layer = tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(settings.ansi.unwrap_or(false));
            registry.with(layer).init();
        }
        Some(guard)
    } else {
        if settings.is_json() {
            registry
                .with(tracing_subscriber::fmt::layer().json())
                .init();
        } else {
            let mut layer = tracing_subscriber::fmt::layer();
            if let Some(ansi) = settings.ansi {
                layer = layer.with_ansi(ansi);
            }
            registry.with(layer).init();
        }
        None
    };

    info!(
        log_format = %settings.format,
        log_file = settings.file.as_deref().unwrap_or("(stdout)"),
        "Logging initialized"
    );
    guard
}
