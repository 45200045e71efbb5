use std::path::Path;
use std::sync::Arc;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

use chat_relay::config::RelayConfig;
use chat_relay::pipeline::types::SessionContext;
use chat_relay::pipeline::{Relay, spawn_relay};
use chat_relay::store::{JsonFileStore, StateStore};

/// Stderr logging, plus a daily-rolling file when a log directory is set.
fn init_tracing(log_dir: Option<&Path>) -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let stderr = fmt::layer().with_target(false).with_writer(std::io::stderr);

    match log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "chat-relay.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::registry()
                .with(filter)
                .with(stderr)
                .with(fmt::layer().with_ansi(false).with_writer(writer))
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::registry().with(filter).with(stderr).init();
            None
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Configuration first: a missing credential must fail before any I/O.
    let config = RelayConfig::from_env().unwrap_or_else(|e| {
        eprintln!("Error: {e}");
        eprintln!("  required: TELEGRAM_BOT_TOKEN, TELEGRAM_CHAT_ID, RELAY_SOURCE_URL");
        std::process::exit(1);
    });

    let _log_guard = init_tracing(config.log_dir.as_deref());

    eprintln!("📨 Chat Relay v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Source: {}", config.source_url);
    eprintln!("   Destination chat: {}", config.telegram.chat_id);
    eprintln!("   State: {}", config.state_path.display());
    eprintln!("   Timezone: {}", config.timezone);
    if config.run_once {
        eprintln!("   Mode: single cycle\n");
    } else {
        eprintln!("   Mode: poll every {}s\n", config.poll_interval.as_secs());
    }

    let session = SessionContext::new(&config.session_path);
    if !session.exists() {
        tracing::warn!(
            path = %session.path().display(),
            "Session file not found, the sidecar may need to log in again"
        );
    }

    let backend: Arc<dyn StateStore> = Arc::new(JsonFileStore::open(&config.state_path).await);
    let mut relay = Relay::from_config(&config, backend)?;

    if config.run_once {
        let report = relay.run_cycle(&session).await?;
        tracing::info!(
            cycle = %report.id,
            units_sent = report.units_sent(),
            keys_committed = report.keys_committed(),
            "Single cycle complete"
        );
        return Ok(());
    }

    let (handle, shutdown) = spawn_relay(relay, session, config.poll_interval);

    tokio::signal::ctrl_c().await?;
    tracing::info!("Ctrl-C received, stopping after the current cycle");
    let _ = shutdown.send(true);
    handle.await?;

    Ok(())
}
