// Episteme entry point.
//
// Startup sequence:
// 1. Initialize tracing (log to file)
// 2. Load config
// 3. Open database and load active groups
// 4. Create mpsc channels
// 5. Spawn gateway task
// 6. Spawn app logic task
// 7. Wait for Ctrl+C
// 8. Cleanup on exit

use std::sync::Arc;

use anyhow::Context;
use tokio::sync::mpsc;
use tracing::{error, info};

use episteme_app::app;
use episteme_app::config;
use episteme_app::conversation::{ConversationManager, Settings};
use episteme_app::gateway;
use episteme_core::{GroupRegistry, Store};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 1. Initialize tracing
    init_tracing()?;
    info!("Episteme starting up");

    // 2. Load config
    let config = config::load_config().context("failed to load configuration")?;
    info!(
        "Config loaded: bot name `{}`, gateway {}:{}",
        config.bot.name, config.gateway.host, config.gateway.port
    );

    // 3. Open database and load active groups
    let store = Store::open(&config.database.path).context("failed to open database")?;
    info!("Database opened at {}", config.database.path);
    let registry = GroupRegistry::load(store).context("failed to load prediction groups")?;

    let manager = Arc::new(ConversationManager::new(
        Arc::new(registry),
        Settings::from_config(&config),
    ));

    // 4. Create mpsc channels
    let (gateway_tx, gateway_rx) = mpsc::channel(256);
    let (outbound_tx, outbound_rx) = mpsc::channel(256);

    // 5. Spawn gateway task
    let host = config.gateway.host.clone();
    let port = config.gateway.port;
    let max_len = config.gateway.max_message_len;
    let gateway_handle = tokio::spawn(async move {
        if let Err(e) = gateway::run(&host, port, gateway_tx, outbound_rx, max_len).await {
            error!("Gateway error on {}:{}: {}", host, port, e);
        }
    });

    // 6. Spawn app logic task
    let state = app::AppState::new(manager, outbound_tx);
    let sweep_interval = config.sessions.sweep_interval();
    let app_handle = tokio::spawn(async move {
        if let Err(e) = app::run(gateway_rx, state, sweep_interval).await {
            error!("Application loop error: {}", e);
        }
    });

    // 7. Wait for Ctrl+C
    info!("Application ready");
    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for Ctrl+C")?;
    info!("Shutdown requested");

    // 8. Cleanup: stopping the gateway closes the app's inbound channel.
    gateway_handle.abort();
    let _ = tokio::time::timeout(std::time::Duration::from_secs(5), async {
        let _ = app_handle.await;
    })
    .await;

    info!("Episteme shut down cleanly");
    Ok(())
}

/// Initialize tracing to log to `logs/episteme.log`.
fn init_tracing() -> anyhow::Result<()> {
    use tracing_subscriber::fmt;
    use tracing_subscriber::EnvFilter;

    let log_dir = std::env::current_dir()?.join("logs");
    std::fs::create_dir_all(&log_dir)?;

    let log_file = std::fs::File::create(log_dir.join("episteme.log"))?;

    let subscriber = fmt::Subscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("episteme_app=info,episteme_core=info,warn")),
        )
        .with_writer(log_file)
        .with_ansi(false)
        .with_target(true)
        .with_thread_ids(true)
        .with_line_number(true)
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .context("failed to set tracing subscriber")?;

    Ok(())
}
