mod bootstrap;
mod channel;
mod sweeper;

use anyhow::Result;
use frontdesk_core::config::{AppConfig, LoadOptions};

use crate::bootstrap::DispatchMode;
use crate::channel::NoopChannel;

fn init_logging(config: &AppConfig) {
    use frontdesk_core::config::LogFormat::*;
    use tracing::Level;

    let log_level = config.logging.level.parse::<Level>().unwrap_or(Level::INFO);

    match config.logging.format {
        Compact => {
            tracing_subscriber::fmt().with_target(false).with_max_level(log_level).compact().init();
        }
        Pretty => {
            tracing_subscriber::fmt().with_target(false).with_max_level(log_level).pretty().init();
        }
        Json => {
            tracing_subscriber::fmt().with_target(false).with_max_level(log_level).json().init();
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    run().await
}

pub async fn run() -> Result<()> {
    // Load config and initialize logging before any other operations
    let config = AppConfig::load(LoadOptions::default())?;
    init_logging(&config);

    // Bootstrap reuses the config we already loaded
    let app = bootstrap::bootstrap_with_config(config).await?;

    tracing::info!(
        event_name = "system.server.dispatch_mode",
        correlation_id = "bootstrap",
        dispatch_mode = match app.dispatch_mode {
            DispatchMode::Preview => "preview",
            DispatchMode::Webhook => "webhook",
        },
        "booking dispatch mode initialized"
    );

    let sweeper = sweeper::spawn(app.store.clone(), app.config.clinic.session_idle_secs);

    tracing::info!(
        event_name = "system.server.started",
        correlation_id = "bootstrap",
        "frontdesk-server started"
    );

    // Serve until the channel closes or the process is interrupted; a closed
    // channel keeps the process (and the sweeper) up until ctrl-c.
    let mut inbound = NoopChannel;
    tokio::select! {
        served = channel::serve(app.runtime.as_ref(), &mut inbound) => {
            served?;
            wait_for_shutdown().await?;
        }
        shutdown = wait_for_shutdown() => shutdown?,
    }

    tracing::info!(
        event_name = "system.server.stopping",
        correlation_id = "shutdown",
        "frontdesk-server stopping"
    );
    sweeper.abort();

    Ok(())
}

async fn wait_for_shutdown() -> Result<()> {
    tokio::signal::ctrl_c().await?;
    Ok(())
}
