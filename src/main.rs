mod ai;
mod bot;
mod config;
mod lifecycle;
mod server;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use teloxide::prelude::*;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::bot::AppState;
use crate::config::{Config, StartupOrder};
use crate::server::ServerState;

/// Delay before the bot is activated when the HTTP listener starts first.
const BOT_START_DELAY: Duration = Duration::from_secs(3);

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,relaybot=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Panics in spawned tasks must reach the log, not bare stderr.
    std::panic::set_hook(Box::new(|panic_info| {
        error!("Unhandled panic: {panic_info}");
    }));

    // Fails before any network call when required variables are missing.
    let config = Config::from_env()?;
    info!("Configuration loaded");
    info!("  Port: {}", config.port);
    info!("  Environment: {}", config.environment);
    info!("  Startup order: {}", config.startup_order);

    let bot = Bot::new(&config.bot_token);
    let state = Arc::new(AppState::new(config)?);
    info!("  Mode: {}", state.run.mode);

    let listener = start(&bot, &state).await?;

    let server_state = ServerState {
        bot: bot.clone(),
        app: state.clone(),
    };
    server::serve(listener, server_state, shutdown_signal()).await?;

    lifecycle::shutdown(&bot, &state).await;
    info!("Stopped cleanly");
    Ok(())
}

/// Brings the process up in the configured order and returns the bound
/// HTTP listener.
async fn start(bot: &Bot, state: &Arc<AppState>) -> Result<tokio::net::TcpListener> {
    match state.config.startup_order {
        // Bot must be up before we serve traffic; activation failure is
        // fatal and the listener is never bound.
        StartupOrder::BotFirst => {
            lifecycle::activate(bot.clone(), state.clone())
                .await
                .context("Bot activation failed")?;
            bind_listener(state.config.port).await
        }
        // Serve immediately, bring the bot up in the background. A conflict
        // with another running instance leaves the HTTP surface in degraded
        // mode instead of exiting.
        StartupOrder::HttpFirst => {
            let listener = bind_listener(state.config.port).await?;
            let bot = bot.clone();
            let state = state.clone();
            tokio::spawn(async move {
                tokio::time::sleep(BOT_START_DELAY).await;
                if let Err(err) = lifecycle::activate(bot, state).await {
                    if lifecycle::is_conflict_chain(&err) {
                        warn!(
                            "Another bot instance is already receiving updates; \
                             continuing in degraded mode"
                        );
                    } else {
                        error!("Bot activation failed (HTTP surface stays up): {err:#}");
                    }
                }
            });
            Ok(listener)
        }
    }
}

async fn bind_listener(port: u16) -> Result<tokio::net::TcpListener> {
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port))
        .await
        .with_context(|| format!("Failed to bind to port {port}"))?;
    info!("HTTP server listening on port {port}");
    Ok(listener)
}

/// Resolves when SIGINT or SIGTERM arrives.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!("Failed to install SIGINT handler: {err}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                error!("Failed to install SIGTERM handler: {err}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received SIGINT, shutting down..."),
        _ = terminate => info!("Received SIGTERM, shutting down..."),
    }
}
