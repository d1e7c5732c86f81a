use std::future::Future;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{
    extract::State,
    http::StatusCode,
    response::Html,
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use teloxide::prelude::*;
use teloxide::types::Update;
use tokio::net::TcpListener;
use tracing::{error, info};

use crate::bot::{self, AppState};

#[derive(Clone)]
pub struct ServerState {
    pub bot: Bot,
    pub app: Arc<AppState>,
}

#[derive(Serialize)]
struct ApiStatus {
    status: &'static str,
    bot: &'static str,
    ai: &'static str,
    mode: String,
    timestamp: String,
    uptime_seconds: u64,
    version: &'static str,
}

#[derive(Serialize)]
struct Health {
    status: &'static str,
    timestamp: String,
    uptime_seconds: u64,
}

pub fn router(state: ServerState) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/api/status", get(api_status))
        .route("/health", get(health))
        .route("/webhook", post(webhook))
        .with_state(state)
}

pub async fn serve(
    listener: TcpListener,
    state: ServerState,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<()> {
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await
        .context("HTTP server error")?;
    info!("HTTP server stopped");
    Ok(())
}

async fn index(State(state): State<ServerState>) -> Html<String> {
    Html(render_index(&state.app))
}

async fn api_status(State(state): State<ServerState>) -> Json<ApiStatus> {
    let app = &state.app;
    Json(ApiStatus {
        status: "online",
        bot: "active",
        ai: "gemini-connected",
        mode: app.run.mode.to_string(),
        timestamp: chrono::Utc::now().to_rfc3339(),
        uptime_seconds: app.run.uptime_seconds(),
        version: env!("CARGO_PKG_VERSION"),
    })
}

async fn health(State(state): State<ServerState>) -> Json<Health> {
    Json(Health {
        status: "OK",
        timestamp: chrono::Utc::now().to_rfc3339(),
        uptime_seconds: state.app.run.uptime_seconds(),
    })
}

/// Telegram webhook receiver. Decodable updates are handed to the message
/// handler on their own task and acknowledged with 200 immediately; a body
/// that does not decode as an update is a 500.
async fn webhook(State(state): State<ServerState>, body: String) -> StatusCode {
    match serde_json::from_str::<Update>(&body) {
        Ok(update) => {
            tokio::spawn(bot::handle_update(
                state.bot.clone(),
                state.app.clone(),
                update,
            ));
            StatusCode::OK
        }
        Err(err) => {
            error!("Failed to decode webhook update: {err}");
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

fn render_index(app: &AppState) -> String {
    let now = chrono::Utc::now().format("%Y-%m-%d %H:%M:%S UTC");
    format!(
        r#"<!DOCTYPE html>
<html lang="en">
<head>
    <meta charset="UTF-8">
    <meta name="viewport" content="width=device-width, initial-scale=1.0">
    <title>AI Telegram Bot</title>
    <style>
        body {{ font-family: sans-serif; max-width: 600px; margin: 40px auto; }}
        .status {{ background: #d4edda; color: #155724; padding: 16px; border-radius: 8px; }}
    </style>
</head>
<body>
    <h1>AI Telegram Bot</h1>
    <div class="status">
        <p>The bot is running and ready to help.</p>
        <p>Port: {port}</p>
        <p>Mode: {mode}</p>
        <p>Environment: {environment}</p>
        <p>Time: {now}</p>
    </div>
    <p>Powered by Google Gemini.</p>
</body>
</html>
"#,
        port = app.config.port,
        mode = app.run.mode,
        environment = app.config.environment,
    )
}
