use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use futures::future::BoxFuture;
use teloxide::dispatching::ShutdownToken;
use teloxide::error_handlers::ErrorHandler;
use teloxide::prelude::*;
use teloxide::types::AllowedUpdate;
use teloxide::update_listeners::Polling;
use teloxide::RequestError;
use tracing::{error, info, warn};

use crate::bot::AppState;

/// Pause between clearing the stale webhook and activating the new
/// delivery mode, so the platform settles.
const SETTLE_DELAY: Duration = Duration::from_secs(2);
const POLL_TIMEOUT: Duration = Duration::from_secs(30);
const POLL_BATCH_LIMIT: u8 = 100;

/// How updates reach the bot. Exactly one mode is active at a time;
/// switching requires clearing the webhook first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryMode {
    Webhook,
    Polling,
}

impl std::fmt::Display for DeliveryMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeliveryMode::Webhook => write!(f, "webhook"),
            DeliveryMode::Polling => write!(f, "polling"),
        }
    }
}

/// Process-wide run state. Written only during startup and shutdown;
/// steady-state message handling only reads it.
pub struct RunState {
    pub mode: DeliveryMode,
    started_at: Instant,
    is_shutting_down: AtomicBool,
    dispatcher: Mutex<Option<ShutdownToken>>,
}

impl RunState {
    pub fn new(mode: DeliveryMode) -> Self {
        Self {
            mode,
            started_at: Instant::now(),
            is_shutting_down: AtomicBool::new(false),
            dispatcher: Mutex::new(None),
        }
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.is_shutting_down.load(Ordering::SeqCst)
    }

    /// Marks shutdown as started. Returns `true` only for the first caller,
    /// so teardown runs exactly once.
    fn begin_shutdown(&self) -> bool {
        !self.is_shutting_down.swap(true, Ordering::SeqCst)
    }

    fn set_dispatcher(&self, token: ShutdownToken) {
        *self.lock_dispatcher() = Some(token);
    }

    fn take_dispatcher(&self) -> Option<ShutdownToken> {
        self.lock_dispatcher().take()
    }

    fn lock_dispatcher(&self) -> std::sync::MutexGuard<'_, Option<ShutdownToken>> {
        // Touched only at activation and teardown; a poisoned lock just
        // means a startup task panicked, so keep going with the value.
        self.dispatcher
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

/// Activates update delivery: clears any stale webhook, authenticates,
/// then either registers the callback URL or starts the long-poll
/// dispatcher on a background task.
pub async fn activate(bot: Bot, state: Arc<AppState>) -> Result<()> {
    info!("Setting up bot...");

    match clear_webhook(&bot).await {
        Ok(()) => info!("Stale webhook cleared"),
        Err(err) if is_conflict(&err) => {
            warn!("Conflict while clearing webhook: another instance is active")
        }
        Err(err) => warn!("Failed to clear stale webhook: {err}"),
    }

    tokio::time::sleep(SETTLE_DELAY).await;

    let me = bot.get_me().await.context("Failed to authenticate bot")?;
    state.set_bot_username(me.username().to_string());
    info!("Bot authenticated as @{}", me.username());

    match state.run.mode {
        DeliveryMode::Webhook => {
            let endpoint = state
                .config
                .webhook_endpoint()
                .context("Webhook mode is enabled but WEBHOOK_URL is missing")?;
            let url = endpoint
                .parse::<url::Url>()
                .with_context(|| format!("Invalid webhook URL: {endpoint}"))?;
            bot.set_webhook(url)
                .await
                .context("Failed to register webhook")?;
            info!("Webhook registered: {endpoint}");
        }
        DeliveryMode::Polling => {
            // One bounded poll up front: a conflicting consumer surfaces
            // here, where bot-first startup treats it as fatal, instead of
            // inside the spawned dispatcher where it would only be logged.
            let mut probe = bot.get_updates();
            probe.limit = Some(1);
            probe.timeout = Some(0);
            probe.await.context("Failed to start long polling")?;

            start_polling(bot, state.clone());
            info!("Polling mode active");
        }
    }

    Ok(())
}

/// Spawns the long-poll dispatcher. The shutdown token is stashed in the
/// run state so teardown can stop it.
fn start_polling(bot: Bot, state: Arc<AppState>) {
    let listener = Polling::builder(bot.clone())
        .timeout(POLL_TIMEOUT)
        .limit(POLL_BATCH_LIMIT)
        .allowed_updates(vec![AllowedUpdate::Message, AllowedUpdate::CallbackQuery])
        .build();

    let mut dispatcher = Dispatcher::builder(bot, crate::bot::handler_tree())
        .dependencies(dptree::deps![state.clone()])
        .default_handler(|upd| async move {
            warn!("Unhandled update: {:?}", upd.id);
        })
        .error_handler(Arc::new(BotErrorHandler))
        .build();

    state.run.set_dispatcher(dispatcher.shutdown_token());

    tokio::spawn(async move {
        dispatcher
            .dispatch_with_listener(listener, Arc::new(BotErrorHandler))
            .await;
        info!("Update polling stopped");
    });
}

/// Ordered teardown: stop is recorded first, then the webhook registration
/// is cleared and the polling consumer stopped. Every step is best-effort.
/// Runs at most once; later calls are no-ops.
pub async fn shutdown(bot: &Bot, state: &AppState) {
    if !state.run.begin_shutdown() {
        return;
    }

    info!("Stopping bot...");

    if let Err(err) = clear_webhook(bot).await {
        warn!("Failed to clear webhook during shutdown (ignored): {err}");
    }

    if let Some(token) = state.run.take_dispatcher() {
        if let Ok(stopped) = token.shutdown() {
            stopped.await;
        }
    }

    info!("Bot stopped");
}

async fn clear_webhook(bot: &Bot) -> Result<(), RequestError> {
    let mut request = bot.delete_webhook();
    request.drop_pending_updates = Some(true);
    request.await.map(|_| ())
}

/// Central classifier for platform-level errors. Conflicts with another
/// running instance are expected during redeploys and are swallowed; the
/// rest is logged.
pub struct BotErrorHandler;

impl ErrorHandler<RequestError> for BotErrorHandler {
    fn handle_error(self: Arc<Self>, error: RequestError) -> BoxFuture<'static, ()> {
        Box::pin(async move { report_bot_error(&error) })
    }
}

pub fn report_bot_error(error: &RequestError) {
    if is_conflict(error) {
        info!("Conflict with another running bot instance (ignored)");
    } else {
        error!("Telegram API error: {error}");
    }
}

/// Another consumer already holds the update stream (HTTP 409 from the
/// platform).
pub fn is_conflict(error: &RequestError) -> bool {
    is_conflict_text(&error.to_string())
}

/// Variant of [`is_conflict`] for context-wrapped errors.
pub fn is_conflict_chain(error: &anyhow::Error) -> bool {
    error.chain().any(|cause| is_conflict_text(&cause.to_string()))
}

fn is_conflict_text(text: &str) -> bool {
    let text = text.to_lowercase();
    text.contains("conflict") || text.contains("terminated by other getupdates request")
}

/// Minimal Telegram Bot API stand-in for activation tests: webhook teardown
/// and `getMe` succeed, `getUpdates` optionally reports that another
/// consumer already holds the update stream.
#[cfg(test)]
pub(crate) mod stub {
    use axum::extract::Path;
    use axum::routing::post;
    use axum::{Json, Router};
    use serde_json::{json, Value};

    pub(crate) async fn telegram_server(conflict_on_get_updates: bool) -> url::Url {
        let app = Router::new().route(
            "/{*rest}",
            post(move |Path(rest): Path<String>| async move {
                // Method names are matched case-insensitively, like the real
                // Bot API (teloxide sends them in PascalCase).
                let method = rest
                    .rsplit('/')
                    .next()
                    .unwrap_or_default()
                    .to_lowercase();
                respond(&method, conflict_on_get_updates)
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.ok();
        });
        format!("http://{addr}/").parse().unwrap()
    }

    fn respond(method: &str, conflict: bool) -> Json<Value> {
        let body = match method {
            "getupdates" if conflict => json!({
                "ok": false,
                "error_code": 409,
                "description": "Conflict: terminated by other getUpdates request",
            }),
            "getupdates" => json!({"ok": true, "result": []}),
            "getme" => json!({"ok": true, "result": {
                "id": 42,
                "is_bot": true,
                "first_name": "relay",
                "username": "relay_test_bot",
                "can_join_groups": false,
                "can_read_all_group_messages": false,
                "supports_inline_queries": false,
                "can_connect_to_business": false,
                "has_main_web_app": false,
            }}),
            _ => json!({"ok": true, "result": true}),
        };
        Json(body)
    }
}
