use std::sync::{Arc, OnceLock};

use anyhow::Result;
use teloxide::dispatching::UpdateHandler;
use teloxide::prelude::*;
use teloxide::types::{ChatAction, ChatId, UpdateKind};
use teloxide::utils::command::BotCommands;
use teloxide::RequestError;
use tracing::{debug, info, warn};

use crate::ai::GeminiClient;
use crate::config::Config;
use crate::lifecycle::{self, DeliveryMode, RunState};

/// Telegram caps messages at 4096 characters; replies are cut a bit below
/// that so the truncation notice always fits.
const REPLY_LIMIT: usize = 4000;
const TRUNCATION_NOTICE: &str = "...\n\nNote: the reply was shortened to fit Telegram's message limit.";

const APOLOGY: &str = "Sorry, something went wrong. Please try again.";

const WELCOME: &str = "Hi! I'm an AI assistant powered by Google Gemini.\n\n\
What I can do:\n\
- Answer questions\n\
- Help with tasks\n\
- Explain difficult topics\n\
- Generate ideas\n\
- Write code\n\n\
Just send me any question and I'll do my best to help!\n\n\
Commands:\n\
/help - How to use the bot\n\
/status - Bot status";

const STICKER_REPLY: &str =
    "Nice sticker! I can only work with text for now. Ask me a question!";
const PHOTO_REPLY: &str =
    "Nice photo! I can only work with text for now. Describe it in words!";
const VOICE_REPLY: &str =
    "Sorry, I can't process voice messages yet. Please type your question!";
const DOCUMENT_REPLY: &str =
    "Interesting document! I only work with text messages. Paste the text you need help with!";

#[derive(BotCommands, Clone, Copy, Debug, PartialEq, Eq)]
#[command(rename_rule = "lowercase")]
pub enum Command {
    Start,
    Help,
    Status,
}

/// Shared application state
pub struct AppState {
    pub config: Config,
    pub ai: GeminiClient,
    pub run: RunState,
    bot_username: OnceLock<String>,
}

impl AppState {
    pub fn new(config: Config) -> Result<Self> {
        let ai = GeminiClient::new(config.gemini_api_key.clone())?;
        let mode = if config.use_webhook {
            DeliveryMode::Webhook
        } else {
            DeliveryMode::Polling
        };
        Ok(Self {
            ai,
            run: RunState::new(mode),
            config,
            bot_username: OnceLock::new(),
        })
    }

    /// Username reported by `getMe`; empty until activation completes.
    pub fn bot_username(&self) -> &str {
        self.bot_username.get().map(String::as_str).unwrap_or("")
    }

    pub fn set_bot_username(&self, username: String) {
        self.bot_username.set(username).ok();
    }
}

/// Handler tree used by the polling dispatcher.
pub fn handler_tree() -> UpdateHandler<RequestError> {
    Update::filter_message().endpoint(route_message)
}

/// Entry point for updates delivered over the webhook. Routes through the
/// same message handler as the polling dispatcher.
pub async fn handle_update(bot: Bot, state: Arc<AppState>, update: Update) {
    if state.run.is_shutting_down() {
        debug!("Ignoring update received during shutdown");
        return;
    }
    let update_id = update.id;
    match update.kind {
        UpdateKind::Message(msg) => {
            if let Err(err) = route_message(bot, msg, state).await {
                lifecycle::report_bot_error(&err);
            }
        }
        _ => debug!("Ignoring non-message update: {update_id:?}"),
    }
}

pub async fn route_message(bot: Bot, msg: Message, state: Arc<AppState>) -> ResponseResult<()> {
    if let Some(text) = msg.text().map(str::to_owned) {
        return match Command::parse(&text, state.bot_username()) {
            Ok(command) => handle_command(bot, msg, state, command).await,
            Err(_) => handle_text(bot, msg, state, &text).await,
        };
    }

    // Non-text media gets static guidance, no AI call.
    let guidance = if msg.sticker().is_some() {
        Some(STICKER_REPLY)
    } else if msg.photo().is_some() {
        Some(PHOTO_REPLY)
    } else if msg.voice().is_some() {
        Some(VOICE_REPLY)
    } else if msg.document().is_some() {
        Some(DOCUMENT_REPLY)
    } else {
        None
    };

    if let Some(reply) = guidance {
        reply_or_apologize(&bot, msg.chat.id, reply.to_string()).await;
    }

    Ok(())
}

async fn handle_command(
    bot: Bot,
    msg: Message,
    state: Arc<AppState>,
    command: Command,
) -> ResponseResult<()> {
    let text = match command {
        Command::Start => WELCOME.to_string(),
        Command::Help => help_text(&state.config.environment),
        Command::Status => status_text(state.run.uptime_seconds(), state.run.mode),
    };
    reply_or_apologize(&bot, msg.chat.id, text).await;
    Ok(())
}

/// Sends a reply while the chat is still in hand. On failure the error is
/// classified centrally and one apology attempt is made; conflicts with
/// another running instance get no apology. Never fails to the caller.
async fn reply_or_apologize(bot: &Bot, chat_id: ChatId, text: String) {
    let Err(err) = bot.send_message(chat_id, text).await else {
        return;
    };
    lifecycle::report_bot_error(&err);
    if lifecycle::is_conflict(&err) {
        return;
    }
    if let Err(err) = bot.send_message(chat_id, APOLOGY).await {
        warn!("Failed to send apology: {err}");
    }
}

/// Relays one text message to Gemini. Errors never leave this function:
/// the AI client maps its own failures to user-facing text, and send
/// failures get one apology attempt before being swallowed.
async fn handle_text(
    bot: Bot,
    msg: Message,
    state: Arc<AppState>,
    text: &str,
) -> ResponseResult<()> {
    let sender = msg
        .from
        .as_ref()
        .map(|user| user.first_name.as_str())
        .unwrap_or("user");
    info!("Message from {sender}: {text}");

    bot.send_chat_action(msg.chat.id, ChatAction::Typing)
        .await
        .ok();

    let reply = state.ai.ask(text).await;
    reply_or_apologize(&bot, msg.chat.id, truncate_reply(&reply)).await;

    Ok(())
}

/// Cuts a reply to the first `REPLY_LIMIT` characters and appends the
/// truncation notice. Replies within the limit pass through verbatim.
pub fn truncate_reply(reply: &str) -> String {
    if reply.chars().count() <= REPLY_LIMIT {
        return reply.to_string();
    }
    let mut truncated: String = reply.chars().take(REPLY_LIMIT).collect();
    truncated.push_str(TRUNCATION_NOTICE);
    truncated
}

fn help_text(environment: &str) -> String {
    format!(
        "How to use the bot:\n\
         1. Send any question as a plain message\n\
         2. I'll answer using Google Gemini\n\
         3. Ask follow-up questions any time\n\n\
         Example questions:\n\
         - \"Explain quantum physics in simple terms\"\n\
         - \"How do I cook pasta carbonara?\"\n\
         - \"Write Python code to sort an array\"\n\
         - \"Translate this text to English\"\n\n\
         Environment: {environment}"
    )
}

fn status_text(uptime_seconds: u64, mode: DeliveryMode) -> String {
    format!(
        "Bot status:\n\
         Bot: active\n\
         Gemini AI: connected\n\
         Uptime: {uptime_seconds} s\n\
         Version: {}\n\
         Mode: {mode}\n\n\
         Ready to help!",
        env!("CARGO_PKG_VERSION")
    )
}
