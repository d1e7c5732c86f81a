use anyhow::{bail, Context, Result};

/// Order in which the HTTP listener and the bot are brought up.
///
/// `HttpFirst` serves HTTP immediately and activates the bot on a delayed
/// background task, tolerating conflicts with another running instance.
/// `BotFirst` activates the bot before serving HTTP and treats any
/// activation failure as fatal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StartupOrder {
    #[default]
    HttpFirst,
    BotFirst,
}

impl std::fmt::Display for StartupOrder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StartupOrder::HttpFirst => write!(f, "http-first"),
            StartupOrder::BotFirst => write!(f, "bot-first"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub bot_token: String,
    pub gemini_api_key: String,
    pub port: u16,
    pub use_webhook: bool,
    pub webhook_url: Option<String>,
    pub environment: String,
    pub startup_order: StartupOrder,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds a config from any variable source. `from_env` delegates here;
    /// tests pass a map instead of touching the process environment.
    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let bot_token = match get("BOT_TOKEN") {
            Some(t) if !t.is_empty() => t,
            _ => bail!("BOT_TOKEN is not set. Check the environment variables."),
        };
        let gemini_api_key = match get("GEMINI_API_KEY") {
            Some(k) if !k.is_empty() => k,
            _ => bail!("GEMINI_API_KEY is not set. Check the environment variables."),
        };

        let port = match get("PORT") {
            Some(raw) => raw
                .parse::<u16>()
                .with_context(|| format!("PORT is not a valid port number: {raw}"))?,
            None => 3000,
        };

        let use_webhook = matches!(get("USE_WEBHOOK").as_deref(), Some("true") | Some("1"));

        let webhook_url = get("WEBHOOK_URL").filter(|u| !u.is_empty());
        if use_webhook && webhook_url.is_none() {
            bail!("USE_WEBHOOK is set but WEBHOOK_URL is missing");
        }

        let environment = get("ENVIRONMENT").unwrap_or_else(|| "development".to_string());

        let startup_order = match get("STARTUP_ORDER").as_deref() {
            None | Some("http-first") => StartupOrder::HttpFirst,
            Some("bot-first") => StartupOrder::BotFirst,
            Some(other) => {
                bail!("STARTUP_ORDER must be \"http-first\" or \"bot-first\", got: {other}")
            }
        };

        Ok(Self {
            bot_token,
            gemini_api_key,
            port,
            use_webhook,
            webhook_url,
            environment,
            startup_order,
        })
    }

    /// The full callback URL registered with Telegram in webhook mode.
    pub fn webhook_endpoint(&self) -> Option<String> {
        self.webhook_url
            .as_ref()
            .map(|base| format!("{}/webhook", base.trim_end_matches('/')))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_missing_bot_token_is_an_error() {
        let err = Config::from_lookup(lookup(&[("GEMINI_API_KEY", "key")])).unwrap_err();
        assert!(err.to_string().contains("BOT_TOKEN"));
    }

    #[test]
    fn test_missing_gemini_key_is_an_error() {
        let err = Config::from_lookup(lookup(&[("BOT_TOKEN", "token")])).unwrap_err();
        assert!(err.to_string().contains("GEMINI_API_KEY"));
    }

    #[test]
    fn test_defaults() {
        let config =
            Config::from_lookup(lookup(&[("BOT_TOKEN", "t"), ("GEMINI_API_KEY", "k")])).unwrap();
        assert_eq!(config.port, 3000);
        assert!(!config.use_webhook);
        assert_eq!(config.webhook_url, None);
        assert_eq!(config.environment, "development");
        assert_eq!(config.startup_order, StartupOrder::HttpFirst);
    }

    #[test]
    fn test_invalid_port_is_an_error() {
        let err = Config::from_lookup(lookup(&[
            ("BOT_TOKEN", "t"),
            ("GEMINI_API_KEY", "k"),
            ("PORT", "not-a-port"),
        ]))
        .unwrap_err();
        assert!(err.to_string().contains("PORT"));
    }

    #[test]
    fn test_webhook_mode_requires_url() {
        let err = Config::from_lookup(lookup(&[
            ("BOT_TOKEN", "t"),
            ("GEMINI_API_KEY", "k"),
            ("USE_WEBHOOK", "true"),
        ]))
        .unwrap_err();
        assert!(err.to_string().contains("WEBHOOK_URL"));
    }

    #[test]
    fn test_webhook_endpoint_appends_path() {
        let config = Config::from_lookup(lookup(&[
            ("BOT_TOKEN", "t"),
            ("GEMINI_API_KEY", "k"),
            ("USE_WEBHOOK", "true"),
            ("WEBHOOK_URL", "https://bot.example.com"),
        ]))
        .unwrap();
        assert_eq!(
            config.webhook_endpoint().as_deref(),
            Some("https://bot.example.com/webhook")
        );
    }

    #[test]
    fn test_webhook_endpoint_tolerates_trailing_slash() {
        let config = Config::from_lookup(lookup(&[
            ("BOT_TOKEN", "t"),
            ("GEMINI_API_KEY", "k"),
            ("USE_WEBHOOK", "1"),
            ("WEBHOOK_URL", "https://bot.example.com/"),
        ]))
        .unwrap();
        assert_eq!(
            config.webhook_endpoint().as_deref(),
            Some("https://bot.example.com/webhook")
        );
    }

    #[test]
    fn test_use_webhook_off_for_other_values() {
        let config = Config::from_lookup(lookup(&[
            ("BOT_TOKEN", "t"),
            ("GEMINI_API_KEY", "k"),
            ("USE_WEBHOOK", "false"),
            ("WEBHOOK_URL", "https://bot.example.com"),
        ]))
        .unwrap();
        assert!(!config.use_webhook);
    }

    #[test]
    fn test_startup_order_bot_first() {
        let config = Config::from_lookup(lookup(&[
            ("BOT_TOKEN", "t"),
            ("GEMINI_API_KEY", "k"),
            ("STARTUP_ORDER", "bot-first"),
        ]))
        .unwrap();
        assert_eq!(config.startup_order, StartupOrder::BotFirst);
    }

    #[test]
    fn test_startup_order_rejects_unknown_values() {
        let err = Config::from_lookup(lookup(&[
            ("BOT_TOKEN", "t"),
            ("GEMINI_API_KEY", "k"),
            ("STARTUP_ORDER", "both-at-once"),
        ]))
        .unwrap_err();
        assert!(err.to_string().contains("STARTUP_ORDER"));
    }
}
