use std::{path::PathBuf, time::Duration};

use clap::Parser;

#[derive(Debug, Parser, Clone)]
#[command(name = "device-relay")]
#[command(about = "Relays operator commands from a Telegram bot to connected device agents")]
pub struct Config {
    #[arg(long, env = "RELAY_PORT", default_value_t = 3000)]
    pub port: u16,

    #[arg(long, env = "RELAY_BIND", default_value = "0.0.0.0")]
    pub bind: String,

    #[arg(long, env = "TELEGRAM_BOT_TOKEN")]
    pub bot_token: Option<String>,

    /// Comma-separated chat ids allowed to operate the bot.
    #[arg(long, env = "TELEGRAM_ALLOWED_CHATS", default_value = "")]
    pub allowed_chats: String,

    #[arg(long, env = "TELEGRAM_API_URL", default_value = "https://api.telegram.org")]
    pub telegram_api_url: String,

    #[arg(long, default_value_t = 30)]
    pub poll_timeout: u64,

    /// Base URL operators use to reach the shell and file-browser pages.
    #[arg(long, env = "RELAY_PUBLIC_URL")]
    pub public_url: Option<String>,

    #[arg(long, env = "RELAY_STATIC_DIR")]
    pub static_dir: Option<PathBuf>,

    /// Expire unanswered prompts after this many seconds. Unset keeps them forever.
    #[arg(long, env = "RELAY_PENDING_TTL_SECS")]
    pub pending_ttl_secs: Option<u64>,

    #[arg(long, env = "RELAY_KEEPALIVE_URL")]
    pub keepalive_url: Option<String>,

    #[arg(long, default_value_t = 300)]
    pub keepalive_interval_secs: u64,

    #[arg(long, env = "RELAY_LOG", default_value = "info")]
    pub log_level: String,

    #[arg(long, default_value_t = false)]
    pub json_output: bool,
}

impl Config {
    /// Parsed allow-list. Entries that are not integers are skipped with a warning.
    pub fn allowed_chat_ids(&self) -> Vec<i64> {
        self.allowed_chats
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .filter_map(|s| match s.parse::<i64>() {
                Ok(id) => Some(id),
                Err(_) => {
                    tracing::warn!(target = "device_relay::config", entry = %s, "ignoring non-numeric chat id");
                    None
                }
            })
            .collect()
    }

    pub fn pending_ttl(&self) -> Option<Duration> {
        self.pending_ttl_secs
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
    }

    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_secs(self.keepalive_interval_secs.max(1))
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }

    /// Public base URL without a trailing slash, defaulting to the local listener.
    pub fn public_base_url(&self) -> String {
        self.public_url
            .as_deref()
            .map(str::trim)
            .filter(|url| !url.is_empty())
            .map(|url| url.trim_end_matches('/').to_string())
            .unwrap_or_else(|| format!("http://localhost:{}", self.port))
    }
}
