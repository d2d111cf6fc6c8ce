use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::relay::rename;

#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Default)]
#[serde(rename_all = "lowercase")]
pub enum StateBackend {
    #[default]
    Json,
    Sqlite,
}

impl std::fmt::Display for StateBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StateBackend::Json => write!(f, "json"),
            StateBackend::Sqlite => write!(f, "sqlite"),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub discord: DiscordConfig,
    pub sftp: SftpConfig,
    #[serde(default = "default_relay_config")]
    pub relay: RelayConfig,
    #[serde(default = "default_state_config")]
    pub state: StateConfig,
}

#[derive(Deserialize, Clone)]
pub struct DiscordConfig {
    #[serde(default)]
    pub bot_token: String,
    #[serde(default)]
    pub channel_id: u64,
    #[serde(default = "default_api_base")]
    pub api_base: String,
    /// Upper bound on any single Discord request, including attachment downloads.
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

impl DiscordConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl std::fmt::Debug for DiscordConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiscordConfig")
            .field("bot_token", &"<redacted>")
            .field("channel_id", &self.channel_id)
            .field("api_base", &self.api_base)
            .field("request_timeout_secs", &self.request_timeout_secs)
            .finish()
    }
}

#[derive(Deserialize, Clone)]
pub struct SftpConfig {
    #[serde(default)]
    pub host: String,
    #[serde(default = "default_sftp_port")]
    pub port: u16,
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub key_path: Option<PathBuf>,
    #[serde(default)]
    pub key_passphrase: Option<String>,
    #[serde(default = "default_remote_dir")]
    pub remote_dir: String,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
}

impl SftpConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

// Credentials must never reach the logs.
impl std::fmt::Debug for SftpConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SftpConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("key_path", &self.key_path)
            .field(
                "key_passphrase",
                &self.key_passphrase.as_ref().map(|_| "<redacted>"),
            )
            .field("remote_dir", &self.remote_dir)
            .field("connect_timeout_secs", &self.connect_timeout_secs)
            .finish()
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct RelayConfig {
    #[serde(default = "default_rename_pattern")]
    pub rename_pattern: String,
    /// Six-field cron expression (seconds first), hourly by default.
    #[serde(default = "default_poll_cron")]
    pub poll_cron: String,
    /// Check the channel once right away instead of waiting for the first cron tick.
    #[serde(default = "default_run_on_start")]
    pub run_on_start: bool,
    #[serde(default = "default_retry_delay_secs")]
    pub retry_delay_secs: u64,
    #[serde(default = "default_delivery_timeout_secs")]
    pub delivery_timeout_secs: u64,
}

impl RelayConfig {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs(self.retry_delay_secs)
    }

    pub fn delivery_timeout(&self) -> Duration {
        Duration::from_secs(self.delivery_timeout_secs)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct StateConfig {
    #[serde(default)]
    pub backend: StateBackend,
    #[serde(default = "default_state_path")]
    pub path: PathBuf,
}

fn default_api_base() -> String {
    "https://discord.com/api/v10".to_string()
}

fn default_request_timeout_secs() -> u64 {
    30
}

fn default_sftp_port() -> u16 {
    22
}

fn default_remote_dir() -> String {
    ".".to_string()
}

fn default_connect_timeout_secs() -> u64 {
    10
}

fn default_rename_pattern() -> String {
    "{timestamp}_{message_id}_{filename}".to_string()
}

fn default_poll_cron() -> String {
    "0 0 * * * *".to_string()
}

fn default_run_on_start() -> bool {
    true
}

fn default_retry_delay_secs() -> u64 {
    300
}

fn default_delivery_timeout_secs() -> u64 {
    60
}

fn default_state_path() -> PathBuf {
    PathBuf::from("state.json")
}

fn default_relay_config() -> RelayConfig {
    RelayConfig {
        rename_pattern: default_rename_pattern(),
        poll_cron: default_poll_cron(),
        run_on_start: default_run_on_start(),
        retry_delay_secs: default_retry_delay_secs(),
        delivery_timeout_secs: default_delivery_timeout_secs(),
    }
}

fn default_state_config() -> StateConfig {
    StateConfig {
        backend: StateBackend::default(),
        path: default_state_path(),
    }
}

/// Treat empty strings as absent, then fall back to the named environment variable.
fn secret_or_env(value: Option<String>, var: &str) -> Option<String> {
    value
        .filter(|v| !v.is_empty())
        .or_else(|| std::env::var(var).ok().filter(|v| !v.is_empty()))
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let config = Self::from_toml(&content)
            .with_context(|| format!("Invalid config file: {}", path.display()))?;
        Ok(config)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let mut config: Config = toml::from_str(content).context("Failed to parse config")?;
        config.apply_env_fallbacks();
        config.validate()?;
        Ok(config)
    }

    fn apply_env_fallbacks(&mut self) {
        self.discord.bot_token =
            secret_or_env(Some(std::mem::take(&mut self.discord.bot_token)), "DISCORD_TOKEN")
                .unwrap_or_default();
        self.sftp.password = secret_or_env(self.sftp.password.take(), "SFTP_PASSWORD");
        self.sftp.key_passphrase =
            secret_or_env(self.sftp.key_passphrase.take(), "SFTP_KEY_PASSPHRASE");
        self.sftp.key_path = self
            .sftp
            .key_path
            .take()
            .filter(|p| !p.as_os_str().is_empty());
    }

    /// Reject a configuration the relay cannot run with. Never echoes secret values.
    pub fn validate(&self) -> Result<()> {
        if self.discord.bot_token.is_empty() {
            anyhow::bail!("Missing required setting: discord.bot_token (or DISCORD_TOKEN)");
        }
        if self.discord.channel_id == 0 {
            anyhow::bail!("Missing required setting: discord.channel_id");
        }
        if self.discord.request_timeout_secs == 0 {
            anyhow::bail!("discord.request_timeout_secs must be greater than zero");
        }
        if self.sftp.host.is_empty() {
            anyhow::bail!("Missing required setting: sftp.host");
        }
        if self.sftp.user.is_empty() {
            anyhow::bail!("Missing required setting: sftp.user");
        }
        if self.sftp.password.is_none() && self.sftp.key_path.is_none() {
            anyhow::bail!("Provide sftp.password (or SFTP_PASSWORD) or sftp.key_path");
        }
        if self.sftp.connect_timeout_secs == 0 {
            anyhow::bail!("sftp.connect_timeout_secs must be greater than zero");
        }
        if self.relay.retry_delay_secs == 0 {
            anyhow::bail!("relay.retry_delay_secs must be greater than zero");
        }
        if self.relay.delivery_timeout_secs == 0 {
            anyhow::bail!("relay.delivery_timeout_secs must be greater than zero");
        }
        rename::validate_template(&self.relay.rename_pattern)
            .context("relay.rename_pattern is not a valid template")?;
        Ok(())
    }
}
