//! Configuration for the Kanade bot.
//!
//! Values come from `~/.kanade/config.json` (optional, every field defaulted)
//! followed by environment variable overrides. The Discord token is the only
//! required value; [`BotConfig::validate`] rejects a config without it.

use crate::error::{Error, Result, ResultExt};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

/// Get the configuration directory.
pub fn config_dir() -> PathBuf {
    directories::UserDirs::new().map_or_else(
        || PathBuf::from(".kanade"),
        |dirs| dirs.home_dir().join(".kanade"),
    )
}

/// Get the configuration file path.
pub fn config_path() -> PathBuf {
    config_dir().join("config.json")
}

// ============================================================================
// Root Configuration
// ============================================================================

/// Root configuration for the bot process.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BotConfig {
    /// Discord gateway settings
    #[serde(default)]
    pub discord: DiscordConfig,

    /// Generative model settings
    #[serde(default)]
    pub model: ModelConfig,

    /// Persona used to prime every new conversation
    #[serde(default)]
    pub persona: PersonaConfig,

    /// Conversation memory and eviction settings
    #[serde(default)]
    pub memory: MemoryConfig,

    /// Liveness HTTP server
    #[serde(default)]
    pub server: ServerConfig,

    /// Logging
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

impl BotConfig {
    /// Load configuration from the default path, falling back to defaults
    /// when the file does not exist.
    ///
    /// Runs before logging is initialised, so it does not log.
    pub fn load() -> Result<Self> {
        let path = config_path();
        if !path.exists() {
            return Ok(Self::default());
        }
        Self::load_from(&path)
    }

    /// Load configuration from a specific path.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .context(format!("Failed to read config from {}", path.display()))?;

        serde_json::from_str(&content)
            .context(format!("Failed to parse config from {}", path.display()))
    }

    /// Apply overrides from the process environment.
    ///
    /// Returns the variables that were set but ignored as invalid.
    pub fn apply_env_overrides(&mut self) -> Vec<&'static str> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides from an arbitrary key lookup.
    ///
    /// Empty values are treated as unset. Returns the variables that were
    /// set but could not be parsed; the caller logs them once logging is up.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Vec<&'static str>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut ignored = Vec::new();
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(token) = get("DISCORD_BOT_TOKEN") {
            self.discord.bot_token = Some(token);
        }
        if let Some(guild) = get("DISCORD_GUILD_ID") {
            self.discord.guild_id = Some(guild);
        }

        if let Some(key) = get("GEMINI_API_KEY").or_else(|| get("GOOGLE_API_KEY")) {
            self.model.api_key = Some(key);
        }
        if let Some(model) = get("KANADE_MODEL") {
            self.model.model = model;
        }

        if let Some(port) = get("PORT") {
            match port.trim().parse() {
                Ok(p) => self.server.port = p,
                Err(_) => ignored.push("PORT"),
            }
        }

        if let Some(level) = get("KANADE_LOG_LEVEL") {
            self.observability.log_level = level;
        }
        if let Some(format) = get("KANADE_LOG_FORMAT") {
            self.observability.log_format = format;
        }

        ignored
    }

    /// Check that the configuration can start the bot.
    ///
    /// A missing Discord token is fatal. A missing model key is not: it
    /// surfaces later as a session creation failure, so only warn here.
    pub fn validate(&self) -> Result<()> {
        if self.discord.token().is_none() {
            return Err(Error::Config("DISCORD_BOT_TOKEN missing".into()));
        }
        if self.model.api_key.as_deref().map_or(true, str::is_empty) {
            tracing::warn!("GEMINI_API_KEY not set; replies will fail until it is configured");
        }
        if self.memory.max_history == 0 {
            return Err(Error::Config("memory.max_history must be at least 1".into()));
        }
        if self.memory.sweep_interval_secs == 0 {
            return Err(Error::Config(
                "memory.sweep_interval_secs must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

// ============================================================================
// Discord
// ============================================================================

/// Discord gateway configuration.
#[derive(Clone, Serialize, Deserialize)]
pub struct DiscordConfig {
    /// Bot token
    #[serde(default)]
    pub bot_token: Option<String>,

    /// Restrict the bot to a single guild (slash commands register there too)
    #[serde(default)]
    pub guild_id: Option<String>,

    /// "Playing ..." presence text
    #[serde(default = "default_status_text")]
    pub status_text: String,

    /// Initial reconnect backoff
    #[serde(default = "default_initial_backoff_secs")]
    pub initial_backoff_secs: u64,

    /// Reconnect backoff ceiling
    #[serde(default = "default_max_backoff_secs")]
    pub max_backoff_secs: u64,
}

impl DiscordConfig {
    /// The bot token, if configured and non-empty.
    pub fn token(&self) -> Option<&str> {
        self.bot_token.as_deref().filter(|t| !t.trim().is_empty())
    }
}

impl Default for DiscordConfig {
    fn default() -> Self {
        Self {
            bot_token: None,
            guild_id: None,
            status_text: default_status_text(),
            initial_backoff_secs: default_initial_backoff_secs(),
            max_backoff_secs: default_max_backoff_secs(),
        }
    }
}

impl fmt::Debug for DiscordConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DiscordConfig")
            .field("bot_token", &self.bot_token.as_ref().map(|_| "***"))
            .field("guild_id", &self.guild_id)
            .field("status_text", &self.status_text)
            .field("initial_backoff_secs", &self.initial_backoff_secs)
            .field("max_backoff_secs", &self.max_backoff_secs)
            .finish()
    }
}

// ============================================================================
// Model
// ============================================================================

/// Generative model configuration.
#[derive(Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Gemini API key
    #[serde(default)]
    pub api_key: Option<String>,

    /// Model name
    #[serde(default = "default_model")]
    pub model: String,

    /// API base URL (overridable for testing)
    #[serde(default = "default_model_base_url")]
    pub base_url: String,

    /// Sampling temperature
    #[serde(default = "default_temperature")]
    pub temperature: f64,

    /// Output token cap
    #[serde(default = "default_max_output_tokens")]
    pub max_output_tokens: i64,

    /// Upper bound for one remote call
    #[serde(default = "default_model_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            model: default_model(),
            base_url: default_model_base_url(),
            temperature: default_temperature(),
            max_output_tokens: default_max_output_tokens(),
            timeout_secs: default_model_timeout_secs(),
        }
    }
}

impl fmt::Debug for ModelConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModelConfig")
            .field("api_key", &self.api_key.as_ref().map(|_| "***"))
            .field("model", &self.model)
            .field("base_url", &self.base_url)
            .field("temperature", &self.temperature)
            .field("max_output_tokens", &self.max_output_tokens)
            .field("timeout_secs", &self.timeout_secs)
            .finish()
    }
}

// ============================================================================
// Persona
// ============================================================================

/// Persona used for the two priming turns of every conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersonaConfig {
    /// Persona instructions (sent as the system turn)
    #[serde(default = "default_system_prompt")]
    pub system_prompt: String,

    /// Canned acknowledgment (sent as the first assistant turn)
    #[serde(default = "default_acknowledgment")]
    pub acknowledgment: String,

    /// Text used when a mention carries no message
    #[serde(default = "default_greeting")]
    pub greeting: String,
}

impl Default for PersonaConfig {
    fn default() -> Self {
        Self {
            system_prompt: default_system_prompt(),
            acknowledgment: default_acknowledgment(),
            greeting: default_greeting(),
        }
    }
}

// ============================================================================
// Memory
// ============================================================================

/// Conversation memory configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryConfig {
    /// Exchanges retained per user (each exchange is two turns)
    #[serde(default = "default_max_history")]
    pub max_history: usize,

    /// Inactivity after which a user is evicted
    #[serde(default = "default_idle_ttl_secs")]
    pub idle_ttl_secs: u64,

    /// Sweeper period
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,

    /// How long the sweeper waits for a busy user before skipping it
    #[serde(default = "default_sweep_lock_timeout_ms")]
    pub sweep_lock_timeout_ms: u64,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            max_history: default_max_history(),
            idle_ttl_secs: default_idle_ttl_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
            sweep_lock_timeout_ms: default_sweep_lock_timeout_ms(),
        }
    }
}

// ============================================================================
// Server
// ============================================================================

/// Liveness server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

// ============================================================================
// Observability
// ============================================================================

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level", alias = "level")]
    pub log_level: String,

    /// Log format (json, pretty)
    #[serde(default = "default_log_format", alias = "format")]
    pub log_format: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_format: default_log_format(),
        }
    }
}

// ============================================================================
// Defaults
// ============================================================================

fn default_status_text() -> String {
    "help/@inxainee".into()
}
fn default_initial_backoff_secs() -> u64 {
    2
}
fn default_max_backoff_secs() -> u64 {
    60
}
fn default_model() -> String {
    "gemini-2.0-flash".into()
}
fn default_model_base_url() -> String {
    "https://generativelanguage.googleapis.com".into()
}
fn default_temperature() -> f64 {
    0.7
}
fn default_max_output_tokens() -> i64 {
    1024
}
fn default_model_timeout_secs() -> u64 {
    60
}
fn default_system_prompt() -> String {
    "You are Kanade, a calm and quiet helper in a Discord server. \
     Answer briefly and kindly, keep replies under a few paragraphs, \
     and describe any images you are shown when they are relevant."
        .into()
}
fn default_acknowledgment() -> String {
    "Understood.".into()
}
fn default_greeting() -> String {
    "Hey".into()
}
fn default_max_history() -> usize {
    20
}
fn default_idle_ttl_secs() -> u64 {
    30 * 24 * 60 * 60
}
fn default_sweep_interval_secs() -> u64 {
    60 * 60
}
fn default_sweep_lock_timeout_ms() -> u64 {
    5_000
}
fn default_host() -> String {
    "0.0.0.0".into()
}
fn default_port() -> u16 {
    8080
}
fn default_log_level() -> String {
    "info".into()
}
fn default_log_format() -> String {
    "pretty".into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = BotConfig::default();
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.memory.max_history, 20);
        assert_eq!(config.memory.idle_ttl_secs, 2_592_000);
        assert_eq!(config.memory.sweep_interval_secs, 3600);
        assert_eq!(config.persona.greeting, "Hey");
        assert!(config.discord.bot_token.is_none());
    }

    #[test]
    fn test_missing_token_is_fatal() {
        let config = BotConfig::default();
        let err = config.validate().unwrap_err();
        assert!(err.is_config());
    }

    #[test]
    fn test_blank_token_is_fatal() {
        let mut config = BotConfig::default();
        config.discord.bot_token = Some("   ".into());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_missing_model_key_is_not_fatal() {
        let mut config = BotConfig::default();
        config.apply_overrides(lookup(&[("DISCORD_BOT_TOKEN", "abc")]));
        assert!(config.validate().is_ok());
        assert!(config.model.api_key.is_none());
    }

    #[test]
    fn test_env_overrides() {
        let mut config = BotConfig::default();
        let ignored = config.apply_overrides(lookup(&[
            ("DISCORD_BOT_TOKEN", "token"),
            ("GOOGLE_API_KEY", "google"),
            ("PORT", "9090"),
            ("KANADE_LOG_FORMAT", "json"),
        ]));
        assert!(ignored.is_empty());
        assert_eq!(config.discord.token(), Some("token"));
        assert_eq!(config.model.api_key.as_deref(), Some("google"));
        assert_eq!(config.server.port, 9090);
        assert_eq!(config.observability.log_format, "json");
    }

    #[test]
    fn test_gemini_key_wins_over_google_key() {
        let mut config = BotConfig::default();
        config.apply_overrides(lookup(&[
            ("GEMINI_API_KEY", "gemini"),
            ("GOOGLE_API_KEY", "google"),
        ]));
        assert_eq!(config.model.api_key.as_deref(), Some("gemini"));
    }

    #[test]
    fn test_invalid_port_keeps_default() {
        let mut config = BotConfig::default();
        let ignored = config.apply_overrides(lookup(&[("PORT", "not-a-port")]));
        assert_eq!(config.server.port, 8080);
        assert_eq!(ignored, ["PORT"]);
    }

    #[test]
    fn test_debug_redacts_secrets() {
        let mut config = BotConfig::default();
        config.discord.bot_token = Some("super-secret-token".into());
        config.model.api_key = Some("super-secret-key".into());
        let rendered = format!("{config:?}");
        assert!(!rendered.contains("super-secret"));
        assert!(rendered.contains("***"));
    }

    #[test]
    fn test_load_from_partial_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{ "memory": {{ "max_history": 5 }}, "server": {{ "port": 3000 }} }}"#
        )
        .unwrap();

        let config = BotConfig::load_from(file.path()).unwrap();
        assert_eq!(config.memory.max_history, 5);
        assert_eq!(config.memory.sweep_interval_secs, 3600);
        assert_eq!(config.server.port, 3000);
        assert_eq!(config.server.host, "0.0.0.0");
    }

    #[test]
    fn test_load_from_invalid_json() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "not json").unwrap();
        assert!(BotConfig::load_from(file.path()).is_err());
    }
}
