//! Relay Configuration
//!
//! TOML configuration loading with environment variable overrides for credentials

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};

pub const ENV_TELEGRAM_TOKEN: &str = "TELEGRAM_TOKEN";
pub const ENV_OPENAI_API_KEY: &str = "OPENAI_API_KEY";
pub const ENV_OPENAI_MODEL: &str = "OPENAI_MODEL";
pub const ENV_SEARCH_API_KEY: &str = "GOOGLE_CSE_API_KEY";
pub const ENV_SEARCH_CX: &str = "GOOGLE_CSE_CX";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required credential {field} (set it in the config file or via {env})")]
    MissingCredential {
        field: &'static str,
        env: &'static str,
    },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub core: CoreConfig,
    #[serde(default)]
    pub telegram: TelegramConfig,
    #[serde(default)]
    pub openai: OpenAIConfig,
    #[serde(default)]
    pub history: HistoryConfig,
    #[serde(default)]
    pub search: SearchConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CoreConfig {
    pub data_dir: Option<String>,
    pub log_level: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelegramConfig {
    #[serde(default)]
    pub bot_token: String,
    /// Bot handle, with or without the leading `@`.
    #[serde(default)]
    pub bot_name: Option<String>,
    /// The single group chat the bot answers in.
    #[serde(default)]
    pub group_chat_id: Option<i64>,
    /// Elevated principals.
    #[serde(default)]
    pub admins: Vec<i64>,
    #[serde(default = "default_poll_timeout_secs")]
    pub poll_timeout_secs: u64,
    #[serde(default = "default_client_recreate_interval_secs")]
    pub client_recreate_interval_secs: u64,
}

impl Default for TelegramConfig {
    fn default() -> Self {
        Self {
            bot_token: String::new(),
            bot_name: None,
            group_chat_id: None,
            admins: Vec::new(),
            poll_timeout_secs: default_poll_timeout_secs(),
            client_recreate_interval_secs: default_client_recreate_interval_secs(),
        }
    }
}

impl TelegramConfig {
    /// Lowercased handle without the leading `@`.
    pub fn bot_username(&self) -> Option<String> {
        self.bot_name
            .as_deref()
            .map(str::trim)
            .map(|value| value.trim_start_matches('@').to_lowercase())
            .filter(|value| !value.is_empty())
    }

    pub fn admin_set(&self) -> HashSet<i64> {
        self.admins.iter().copied().collect()
    }

    /// Numeric bot id taken from the token prefix, used to scope runtime files.
    pub fn account_tag(&self) -> String {
        telegram_account_tag(&self.bot_token)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenAIConfig {
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_openai_base_url")]
    pub base_url: String,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_transcription_model")]
    pub transcription_model: String,
    #[serde(default = "default_billing_url")]
    pub billing_url: String,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_billing_timeout_secs")]
    pub billing_timeout_secs: u64,
    #[serde(default)]
    pub retry: RetryPolicyConfig,
}

impl Default for OpenAIConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            base_url: default_openai_base_url(),
            model: default_model(),
            transcription_model: default_transcription_model(),
            billing_url: default_billing_url(),
            request_timeout_secs: default_request_timeout_secs(),
            billing_timeout_secs: default_billing_timeout_secs(),
            retry: RetryPolicyConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicyConfig {
    #[serde(default = "default_retry_window_secs")]
    pub window_secs: u64,
    #[serde(default = "default_retry_initial_delay_secs")]
    pub initial_delay_secs: u64,
    #[serde(default = "default_retry_backoff_factor")]
    pub backoff_factor: u32,
    #[serde(default = "default_retry_max_delay_secs")]
    pub max_delay_secs: u64,
}

impl Default for RetryPolicyConfig {
    fn default() -> Self {
        Self {
            window_secs: default_retry_window_secs(),
            initial_delay_secs: default_retry_initial_delay_secs(),
            backoff_factor: default_retry_backoff_factor(),
            max_delay_secs: default_retry_max_delay_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryConfig {
    #[serde(default = "default_history_capacity")]
    pub capacity: usize,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            capacity: default_history_capacity(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TriggerStrategy {
    #[default]
    Model,
    Keywords,
}

impl TriggerStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerStrategy::Model => "model",
            TriggerStrategy::Keywords => "keywords",
        }
    }
}

impl std::str::FromStr for TriggerStrategy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "model" => Ok(TriggerStrategy::Model),
            "keywords" => Ok(TriggerStrategy::Keywords),
            other => Err(ConfigError::Invalid(format!(
                "search.trigger must be \"model\" or \"keywords\", got \"{}\"",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchConfig {
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub cx: Option<String>,
    #[serde(default = "default_search_endpoint")]
    pub endpoint: String,
    #[serde(default = "default_num_results")]
    pub num_results: u8,
    /// Language restriction of the first cascade step (`lr` parameter).
    #[serde(default = "default_search_language")]
    pub language: Option<String>,
    #[serde(default = "default_interface_language")]
    pub interface_language: String,
    /// Recency restriction of the first two cascade steps (`dateRestrict` parameter).
    #[serde(default = "default_date_restrict")]
    pub date_restrict: Option<String>,
    #[serde(default = "default_safe")]
    pub safe: String,
    #[serde(default = "default_search_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_deny_domains")]
    pub deny_domains: Vec<String>,
    /// `model` or `keywords`; see [`SearchConfig::trigger_strategy`].
    #[serde(default = "default_trigger")]
    pub trigger: String,
    #[serde(default = "default_trigger_keywords")]
    pub keywords: Vec<String>,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            cx: None,
            endpoint: default_search_endpoint(),
            num_results: default_num_results(),
            language: default_search_language(),
            interface_language: default_interface_language(),
            date_restrict: default_date_restrict(),
            safe: default_safe(),
            timeout_secs: default_search_timeout_secs(),
            deny_domains: default_deny_domains(),
            trigger: default_trigger(),
            keywords: default_trigger_keywords(),
        }
    }
}

impl SearchConfig {
    /// Both the key and the engine id are present.
    pub fn is_enabled(&self) -> bool {
        non_empty(self.api_key.as_deref()).is_some() && non_empty(self.cx.as_deref()).is_some()
    }

    pub fn trigger_strategy(&self) -> Result<TriggerStrategy, ConfigError> {
        self.trigger.parse()
    }
}

pub fn telegram_account_tag(bot_token: &str) -> String {
    let token = bot_token.trim();
    token.split(':').next().unwrap_or(token).trim().to_string()
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

fn default_poll_timeout_secs() -> u64 {
    60
}

fn default_client_recreate_interval_secs() -> u64 {
    60
}

fn default_openai_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_model() -> String {
    "gpt-4o".to_string()
}

fn default_transcription_model() -> String {
    "whisper-1".to_string()
}

fn default_billing_url() -> String {
    "https://api.openai.com/dashboard/billing/credit_grants".to_string()
}

fn default_request_timeout_secs() -> u64 {
    60
}

fn default_billing_timeout_secs() -> u64 {
    10
}

fn default_retry_window_secs() -> u64 {
    60
}

fn default_retry_initial_delay_secs() -> u64 {
    2
}

fn default_retry_backoff_factor() -> u32 {
    2
}

fn default_retry_max_delay_secs() -> u64 {
    10
}

fn default_history_capacity() -> usize {
    5
}

fn default_search_endpoint() -> String {
    "https://www.googleapis.com/customsearch/v1".to_string()
}

fn default_num_results() -> u8 {
    8
}

fn default_search_language() -> Option<String> {
    Some("lang_ru".to_string())
}

fn default_interface_language() -> String {
    "ru".to_string()
}

fn default_date_restrict() -> Option<String> {
    Some("m6".to_string())
}

fn default_safe() -> String {
    "active".to_string()
}

fn default_search_timeout_secs() -> u64 {
    15
}

fn default_deny_domains() -> Vec<String> {
    [
        "google.com",
        "support.google.com",
        "policies.google.com",
        "accounts.google.com",
        "blog.google",
        "chrome.google.com",
    ]
    .into_iter()
    .map(str::to_string)
    .collect()
}

fn default_trigger() -> String {
    TriggerStrategy::default().as_str().to_string()
}

fn default_trigger_keywords() -> Vec<String> {
    [
        "today",
        "latest",
        "news",
        "current",
        "price",
        "weather",
        "score",
        "сегодня",
        "новости",
        "последн",
        "курс",
        "погода",
        "цена",
    ]
    .into_iter()
    .map(str::to_string)
    .collect()
}

impl Config {
    /// Reads the TOML file, applies environment overrides and validates.
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        let mut config: Config = toml::from_str(&content)?;
        config.apply_env_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Configuration made only of defaults and environment variables.
    pub fn from_env() -> anyhow::Result<Self> {
        let mut config = Config::default();
        config.apply_env_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("relay").join("config.toml"))
    }

    pub fn apply_env_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = |key: &str| {
            lookup(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };

        if let Some(token) = env(ENV_TELEGRAM_TOKEN) {
            self.telegram.bot_token = token;
        }
        if let Some(key) = env(ENV_OPENAI_API_KEY) {
            self.openai.api_key = key;
        }
        if let Some(model) = env(ENV_OPENAI_MODEL) {
            self.openai.model = model;
        }
        if let Some(key) = env(ENV_SEARCH_API_KEY) {
            self.search.api_key = Some(key);
        }
        if let Some(cx) = env(ENV_SEARCH_CX) {
            self.search.cx = Some(cx);
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.telegram.bot_token.trim().is_empty() {
            return Err(ConfigError::MissingCredential {
                field: "telegram.bot_token",
                env: ENV_TELEGRAM_TOKEN,
            }
            .into());
        }
        if self.openai.api_key.trim().is_empty() {
            return Err(ConfigError::MissingCredential {
                field: "openai.api_key",
                env: ENV_OPENAI_API_KEY,
            }
            .into());
        }
        if self.openai.model.trim().is_empty() {
            return Err(ConfigError::Invalid("openai.model cannot be empty".to_string()).into());
        }
        if self.history.capacity == 0 {
            return Err(
                ConfigError::Invalid("history.capacity must be at least 1".to_string()).into(),
            );
        }
        if self.telegram.bot_username().is_none() {
            return Err(ConfigError::Invalid(
                "telegram.bot_name is required to recognise mentions in the group".to_string(),
            )
            .into());
        }
        if self.search.api_key.is_some() != self.search.cx.is_some() {
            return Err(ConfigError::Invalid(
                "search.api_key and search.cx must be configured together".to_string(),
            )
            .into());
        }
        if self.search.trigger_strategy()? == TriggerStrategy::Keywords
            && self.search.keywords.iter().all(|k| k.trim().is_empty())
        {
            return Err(ConfigError::Invalid(
                "search.trigger = \"keywords\" needs a non-empty search.keywords list".to_string(),
            )
            .into());
        }
        Ok(())
    }

    /// Data directory with `~` expanded; defaults to `~/.relay`.
    pub fn data_dir(&self) -> anyhow::Result<PathBuf> {
        let raw = self.core.data_dir.as_deref().unwrap_or("~/.relay");
        if raw == "~" || raw.starts_with("~/") {
            let home =
                dirs::home_dir().ok_or_else(|| anyhow::anyhow!("Cannot resolve home directory"))?;
            let rest = raw.trim_start_matches('~').trim_start_matches('/');
            return Ok(if rest.is_empty() {
                home
            } else {
                home.join(rest)
            });
        }
        Ok(PathBuf::from(raw))
    }
}
