//! Process configuration: a RON file with per-field environment overrides.
//!
//! The file is optional. Every field has a default, so a missing file plus
//! `BOT_TOKEN` in the environment is a complete configuration.
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use engine_logging::LogSettings;
use harvester_engine::{
    ChromiumSettings, DeliverySettings, FetchSettings, HarvestSettings, RateLimiter,
    RenderSettings, SchedulerSettings, TelegramSettings, DEFAULT_API_BASE,
};
use serde::Deserialize;

use crate::listener::ListenerSettings;

pub const DEFAULT_CONFIG_FILE: &str = "harvester.ron";
pub const CONFIG_PATH_ENV: &str = "HARVESTER_CONFIG";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("could not read {path:?}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("could not parse {path:?}: {source}")]
    Parse {
        path: PathBuf,
        source: ron::error::SpannedError,
    },
    #[error("environment variable {key} has unusable value {value:?}")]
    Env { key: &'static str, value: String },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct BotConfig {
    pub token: String,
    pub api_base: String,
    /// Long-poll wait handed to `getUpdates`.
    pub poll_timeout_secs: u64,
}

impl Default for BotConfig {
    fn default() -> Self {
        Self {
            token: String::new(),
            api_base: DEFAULT_API_BASE.to_string(),
            poll_timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub db_path: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("./harvester.db"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct CrawlerConfig {
    /// Runs the timer loop. Manual `/crawl` works either way.
    pub enabled: bool,
    pub base_url: String,
    pub initial_delay_secs: u64,
    pub interval_secs: u64,
    pub initial_pages: u32,
    /// Requests per second against the harvested site.
    pub rate_limit: f64,
    pub timeout_secs: u64,
    pub max_retries: u32,
    pub user_agent: Option<String>,
    pub proxy_url: Option<String>,
    pub headless: bool,
    pub page_pacing_ms: u64,
}

impl Default for CrawlerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            base_url: HarvestSettings::default().base_url,
            initial_delay_secs: 5,
            interval_secs: 15 * 60,
            initial_pages: 2,
            rate_limit: 0.5,
            timeout_secs: 30,
            max_retries: 3,
            user_agent: None,
            proxy_url: None,
            headless: true,
            page_pacing_ms: 2000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct DeliveryConfig {
    /// Messages per second across all destinations.
    pub send_rate: f64,
    pub destination_pacing_ms: u64,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            send_rate: 30.0,
            destination_pacing_ms: 1000,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct Config {
    pub bot: BotConfig,
    pub store: StoreConfig,
    pub crawler: CrawlerConfig,
    pub delivery: DeliveryConfig,
    pub logging: LogSettings,
}

/// Load from `HARVESTER_CONFIG` (or `./harvester.ron`), apply environment
/// overrides, then validate.
pub fn load() -> Result<Config, ConfigError> {
    let path = std::env::var_os(CONFIG_PATH_ENV)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));
    let mut config = Config::from_file(&path)?;
    config.apply_env(|key| std::env::var(key).ok())?;
    config.validate()?;
    Ok(config)
}

fn parse_env<T: FromStr>(key: &'static str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::Env {
        key,
        value: value.to_string(),
    })
}

fn parse_bool(key: &'static str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::Env {
            key,
            value: value.to_string(),
        }),
    }
}

fn non_empty(value: String) -> Option<String> {
    let trimmed = value.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

fn positive_rate(name: &str, rate: f64) -> Result<(), ConfigError> {
    RateLimiter::new(rate)
        .map(|_| ())
        .map_err(|err| ConfigError::Invalid(format!("{name}: {err}")))
}

impl Config {
    /// Parse `path`; a file that does not exist yields the defaults.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = match fs::read_to_string(path) {
            Ok(text) => text,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Ok(Self::default());
            }
            Err(source) => {
                return Err(ConfigError::Read {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };
        Self::from_ron(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn from_ron(text: &str) -> Result<Self, ron::error::SpannedError> {
        ron::from_str(text)
    }

    /// Override fields from the environment. `lookup` returns the raw value
    /// of a variable, `None` when unset.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(token) = lookup("BOT_TOKEN") {
            self.bot.token = token.trim().to_string();
        }
        if let Some(path) = lookup("HARVESTER_DB_PATH").and_then(non_empty) {
            self.store.db_path = PathBuf::from(path);
        }
        if let Some(value) = lookup("CRAWLER_ENABLED") {
            self.crawler.enabled = parse_bool("CRAWLER_ENABLED", &value)?;
        }
        if let Some(value) = lookup("CRAWLER_INTERVAL_SECS") {
            self.crawler.interval_secs = parse_env("CRAWLER_INTERVAL_SECS", &value)?;
        }
        if let Some(value) = lookup("CRAWLER_INITIAL_PAGES") {
            self.crawler.initial_pages = parse_env("CRAWLER_INITIAL_PAGES", &value)?;
        }
        if let Some(value) = lookup("CRAWLER_RATE_LIMIT") {
            self.crawler.rate_limit = parse_env("CRAWLER_RATE_LIMIT", &value)?;
        }
        if let Some(value) = lookup("CRAWLER_MAX_RETRIES") {
            self.crawler.max_retries = parse_env("CRAWLER_MAX_RETRIES", &value)?;
        }
        if let Some(value) = lookup("CRAWLER_PROXY_URL") {
            self.crawler.proxy_url = non_empty(value);
        }
        if let Some(value) = lookup("CRAWLER_USER_AGENT") {
            self.crawler.user_agent = non_empty(value);
        }
        if let Some(value) = lookup("CRAWLER_BASE_URL").and_then(non_empty) {
            self.crawler.base_url = value;
        }
        if let Some(level) = lookup("LOG_LEVEL").and_then(non_empty) {
            self.logging.level = level;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.bot.token.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "bot token is required (set BOT_TOKEN)".to_string(),
            ));
        }
        positive_rate("crawler.rate_limit", self.crawler.rate_limit)?;
        positive_rate("delivery.send_rate", self.delivery.send_rate)?;
        if self.crawler.interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "crawler.interval_secs must be at least 1".to_string(),
            ));
        }
        if self.crawler.initial_pages == 0 {
            return Err(ConfigError::Invalid(
                "crawler.initial_pages must be at least 1".to_string(),
            ));
        }
        if harvester_core::host_of(&self.crawler.base_url).is_none() {
            return Err(ConfigError::Invalid(format!(
                "crawler.base_url {:?} is not an absolute URL",
                self.crawler.base_url
            )));
        }
        Ok(())
    }

    fn base_url(&self) -> String {
        self.crawler.base_url.trim_end_matches('/').to_string()
    }

    fn user_agent(&self) -> Option<String> {
        self.crawler.user_agent.clone()
    }

    pub fn fetch_settings(&self) -> FetchSettings {
        let defaults = FetchSettings::default();
        FetchSettings {
            request_timeout: Duration::from_secs(self.crawler.timeout_secs),
            user_agent: self.user_agent().unwrap_or(defaults.user_agent.clone()),
            referer: Some(format!("{}/", self.base_url())),
            proxy_url: self.crawler.proxy_url.clone(),
            ..defaults
        }
    }

    pub fn harvest_settings(&self) -> HarvestSettings {
        HarvestSettings {
            base_url: self.base_url(),
            max_retries: self.crawler.max_retries,
            page_pacing: Duration::from_millis(self.crawler.page_pacing_ms),
            ..HarvestSettings::default()
        }
    }

    pub fn render_settings(&self) -> RenderSettings {
        let defaults = RenderSettings::default();
        RenderSettings {
            user_agent: self.user_agent().unwrap_or(defaults.user_agent.clone()),
            ..defaults
        }
    }

    pub fn chromium_settings(&self) -> ChromiumSettings {
        ChromiumSettings {
            headless: self.crawler.headless,
            proxy_url: self.crawler.proxy_url.clone(),
            request_timeout: Duration::from_secs(self.crawler.timeout_secs),
        }
    }

    pub fn scheduler_settings(&self) -> SchedulerSettings {
        SchedulerSettings {
            initial_delay: Duration::from_secs(self.crawler.initial_delay_secs),
            interval: Duration::from_secs(self.crawler.interval_secs),
            pages: self.crawler.initial_pages,
        }
    }

    pub fn delivery_settings(&self) -> DeliverySettings {
        DeliverySettings {
            destination_pacing: Duration::from_millis(self.delivery.destination_pacing_ms),
        }
    }

    pub fn telegram_settings(&self) -> TelegramSettings {
        TelegramSettings {
            api_base: self.bot.api_base.clone(),
            ..TelegramSettings::new(self.bot.token.clone())
        }
    }

    pub fn listener_settings(&self) -> ListenerSettings {
        ListenerSettings {
            poll_timeout_secs: self.bot.poll_timeout_secs,
            ..ListenerSettings::default()
        }
    }
}
