use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::models::Profile;
use crate::retry::RetryPolicy;

pub const DEFAULT_CONFIG_PATH: &str = "config/scout.toml";
pub const DEFAULT_PROFILE_PATH: &str = "config/user_profile.json";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {reason}")]
    Parse { path: PathBuf, reason: String },

    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error("{0} environment variable not set")]
    MissingCredential(&'static str),
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct ScraperConfig {
    pub base_url: String,
    pub max_pages: u32,
    pub delay_seconds: f64,
    pub timeout_seconds: u64,
    pub user_agents: Vec<String>,
}

impl Default for ScraperConfig {
    fn default() -> Self {
        Self {
            base_url: "https://wellfound.com/jobs".to_string(),
            max_pages: 1,
            delay_seconds: 3.0,
            timeout_seconds: 15,
            user_agents: vec![
                "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36".to_string(),
                "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36".to_string(),
            ],
        }
    }
}

impl ScraperConfig {
    /// Pause between page requests.
    pub fn delay(&self) -> Result<Duration, ConfigError> {
        Duration::try_from_secs_f64(self.delay_seconds).map_err(|_| {
            ConfigError::Invalid(format!(
                "scraper.delay_seconds must be a non-negative number of seconds, got {}",
                self.delay_seconds
            ))
        })
    }
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Falls back to the platform data directory when unset.
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct NotificationConfig {
    pub enabled: bool,
    pub batch_size: usize,
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            batch_size: 5,
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct CoverLetterConfig {
    pub enabled: bool,
    pub model: String,
}

impl Default for CoverLetterConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            model: "gpt-4o-mini".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct RetryConfig {
    pub fetch_attempts: u32,
    pub notify_attempts: u32,
    pub backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            fetch_attempts: 3,
            notify_attempts: 3,
            backoff_ms: 1000,
            max_backoff_ms: 30_000,
        }
    }
}

impl RetryConfig {
    pub fn fetch_policy(&self) -> RetryPolicy {
        self.policy(self.fetch_attempts)
    }

    pub fn notify_policy(&self) -> RetryPolicy {
        self.policy(self.notify_attempts)
    }

    fn policy(&self, attempts: u32) -> RetryPolicy {
        RetryPolicy::new(
            attempts,
            Duration::from_millis(self.backoff_ms),
            Duration::from_millis(self.max_backoff_ms),
        )
    }
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(default)]
pub struct AppConfig {
    pub scraper: ScraperConfig,
    pub database: DatabaseConfig,
    pub notifications: NotificationConfig,
    pub cover_letter: CoverLetterConfig,
    pub retry: RetryConfig,
}

impl AppConfig {
    /// Missing file means defaults; a file that exists must parse.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            tracing::info!(path = %path.display(), "no config file, using defaults");
            return Ok(Self::default());
        }
        let content = read(path)?;
        let config: AppConfig = toml::from_str(&content).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.scraper.max_pages == 0 {
            return Err(ConfigError::Invalid("scraper.max_pages must be positive".into()));
        }
        self.scraper.delay()?;
        if self.notifications.batch_size == 0 {
            return Err(ConfigError::Invalid("notifications.batch_size must be positive".into()));
        }
        Ok(())
    }

    pub fn page_delay(&self) -> Result<Duration, ConfigError> {
        self.scraper.delay()
    }
}

/// Loads the user profile. JSON unless the file ends in `.toml`.
pub fn load_profile(path: &Path) -> Result<Profile, ConfigError> {
    let content = read(path)?;
    let ext = path
        .extension()
        .and_then(|s| s.to_str())
        .unwrap_or_default()
        .to_ascii_lowercase();
    parse_profile(&content, &ext).map_err(|reason| ConfigError::Parse {
        path: path.to_path_buf(),
        reason,
    })
}

#[derive(Deserialize)]
struct RawProfile {
    #[serde(default)]
    skills: Vec<String>,
    #[serde(default)]
    keywords: Vec<String>,
    #[serde(default)]
    locations: Vec<String>,
    min_match_score: Option<i64>,
}

fn parse_profile(content: &str, ext: &str) -> Result<Profile, String> {
    let raw: RawProfile = if ext == "toml" {
        toml::from_str(content).map_err(|e| e.to_string())?
    } else {
        serde_json::from_str(content).map_err(|e| e.to_string())?
    };

    let min_match_score = match raw.min_match_score {
        None => Profile::default_min_match_score(),
        Some(n) if (0..=100).contains(&n) => n as u8,
        Some(n) => return Err(format!("min_match_score must be within 0..=100, got {}", n)),
    };

    Ok(Profile {
        skills: raw.skills,
        keywords: raw.keywords,
        locations: raw.locations,
        min_match_score,
    }
    .normalized())
}

fn read(path: &Path) -> Result<String, ConfigError> {
    fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })
}

pub struct TelegramCredentials {
    pub bot_token: String,
    pub chat_id: String,
}

impl TelegramCredentials {
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            bot_token: env_var("TELEGRAM_BOT_TOKEN")?,
            chat_id: env_var("TELEGRAM_CHAT_ID")?,
        })
    }
}

pub fn env_var(name: &'static str) -> Result<String, ConfigError> {
    std::env::var(name)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .ok_or(ConfigError::MissingCredential(name))
}
