use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("missing required env var: {0}")]
    MissingEnv(String),
    #[error("invalid config value for {key}: {reason}")]
    Invalid { key: String, reason: String },
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub target: TargetConfig,
    #[serde(default)]
    pub telegram: TelegramConfig,
    #[serde(default)]
    pub polling: PollingConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TargetConfig {
    /// Event page to watch - env EVENT_URL
    #[serde(default)]
    pub event_url: String,
    /// Visited once per new capability to pick up site cookies.
    #[serde(default = "default_site_url")]
    pub site_url: String,
    #[serde(default = "default_fetch_timeout")]
    pub fetch_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TelegramConfig {
    /// Bot token - loaded from env TELEGRAM_BOT_TOKEN only
    #[serde(default, skip_deserializing)]
    pub bot_token: String,
    /// Recipient chat ids - env CHAT_ID (comma-separated)
    #[serde(default)]
    pub chat_ids: Vec<String>,
    #[serde(default = "default_api_base")]
    pub api_base: String,
    #[serde(default = "default_send_timeout")]
    pub send_timeout_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Retry n waits `retry_backoff_secs * n`.
    #[serde(default = "default_retry_backoff")]
    pub retry_backoff_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PollingConfig {
    #[serde(default = "default_sleep_min")]
    pub sleep_min_secs: u64,
    #[serde(default = "default_sleep_max")]
    pub sleep_max_secs: u64,
    #[serde(default = "default_penalty_min")]
    pub penalty_min_secs: u64,
    #[serde(default = "default_penalty_max")]
    pub penalty_max_secs: u64,
    #[serde(default = "default_heartbeat_minutes")]
    pub heartbeat_interval_minutes: u64,
    /// Cycles served by one capability before it is replaced.
    #[serde(default = "default_restart_interval")]
    pub restart_interval: u64,
    #[serde(default = "default_rate_limit_threshold")]
    pub rate_limit_restart_threshold: u64,
    #[serde(default = "default_rate_limit_pause")]
    pub rate_limit_pause_secs: u64,
    #[serde(default = "default_resend_hours")]
    pub resend_interval_hours: u64,
    /// Occasionally inject a fake offer to exercise alerts.
    #[serde(default)]
    pub test_mode: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_session_file")]
    pub session_file: PathBuf,
    #[serde(default = "default_snapshot_dir")]
    pub snapshot_dir: PathBuf,
    #[serde(default = "default_snapshot_max_bytes")]
    pub snapshot_max_bytes: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub json: bool,
}

fn default_site_url() -> String {
    "https://www.twickets.live".to_string()
}
fn default_fetch_timeout() -> u64 {
    30
}
fn default_api_base() -> String {
    crate::notify::telegram::DEFAULT_API_BASE.to_string()
}
fn default_send_timeout() -> u64 {
    5
}
fn default_max_retries() -> u32 {
    3
}
fn default_retry_backoff() -> u64 {
    5
}
fn default_sleep_min() -> u64 {
    30
}
fn default_sleep_max() -> u64 {
    60
}
fn default_penalty_min() -> u64 {
    10
}
fn default_penalty_max() -> u64 {
    30
}
fn default_heartbeat_minutes() -> u64 {
    60
}
fn default_restart_interval() -> u64 {
    200
}
fn default_rate_limit_threshold() -> u64 {
    3
}
fn default_rate_limit_pause() -> u64 {
    300
}
fn default_resend_hours() -> u64 {
    4
}
fn default_session_file() -> PathBuf {
    PathBuf::from("./app/data/session.json")
}
fn default_snapshot_dir() -> PathBuf {
    PathBuf::from("./app/logs")
}
fn default_snapshot_max_bytes() -> usize {
    crate::diagnostics::DEFAULT_SNAPSHOT_MAX_BYTES
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for TelegramConfig {
    fn default() -> Self {
        Self {
            bot_token: String::new(),
            chat_ids: Vec::new(),
            api_base: default_api_base(),
            send_timeout_secs: default_send_timeout(),
            max_retries: default_max_retries(),
            retry_backoff_secs: default_retry_backoff(),
        }
    }
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            sleep_min_secs: default_sleep_min(),
            sleep_max_secs: default_sleep_max(),
            penalty_min_secs: default_penalty_min(),
            penalty_max_secs: default_penalty_max(),
            heartbeat_interval_minutes: default_heartbeat_minutes(),
            restart_interval: default_restart_interval(),
            rate_limit_restart_threshold: default_rate_limit_threshold(),
            rate_limit_pause_secs: default_rate_limit_pause(),
            resend_interval_hours: default_resend_hours(),
            test_mode: false,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            session_file: default_session_file(),
            snapshot_dir: default_snapshot_dir(),
            snapshot_max_bytes: default_snapshot_max_bytes(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

impl Config {
    /// Load config from a TOML file, then overlay environment variables for secrets.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&contents)?;

        // Secrets never live in the config file
        if let Ok(token) = std::env::var("TELEGRAM_BOT_TOKEN") {
            config.telegram.bot_token = token;
        }
        config.telegram.chat_ids = normalize_chat_ids(&config.telegram.chat_ids);

        Ok(config)
    }

    /// Build config from environment variables alone.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build config from any key lookup (the process env in production).
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let chat_ids: Vec<String> = var("CHAT_ID")
            .map(|raw| raw.split(',').map(str::to_string).collect())
            .unwrap_or_default();

        Ok(Config {
            target: TargetConfig {
                event_url: var("EVENT_URL").unwrap_or_default(),
                site_url: var("SITE_URL").unwrap_or_else(default_site_url),
                fetch_timeout_secs: parse_or(&var, "FETCH_TIMEOUT_SECONDS", default_fetch_timeout())?,
            },
            telegram: TelegramConfig {
                bot_token: var("TELEGRAM_BOT_TOKEN").unwrap_or_default(),
                chat_ids: normalize_chat_ids(&chat_ids),
                api_base: var("TELEGRAM_API_BASE").unwrap_or_else(default_api_base),
                send_timeout_secs: default_send_timeout(),
                max_retries: parse_or(&var, "MAX_RETRIES", default_max_retries())?,
                retry_backoff_secs: default_retry_backoff(),
            },
            polling: PollingConfig {
                sleep_min_secs: parse_or(&var, "SLEEP_MIN", default_sleep_min())?,
                sleep_max_secs: parse_or(&var, "SLEEP_MAX", default_sleep_max())?,
                penalty_min_secs: default_penalty_min(),
                penalty_max_secs: default_penalty_max(),
                heartbeat_interval_minutes: parse_or(
                    &var,
                    "HEARTBEAT_INTERVAL_MINUTES",
                    default_heartbeat_minutes(),
                )?,
                restart_interval: parse_or(&var, "DRIVER_RESTART_INTERVAL", default_restart_interval())?,
                rate_limit_restart_threshold: parse_or(
                    &var,
                    "RATE_LIMIT_RESTART_THRESHOLD",
                    default_rate_limit_threshold(),
                )?,
                rate_limit_pause_secs: parse_or(&var, "RATE_LIMIT_PAUSE_SECONDS", default_rate_limit_pause())?,
                resend_interval_hours: parse_or(&var, "RESEND_INTERVAL_HOURS", default_resend_hours())?,
                test_mode: var("TEST_MODE")
                    .map(|v| v.trim().eq_ignore_ascii_case("true"))
                    .unwrap_or(false),
            },
            storage: StorageConfig {
                session_file: var("SESSION_FILE")
                    .map(PathBuf::from)
                    .unwrap_or_else(default_session_file),
                snapshot_dir: var("SNAPSHOT_DIR")
                    .map(PathBuf::from)
                    .unwrap_or_else(default_snapshot_dir),
                snapshot_max_bytes: default_snapshot_max_bytes(),
            },
            logging: LoggingConfig {
                level: var("LOG_LEVEL").unwrap_or_else(default_log_level),
                json: var("LOG_JSON")
                    .map(|v| v.trim().eq_ignore_ascii_case("true"))
                    .unwrap_or(false),
            },
        })
    }

    /// Reject configs the poller cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.telegram.bot_token.is_empty() {
            return Err(ConfigError::MissingEnv("TELEGRAM_BOT_TOKEN".to_string()));
        }
        if self.telegram.chat_ids.is_empty() {
            return Err(ConfigError::MissingEnv("CHAT_ID".to_string()));
        }
        if self.target.event_url.is_empty() {
            return Err(ConfigError::MissingEnv("EVENT_URL".to_string()));
        }
        let p = &self.polling;
        if p.sleep_min_secs > p.sleep_max_secs {
            return Err(invalid("SLEEP_MIN", "must not exceed SLEEP_MAX"));
        }
        if p.penalty_min_secs > p.penalty_max_secs {
            return Err(invalid("penalty_min_secs", "must not exceed penalty_max_secs"));
        }
        for (key, value) in [
            ("HEARTBEAT_INTERVAL_MINUTES", p.heartbeat_interval_minutes),
            ("DRIVER_RESTART_INTERVAL", p.restart_interval),
            ("RATE_LIMIT_RESTART_THRESHOLD", p.rate_limit_restart_threshold),
            ("RESEND_INTERVAL_HOURS", p.resend_interval_hours),
            ("FETCH_TIMEOUT_SECONDS", self.target.fetch_timeout_secs),
        ] {
            if value == 0 {
                return Err(invalid(key, "must be greater than zero"));
            }
        }
        Ok(())
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.target.fetch_timeout_secs)
    }
}

fn invalid(key: &str, reason: &str) -> ConfigError {
    ConfigError::Invalid {
        key: key.to_string(),
        reason: reason.to_string(),
    }
}

fn parse_or<T, F>(var: &F, key: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    match var(key) {
        None => Ok(default),
        Some(raw) => raw.trim().parse().map_err(|e: T::Err| invalid(key, &e.to_string())),
    }
}

/// Trim, drop blanks, and drop duplicates keeping first occurrence.
fn normalize_chat_ids(raw: &[String]) -> Vec<String> {
    let mut ids: Vec<String> = Vec::new();
    for id in raw.iter().map(|s| s.trim()).filter(|s| !s.is_empty()) {
        if !ids.iter().any(|existing| existing == id) {
            ids.push(id.to_string());
        }
    }
    ids
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
    fn test_env_defaults() {
        let config = Config::from_lookup(lookup(&[
            ("TELEGRAM_BOT_TOKEN", "t"),
            ("CHAT_ID", "1, 2,,1"),
            ("EVENT_URL", "https://example.test/event/1"),
        ]))
        .unwrap();

        assert_eq!(config.telegram.chat_ids, vec!["1", "2"]);
        assert_eq!(config.polling.sleep_min_secs, 30);
        assert_eq!(config.polling.sleep_max_secs, 60);
        assert_eq!(config.polling.restart_interval, 200);
        assert_eq!(config.polling.resend_interval_hours, 4);
        assert_eq!(config.telegram.max_retries, 3);
        assert!(!config.polling.test_mode);
        config.validate().unwrap();
    }

    #[test]
    fn test_env_overrides() {
        let config = Config::from_lookup(lookup(&[
            ("SLEEP_MIN", "5"),
            ("SLEEP_MAX", " 9 "),
            ("RATE_LIMIT_PAUSE_SECONDS", "120"),
            ("TEST_MODE", "TRUE"),
        ]))
        .unwrap();
        assert_eq!(config.polling.sleep_min_secs, 5);
        assert_eq!(config.polling.sleep_max_secs, 9);
        assert_eq!(config.polling.rate_limit_pause_secs, 120);
        assert!(config.polling.test_mode);
    }

    #[test]
    fn test_unparsable_number_is_rejected() {
        let err = Config::from_lookup(lookup(&[("SLEEP_MIN", "soon")])).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { ref key, .. } if key == "SLEEP_MIN"));
    }

    #[test]
    fn test_validate_reports_missing_vars() {
        let config = Config::from_lookup(lookup(&[("CHAT_ID", "1")])).unwrap();
        assert!(matches!(config.validate(), Err(ConfigError::MissingEnv(ref v)) if v == "TELEGRAM_BOT_TOKEN"));

        let config = Config::from_lookup(lookup(&[("TELEGRAM_BOT_TOKEN", "t"), ("CHAT_ID", "1")])).unwrap();
        assert!(matches!(config.validate(), Err(ConfigError::MissingEnv(ref v)) if v == "EVENT_URL"));
    }

    #[test]
    fn test_validate_rejects_inverted_sleep_window() {
        let config = Config::from_lookup(lookup(&[
            ("TELEGRAM_BOT_TOKEN", "t"),
            ("CHAT_ID", "1"),
            ("EVENT_URL", "https://example.test"),
            ("SLEEP_MIN", "90"),
            ("SLEEP_MAX", "60"),
        ]))
        .unwrap();
        assert!(matches!(config.validate(), Err(ConfigError::Invalid { .. })));
    }

    #[test]
    fn test_toml_with_defaults() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("ticketwatch.toml");
        std::fs::write(
            &path,
            r#"
[target]
event_url = "https://example.test/event/9"

[telegram]
chat_ids = ["100", " 200 "]
max_retries = 5

[polling]
sleep_min_secs = 10
sleep_max_secs = 20
"#,
        )
        .unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.target.event_url, "https://example.test/event/9");
        assert_eq!(config.target.fetch_timeout_secs, 30);
        assert_eq!(config.telegram.chat_ids, vec!["100", "200"]);
        assert_eq!(config.telegram.max_retries, 5);
        assert_eq!(config.polling.sleep_max_secs, 20);
        assert_eq!(config.polling.heartbeat_interval_minutes, 60);
        assert_eq!(config.logging.level, "info");
    }
}
