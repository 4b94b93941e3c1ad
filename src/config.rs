use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::models::{Rule, RuleType, Severity};

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// Configuration for the streamwarden daemon
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Media servers to poll
    #[serde(default)]
    pub servers: Vec<ServerConfig>,
    #[serde(default)]
    pub poller: PollerConfig,
    #[serde(default)]
    pub lifecycle: LifecycleConfig,
    #[serde(default)]
    pub trust: TrustConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub geoip: GeoIpConfig,
    #[serde(default)]
    pub output: OutputConfig,
    /// Rules inserted on startup unless a rule with the same name exists
    #[serde(default)]
    pub rules: Vec<RuleSeed>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerKind {
    Plex,
    Jellyfin,
    Emby,
}

/// A single media server
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Stable identifier stored on every session
    pub id: String,
    pub name: String,
    pub kind: ServerKind,
    /// Base URL, e.g. "http://localhost:32400"
    pub url: String,
    /// API token (X-Plex-Token or Jellyfin/Emby API key)
    pub token: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollerConfig {
    pub poll_interval_secs: u64,
    /// A tick running longer than this is abandoned
    pub tick_timeout_secs: u64,
    /// Consecutive failed ticks before a server is reported down
    pub down_after_failures: u32,
    /// How far back stored sessions are pulled in for rule evaluation
    pub history_window_hours: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LifecycleConfig {
    /// Missed polls before an absent session is closed
    pub stale_after_missed_polls: u32,
    /// Max gap between a stop and a new session of the same media to count as a resume
    pub resume_window_secs: i64,
    /// Sessions shorter than this are flagged as short
    pub min_play_secs: i64,
    /// Fraction of total duration that counts as watched
    pub completion_ratio: f64,
}

/// Trust score penalties per severity
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrustConfig {
    pub initial_score: i64,
    pub high_penalty: i64,
    pub warning_penalty: i64,
    pub low_penalty: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    pub database_path: PathBuf,
    /// Stopped sessions and acknowledged violations older than this are pruned
    pub retention_days: i64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GeoIpConfig {
    /// Path to GeoLite2-City.mmdb; without it only private ranges are classified
    pub database_path: Option<PathBuf>,
}

/// Event output configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputConfig {
    /// Output format: "json", "jsonl", or "console"
    pub format: String,
    /// Output file path (stdout when absent)
    pub file_path: Option<PathBuf>,
}

/// A rule declared in the config file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleSeed {
    pub name: String,
    #[serde(rename = "type")]
    pub rule_type: RuleType,
    pub server_user_id: Option<String>,
    #[serde(default = "default_true")]
    pub is_active: bool,
    #[serde(default = "empty_params")]
    pub params: serde_json::Value,
}

fn empty_params() -> serde_json::Value {
    serde_json::Value::Object(serde_json::Map::new())
}

fn default_true() -> bool {
    true
}

impl RuleSeed {
    pub fn to_rule(&self) -> Rule {
        let mut rule = Rule::new(self.name.clone(), self.rule_type, self.params.clone());
        rule.server_user_id = self.server_user_id.clone();
        rule.is_active = self.is_active;
        rule
    }
}

impl Default for PollerConfig {
    fn default() -> Self {
        PollerConfig {
            poll_interval_secs: 15,
            tick_timeout_secs: 10,
            down_after_failures: 3,
            history_window_hours: 24,
        }
    }
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        LifecycleConfig {
            stale_after_missed_polls: 3,
            resume_window_secs: 30 * 60,
            min_play_secs: 120,
            completion_ratio: 0.85,
        }
    }
}

impl Default for TrustConfig {
    fn default() -> Self {
        TrustConfig {
            initial_score: 100,
            high_penalty: 20,
            warning_penalty: 10,
            low_penalty: 5,
        }
    }
}

impl TrustConfig {
    pub fn penalty(&self, severity: Severity) -> i64 {
        match severity {
            Severity::High => self.high_penalty,
            Severity::Warning => self.warning_penalty,
            Severity::Low => self.low_penalty,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        StorageConfig {
            database_path: PathBuf::from("streamwarden.db"),
            retention_days: 90,
        }
    }
}

impl Default for OutputConfig {
    fn default() -> Self {
        OutputConfig {
            format: "jsonl".to_string(),
            file_path: None,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        let seed = |name: &str, rule_type: RuleType, params: serde_json::Value| RuleSeed {
            name: name.to_string(),
            rule_type,
            params,
            server_user_id: None,
            is_active: true,
        };

        Config {
            servers: vec![ServerConfig {
                id: "plex-main".to_string(),
                name: "Plex".to_string(),
                kind: ServerKind::Plex,
                url: "http://localhost:32400".to_string(),
                token: String::new(),
            }],
            poller: PollerConfig::default(),
            lifecycle: LifecycleConfig::default(),
            trust: TrustConfig::default(),
            storage: StorageConfig::default(),
            geoip: GeoIpConfig {
                database_path: Some(PathBuf::from("GeoLite2-City.mmdb")),
            },
            output: OutputConfig::default(),
            rules: vec![
                seed(
                    "Impossible travel",
                    RuleType::ImpossibleTravel,
                    serde_json::json!({ "maxSpeedKmh": 500.0 }),
                ),
                seed(
                    "Simultaneous locations",
                    RuleType::SimultaneousLocations,
                    serde_json::json!({ "minDistanceKm": 100.0 }),
                ),
                seed(
                    "Too many IPs",
                    RuleType::DeviceVelocity,
                    serde_json::json!({ "maxIps": 5, "windowHours": 24 }),
                ),
                seed(
                    "Concurrent streams",
                    RuleType::ConcurrentStreams,
                    serde_json::json!({ "maxStreams": 3 }),
                ),
            ],
        }
    }
}

const MAX_POLL_INTERVAL_SECS: i64 = 24 * 60 * 60;
const MAX_HISTORY_WINDOW_HOURS: i64 = 24 * 366;
const MAX_RESUME_WINDOW_SECS: i64 = 7 * 24 * 60 * 60;
const MAX_RETENTION_DAYS: i64 = 100 * 366;

fn check_range(name: &str, value: i64, min: i64, max: i64) -> Result<(), ConfigError> {
    if value < min || value > max {
        return Err(ConfigError::Invalid(format!(
            "{} must be between {} and {}, got {}",
            name, min, max, value
        )));
    }
    Ok(())
}

impl Config {
    /// Load configuration from a file
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a file
    pub fn to_file(&self, path: &Path) -> Result<(), ConfigError> {
        let contents = toml::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.poller.tick_timeout_secs == 0 {
            return Err(ConfigError::Invalid("tick_timeout_secs must be > 0".to_string()));
        }
        check_range("poll_interval_secs", self.poller.poll_interval_secs as i64, 1, MAX_POLL_INTERVAL_SECS)?;
        check_range("history_window_hours", self.poller.history_window_hours, 1, MAX_HISTORY_WINDOW_HOURS)?;
        check_range("resume_window_secs", self.lifecycle.resume_window_secs, 0, MAX_RESUME_WINDOW_SECS)?;
        check_range("min_play_secs", self.lifecycle.min_play_secs, 0, MAX_RESUME_WINDOW_SECS)?;
        check_range("retention_days", self.storage.retention_days, 1, MAX_RETENTION_DAYS)?;

        let ratio = self.lifecycle.completion_ratio;
        if !(ratio > 0.0 && ratio <= 1.0) {
            return Err(ConfigError::Invalid(format!(
                "completion_ratio must be in (0, 1], got {}",
                ratio
            )));
        }

        let mut seen = HashSet::new();
        for server in &self.servers {
            if server.id.is_empty() {
                return Err(ConfigError::Invalid(format!("server '{}' has an empty id", server.name)));
            }
            if !seen.insert(server.id.as_str()) {
                return Err(ConfigError::Invalid(format!("duplicate server id '{}'", server.id)));
            }
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poller.poll_interval_secs)
    }

    pub fn tick_timeout(&self) -> Duration {
        Duration::from_secs(self.poller.tick_timeout_secs)
    }

    /// How long a session may go unreported before it is closed
    pub fn stale_threshold_ms(&self) -> i64 {
        (self.poller.poll_interval_secs * u64::from(self.lifecycle.stale_after_missed_polls) * 1000) as i64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.stale_threshold_ms(), 45_000);
    }

    #[test]
    fn test_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");

        let config = Config::default();
        config.to_file(&path).unwrap();

        let loaded = Config::from_file(&path).unwrap();
        assert_eq!(loaded.servers.len(), 1);
        assert_eq!(loaded.servers[0].kind, ServerKind::Plex);
        assert_eq!(loaded.rules.len(), config.rules.len());
        assert_eq!(loaded.rules[0].params["maxSpeedKmh"], 500.0);
    }

    #[test]
    fn test_minimal_file_uses_defaults() {
        let config: Config = toml::from_str(
            r#"
            [[servers]]
            id = "jf"
            name = "Jellyfin"
            kind = "jellyfin"
            url = "http://jf:8096"
            token = "abc"

            [[rules]]
            name = "Block"
            type = "geo_restriction"
            params = { countries = ["CN", "RU"] }
            "#,
        )
        .unwrap();

        assert_eq!(config.poller.poll_interval_secs, 15);
        assert_eq!(config.lifecycle.resume_window_secs, 1800);
        assert_eq!(config.rules[0].rule_type, RuleType::GeoRestriction);
        assert!(config.rules[0].is_active);
        assert_eq!(config.rules[0].to_rule().params["countries"][1], "RU");
    }

    #[test]
    fn test_rejects_duplicate_servers() {
        let mut config = Config::default();
        config.servers.push(config.servers[0].clone());
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_rejects_bad_completion_ratio() {
        let mut config = Config::default();
        config.lifecycle.completion_ratio = 1.5;
        assert!(config.validate().is_err());
        config.lifecycle.completion_ratio = 0.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_out_of_range_windows() {
        let mut config = Config::default();
        config.lifecycle.resume_window_secs = i64::MAX;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.poller.history_window_hours = i64::MAX / 2;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.storage.retention_days = 1_000_000_000_000;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("retention_days"));

        let mut config = Config::default();
        config.poller.poll_interval_secs = u64::MAX;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_unknown_server_kind_fails_to_parse() {
        let result: Result<Config, _> = toml::from_str(
            r#"
            [[servers]]
            id = "x"
            name = "X"
            kind = "kodi"
            url = "http://x"
            token = ""
            "#,
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_penalties() {
        let trust = TrustConfig::default();
        assert_eq!(trust.penalty(Severity::High), 20);
        assert_eq!(trust.penalty(Severity::Warning), 10);
        assert_eq!(trust.penalty(Severity::Low), 5);
    }
}
