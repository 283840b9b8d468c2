//! Configuration management with file persistence

use anyhow::{Context, anyhow};
use chrono::Duration as ChronoDuration;
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

/// dsnet client configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub network: NetworkConfig,
    pub credentials: CredentialConfig,
    pub submission: SubmissionConfig,
    pub codec: CodecConfig,
    pub aggregation: AggregationConfig,
    pub cover: CoverConfig,
    pub database: DatabaseSection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub relay_url: String,
    pub authority_url: String,
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CredentialConfig {
    /// Tokens fetched when a submission finds none unused (0 disables)
    pub auto_acquire_batch: u32,
    /// Unused tokens older than this are expired
    pub token_ttl_days: i64,
    /// Reservations without a submitting query are released by recovery
    /// only once they are at least this old
    pub orphan_grace_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SubmissionConfig {
    pub max_attempts: u32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    pub default_deadline_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CodecConfig {
    /// Envelope sizes in ascending order; every frame is padded to one of these
    pub buckets: Vec<usize>,
}

/// What to do with a response that arrives after its query completed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LateResponsePolicy {
    #[default]
    Drop,
    Record,
}

impl LateResponsePolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Drop => "drop",
            Self::Record => "record",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AggregationConfig {
    pub late_responses: LateResponsePolicy,
    pub sweep_interval_secs: u64,
    pub poll_interval_ms: u64,
    pub retention_days: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoverConfig {
    pub enabled: bool,
    pub mean_interval_secs: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseSection {
    pub path: Option<PathBuf>,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            relay_url: "http://localhost:12345".to_string(),
            authority_url: "http://localhost:12346".to_string(),
            timeout_secs: 30,
        }
    }
}

impl Default for CredentialConfig {
    fn default() -> Self {
        Self {
            auto_acquire_batch: 0,
            token_ttl_days: 30,
            orphan_grace_secs: 300,
        }
    }
}

impl Default for SubmissionConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            backoff_base_ms: 500,
            backoff_max_ms: 30_000,
            default_deadline_secs: 3600,
        }
    }
}

impl Default for CodecConfig {
    fn default() -> Self {
        Self {
            buckets: vec![1024, 4096, 16384, 65536],
        }
    }
}

impl Default for AggregationConfig {
    fn default() -> Self {
        Self {
            late_responses: LateResponsePolicy::Drop,
            sweep_interval_secs: 10,
            poll_interval_ms: 1000,
            retention_days: 30,
        }
    }
}

impl Default for CoverConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            mean_interval_secs: 5.0,
        }
    }
}

impl CredentialConfig {
    pub fn orphan_grace(&self) -> ChronoDuration {
        i64::try_from(self.orphan_grace_secs)
            .ok()
            .and_then(ChronoDuration::try_seconds)
            .unwrap_or(ChronoDuration::MAX)
    }
}

impl SubmissionConfig {
    pub fn default_deadline(&self) -> Duration {
        Duration::from_secs(self.default_deadline_secs)
    }
}

impl Config {
    /// Get the config directory path
    pub fn config_dir() -> anyhow::Result<PathBuf> {
        let dir = if let Ok(custom_dir) = env::var("DSNET_CONFIG_DIR") {
            PathBuf::from(custom_dir)
        } else {
            dirs::config_dir()
                .ok_or_else(|| anyhow!("Could not determine config directory"))?
                .join("dsnet")
        };
        Ok(dir)
    }

    /// Get the config file path
    pub fn config_path() -> anyhow::Result<PathBuf> {
        Ok(Self::config_dir()?.join("config.toml"))
    }

    /// Load configuration from file, or the defaults if it doesn't exist
    pub fn load() -> anyhow::Result<Self> {
        let path = Self::config_path()?;

        if path.exists() {
            let contents = fs::read_to_string(&path)
                .with_context(|| format!("Failed to read config file: {}", path.display()))?;
            let config: Config = toml::from_str(&contents)
                .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
            config.validate()?;
            Ok(config)
        } else {
            Ok(Config::default())
        }
    }

    /// Save configuration to file
    pub fn save(&self) -> anyhow::Result<()> {
        self.validate()?;

        let dir = Self::config_dir()?;
        fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create config directory: {}", dir.display()))?;

        let path = Self::config_path()?;
        let contents = toml::to_string_pretty(self).context("Failed to serialize config")?;

        fs::write(&path, contents)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.submission.max_attempts == 0 {
            return Err(anyhow!("submission.max_attempts must be at least 1"));
        }
        if self.submission.backoff_base_ms > self.submission.backoff_max_ms {
            return Err(anyhow!(
                "submission.backoff_base_ms must not exceed submission.backoff_max_ms"
            ));
        }
        if self.codec.buckets.is_empty() {
            return Err(anyhow!("codec.buckets must list at least one size"));
        }
        if self.codec.buckets.windows(2).any(|w| w[0] >= w[1]) {
            return Err(anyhow!("codec.buckets must be strictly ascending"));
        }
        if self.cover.mean_interval_secs <= 0.0 {
            return Err(anyhow!("cover.mean_interval_secs must be positive"));
        }
        Ok(())
    }

    /// Resolved database path (explicit override or the platform default)
    pub fn database_path(&self) -> PathBuf {
        self.database
            .path
            .clone()
            .unwrap_or_else(crate::storage::database::default_database_path)
    }

    /// Get a configuration value by key
    pub fn get(&self, key: &str) -> anyhow::Result<String> {
        match key {
            "network.relay_url" => Ok(self.network.relay_url.clone()),
            "network.authority_url" => Ok(self.network.authority_url.clone()),
            "network.timeout_secs" => Ok(self.network.timeout_secs.to_string()),

            "credentials.auto_acquire_batch" => Ok(self.credentials.auto_acquire_batch.to_string()),
            "credentials.token_ttl_days" => Ok(self.credentials.token_ttl_days.to_string()),
            "credentials.orphan_grace_secs" => Ok(self.credentials.orphan_grace_secs.to_string()),

            "submission.max_attempts" => Ok(self.submission.max_attempts.to_string()),
            "submission.backoff_base_ms" => Ok(self.submission.backoff_base_ms.to_string()),
            "submission.backoff_max_ms" => Ok(self.submission.backoff_max_ms.to_string()),
            "submission.default_deadline_secs" => {
                Ok(self.submission.default_deadline_secs.to_string())
            }

            "codec.buckets" => Ok(self
                .codec
                .buckets
                .iter()
                .map(|b| b.to_string())
                .collect::<Vec<_>>()
                .join(", ")),

            "aggregation.late_responses" => Ok(self.aggregation.late_responses.as_str().to_string()),
            "aggregation.sweep_interval_secs" => {
                Ok(self.aggregation.sweep_interval_secs.to_string())
            }
            "aggregation.poll_interval_ms" => Ok(self.aggregation.poll_interval_ms.to_string()),
            "aggregation.retention_days" => Ok(self.aggregation.retention_days.to_string()),

            "cover.enabled" => Ok(self.cover.enabled.to_string()),
            "cover.mean_interval_secs" => Ok(self.cover.mean_interval_secs.to_string()),

            "database.path" => Ok(self.database_path().display().to_string()),

            _ => Err(anyhow!(
                "Unknown configuration key: {}. Use `dsnet config list` to see available keys.",
                key
            )),
        }
    }

    /// Set a configuration value by key
    pub fn set(&mut self, key: &str, value: &str) -> anyhow::Result<()> {
        match key {
            "network.relay_url" => self.network.relay_url = value.to_string(),
            "network.authority_url" => self.network.authority_url = value.to_string(),
            "network.timeout_secs" => {
                self.network.timeout_secs = value
                    .parse()
                    .with_context(|| format!("Invalid timeout_secs value: {}", value))?;
            }

            "credentials.auto_acquire_batch" => {
                self.credentials.auto_acquire_batch = value
                    .parse()
                    .with_context(|| format!("Invalid auto_acquire_batch value: {}", value))?;
            }
            "credentials.token_ttl_days" => {
                let days: i64 = value
                    .parse()
                    .with_context(|| format!("Invalid token_ttl_days value: {}", value))?;
                if days <= 0 {
                    return Err(anyhow!("Token TTL must be positive"));
                }
                self.credentials.token_ttl_days = days;
            }
            "credentials.orphan_grace_secs" => {
                self.credentials.orphan_grace_secs = value
                    .parse()
                    .with_context(|| format!("Invalid orphan_grace_secs value: {}", value))?;
            }

            "submission.max_attempts" => {
                self.submission.max_attempts = value
                    .parse()
                    .with_context(|| format!("Invalid max_attempts value: {}", value))?;
            }
            "submission.backoff_base_ms" => {
                self.submission.backoff_base_ms = value
                    .parse()
                    .with_context(|| format!("Invalid backoff_base_ms value: {}", value))?;
            }
            "submission.backoff_max_ms" => {
                self.submission.backoff_max_ms = value
                    .parse()
                    .with_context(|| format!("Invalid backoff_max_ms value: {}", value))?;
            }
            "submission.default_deadline_secs" => {
                self.submission.default_deadline_secs = value
                    .parse()
                    .with_context(|| format!("Invalid default_deadline_secs value: {}", value))?;
            }

            "codec.buckets" => {
                self.codec.buckets = value
                    .split(',')
                    .map(|s| s.trim())
                    .filter(|s| !s.is_empty())
                    .map(|s| {
                        s.parse::<usize>()
                            .with_context(|| format!("Invalid bucket size: {}", s))
                    })
                    .collect::<anyhow::Result<Vec<_>>>()?;
            }

            "aggregation.late_responses" => {
                self.aggregation.late_responses = match value {
                    "drop" => LateResponsePolicy::Drop,
                    "record" => LateResponsePolicy::Record,
                    _ => {
                        return Err(anyhow!(
                            "Invalid late response policy: {}. Valid options: drop, record",
                            value
                        ));
                    }
                };
            }
            "aggregation.sweep_interval_secs" => {
                self.aggregation.sweep_interval_secs = value
                    .parse()
                    .with_context(|| format!("Invalid sweep_interval_secs value: {}", value))?;
            }
            "aggregation.poll_interval_ms" => {
                self.aggregation.poll_interval_ms = value
                    .parse()
                    .with_context(|| format!("Invalid poll_interval_ms value: {}", value))?;
            }
            "aggregation.retention_days" => {
                self.aggregation.retention_days = value
                    .parse()
                    .with_context(|| format!("Invalid retention_days value: {}", value))?;
            }

            "cover.enabled" => {
                self.cover.enabled = value
                    .parse()
                    .with_context(|| format!("Invalid boolean value: {}", value))?;
            }
            "cover.mean_interval_secs" => {
                self.cover.mean_interval_secs = value
                    .parse()
                    .with_context(|| format!("Invalid mean_interval_secs value: {}", value))?;
            }

            "database.path" => self.database.path = Some(PathBuf::from(value)),

            _ => {
                return Err(anyhow!(
                    "Unknown configuration key: {}. Use `dsnet config list` to see available keys.",
                    key
                ));
            }
        }
        self.validate()
    }

    /// List all configuration keys and their values
    pub fn list(&self) -> anyhow::Result<Vec<(String, String)>> {
        let keys = [
            "network.relay_url",
            "network.authority_url",
            "network.timeout_secs",
            "credentials.auto_acquire_batch",
            "credentials.token_ttl_days",
            "credentials.orphan_grace_secs",
            "submission.max_attempts",
            "submission.backoff_base_ms",
            "submission.backoff_max_ms",
            "submission.default_deadline_secs",
            "codec.buckets",
            "aggregation.late_responses",
            "aggregation.sweep_interval_secs",
            "aggregation.poll_interval_ms",
            "aggregation.retention_days",
            "cover.enabled",
            "cover.mean_interval_secs",
            "database.path",
        ];

        keys.into_iter()
            .map(|key| Ok((key.to_string(), self.get(key)?)))
            .collect()
    }

    /// Reset configuration to defaults
    pub fn reset() -> anyhow::Result<()> {
        let path = Self::config_path()?;
        if path.exists() {
            fs::remove_file(&path)
                .with_context(|| format!("Failed to remove config file: {}", path.display()))?;
        }
        Ok(())
    }
}
