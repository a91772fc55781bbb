//! Configuration management with file persistence

use anyhow::{Context, anyhow};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::path::PathBuf;

use crate::signing::TrustedKeys;

/// Palisade configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub host: HostConfig,
    pub paths: PathsConfig,
    pub trust: TrustConfig,
    pub budgets: BudgetConfig,
    pub rate: RateConfig,
    pub channel: ChannelConfig,
    pub network: NetworkConfig,
    pub security: SecurityConfig,
}

/// Facts about the host that plugins declare compatibility against
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HostConfig {
    pub api_level: u32,
    pub app_version: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    /// Root for artifacts, backups and plugin private directories.
    /// Falls back to the platform data directory when unset.
    pub data_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TrustConfig {
    /// Base64-encoded ed25519 public keys allowed to sign plugin artifacts
    pub keys: Vec<String>,
}

/// Default per-plugin ceilings, applied when an instance is loaded
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BudgetConfig {
    pub cpu_millis: u64,
    pub memory_bytes: u64,
    pub disk_bytes: u64,
    pub network_bytes: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BucketConfig {
    pub capacity: u32,
    pub refill_per_sec: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateConfig {
    pub default: BucketConfig,
    /// Per-operation overrides keyed by operation name
    pub operations: BTreeMap<String, BucketConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    pub request_timeout_ms: u64,
    pub max_consecutive_timeouts: u32,
    pub queue_depth: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub enforce_https: bool,
    pub block_private_addresses: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThreatPolicy {
    /// Refuse to enable plugins with sensitive permissions while threats are present
    Block,
    /// Record the finding and continue
    Warn,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityConfig {
    pub threat_policy: ThreatPolicy,
    /// A scan still running after this long counts as inconclusive
    pub scan_timeout_ms: u64,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            api_level: 1,
            app_version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            cpu_millis: 30_000,
            memory_bytes: 100 * 1024 * 1024,
            disk_bytes: 10 * 1024 * 1024,
            network_bytes: 50 * 1024 * 1024,
        }
    }
}

impl Default for RateConfig {
    fn default() -> Self {
        let mut operations = BTreeMap::new();
        operations.insert(
            "submit_log".to_string(),
            BucketConfig {
                capacity: 150,
                refill_per_sec: 100.0,
            },
        );
        operations.insert(
            "submit_log_exception".to_string(),
            BucketConfig {
                capacity: 20,
                refill_per_sec: 5.0,
            },
        );
        operations.insert(
            "network_send".to_string(),
            BucketConfig {
                capacity: 60,
                refill_per_sec: 1.0,
            },
        );

        Self {
            default: BucketConfig {
                capacity: 100,
                refill_per_sec: 50.0,
            },
            operations,
        }
    }
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: 5_000,
            max_consecutive_timeouts: 3,
            queue_depth: 64,
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            enforce_https: true,
            block_private_addresses: true,
        }
    }
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            threat_policy: ThreatPolicy::Block,
            scan_timeout_ms: 10_000,
        }
    }
}

impl RateConfig {
    /// Bucket parameters for an operation, falling back to the default bucket
    pub fn bucket_for(&self, operation: &str) -> BucketConfig {
        self.operations
            .get(operation)
            .copied()
            .unwrap_or(self.default)
    }
}

impl Config {
    /// Get the config directory path
    pub fn config_dir() -> anyhow::Result<PathBuf> {
        let dir = if let Ok(custom_dir) = env::var("PALISADE_CONFIG_DIR") {
            PathBuf::from(custom_dir)
        } else {
            dirs::config_dir()
                .ok_or_else(|| anyhow!("Could not determine config directory"))?
                .join("palisade")
        };
        Ok(dir)
    }

    /// Get the config file path
    pub fn config_path() -> anyhow::Result<PathBuf> {
        Ok(Self::config_dir()?.join("config.toml"))
    }

    /// Resolve the data directory (artifacts, backups, private plugin dirs)
    pub fn data_dir(&self) -> anyhow::Result<PathBuf> {
        if let Some(dir) = &self.paths.data_dir {
            return Ok(dir.clone());
        }
        if let Ok(custom_dir) = env::var("PALISADE_DATA_DIR") {
            return Ok(PathBuf::from(custom_dir));
        }
        Ok(dirs::data_dir()
            .ok_or_else(|| anyhow!("Could not determine data directory"))?
            .join("palisade"))
    }

    /// Load configuration from file, or return defaults if it doesn't exist
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
        semver_like(&self.host.app_version)?;

        for (name, bucket) in
            std::iter::once(("default", &self.rate.default)).chain(
                self.rate
                    .operations
                    .iter()
                    .map(|(name, bucket)| (name.as_str(), bucket)),
            )
        {
            if bucket.capacity == 0 {
                return Err(anyhow!("Rate bucket '{}' must have a non-zero capacity", name));
            }
            if !bucket.refill_per_sec.is_finite() || bucket.refill_per_sec < 0.0 {
                return Err(anyhow!(
                    "Rate bucket '{}' must have a finite, non-negative refill rate",
                    name
                ));
            }
        }

        if self.channel.request_timeout_ms == 0 {
            return Err(anyhow!("channel.request_timeout_ms must be greater than zero"));
        }
        if self.channel.queue_depth == 0 {
            return Err(anyhow!("channel.queue_depth must be greater than zero"));
        }
        if self.channel.max_consecutive_timeouts == 0 {
            return Err(anyhow!("channel.max_consecutive_timeouts must be greater than zero"));
        }
        if self.security.scan_timeout_ms == 0 {
            return Err(anyhow!("security.scan_timeout_ms must be greater than zero"));
        }

        TrustedKeys::from_base64(&self.trust.keys).context("Invalid trust.keys entry")?;

        Ok(())
    }

    /// Get a configuration value by key
    pub fn get(&self, key: &str) -> anyhow::Result<String> {
        match key {
            "host.api_level" => Ok(self.host.api_level.to_string()),
            "host.app_version" => Ok(self.host.app_version.clone()),

            "paths.data_dir" => Ok(self
                .data_dir()
                .map(|p| p.display().to_string())
                .unwrap_or_else(|_| "(unresolved)".to_string())),

            "trust.keys" => Ok(self.trust.keys.join(", ")),

            "budgets.cpu_millis" => Ok(self.budgets.cpu_millis.to_string()),
            "budgets.memory_bytes" => Ok(self.budgets.memory_bytes.to_string()),
            "budgets.disk_bytes" => Ok(self.budgets.disk_bytes.to_string()),
            "budgets.network_bytes" => Ok(self.budgets.network_bytes.to_string()),

            "rate.default.capacity" => Ok(self.rate.default.capacity.to_string()),
            "rate.default.refill_per_sec" => Ok(self.rate.default.refill_per_sec.to_string()),

            "channel.request_timeout_ms" => Ok(self.channel.request_timeout_ms.to_string()),
            "channel.max_consecutive_timeouts" => {
                Ok(self.channel.max_consecutive_timeouts.to_string())
            }
            "channel.queue_depth" => Ok(self.channel.queue_depth.to_string()),

            "network.enforce_https" => Ok(self.network.enforce_https.to_string()),
            "network.block_private_addresses" => {
                Ok(self.network.block_private_addresses.to_string())
            }

            "security.threat_policy" => Ok(match self.security.threat_policy {
                ThreatPolicy::Block => "block".to_string(),
                ThreatPolicy::Warn => "warn".to_string(),
            }),
            "security.scan_timeout_ms" => Ok(self.security.scan_timeout_ms.to_string()),

            _ => Err(anyhow!(
                "Unknown configuration key: {}. Use `palisade config show` to see available keys.",
                key
            )),
        }
    }

    /// Set a configuration value by key
    pub fn set(&mut self, key: &str, value: &str) -> anyhow::Result<()> {
        match key {
            "host.api_level" => {
                self.host.api_level = value
                    .parse()
                    .with_context(|| format!("Invalid api_level value: {}", value))?;
            }
            "host.app_version" => {
                semver_like(value)?;
                self.host.app_version = value.to_string();
            }
            "paths.data_dir" => {
                self.paths.data_dir = if value.is_empty() {
                    None
                } else {
                    Some(PathBuf::from(value))
                };
            }
            "trust.keys" => {
                let keys: Vec<String> = value
                    .split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect();
                TrustedKeys::from_base64(&keys).context("Invalid trusted key")?;
                self.trust.keys = keys;
            }
            "budgets.cpu_millis" => self.budgets.cpu_millis = parse_u64(key, value)?,
            "budgets.memory_bytes" => self.budgets.memory_bytes = parse_u64(key, value)?,
            "budgets.disk_bytes" => self.budgets.disk_bytes = parse_u64(key, value)?,
            "budgets.network_bytes" => self.budgets.network_bytes = parse_u64(key, value)?,
            "rate.default.capacity" => {
                let capacity: u32 = value
                    .parse()
                    .with_context(|| format!("Invalid capacity value: {}", value))?;
                if capacity == 0 {
                    return Err(anyhow!("Capacity must be greater than zero"));
                }
                self.rate.default.capacity = capacity;
            }
            "rate.default.refill_per_sec" => {
                let refill: f64 = value
                    .parse()
                    .with_context(|| format!("Invalid refill value: {}", value))?;
                if !refill.is_finite() || refill < 0.0 {
                    return Err(anyhow!("Refill rate must be finite and non-negative"));
                }
                self.rate.default.refill_per_sec = refill;
            }
            "channel.request_timeout_ms" => {
                let timeout = parse_u64(key, value)?;
                if timeout == 0 {
                    return Err(anyhow!("Timeout must be greater than zero"));
                }
                self.channel.request_timeout_ms = timeout;
            }
            "channel.max_consecutive_timeouts" => {
                let limit: u32 = value
                    .parse()
                    .with_context(|| format!("Invalid timeout limit: {}", value))?;
                if limit == 0 {
                    return Err(anyhow!("Timeout limit must be greater than zero"));
                }
                self.channel.max_consecutive_timeouts = limit;
            }
            "channel.queue_depth" => {
                let depth: usize = value
                    .parse()
                    .with_context(|| format!("Invalid queue depth: {}", value))?;
                if depth == 0 {
                    return Err(anyhow!("Queue depth must be greater than zero"));
                }
                self.channel.queue_depth = depth;
            }
            "network.enforce_https" => self.network.enforce_https = parse_bool(key, value)?,
            "network.block_private_addresses" => {
                self.network.block_private_addresses = parse_bool(key, value)?
            }
            "security.threat_policy" => {
                self.security.threat_policy = match value {
                    "block" => ThreatPolicy::Block,
                    "warn" => ThreatPolicy::Warn,
                    _ => {
                        return Err(anyhow!(
                            "Invalid threat policy: {}. Valid options: block, warn",
                            value
                        ));
                    }
                };
            }
            "security.scan_timeout_ms" => {
                let timeout = parse_u64(key, value)?;
                if timeout == 0 {
                    return Err(anyhow!("Timeout must be greater than zero"));
                }
                self.security.scan_timeout_ms = timeout;
            }
            _ => {
                return Err(anyhow!(
                    "Unknown configuration key: {}. Use `palisade config show` to see available keys.",
                    key
                ));
            }
        }
        Ok(())
    }

    /// List all configuration keys and their values
    pub fn list(&self) -> anyhow::Result<Vec<(String, String)>> {
        let keys = [
            "host.api_level",
            "host.app_version",
            "paths.data_dir",
            "trust.keys",
            "budgets.cpu_millis",
            "budgets.memory_bytes",
            "budgets.disk_bytes",
            "budgets.network_bytes",
            "rate.default.capacity",
            "rate.default.refill_per_sec",
            "channel.request_timeout_ms",
            "channel.max_consecutive_timeouts",
            "channel.queue_depth",
            "network.enforce_https",
            "network.block_private_addresses",
            "security.threat_policy",
            "security.scan_timeout_ms",
        ];

        keys.into_iter()
            .map(|key| {
                let value = self.get(key)?;
                Ok((key.to_string(), value))
            })
            .collect()
    }
}

fn parse_u64(key: &str, value: &str) -> anyhow::Result<u64> {
    value
        .parse()
        .with_context(|| format!("Invalid value for {}: {}", key, value))
}

fn parse_bool(key: &str, value: &str) -> anyhow::Result<bool> {
    match value {
        "true" | "1" | "yes" => Ok(true),
        "false" | "0" | "no" => Ok(false),
        _ => Err(anyhow!("Invalid boolean for {}: {}", key, value)),
    }
}

// Cheap shape check; full semver parsing lives with the plugin manifest.
fn semver_like(value: &str) -> anyhow::Result<()> {
    let core = value.split(['-', '+']).next().unwrap_or_default();
    let parts: Vec<&str> = core.split('.').collect();
    if parts.len() != 3 || parts.iter().any(|p| p.parse::<u64>().is_err()) {
        return Err(anyhow!("Host version '{}' is not a semantic version", value));
    }
    Ok(())
}
