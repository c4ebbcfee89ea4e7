//! kiln.toml configuration parser.
//!
//! Every field is optional; missing values fall back to the defaults
//! below. Durations are written as strings such as `"5s"`, `"500ms"`
//! or `"2m"`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct KilnConfig {
    pub poolmgr: PoolManagerConfig,
    pub fetcher: FetcherConfig,
    pub client: ClientConfig,
}

/// What an allocation does when a pool is at its maximum with no idle
/// container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "policy", rename_all = "snake_case")]
pub enum ExhaustionPolicy {
    /// Fail immediately with `PoolExhausted`.
    Fail,
    /// Wait up to `timeout` for a container to free up.
    Wait {
        #[serde(with = "duration_str")]
        timeout: Duration,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolManagerConfig {
    /// Warm containers kept ready per environment.
    pub pool_size: u32,
    /// Hard cap on containers per environment (idle + specialized).
    pub max_pool_size: u32,
    pub exhaustion: ExhaustionPolicy,
    /// Specialization attempts per allocation, each on a fresh container.
    pub max_attempts: u32,
    /// Timeout applied to every orchestrator, fetch, and load call.
    #[serde(with = "duration_str")]
    pub call_timeout: Duration,
    /// Unused cache entries older than this are reclaimed.
    #[serde(with = "duration_str")]
    pub idle_timeout: Duration,
    #[serde(with = "duration_str")]
    pub sweep_interval: Duration,
    /// Containers stuck in `Specializing` longer than this are terminated.
    #[serde(with = "duration_str")]
    pub specializing_stale_after: Duration,
    #[serde(with = "duration_str")]
    pub replenish_interval: Duration,
    /// Namespace in which containers and services are created.
    pub function_namespace: String,
    /// Mount point of the shared volume inside runtime containers.
    pub shared_mount_path: String,
    /// Port of the fetcher sidecar in every container.
    pub fetcher_port: u16,
}

impl Default for PoolManagerConfig {
    fn default() -> Self {
        Self {
            pool_size: 3,
            max_pool_size: 10,
            exhaustion: ExhaustionPolicy::Fail,
            max_attempts: 3,
            call_timeout: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(120),
            sweep_interval: Duration::from_secs(5),
            specializing_stale_after: Duration::from_secs(120),
            replenish_interval: Duration::from_secs(2),
            function_namespace: "kiln-function".to_string(),
            shared_mount_path: "/userfunc".to_string(),
            fetcher_port: 8000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FetcherConfig {
    /// Directory that receives delivered code.
    pub shared_path: PathBuf,
    pub port: u16,
    #[serde(with = "duration_str")]
    pub download_timeout: Duration,
    /// Pool manager API used to resolve functions when no local store is
    /// available.
    pub function_source_url: Option<String>,
}

impl Default for FetcherConfig {
    fn default() -> Self {
        Self {
            shared_path: PathBuf::from("/userfunc"),
            port: 8000,
            download_timeout: Duration::from_secs(60),
            function_source_url: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// How often batched taps are flushed.
    #[serde(with = "duration_str")]
    pub tap_interval: Duration,
    /// Capacity of the tap mailbox; taps beyond it are dropped.
    pub tap_mailbox: usize,
    #[serde(with = "duration_str")]
    pub request_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            tap_interval: Duration::from_secs(5),
            tap_mailbox: 1024,
            request_timeout: Duration::from_secs(60),
        }
    }
}

impl PoolManagerConfig {
    /// Reject values the background loops cannot run with.
    pub fn validate(&self) -> Result<(), String> {
        non_zero("poolmgr.sweep_interval", self.sweep_interval)?;
        non_zero("poolmgr.replenish_interval", self.replenish_interval)
    }
}

impl ClientConfig {
    pub fn validate(&self) -> Result<(), String> {
        non_zero("client.tap_interval", self.tap_interval)
    }
}

fn non_zero(field: &str, value: Duration) -> Result<(), String> {
    if value.is_zero() {
        return Err(format!("{field} must be greater than zero"));
    }
    Ok(())
}

impl KilnConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: KilnConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        self.poolmgr
            .validate()
            .and_then(|()| self.client.validate())
            .map_err(anyhow::Error::msg)
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }
}

/// Parse a duration string like "5s", "500ms", "2m".
///
/// A bare number is read as seconds.
pub fn parse_duration(s: &str) -> Option<Duration> {
    let s = s.trim();
    if let Some(ms) = s.strip_suffix("ms") {
        ms.parse::<u64>().ok().map(Duration::from_millis)
    } else if let Some(secs) = s.strip_suffix('s') {
        secs.parse::<u64>().ok().map(Duration::from_secs)
    } else if let Some(mins) = s.strip_suffix('m') {
        mins.parse::<u64>().ok().map(|m| Duration::from_secs(m * 60))
    } else {
        s.parse::<u64>().ok().map(Duration::from_secs)
    }
}

fn format_duration(d: &Duration) -> String {
    if d.subsec_millis() != 0 {
        format!("{}ms", d.as_millis())
    } else {
        format!("{}s", d.as_secs())
    }
}

mod duration_str {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&super::format_duration(d))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let raw = String::deserialize(d)?;
        super::parse_duration(&raw)
            .ok_or_else(|| serde::de::Error::custom(format!("invalid duration {raw:?}")))
    }
}
