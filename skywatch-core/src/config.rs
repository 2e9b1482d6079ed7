use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Deserialize;

use crate::error::{ConfigError, Result};
use crate::gateway::Visibility;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct SkywatchConfig {
    pub station: StationSection,
    pub schedule: ScheduleSection,
    pub probes: ProbesSection,
    pub recovery: RecoverySection,
    pub nas: NasSection,
    pub platform: PlatformSection,
    pub astronomy: AstronomySection,
    #[serde(default)]
    pub cleanup: CleanupSection,
}

impl SkywatchConfig {
    pub fn resolve_path<P: AsRef<Path>>(&self, candidate: P) -> PathBuf {
        let path = candidate.as_ref();
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            Path::new(&self.station.state_dir).join(path)
        }
    }

    /// Reads a credential file relative to the state directory. Missing or
    /// blank files are a precondition failure.
    pub fn read_credential<P: AsRef<Path>>(&self, candidate: P) -> Result<String> {
        let path = self.resolve_path(candidate);
        let content = std::fs::read_to_string(&path)
            .map_err(|_| ConfigError::MissingCredential { path: path.clone() })?;
        let value = content.trim();
        if value.is_empty() {
            return Err(ConfigError::MissingCredential { path });
        }
        Ok(value.to_string())
    }

    pub fn validate(&self) -> Result<()> {
        if self.schedule.max_segment_minutes == 0 {
            return Err(ConfigError::Invalid {
                field: "schedule.max_segment_minutes",
                reason: "must be greater than zero".into(),
            });
        }
        if self.probes.network_host.trim().is_empty() {
            return Err(ConfigError::Invalid {
                field: "probes.network_host",
                reason: "must not be empty".into(),
            });
        }
        if self.platform.broadcast_title.trim().is_empty() {
            return Err(ConfigError::Invalid {
                field: "platform.broadcast_title",
                reason: "must not be empty".into(),
            });
        }
        if self.astronomy.afternoon_hour > 23 {
            return Err(ConfigError::Invalid {
                field: "astronomy.afternoon_hour",
                reason: format!("{} is not an hour of the day", self.astronomy.afternoon_hour),
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct StationSection {
    pub name: String,
    pub state_dir: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ScheduleSection {
    pub start_offset_minutes: i64,
    pub stop_offset_minutes: i64,
    pub max_segment_minutes: u64,
    pub grace_minutes: u64,
    #[serde(default)]
    pub midday_split: bool,
    #[serde(default = "default_warmup_seconds")]
    pub warmup_seconds: u64,
    #[serde(default = "default_settle_seconds")]
    pub settle_seconds: u64,
}

impl ScheduleSection {
    pub fn warmup(&self) -> Duration {
        Duration::from_secs(self.warmup_seconds)
    }

    pub fn settle(&self) -> Duration {
        Duration::from_secs(self.settle_seconds)
    }
}

fn default_warmup_seconds() -> u64 {
    60
}

fn default_settle_seconds() -> u64 {
    20
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProbesSection {
    pub network_host: String,
    #[serde(default = "default_network_port")]
    pub network_port: u16,
    #[serde(default = "default_network_timeout")]
    pub network_timeout_seconds: u64,
    #[serde(default = "default_one")]
    pub network_samples: u32,
    #[serde(default)]
    pub network_interval_seconds: u64,
    pub stream_samples: u32,
    pub stream_interval_seconds: u64,
    pub extractor: String,
    #[serde(default)]
    pub extractor_args: Vec<String>,
    #[serde(default = "default_extractor_timeout")]
    pub extractor_timeout_seconds: u64,
    #[serde(default = "default_error_pattern")]
    pub error_pattern: String,
}

fn default_network_port() -> u16 {
    53
}

fn default_network_timeout() -> u64 {
    15
}

fn default_one() -> u32 {
    1
}

fn default_extractor_timeout() -> u64 {
    60
}

fn default_error_pattern() -> String {
    "(?i)error".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct RecoverySection {
    pub retry_interval_seconds: u64,
    pub max_retries: u32,
    #[serde(default = "default_true")]
    pub bounce_on_network_failure: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
pub struct NasSection {
    pub base_url: String,
    pub username: String,
    pub password_file: String,
    #[serde(default = "default_nas_timeout")]
    pub timeout_seconds: u64,
}

fn default_nas_timeout() -> u64 {
    30
}

#[derive(Debug, Clone, Deserialize)]
pub struct PlatformSection {
    #[serde(default = "default_api_base")]
    pub api_base: String,
    #[serde(default = "default_token_url")]
    pub token_url: String,
    pub client_id: String,
    pub client_secret_file: String,
    pub refresh_token_file: String,
    pub broadcast_title: String,
    pub desired_visibility: Visibility,
    pub watch_url: String,
    #[serde(default = "default_platform_timeout")]
    pub timeout_seconds: u64,
}

fn default_api_base() -> String {
    "https://www.googleapis.com/youtube/v3/".to_string()
}

fn default_token_url() -> String {
    "https://oauth2.googleapis.com/token".to_string()
}

fn default_platform_timeout() -> u64 {
    30
}

#[derive(Debug, Clone, Deserialize)]
pub struct AstronomySection {
    /// Lookup URL; `{date}` is replaced with the target date (YYYY-MM-DD).
    pub url: String,
    pub sunrise_pattern: String,
    pub sunset_pattern: String,
    #[serde(default = "default_sunrise_cache")]
    pub sunrise_cache: String,
    #[serde(default = "default_sunset_cache")]
    pub sunset_cache: String,
    #[serde(default = "default_stamp_file")]
    pub stamp_file: String,
    #[serde(default = "default_afternoon_hour")]
    pub afternoon_hour: u32,
}

fn default_sunrise_cache() -> String {
    "sunrise.txt".to_string()
}

fn default_sunset_cache() -> String {
    "sunset.txt".to_string()
}

fn default_stamp_file() -> String {
    "astronomy.stamp".to_string()
}

fn default_afternoon_hour() -> u32 {
    13
}

#[derive(Debug, Clone, Deserialize)]
pub struct CleanupSection {
    pub retention_days: u32,
    pub min_duration_seconds: u64,
    pub duration_cache: String,
    pub max_pages: u32,
}

impl Default for CleanupSection {
    fn default() -> Self {
        Self {
            retention_days: 14,
            min_duration_seconds: 120,
            duration_cache: "durations.txt".to_string(),
            max_pages: 10,
        }
    }
}

pub fn load_skywatch_config<P: AsRef<Path>>(path: P) -> Result<SkywatchConfig> {
    let config: SkywatchConfig = load_toml(path)?;
    config.validate()?;
    Ok(config)
}

fn load_toml<T, P>(path: P) -> Result<T>
where
    T: DeserializeOwned,
    P: AsRef<Path>,
{
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        source,
        path: path.to_path_buf(),
    })?;
    toml::from_str(&content).map_err(|source| ConfigError::Parse {
        source,
        path: path.to_path_buf(),
    })
}
