use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, FixedOffset, NaiveDate, Timelike};
use regex::Regex;
use reqwest::Client;
use thiserror::Error;
use tracing::{info, warn};

use crate::config::SkywatchConfig;

use super::{time_to_seconds, AstronomicalTimes};

#[derive(Debug, Error)]
pub enum AstronomyError {
    #[error("lookup request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("lookup returned status {0}")]
    Status(u16),
    #[error("{0} pattern did not match the lookup response")]
    NoMatch(&'static str),
    #[error("{which} value {value:?} is not a time of day")]
    Malformed { which: &'static str, value: String },
    #[error("invalid {which} pattern: {source}")]
    Pattern {
        which: &'static str,
        #[source]
        source: regex::Error,
    },
    #[error("no cached {which} value at {path}")]
    MissingCache { which: &'static str, path: PathBuf },
    #[error("io error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[async_trait]
pub trait PageFetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<String, AstronomyError>;
}

#[derive(Debug, Clone)]
pub struct HttpPageFetcher {
    client: Client,
}

impl HttpPageFetcher {
    pub fn new(timeout: Duration) -> Result<Self, AstronomyError> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(concat!("skywatch/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl PageFetcher for HttpPageFetcher {
    async fn fetch(&self, url: &str) -> Result<String, AstronomyError> {
        let response = self.client.get(url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(AstronomyError::Status(status.as_u16()));
        }
        Ok(response.text().await?)
    }
}

/// Sunrise/sunset source with a once-a-day live lookup and an on-disk
/// last-known-good fallback.
pub struct AstronomySource {
    url_template: String,
    sunrise_pattern: Regex,
    sunset_pattern: Regex,
    sunrise_cache: PathBuf,
    sunset_cache: PathBuf,
    stamp_file: PathBuf,
    afternoon_hour: u32,
    fetcher: Arc<dyn PageFetcher>,
}

impl fmt::Debug for AstronomySource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AstronomySource")
            .field("url_template", &self.url_template)
            .field("sunrise_cache", &self.sunrise_cache)
            .field("sunset_cache", &self.sunset_cache)
            .field("afternoon_hour", &self.afternoon_hour)
            .finish()
    }
}

impl AstronomySource {
    pub fn from_config(
        config: &SkywatchConfig,
        fetcher: Option<Arc<dyn PageFetcher>>,
    ) -> Result<Self, AstronomyError> {
        let section = &config.astronomy;
        let fetcher = match fetcher {
            Some(fetcher) => fetcher,
            None => Arc::new(HttpPageFetcher::new(Duration::from_secs(30))?),
        };
        let compile = |which: &'static str, pattern: &str| {
            Regex::new(pattern).map_err(|source| AstronomyError::Pattern { which, source })
        };
        Ok(Self {
            url_template: section.url.clone(),
            sunrise_pattern: compile("sunrise", &section.sunrise_pattern)?,
            sunset_pattern: compile("sunset", &section.sunset_pattern)?,
            sunrise_cache: config.resolve_path(&section.sunrise_cache),
            sunset_cache: config.resolve_path(&section.sunset_cache),
            stamp_file: config.resolve_path(&section.stamp_file),
            afternoon_hour: section.afternoon_hour,
            fetcher,
        })
    }

    /// Pulls both values out of a lookup response. Each pattern's first
    /// capture group (or whole match) must parse as a time of day.
    pub fn extract(&self, body: &str) -> Result<(String, String), AstronomyError> {
        let sunrise = capture(&self.sunrise_pattern, body, "sunrise")?;
        let sunset = capture(&self.sunset_pattern, body, "sunset")?;
        Ok((sunrise, sunset))
    }

    /// A lookup is due once per day, after the afternoon gate, so the
    /// target is always tomorrow's sunrise.
    pub fn lookup_due(&self, now: DateTime<FixedOffset>) -> bool {
        if now.hour() < self.afternoon_hour {
            return false;
        }
        read_trimmed(&self.stamp_file)
            .ok()
            .flatten()
            .and_then(|stamp| NaiveDate::parse_from_str(&stamp, "%Y-%m-%d").ok())
            != Some(now.date_naive())
    }

    pub async fn refresh(
        &self,
        now: DateTime<FixedOffset>,
    ) -> Result<AstronomicalTimes, AstronomyError> {
        if self.lookup_due(now) {
            let target = now.date_naive().succ_opt().unwrap_or_else(|| now.date_naive());
            let url = self
                .url_template
                .replace("{date}", &target.format("%Y-%m-%d").to_string());
            write_value(&self.stamp_file, &now.date_naive().format("%Y-%m-%d").to_string())?;
            match self.lookup(&url).await {
                Ok((sunrise, sunset)) => {
                    write_value(&self.sunrise_cache, &sunrise)?;
                    write_value(&self.sunset_cache, &sunset)?;
                    info!(%target, %sunrise, %sunset, "astronomy cache refreshed");
                }
                Err(error) => {
                    warn!(%error, %url, "astronomy lookup failed, using cached values");
                }
            }
        }
        self.cached()
    }

    async fn lookup(&self, url: &str) -> Result<(String, String), AstronomyError> {
        let body = self.fetcher.fetch(url).await?;
        self.extract(&body)
    }

    /// Last-known-good values from the cache files.
    pub fn cached(&self) -> Result<AstronomicalTimes, AstronomyError> {
        let sunrise = cached_seconds(&self.sunrise_cache, "sunrise")?;
        let sunset = cached_seconds(&self.sunset_cache, "sunset")?;
        Ok(AstronomicalTimes { sunrise, sunset })
    }
}

fn capture(pattern: &Regex, body: &str, which: &'static str) -> Result<String, AstronomyError> {
    let captures = pattern
        .captures(body)
        .ok_or(AstronomyError::NoMatch(which))?;
    let value = captures
        .get(1)
        .or_else(|| captures.get(0))
        .map(|m| m.as_str().trim().to_string())
        .unwrap_or_default();
    if time_to_seconds(&value).is_err() {
        return Err(AstronomyError::Malformed { which, value });
    }
    Ok(value)
}

fn cached_seconds(path: &Path, which: &'static str) -> Result<u32, AstronomyError> {
    let value = read_trimmed(path)?.ok_or_else(|| AstronomyError::MissingCache {
        which,
        path: path.to_path_buf(),
    })?;
    time_to_seconds(&value).map_err(|_| AstronomyError::Malformed { which, value })
}

fn read_trimmed(path: &Path) -> Result<Option<String>, AstronomyError> {
    match std::fs::read_to_string(path) {
        Ok(content) => {
            let value = content.trim();
            Ok((!value.is_empty()).then(|| value.to_string()))
        }
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(source) => Err(AstronomyError::Io {
            path: path.to_path_buf(),
            source,
        }),
    }
}

fn write_value(path: &Path, value: &str) -> Result<(), AstronomyError> {
    let io_err = |source| AstronomyError::Io {
        path: path.to_path_buf(),
        source,
    };
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(io_err)?;
    }
    std::fs::write(path, format!("{value}\n")).map_err(io_err)
}
