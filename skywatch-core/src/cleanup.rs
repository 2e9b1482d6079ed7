use std::collections::HashMap;
use std::fmt;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::CleanupSection;
use crate::gateway::{GatewayError, VideoPlatform, VideoSummary};

#[derive(Debug, Error)]
pub enum CleanupError {
    #[error("remote call failed: {0}")]
    Gateway(#[from] GatewayError),
    #[error("duration cache {path}: {source}")]
    Cache {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Append-only `video_id=seconds` file. Later lines win.
#[derive(Debug)]
pub struct DurationCache {
    path: PathBuf,
    entries: HashMap<String, u64>,
}

impl DurationCache {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, CleanupError> {
        let path = path.as_ref().to_path_buf();
        let content = match std::fs::read_to_string(&path) {
            Ok(content) => content,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => String::new(),
            Err(source) => return Err(CleanupError::Cache { path, source }),
        };
        let mut entries = HashMap::new();
        for line in content.lines() {
            let Some((id, seconds)) = line.split_once('=') else {
                continue;
            };
            match seconds.trim().parse::<u64>() {
                Ok(seconds) => {
                    entries.insert(id.trim().to_string(), seconds);
                }
                Err(_) => debug!(line, "skipping malformed duration cache line"),
            }
        }
        Ok(Self { path, entries })
    }

    pub fn get(&self, video_id: &str) -> Option<u64> {
        self.entries.get(video_id).copied()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn insert(&mut self, video_id: &str, seconds: u64) -> Result<(), CleanupError> {
        if self.entries.get(video_id) == Some(&seconds) {
            return Ok(());
        }
        let io_err = |source| CleanupError::Cache {
            path: self.path.clone(),
            source,
        };
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(io_err)?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(io_err)?;
        writeln!(file, "{video_id}={seconds}").map_err(io_err)?;
        self.entries.insert(video_id.to_string(), seconds);
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeleteReason {
    Expired,
    TooShort,
}

#[derive(Debug, Clone, Serialize)]
pub struct Deletion {
    pub video_id: String,
    pub title: String,
    pub reason: DeleteReason,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CleanupReport {
    pub scanned: usize,
    pub skipped_live: usize,
    pub kept: usize,
    pub deleted: Vec<Deletion>,
    pub dry_run: bool,
}

/// Batch pruning of old or aborted uploads on the platform.
pub struct CleanupJob {
    platform: Arc<dyn VideoPlatform>,
    config: CleanupSection,
    cache: DurationCache,
    dry_run: bool,
}

impl fmt::Debug for CleanupJob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CleanupJob")
            .field("config", &self.config)
            .field("cached_durations", &self.cache.len())
            .field("dry_run", &self.dry_run)
            .finish()
    }
}

impl CleanupJob {
    pub fn new(
        platform: Arc<dyn VideoPlatform>,
        config: CleanupSection,
        cache: DurationCache,
        dry_run: bool,
    ) -> Self {
        Self {
            platform,
            config,
            cache,
            dry_run,
        }
    }

    pub async fn run(&mut self, now: DateTime<Utc>) -> Result<CleanupReport, CleanupError> {
        let mut report = CleanupReport {
            dry_run: self.dry_run,
            ..CleanupReport::default()
        };
        let bound = self
            .platform
            .current_broadcast()
            .await?
            .map(|broadcast| broadcast.id);
        let cutoff = now - Duration::days(i64::from(self.config.retention_days));

        let mut page_token: Option<String> = None;
        for page_number in 0..self.config.max_pages.max(1) {
            let page = self.platform.list_videos(page_token.as_deref()).await?;
            debug!(page = page_number, videos = page.videos.len(), "listed videos");
            let candidates: Vec<VideoSummary> = page
                .videos
                .into_iter()
                .filter(|video| {
                    let live = bound.as_deref() == Some(video.id.as_str())
                        || matches!(video.live_content.as_str(), "live" | "upcoming");
                    if live {
                        report.skipped_live += 1;
                    }
                    !live
                })
                .collect();
            report.scanned += candidates.len();
            self.fill_durations(&candidates).await?;

            for video in candidates {
                match self.verdict(&video, cutoff) {
                    Some(reason) => {
                        if self.dry_run {
                            info!(video = %video.id, ?reason, "dry run: would delete video");
                        } else {
                            self.platform.delete_video(&video.id).await?;
                            info!(video = %video.id, title = %video.title, ?reason, "deleted video");
                        }
                        report.deleted.push(Deletion {
                            video_id: video.id,
                            title: video.title,
                            reason,
                        });
                    }
                    None => report.kept += 1,
                }
            }

            page_token = page.next_page;
            if page_token.is_none() {
                break;
            }
        }
        if page_token.is_some() {
            warn!(max_pages = self.config.max_pages, "page limit reached, listing truncated");
        }
        Ok(report)
    }

    fn verdict(&self, video: &VideoSummary, cutoff: DateTime<Utc>) -> Option<DeleteReason> {
        if video.published_at < cutoff {
            return Some(DeleteReason::Expired);
        }
        match self.cache.get(&video.id) {
            Some(seconds) if seconds < self.config.min_duration_seconds => {
                Some(DeleteReason::TooShort)
            }
            _ => None,
        }
    }

    async fn fill_durations(&mut self, videos: &[VideoSummary]) -> Result<(), CleanupError> {
        let missing: Vec<String> = videos
            .iter()
            .filter(|video| self.cache.get(&video.id).is_none())
            .map(|video| video.id.clone())
            .collect();
        if missing.is_empty() {
            return Ok(());
        }
        for (id, seconds) in self.platform.video_durations(&missing).await? {
            self.cache.insert(&id, seconds)?;
        }
        Ok(())
    }
}
