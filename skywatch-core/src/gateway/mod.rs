pub mod nas;
pub mod platform;

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use crate::config::SkywatchConfig;

use nas::NasClient;
use platform::{PlatformClient, PlatformCredentials};

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("{service} rejected the session credential")]
    Unauthorized { service: &'static str },
    #[error("{service} returned status {status}: {body}")]
    Status {
        service: &'static str,
        status: u16,
        body: String,
    },
    #[error("{service} reported failure (code {code:?})")]
    Rejected {
        service: &'static str,
        code: Option<i64>,
    },
    #[error("{service} response could not be decoded: {reason}")]
    Decode {
        service: &'static str,
        reason: String,
    },
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("credential error: {0}")]
    Credential(#[from] crate::error::ConfigError),
}

impl GatewayError {
    pub fn is_unauthorized(&self) -> bool {
        matches!(self, GatewayError::Unauthorized { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Visibility {
    Public,
    Unlisted,
    Private,
}

impl Visibility {
    pub fn as_str(&self) -> &'static str {
        match self {
            Visibility::Public => "public",
            Visibility::Unlisted => "unlisted",
            Visibility::Private => "private",
        }
    }
}

impl fmt::Display for Visibility {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Push settings held by the local streaming-control service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EncoderState {
    pub live_on: bool,
    pub stream_key: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EncoderUpdate {
    pub live_on: Option<bool>,
    pub stream_key: Option<String>,
}

/// Live event resource on the video-hosting platform.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlatformBroadcast {
    pub id: String,
    pub title: String,
    pub visibility: Visibility,
    pub life_cycle: String,
    pub bound_stream_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub actual_start: Option<DateTime<Utc>>,
}

impl PlatformBroadcast {
    /// When the current segment began recording.
    pub fn segment_started_at(&self) -> DateTime<Utc> {
        self.actual_start.unwrap_or(self.created_at)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StreamStatus {
    pub id: String,
    pub stream_key: String,
    pub status: String,
    pub health: String,
}

#[derive(Debug, Clone)]
pub struct NewBroadcast {
    pub title: String,
    pub visibility: Visibility,
    pub scheduled_start: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VideoSummary {
    pub id: String,
    pub title: String,
    pub published_at: DateTime<Utc>,
    pub live_content: String,
}

#[derive(Debug, Clone, Default)]
pub struct VideoPage {
    pub videos: Vec<VideoSummary>,
    pub next_page: Option<String>,
}

/// Local NAS streaming-control API.
#[async_trait]
pub trait StreamControl: Send + Sync {
    async fn load(&self) -> Result<EncoderState, GatewayError>;
    async fn save(&self, update: &EncoderUpdate) -> Result<(), GatewayError>;
}

/// Remote video-hosting platform API.
#[async_trait]
pub trait VideoPlatform: Send + Sync {
    async fn current_broadcast(&self) -> Result<Option<PlatformBroadcast>, GatewayError>;
    async fn stream(&self, stream_id: &str) -> Result<StreamStatus, GatewayError>;
    async fn set_visibility(
        &self,
        broadcast_id: &str,
        visibility: Visibility,
    ) -> Result<(), GatewayError>;
    async fn complete_broadcast(&self, broadcast_id: &str) -> Result<(), GatewayError>;
    async fn create_broadcast(
        &self,
        request: &NewBroadcast,
    ) -> Result<PlatformBroadcast, GatewayError>;
    async fn create_stream(&self, title: &str) -> Result<StreamStatus, GatewayError>;
    async fn bind_stream(&self, broadcast_id: &str, stream_id: &str) -> Result<(), GatewayError>;
    async fn list_videos(&self, page: Option<&str>) -> Result<VideoPage, GatewayError>;
    async fn video_durations(&self, ids: &[String]) -> Result<Vec<(String, u64)>, GatewayError>;
    async fn delete_video(&self, video_id: &str) -> Result<(), GatewayError>;
}

/// Credential holder that can obtain a fresh session on demand.
#[async_trait]
pub trait Reauthenticate: Send + Sync {
    async fn reauthenticate(&self) -> Result<(), GatewayError>;
}

/// Runs `call`; if it fails authorization, re-authenticates once and retries.
/// A second failure of any kind is returned to the caller as fatal.
pub async fn with_reauth<A, T, F, Fut>(
    auth: &A,
    operation: &str,
    mut call: F,
) -> Result<T, GatewayError>
where
    A: Reauthenticate + ?Sized,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, GatewayError>>,
{
    match call().await {
        Err(error) if error.is_unauthorized() => {
            warn!(operation, %error, "session rejected, re-authenticating");
            auth.reauthenticate().await?;
            call().await
        }
        other => other,
    }
}

/// Builds the NAS client. The password file must exist and be non-empty.
pub fn nas_client(config: &SkywatchConfig) -> Result<NasClient, GatewayError> {
    let section = &config.nas;
    let password = config.read_credential(&section.password_file)?;
    NasClient::new(
        &section.base_url,
        section.username.clone(),
        password,
        Duration::from_secs(section.timeout_seconds),
    )
}

pub fn platform_client(config: &SkywatchConfig) -> Result<PlatformClient, GatewayError> {
    let section = &config.platform;
    let credentials = PlatformCredentials {
        client_id: section.client_id.clone(),
        client_secret: config.read_credential(&section.client_secret_file)?,
        refresh_token: config.read_credential(&section.refresh_token_file)?,
        refresh_token_path: Some(config.resolve_path(&section.refresh_token_file)),
    };
    PlatformClient::new(
        &section.api_base,
        &section.token_url,
        credentials,
        Duration::from_secs(section.timeout_seconds),
    )
}

/// Remote truth for one reconciliation pass.
#[derive(Debug, Clone, Serialize)]
pub struct BroadcastState {
    pub is_live: bool,
    pub local_key: String,
    pub broadcast: Option<PlatformBroadcast>,
    pub stream: Option<StreamStatus>,
}

impl BroadcastState {
    pub fn secret_key(&self) -> Option<&str> {
        self.stream.as_ref().map(|stream| stream.stream_key.as_str())
    }

    pub fn bound_stream_id(&self) -> Option<&str> {
        self.broadcast
            .as_ref()
            .and_then(|broadcast| broadcast.bound_stream_id.as_deref())
    }
}

/// Typed facade over both remote services.
#[derive(Clone)]
pub struct RemoteStateGateway {
    encoder: Arc<dyn StreamControl>,
    platform: Arc<dyn VideoPlatform>,
}

impl fmt::Debug for RemoteStateGateway {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteStateGateway").finish_non_exhaustive()
    }
}

impl RemoteStateGateway {
    pub fn new(encoder: Arc<dyn StreamControl>, platform: Arc<dyn VideoPlatform>) -> Self {
        Self { encoder, platform }
    }

    pub fn from_config(config: &SkywatchConfig) -> Result<Self, GatewayError> {
        Ok(Self::new(
            Arc::new(nas_client(config)?),
            Arc::new(platform_client(config)?),
        ))
    }

    pub fn platform(&self) -> Arc<dyn VideoPlatform> {
        Arc::clone(&self.platform)
    }

    pub async fn fetch_state(&self) -> Result<BroadcastState, GatewayError> {
        let encoder = self.encoder.load().await?;
        let broadcast = self.platform.current_broadcast().await?;
        let stream = match broadcast
            .as_ref()
            .and_then(|broadcast| broadcast.bound_stream_id.as_deref())
        {
            Some(stream_id) => Some(self.platform.stream(stream_id).await?),
            None => None,
        };
        Ok(BroadcastState {
            is_live: encoder.live_on,
            local_key: encoder.stream_key,
            broadcast,
            stream,
        })
    }

    pub async fn set_live(&self, live_on: bool) -> Result<(), GatewayError> {
        self.encoder
            .save(&EncoderUpdate {
                live_on: Some(live_on),
                stream_key: None,
            })
            .await
    }

    pub async fn set_stream_key(&self, key: &str) -> Result<(), GatewayError> {
        self.encoder
            .save(&EncoderUpdate {
                live_on: None,
                stream_key: Some(key.to_string()),
            })
            .await
    }

    pub async fn set_visibility(
        &self,
        broadcast_id: &str,
        visibility: Visibility,
    ) -> Result<(), GatewayError> {
        self.platform.set_visibility(broadcast_id, visibility).await
    }

    pub async fn complete_broadcast(&self, broadcast_id: &str) -> Result<(), GatewayError> {
        self.platform.complete_broadcast(broadcast_id).await
    }

    /// Creates a new broadcast and binds an ingest stream to it, reusing
    /// `stream_id` when given so the secret key stays the same.
    pub async fn recreate_broadcast(
        &self,
        request: &NewBroadcast,
        stream_id: Option<&str>,
    ) -> Result<PlatformBroadcast, GatewayError> {
        let mut broadcast = self.platform.create_broadcast(request).await?;
        let stream_id = match stream_id {
            Some(id) => id.to_string(),
            None => self.platform.create_stream(&request.title).await?.id,
        };
        self.platform.bind_stream(&broadcast.id, &stream_id).await?;
        broadcast.bound_stream_id = Some(stream_id);
        Ok(broadcast)
    }
}
