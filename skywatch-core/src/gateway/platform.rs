use std::fmt;
use std::path::PathBuf;
use std::sync::{Mutex, OnceLock, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use regex::Regex;
use reqwest::{Client, Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info, warn};
use url::Url;

use super::{
    with_reauth, GatewayError, NewBroadcast, PlatformBroadcast, Reauthenticate, StreamStatus,
    VideoPage, VideoPlatform, VideoSummary, Visibility,
};

const SERVICE: &str = "platform";

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_in: Option<u64>,
}

#[derive(Debug, Deserialize)]
#[serde(bound(deserialize = "T: DeserializeOwned"))]
struct ItemList<T> {
    #[serde(default)]
    items: Vec<T>,
    #[serde(rename = "nextPageToken", default)]
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BroadcastResource {
    id: String,
    snippet: BroadcastSnippet,
    status: BroadcastStatusBody,
    #[serde(default)]
    content_details: Option<BroadcastContent>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BroadcastSnippet {
    title: String,
    published_at: DateTime<Utc>,
    #[serde(default)]
    actual_start_time: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BroadcastStatusBody {
    privacy_status: Visibility,
    #[serde(default)]
    life_cycle_status: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BroadcastContent {
    #[serde(default)]
    bound_stream_id: Option<String>,
}

impl From<BroadcastResource> for PlatformBroadcast {
    fn from(resource: BroadcastResource) -> Self {
        PlatformBroadcast {
            id: resource.id,
            title: resource.snippet.title,
            visibility: resource.status.privacy_status,
            life_cycle: resource.status.life_cycle_status,
            bound_stream_id: resource
                .content_details
                .and_then(|details| details.bound_stream_id),
            created_at: resource.snippet.published_at,
            actual_start: resource.snippet.actual_start_time,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StreamResource {
    id: String,
    cdn: StreamCdn,
    #[serde(default)]
    status: Option<StreamStatusBody>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StreamCdn {
    ingestion_info: IngestionInfo,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct IngestionInfo {
    stream_name: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StreamStatusBody {
    stream_status: String,
    #[serde(default)]
    health_status: Option<HealthBody>,
}

#[derive(Debug, Deserialize)]
struct HealthBody {
    status: String,
}

impl From<StreamResource> for StreamStatus {
    fn from(resource: StreamResource) -> Self {
        let (status, health) = match resource.status {
            Some(body) => (
                body.stream_status,
                body.health_status
                    .map(|health| health.status)
                    .unwrap_or_else(|| "noData".to_string()),
            ),
            None => ("unknown".to_string(), "noData".to_string()),
        };
        StreamStatus {
            id: resource.id,
            stream_key: resource.cdn.ingestion_info.stream_name,
            status,
            health,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SearchResult {
    id: SearchId,
    snippet: SearchSnippet,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SearchId {
    #[serde(default)]
    video_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SearchSnippet {
    title: String,
    published_at: DateTime<Utc>,
    #[serde(default)]
    live_broadcast_content: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VideoResource {
    id: String,
    content_details: VideoContent,
}

#[derive(Debug, Deserialize)]
struct VideoContent {
    duration: String,
}

fn parse<T: DeserializeOwned>(body: &str) -> Result<T, GatewayError> {
    serde_json::from_str(body).map_err(|err| GatewayError::Decode {
        service: SERVICE,
        reason: err.to_string(),
    })
}

/// Parses an ISO-8601 duration such as `PT1H2M3S` or `P1DT2H` into seconds.
pub fn parse_iso_duration(value: &str) -> Option<u64> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    let pattern = PATTERN
        .get_or_init(|| {
            Regex::new(r"^P(?:(\d+)D)?(?:T(?:(\d+)H)?(?:(\d+)M)?(?:(\d+)S)?)?$").ok()
        })
        .as_ref()?;
    if value == "P" || value == "PT" {
        return None;
    }
    let captures = pattern.captures(value)?;
    let part = |index: usize, scale: u64| -> Option<u64> {
        match captures.get(index) {
            Some(found) => found.as_str().parse::<u64>().ok().map(|v| v * scale),
            None => Some(0),
        }
    };
    Some(part(1, 86_400)? + part(2, 3_600)? + part(3, 60)? + part(4, 1)?)
}

#[derive(Debug, Clone)]
pub struct PlatformCredentials {
    pub client_id: String,
    pub client_secret: String,
    pub refresh_token: String,
    /// Where a rotated refresh token is written back.
    pub refresh_token_path: Option<PathBuf>,
}

/// OAuth2 bearer client for the video-hosting platform. The refresh token is
/// long-lived; the access token is exchanged once per run and on rejection.
pub struct PlatformClient {
    client: Client,
    api_base: Url,
    token_url: Url,
    credentials: Mutex<PlatformCredentials>,
    access_token: Mutex<Option<String>>,
}

impl fmt::Debug for PlatformClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PlatformClient")
            .field("api_base", &self.api_base.as_str())
            .field("token_url", &self.token_url.as_str())
            .finish()
    }
}

impl PlatformClient {
    pub fn new(
        api_base: &str,
        token_url: &str,
        credentials: PlatformCredentials,
        timeout: Duration,
    ) -> Result<Self, GatewayError> {
        Ok(Self {
            client: Client::builder().timeout(timeout).build()?,
            api_base: Url::parse(api_base)?,
            token_url: Url::parse(token_url)?,
            credentials: Mutex::new(credentials),
            access_token: Mutex::new(None),
        })
    }

    async fn exchange_token(&self) -> Result<String, GatewayError> {
        let credentials = self.credentials.lock().unwrap_or_else(PoisonError::into_inner).clone();
        let form = [
            ("client_id", credentials.client_id.as_str()),
            ("client_secret", credentials.client_secret.as_str()),
            ("refresh_token", credentials.refresh_token.as_str()),
            ("grant_type", "refresh_token"),
        ];
        let response = self
            .client
            .post(self.token_url.clone())
            .form(&form)
            .send()
            .await?;
        let status = response.status();
        let body = response.text().await?;
        // a rejected exchange (invalid_grant) is fatal, never Unauthorized
        if !status.is_success() {
            return Err(GatewayError::Status {
                service: "oauth",
                status: status.as_u16(),
                body,
            });
        }
        let token: TokenResponse = parse(&body)?;
        if let Some(rotated) = token.refresh_token.filter(|value| !value.is_empty()) {
            self.store_refresh_token(&rotated).await?;
        }
        debug!(expires_in = ?token.expires_in, "access token refreshed");
        *self
            .access_token
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(token.access_token.clone());
        Ok(token.access_token)
    }

    async fn store_refresh_token(&self, rotated: &str) -> Result<(), GatewayError> {
        let path = {
            let mut guard = self.credentials.lock().unwrap_or_else(PoisonError::into_inner);
            if guard.refresh_token == rotated {
                return Ok(());
            }
            guard.refresh_token = rotated.to_string();
            guard.refresh_token_path.clone()
        };
        if let Some(path) = path {
            tokio::fs::write(&path, format!("{rotated}\n")).await?;
            info!(path = %path.display(), "refresh token rotated by platform");
        }
        Ok(())
    }

    async fn token(&self) -> Result<String, GatewayError> {
        let cached = self.access_token.lock().unwrap_or_else(PoisonError::into_inner).clone();
        match cached {
            Some(token) => Ok(token),
            None => self.exchange_token().await,
        }
    }

    async fn call(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, String)],
        body: Option<serde_json::Value>,
    ) -> Result<String, GatewayError> {
        let token = self.token().await?;
        let url = self.api_base.join(path)?;
        let mut request = self
            .client
            .request(method, url)
            .bearer_auth(token)
            .query(query);
        if let Some(body) = body {
            request = request.json(&body);
        }
        let response = request.send().await?;
        let status = response.status();
        let text = response.text().await?;
        if status == StatusCode::UNAUTHORIZED {
            return Err(GatewayError::Unauthorized { service: SERVICE });
        }
        if !status.is_success() {
            return Err(GatewayError::Status {
                service: SERVICE,
                status: status.as_u16(),
                body: text,
            });
        }
        Ok(text)
    }

    async fn broadcasts_with_status(
        &self,
        broadcast_status: &str,
    ) -> Result<Vec<PlatformBroadcast>, GatewayError> {
        let query = [
            ("part", "id,snippet,contentDetails,status".to_string()),
            ("broadcastStatus", broadcast_status.to_string()),
            ("broadcastType", "all".to_string()),
            ("maxResults", "10".to_string()),
        ];
        let body = self.call(Method::GET, "liveBroadcasts", &query, None).await?;
        let list: ItemList<BroadcastResource> = parse(&body)?;
        Ok(list.items.into_iter().map(PlatformBroadcast::from).collect())
    }

    async fn current_broadcast_once(&self) -> Result<Option<PlatformBroadcast>, GatewayError> {
        for status in ["active", "upcoming"] {
            let mut broadcasts = self.broadcasts_with_status(status).await?;
            broadcasts.sort_by(|a, b| b.created_at.cmp(&a.created_at));
            if broadcasts.len() > 1 {
                warn!(
                    count = broadcasts.len(),
                    status, "multiple broadcasts found, using the newest"
                );
            }
            if let Some(broadcast) = broadcasts.into_iter().next() {
                return Ok(Some(broadcast));
            }
        }
        Ok(None)
    }

    async fn stream_once(&self, stream_id: &str) -> Result<StreamStatus, GatewayError> {
        let query = [
            ("part", "id,cdn,status".to_string()),
            ("id", stream_id.to_string()),
        ];
        let body = self.call(Method::GET, "liveStreams", &query, None).await?;
        let list: ItemList<StreamResource> = parse(&body)?;
        list.items
            .into_iter()
            .next()
            .map(StreamStatus::from)
            .ok_or_else(|| GatewayError::Decode {
                service: SERVICE,
                reason: format!("stream {stream_id} not found"),
            })
    }

    async fn set_visibility_once(
        &self,
        broadcast_id: &str,
        visibility: Visibility,
    ) -> Result<(), GatewayError> {
        let query = [("part", "status".to_string())];
        let body = json!({
            "id": broadcast_id,
            "status": { "privacyStatus": visibility.as_str() },
        });
        self.call(Method::PUT, "videos", &query, Some(body)).await?;
        Ok(())
    }

    async fn complete_once(&self, broadcast_id: &str) -> Result<(), GatewayError> {
        let query = [
            ("broadcastStatus", "complete".to_string()),
            ("id", broadcast_id.to_string()),
            ("part", "id,status".to_string()),
        ];
        self.call(Method::POST, "liveBroadcasts/transition", &query, None)
            .await?;
        Ok(())
    }

    async fn create_broadcast_once(
        &self,
        request: &NewBroadcast,
    ) -> Result<PlatformBroadcast, GatewayError> {
        let query = [("part", "id,snippet,contentDetails,status".to_string())];
        let body = json!({
            "snippet": {
                "title": request.title,
                "scheduledStartTime": request.scheduled_start.to_rfc3339(),
            },
            "status": {
                "privacyStatus": request.visibility.as_str(),
                "selfDeclaredMadeForKids": false,
            },
            "contentDetails": {
                "enableAutoStart": true,
                "enableAutoStop": true,
            },
        });
        let text = self
            .call(Method::POST, "liveBroadcasts", &query, Some(body))
            .await?;
        let resource: BroadcastResource = parse(&text)?;
        Ok(resource.into())
    }

    async fn create_stream_once(&self, title: &str) -> Result<StreamStatus, GatewayError> {
        let query = [("part", "id,snippet,cdn,contentDetails,status".to_string())];
        let body = json!({
            "snippet": { "title": title },
            "cdn": {
                "frameRate": "variable",
                "ingestionType": "rtmp",
                "resolution": "variable",
            },
            "contentDetails": { "isReusable": true },
        });
        let text = self
            .call(Method::POST, "liveStreams", &query, Some(body))
            .await?;
        let resource: StreamResource = parse(&text)?;
        Ok(resource.into())
    }

    async fn bind_once(&self, broadcast_id: &str, stream_id: &str) -> Result<(), GatewayError> {
        let query = [
            ("id", broadcast_id.to_string()),
            ("streamId", stream_id.to_string()),
            ("part", "id,contentDetails".to_string()),
        ];
        self.call(Method::POST, "liveBroadcasts/bind", &query, None)
            .await?;
        Ok(())
    }

    async fn list_videos_once(&self, page: Option<&str>) -> Result<VideoPage, GatewayError> {
        let mut query = vec![
            ("part", "snippet".to_string()),
            ("forMine", "true".to_string()),
            ("type", "video".to_string()),
            ("order", "date".to_string()),
            ("maxResults", "50".to_string()),
        ];
        if let Some(token) = page {
            query.push(("pageToken", token.to_string()));
        }
        let body = self.call(Method::GET, "search", &query, None).await?;
        let list: ItemList<SearchResult> = parse(&body)?;
        let videos = list
            .items
            .into_iter()
            .filter_map(|item| {
                let id = item.id.video_id?;
                Some(VideoSummary {
                    id,
                    title: item.snippet.title,
                    published_at: item.snippet.published_at,
                    live_content: item.snippet.live_broadcast_content,
                })
            })
            .collect();
        Ok(VideoPage {
            videos,
            next_page: list.next_page_token,
        })
    }

    async fn durations_once(&self, ids: &[String]) -> Result<Vec<(String, u64)>, GatewayError> {
        let query = [
            ("part", "contentDetails".to_string()),
            ("id", ids.join(",")),
        ];
        let body = self.call(Method::GET, "videos", &query, None).await?;
        let list: ItemList<VideoResource> = parse(&body)?;
        Ok(list
            .items
            .into_iter()
            .filter_map(|video| {
                let seconds = parse_iso_duration(&video.content_details.duration)?;
                Some((video.id, seconds))
            })
            .collect())
    }

    async fn delete_once(&self, video_id: &str) -> Result<(), GatewayError> {
        let query = [("id", video_id.to_string())];
        self.call(Method::DELETE, "videos", &query, None).await?;
        Ok(())
    }
}

#[async_trait]
impl Reauthenticate for PlatformClient {
    async fn reauthenticate(&self) -> Result<(), GatewayError> {
        *self.access_token.lock().unwrap_or_else(PoisonError::into_inner) = None;
        self.exchange_token().await.map(|_| ())
    }
}

#[async_trait]
impl VideoPlatform for PlatformClient {
    async fn current_broadcast(&self) -> Result<Option<PlatformBroadcast>, GatewayError> {
        with_reauth(self, "current broadcast", || self.current_broadcast_once()).await
    }

    async fn stream(&self, stream_id: &str) -> Result<StreamStatus, GatewayError> {
        with_reauth(self, "stream status", || self.stream_once(stream_id)).await
    }

    async fn set_visibility(
        &self,
        broadcast_id: &str,
        visibility: Visibility,
    ) -> Result<(), GatewayError> {
        with_reauth(self, "set visibility", || {
            self.set_visibility_once(broadcast_id, visibility)
        })
        .await
    }

    async fn complete_broadcast(&self, broadcast_id: &str) -> Result<(), GatewayError> {
        with_reauth(self, "complete broadcast", || self.complete_once(broadcast_id)).await
    }

    async fn create_broadcast(
        &self,
        request: &NewBroadcast,
    ) -> Result<PlatformBroadcast, GatewayError> {
        with_reauth(self, "create broadcast", || self.create_broadcast_once(request)).await
    }

    async fn create_stream(&self, title: &str) -> Result<StreamStatus, GatewayError> {
        with_reauth(self, "create stream", || self.create_stream_once(title)).await
    }

    async fn bind_stream(&self, broadcast_id: &str, stream_id: &str) -> Result<(), GatewayError> {
        with_reauth(self, "bind stream", || self.bind_once(broadcast_id, stream_id)).await
    }

    async fn list_videos(&self, page: Option<&str>) -> Result<VideoPage, GatewayError> {
        with_reauth(self, "list videos", || self.list_videos_once(page)).await
    }

    async fn video_durations(&self, ids: &[String]) -> Result<Vec<(String, u64)>, GatewayError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        with_reauth(self, "video durations", || self.durations_once(ids)).await
    }

    async fn delete_video(&self, video_id: &str) -> Result<(), GatewayError> {
        with_reauth(self, "delete video", || self.delete_once(video_id)).await
    }
}
