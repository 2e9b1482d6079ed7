use std::fmt;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tracing::{debug, info};
use url::Url;

use super::{
    with_reauth, EncoderState, EncoderUpdate, GatewayError, Reauthenticate, StreamControl,
};

const SERVICE: &str = "nas";
const LIVE_API: &str = "SYNO.SurveillanceStation.YoutubeLive";
const AUTH_API: &str = "SYNO.API.Auth";
/// Error codes the NAS uses for a missing, expired or revoked session.
const SESSION_ERROR_CODES: [i64; 4] = [105, 106, 107, 119];

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    success: bool,
    data: Option<T>,
    error: Option<ErrorBody>,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    code: i64,
}

#[derive(Debug, Deserialize)]
struct LoginData {
    sid: String,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
struct LiveSettings {
    live_on: bool,
    key: String,
    #[serde(default)]
    cam_id: i64,
    #[serde(default)]
    rtmp_path: String,
    #[serde(default)]
    stream_profile: i64,
}

impl LiveSettings {
    fn merged(&self, update: &EncoderUpdate) -> Self {
        let mut next = self.clone();
        if let Some(live_on) = update.live_on {
            next.live_on = live_on;
        }
        if let Some(key) = &update.stream_key {
            next.key = key.clone();
        }
        next
    }
}

fn decode<T: DeserializeOwned>(body: &str) -> Result<Option<T>, GatewayError> {
    let envelope: Envelope<T> = serde_json::from_str(body).map_err(|err| GatewayError::Decode {
        service: SERVICE,
        reason: err.to_string(),
    })?;
    if envelope.success {
        return Ok(envelope.data);
    }
    let code = envelope.error.map(|error| error.code);
    match code {
        Some(code) if SESSION_ERROR_CODES.contains(&code) => {
            Err(GatewayError::Unauthorized { service: SERVICE })
        }
        code => Err(GatewayError::Rejected {
            service: SERVICE,
            code,
        }),
    }
}

/// Client for the NAS surveillance service's live-push settings. The session
/// id lives only for the duration of one run.
pub struct NasClient {
    client: Client,
    endpoint: Url,
    username: String,
    password: String,
    sid: Mutex<Option<String>>,
}

impl fmt::Debug for NasClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NasClient")
            .field("endpoint", &self.endpoint.as_str())
            .field("username", &self.username)
            .finish()
    }
}

impl NasClient {
    pub fn new(
        base_url: &str,
        username: impl Into<String>,
        password: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, GatewayError> {
        let endpoint = Url::parse(base_url)?.join("entry.cgi")?;
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            endpoint,
            username: username.into(),
            password: password.into(),
            sid: Mutex::new(None),
        })
    }

    async fn login(&self) -> Result<String, GatewayError> {
        let params = [
            ("api", AUTH_API.to_string()),
            ("version", "6".to_string()),
            ("method", "login".to_string()),
            ("account", self.username.clone()),
            ("passwd", self.password.clone()),
            ("session", "SurveillanceStation".to_string()),
            ("format", "sid".to_string()),
        ];
        let body = self.send(&params).await?;
        let data: LoginData = decode(&body)?.ok_or_else(|| GatewayError::Decode {
            service: SERVICE,
            reason: "login response without sid".into(),
        })?;
        info!(user = %self.username, "nas session established");
        *self.sid.lock().unwrap_or_else(PoisonError::into_inner) = Some(data.sid.clone());
        Ok(data.sid)
    }

    async fn session(&self) -> Result<String, GatewayError> {
        let cached = self.sid.lock().unwrap_or_else(PoisonError::into_inner).clone();
        match cached {
            Some(sid) => Ok(sid),
            None => self.login().await,
        }
    }

    async fn send(&self, params: &[(&str, String)]) -> Result<String, GatewayError> {
        let response = self
            .client
            .get(self.endpoint.clone())
            .query(params)
            .send()
            .await?;
        let status = response.status();
        let body = response.text().await?;
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN
        {
            return Err(GatewayError::Unauthorized { service: SERVICE });
        }
        if !status.is_success() {
            return Err(GatewayError::Status {
                service: SERVICE,
                status: status.as_u16(),
                body,
            });
        }
        Ok(body)
    }

    async fn live_call(
        &self,
        method: &str,
        extra: &[(&str, String)],
    ) -> Result<String, GatewayError> {
        let sid = self.session().await?;
        let mut params = vec![
            ("api", LIVE_API.to_string()),
            ("version", "1".to_string()),
            ("method", method.to_string()),
            ("_sid", sid),
        ];
        params.extend(extra.iter().cloned());
        self.send(&params).await
    }

    async fn load_settings(&self) -> Result<LiveSettings, GatewayError> {
        let body = self.live_call("Load", &[]).await?;
        decode::<LiveSettings>(&body)?.ok_or_else(|| GatewayError::Decode {
            service: SERVICE,
            reason: "Load response without data".into(),
        })
    }

    async fn save_settings(&self, settings: &LiveSettings) -> Result<(), GatewayError> {
        let extra = [
            ("live_on", settings.live_on.to_string()),
            ("key", settings.key.clone()),
            ("cam_id", settings.cam_id.to_string()),
            ("rtmp_path", settings.rtmp_path.clone()),
            ("stream_profile", settings.stream_profile.to_string()),
        ];
        let body = self.live_call("Save", &extra).await?;
        decode::<serde_json::Value>(&body)?;
        Ok(())
    }

    async fn update_once(&self, update: &EncoderUpdate) -> Result<(), GatewayError> {
        let current = self.load_settings().await?;
        let next = current.merged(update);
        if next == current {
            debug!("nas settings already match requested update");
            return Ok(());
        }
        self.save_settings(&next).await
    }
}

#[async_trait]
impl Reauthenticate for NasClient {
    async fn reauthenticate(&self) -> Result<(), GatewayError> {
        *self.sid.lock().unwrap_or_else(PoisonError::into_inner) = None;
        self.login().await.map(|_| ())
    }
}

#[async_trait]
impl StreamControl for NasClient {
    async fn load(&self) -> Result<EncoderState, GatewayError> {
        let settings = with_reauth(self, "nas load", || self.load_settings()).await?;
        Ok(EncoderState {
            live_on: settings.live_on,
            stream_key: settings.key,
        })
    }

    async fn save(&self, update: &EncoderUpdate) -> Result<(), GatewayError> {
        with_reauth(self, "nas save", || self.update_once(update)).await
    }
}
