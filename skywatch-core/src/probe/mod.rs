pub mod hysteresis;

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use serde::Serialize;
use tokio::net::TcpStream;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::debug;

use crate::gateway::VideoPlatform;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Verdict {
    Up,
    Down,
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Verdict::Up => f.write_str("up"),
            Verdict::Down => f.write_str("down"),
        }
    }
}

/// One point-in-time sample of a signal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeResult {
    pub verdict: Verdict,
    pub reason: Option<String>,
}

impl ProbeResult {
    pub fn up() -> Self {
        Self {
            verdict: Verdict::Up,
            reason: None,
        }
    }

    pub fn down(reason: impl Into<String>) -> Self {
        Self {
            verdict: Verdict::Down,
            reason: Some(reason.into()),
        }
    }

    pub fn is_up(&self) -> bool {
        self.verdict == Verdict::Up
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalKind {
    Network,
    StreamDownload,
    RemoteHealth,
}

/// A single attempt at observing one signal. Implementations never fail:
/// anything that prevents a clean answer is reported as `Down`.
#[async_trait]
pub trait HealthProbe: Send + Sync {
    fn kind(&self) -> SignalKind;
    async fn probe(&self) -> ProbeResult;
}

#[async_trait]
pub trait CommandExecutor: Send + Sync {
    async fn run(&self, command: &mut Command) -> std::io::Result<std::process::Output>;
}

#[derive(Debug, Default)]
pub struct SystemCommandExecutor;

#[async_trait]
impl CommandExecutor for SystemCommandExecutor {
    async fn run(&self, command: &mut Command) -> std::io::Result<std::process::Output> {
        command.kill_on_drop(true).output().await
    }
}

/// TCP reachability check against a well-known external host.
#[derive(Debug, Clone)]
pub struct NetworkProbe {
    host: String,
    port: u16,
    timeout: Duration,
}

impl NetworkProbe {
    pub fn new(host: impl Into<String>, port: u16, timeout: Duration) -> Self {
        Self {
            host: host.into(),
            port,
            timeout,
        }
    }
}

#[async_trait]
impl HealthProbe for NetworkProbe {
    fn kind(&self) -> SignalKind {
        SignalKind::Network
    }

    async fn probe(&self) -> ProbeResult {
        let address = (self.host.as_str(), self.port);
        match timeout(self.timeout, TcpStream::connect(address)).await {
            Ok(Ok(_)) => ProbeResult::up(),
            Ok(Err(error)) => ProbeResult::down(format!("connect {}: {error}", self.host)),
            Err(_) => ProbeResult::down(format!(
                "connect {} timed out after {}s",
                self.host,
                self.timeout.as_secs()
            )),
        }
    }
}

/// Resolves a playable URL for the live stream with an external extraction
/// tool. Up only when the tool exits cleanly with a non-empty, error-free
/// answer.
pub struct StreamDownloadProbe {
    program: PathBuf,
    args: Vec<String>,
    watch_url: String,
    timeout: Duration,
    error_pattern: Regex,
    executor: Arc<dyn CommandExecutor>,
}

impl fmt::Debug for StreamDownloadProbe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamDownloadProbe")
            .field("program", &self.program)
            .field("args", &self.args)
            .field("watch_url", &self.watch_url)
            .finish()
    }
}

impl StreamDownloadProbe {
    pub fn new(
        program: impl Into<PathBuf>,
        args: Vec<String>,
        watch_url: impl Into<String>,
        timeout: Duration,
        error_pattern: &str,
        executor: Option<Arc<dyn CommandExecutor>>,
    ) -> Result<Self, regex::Error> {
        let executor = executor.unwrap_or_else(|| Arc::new(SystemCommandExecutor));
        Ok(Self {
            program: program.into(),
            args,
            watch_url: watch_url.into(),
            timeout,
            error_pattern: Regex::new(error_pattern)?,
            executor,
        })
    }

    fn classify(&self, output: &std::process::Output) -> ProbeResult {
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return ProbeResult::down(format!(
                "extractor exited with {:?}: {}",
                output.status.code(),
                stderr.trim()
            ));
        }
        let stdout = String::from_utf8_lossy(&output.stdout);
        let resolved = stdout.trim();
        if resolved.is_empty() {
            return ProbeResult::down("extractor resolved an empty url");
        }
        if self.error_pattern.is_match(resolved) {
            return ProbeResult::down(format!("extractor payload reports an error: {resolved}"));
        }
        ProbeResult::up()
    }
}

#[async_trait]
impl HealthProbe for StreamDownloadProbe {
    fn kind(&self) -> SignalKind {
        SignalKind::StreamDownload
    }

    async fn probe(&self) -> ProbeResult {
        let mut command = Command::new(&self.program);
        command.args(&self.args).arg(&self.watch_url);
        match timeout(self.timeout, self.executor.run(&mut command)).await {
            Ok(Ok(output)) => self.classify(&output),
            Ok(Err(error)) => ProbeResult::down(format!(
                "failed to run {}: {error}",
                self.program.display()
            )),
            Err(_) => ProbeResult::down(format!(
                "extractor timed out after {}s",
                self.timeout.as_secs()
            )),
        }
    }
}

/// Maps the platform's stream status and health grade to a verdict.
pub fn classify_remote_health(status: &str, health: &str) -> ProbeResult {
    let status_ok = status.eq_ignore_ascii_case("active");
    let health_ok = matches!(health.to_ascii_lowercase().as_str(), "good" | "ok");
    if status_ok && health_ok {
        ProbeResult::up()
    } else {
        ProbeResult::down(format!("stream status {status}, health {health}"))
    }
}

/// Asks the platform for its own view of the ingest stream.
pub struct RemoteHealthProbe {
    platform: Arc<dyn VideoPlatform>,
    stream_id: String,
}

impl fmt::Debug for RemoteHealthProbe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteHealthProbe")
            .field("stream_id", &self.stream_id)
            .finish()
    }
}

impl RemoteHealthProbe {
    pub fn new(platform: Arc<dyn VideoPlatform>, stream_id: impl Into<String>) -> Self {
        Self {
            platform,
            stream_id: stream_id.into(),
        }
    }
}

#[async_trait]
impl HealthProbe for RemoteHealthProbe {
    fn kind(&self) -> SignalKind {
        SignalKind::RemoteHealth
    }

    async fn probe(&self) -> ProbeResult {
        match self.platform.stream(&self.stream_id).await {
            Ok(stream) => classify_remote_health(&stream.status, &stream.health),
            Err(error) => {
                debug!(%error, "remote health query failed");
                ProbeResult::down(format!("status query failed: {error}"))
            }
        }
    }
}
