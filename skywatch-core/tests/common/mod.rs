#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, FixedOffset, NaiveDate, TimeZone, Utc};
use skywatch_core::{
    BroadcastState, Clock, EncoderState, EncoderUpdate, GatewayError, HealthProbe, LivenessProbes, ManualClock,
    NewBroadcast, PlatformBroadcast, ProbeResult, ReconcileSettings, Reconciler,
    RemoteStateGateway, SamplingPolicy, ScheduleWindow, SignalKind, StreamControl, StreamStatus,
    Verdict, VideoPage, VideoPlatform, Visibility,
};

pub const TITLE: &str = "Ridge Cam Live";

pub fn local(hour: u32, minute: u32) -> DateTime<FixedOffset> {
    FixedOffset::west_opt(6 * 3600)
        .unwrap()
        .with_ymd_and_hms(2024, 6, 1, hour, minute, 0)
        .unwrap()
}

/// 06:00 to 20:00, four hour segments, one hour grace.
pub fn window() -> ScheduleWindow {
    ScheduleWindow {
        date: NaiveDate::from_ymd_opt(2024, 6, 1).unwrap(),
        activation: 6 * 3600,
        deactivation: 20 * 3600,
        max_segment: Duration::from_secs(4 * 3600),
        grace: Duration::from_secs(3600),
        midday_split: false,
    }
}

pub fn settings() -> ReconcileSettings {
    ReconcileSettings {
        network_policy: SamplingPolicy::hairtrigger(),
        stream_policy: SamplingPolicy::new(6, Duration::from_secs(20)),
        retry_interval: Duration::from_secs(10),
        max_retries: 40,
        bounce_on_network_failure: true,
        warmup: Duration::from_secs(60),
        settle: Duration::from_secs(20),
        broadcast_title: TITLE.to_string(),
        desired_visibility: Visibility::Public,
        dry_run: false,
    }
}

pub fn broadcast(started_at: DateTime<FixedOffset>) -> PlatformBroadcast {
    let started_at = started_at.with_timezone(&Utc);
    PlatformBroadcast {
        id: "bc-1".into(),
        title: TITLE.into(),
        visibility: Visibility::Public,
        life_cycle: "live".into(),
        bound_stream_id: Some("st-1".into()),
        created_at: started_at,
        actual_start: Some(started_at),
    }
}

pub fn stream(key: &str) -> StreamStatus {
    StreamStatus {
        id: "st-1".into(),
        stream_key: key.into(),
        status: "active".into(),
        health: "good".into(),
    }
}

pub struct FakeEncoder {
    state: Mutex<EncoderState>,
    saves: Mutex<Vec<(EncoderUpdate, DateTime<FixedOffset>)>>,
    clock: Arc<ManualClock>,
}

impl FakeEncoder {
    pub fn new(live_on: bool, key: &str, clock: Arc<ManualClock>) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(EncoderState {
                live_on,
                stream_key: key.into(),
            }),
            saves: Mutex::new(Vec::new()),
            clock,
        })
    }

    pub fn saves(&self) -> Vec<EncoderUpdate> {
        self.saves
            .lock()
            .unwrap()
            .iter()
            .map(|(update, _)| update.clone())
            .collect()
    }

    pub fn save_times(&self) -> Vec<DateTime<FixedOffset>> {
        self.saves.lock().unwrap().iter().map(|(_, at)| *at).collect()
    }

    pub fn live_on(&self) -> bool {
        self.state.lock().unwrap().live_on
    }
}

#[async_trait]
impl StreamControl for FakeEncoder {
    async fn load(&self) -> Result<EncoderState, GatewayError> {
        Ok(self.state.lock().unwrap().clone())
    }

    async fn save(&self, update: &EncoderUpdate) -> Result<(), GatewayError> {
        let mut state = self.state.lock().unwrap();
        if let Some(live_on) = update.live_on {
            state.live_on = live_on;
        }
        if let Some(key) = &update.stream_key {
            state.stream_key = key.clone();
        }
        self.saves
            .lock()
            .unwrap()
            .push((update.clone(), self.clock.now()));
        Ok(())
    }
}

#[derive(Default)]
pub struct FakePlatform {
    pub broadcast: Mutex<Option<PlatformBroadcast>>,
    pub streams: Mutex<HashMap<String, StreamStatus>>,
    pub pages: Mutex<HashMap<Option<String>, VideoPage>>,
    pub durations: Mutex<HashMap<String, u64>>,
    pub unauthorized: Mutex<bool>,
    log: Mutex<Vec<String>>,
    duration_lookups: Mutex<Vec<Vec<String>>>,
}

impl FakePlatform {
    pub fn with(broadcast: Option<PlatformBroadcast>, stream: Option<StreamStatus>) -> Arc<Self> {
        let platform = Self::default();
        *platform.broadcast.lock().unwrap() = broadcast;
        if let Some(stream) = stream {
            platform
                .streams
                .lock()
                .unwrap()
                .insert(stream.id.clone(), stream);
        }
        Arc::new(platform)
    }

    /// Mutating calls, in order.
    pub fn log(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }

    pub fn duration_lookups(&self) -> Vec<Vec<String>> {
        self.duration_lookups.lock().unwrap().clone()
    }

    fn push(&self, entry: String) {
        self.log.lock().unwrap().push(entry);
    }
}

#[async_trait]
impl VideoPlatform for FakePlatform {
    async fn current_broadcast(&self) -> Result<Option<PlatformBroadcast>, GatewayError> {
        if *self.unauthorized.lock().unwrap() {
            return Err(GatewayError::Unauthorized {
                service: "platform",
            });
        }
        Ok(self.broadcast.lock().unwrap().clone())
    }

    async fn stream(&self, stream_id: &str) -> Result<StreamStatus, GatewayError> {
        self.streams
            .lock()
            .unwrap()
            .get(stream_id)
            .cloned()
            .ok_or(GatewayError::Rejected {
                service: "platform",
                code: Some(404),
            })
    }

    async fn set_visibility(
        &self,
        broadcast_id: &str,
        visibility: Visibility,
    ) -> Result<(), GatewayError> {
        self.push(format!("set_visibility {broadcast_id} {visibility}"));
        Ok(())
    }

    async fn complete_broadcast(&self, broadcast_id: &str) -> Result<(), GatewayError> {
        self.push(format!("complete {broadcast_id}"));
        Ok(())
    }

    async fn create_broadcast(
        &self,
        request: &NewBroadcast,
    ) -> Result<PlatformBroadcast, GatewayError> {
        self.push(format!("create_broadcast {}", request.title));
        Ok(PlatformBroadcast {
            id: "bc-2".into(),
            title: request.title.clone(),
            visibility: request.visibility,
            life_cycle: "ready".into(),
            bound_stream_id: None,
            created_at: request.scheduled_start,
            actual_start: None,
        })
    }

    async fn create_stream(&self, title: &str) -> Result<StreamStatus, GatewayError> {
        self.push(format!("create_stream {title}"));
        Ok(StreamStatus {
            id: "st-2".into(),
            stream_key: "new-key".into(),
            status: "ready".into(),
            health: "noData".into(),
        })
    }

    async fn bind_stream(&self, broadcast_id: &str, stream_id: &str) -> Result<(), GatewayError> {
        self.push(format!("bind {broadcast_id} {stream_id}"));
        Ok(())
    }

    async fn list_videos(&self, page: Option<&str>) -> Result<VideoPage, GatewayError> {
        Ok(self
            .pages
            .lock()
            .unwrap()
            .get(&page.map(str::to_string))
            .cloned()
            .unwrap_or_default())
    }

    async fn video_durations(&self, ids: &[String]) -> Result<Vec<(String, u64)>, GatewayError> {
        self.duration_lookups.lock().unwrap().push(ids.to_vec());
        let durations = self.durations.lock().unwrap();
        Ok(ids
            .iter()
            .filter_map(|id| durations.get(id).map(|seconds| (id.clone(), *seconds)))
            .collect())
    }

    async fn delete_video(&self, video_id: &str) -> Result<(), GatewayError> {
        self.push(format!("delete {video_id}"));
        Ok(())
    }
}

/// Replays a fixed list of verdicts, then repeats `fallback`.
pub struct ScriptedProbe {
    kind: SignalKind,
    script: Mutex<VecDeque<Verdict>>,
    fallback: Verdict,
    calls: Mutex<u32>,
}

impl ScriptedProbe {
    pub fn new(kind: SignalKind, script: Vec<Verdict>, fallback: Verdict) -> Arc<Self> {
        Arc::new(Self {
            kind,
            script: Mutex::new(script.into()),
            fallback,
            calls: Mutex::new(0),
        })
    }

    pub fn always(kind: SignalKind, verdict: Verdict) -> Arc<Self> {
        Self::new(kind, Vec::new(), verdict)
    }

    pub fn calls(&self) -> u32 {
        *self.calls.lock().unwrap()
    }
}

#[async_trait]
impl HealthProbe for ScriptedProbe {
    fn kind(&self) -> SignalKind {
        self.kind
    }

    async fn probe(&self) -> ProbeResult {
        *self.calls.lock().unwrap() += 1;
        let verdict = self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(self.fallback);
        match verdict {
            Verdict::Up => ProbeResult::up(),
            Verdict::Down => ProbeResult::down("scripted failure"),
        }
    }
}

pub struct Harness {
    pub clock: Arc<ManualClock>,
    pub encoder: Arc<FakeEncoder>,
    pub platform: Arc<FakePlatform>,
    pub network: Arc<ScriptedProbe>,
    pub stream: Arc<ScriptedProbe>,
}

impl Harness {
    /// Encoder on with key `abc-123`, a healthy bound broadcast started at
    /// 11:00, both probes up, clock at `now`.
    pub fn new(now: DateTime<FixedOffset>) -> Self {
        let clock = Arc::new(ManualClock::new(now));
        Self {
            encoder: FakeEncoder::new(true, "abc-123", Arc::clone(&clock)),
            platform: FakePlatform::with(Some(broadcast(local(11, 0))), Some(stream("abc-123"))),
            network: ScriptedProbe::always(SignalKind::Network, Verdict::Up),
            stream: ScriptedProbe::always(SignalKind::StreamDownload, Verdict::Up),
            clock,
        }
    }

    /// Snapshot of the fakes as the reconciler would fetch it.
    pub fn state(&self) -> BroadcastState {
        let broadcast = self.platform.broadcast.lock().unwrap().clone();
        let stream = broadcast
            .as_ref()
            .and_then(|broadcast| broadcast.bound_stream_id.clone())
            .and_then(|id| self.platform.streams.lock().unwrap().get(&id).cloned());
        let encoder = self.encoder.state.lock().unwrap().clone();
        BroadcastState {
            is_live: encoder.live_on,
            local_key: encoder.stream_key,
            broadcast,
            stream,
        }
    }

    pub fn reconciler(&self, settings: ReconcileSettings) -> Reconciler {
        let gateway = RemoteStateGateway::new(self.encoder.clone(), self.platform.clone());
        let probes = LivenessProbes {
            network: self.network.clone(),
            stream: self.stream.clone(),
        };
        Reconciler::new(settings, window(), gateway, probes, self.clock.clone())
    }
}

pub fn utc(value: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(value)
        .unwrap()
        .with_timezone(&Utc)
}
