use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, FixedOffset, Utc};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::clock::Clock;
use crate::config::SkywatchConfig;
use crate::gateway::{
    BroadcastState, GatewayError, NewBroadcast, PlatformBroadcast, RemoteStateGateway, Visibility,
};
use crate::probe::hysteresis::{HysteresisEvaluator, HysteresisState, SamplingPolicy};
use crate::probe::{
    CommandExecutor, HealthProbe, NetworkProbe, RemoteHealthProbe, StreamDownloadProbe, Verdict,
};
use crate::retry::{RecoveryOutcome, RetryWaiter};
use crate::schedule::{
    format_seconds, seconds_since_midnight, segment_decision, should_be_on, ScheduleWindow,
    SegmentDecision,
};

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("remote call failed: {0}")]
    Gateway(#[from] GatewayError),
    #[error("invalid stream error pattern: {0}")]
    Pattern(#[from] regex::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    NoOp,
    StartBroadcast,
    StopBroadcast,
    RecreateBroadcast,
    FixSecretKey,
    FixVisibility,
    SplitSegment,
}

/// What one pass saw and did.
#[derive(Debug, Clone, Serialize)]
pub struct ReconcileReport {
    pub started_at: DateTime<FixedOffset>,
    pub should_be_on: bool,
    pub dry_run: bool,
    pub actions: Vec<Action>,
    pub observations: Vec<String>,
    pub verdicts: Vec<HysteresisState>,
    pub remote_health: Option<Verdict>,
    pub recovery: Option<RecoveryOutcome>,
}

impl ReconcileReport {
    fn new(started_at: DateTime<FixedOffset>, should_be_on: bool, dry_run: bool) -> Self {
        Self {
            started_at,
            should_be_on,
            dry_run,
            actions: Vec::new(),
            observations: Vec::new(),
            verdicts: Vec::new(),
            remote_health: None,
            recovery: None,
        }
    }

    /// A report for callers driving individual operations.
    pub fn empty(started_at: DateTime<FixedOffset>) -> Self {
        Self::new(started_at, false, false)
    }

    fn record(&mut self, action: Action) {
        if action != Action::NoOp {
            self.actions.push(action);
        }
    }

    fn observe(&mut self, observation: impl Into<String>) {
        self.observations.push(observation.into());
    }
}

#[derive(Debug, Clone)]
pub struct ReconcileSettings {
    pub network_policy: SamplingPolicy,
    pub stream_policy: SamplingPolicy,
    pub retry_interval: Duration,
    pub max_retries: u32,
    pub bounce_on_network_failure: bool,
    pub warmup: Duration,
    pub settle: Duration,
    pub broadcast_title: String,
    pub desired_visibility: Visibility,
    pub dry_run: bool,
}

impl ReconcileSettings {
    pub fn from_config(config: &SkywatchConfig) -> Self {
        let probes = &config.probes;
        Self {
            network_policy: SamplingPolicy::new(
                probes.network_samples,
                Duration::from_secs(probes.network_interval_seconds),
            ),
            stream_policy: SamplingPolicy::new(
                probes.stream_samples,
                Duration::from_secs(probes.stream_interval_seconds),
            ),
            retry_interval: Duration::from_secs(config.recovery.retry_interval_seconds),
            max_retries: config.recovery.max_retries,
            bounce_on_network_failure: config.recovery.bounce_on_network_failure,
            warmup: config.schedule.warmup(),
            settle: config.schedule.settle(),
            broadcast_title: config.platform.broadcast_title.clone(),
            desired_visibility: config.platform.desired_visibility,
            dry_run: false,
        }
    }
}

/// The two local liveness signals.
#[derive(Clone)]
pub struct LivenessProbes {
    pub network: Arc<dyn HealthProbe>,
    pub stream: Arc<dyn HealthProbe>,
}

impl fmt::Debug for LivenessProbes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LivenessProbes")
            .field("network", &self.network.kind())
            .field("stream", &self.stream.kind())
            .finish()
    }
}

impl LivenessProbes {
    pub fn from_config(
        config: &SkywatchConfig,
        executor: Option<Arc<dyn CommandExecutor>>,
    ) -> Result<Self, ReconcileError> {
        let probes = &config.probes;
        let network = NetworkProbe::new(
            probes.network_host.clone(),
            probes.network_port,
            Duration::from_secs(probes.network_timeout_seconds),
        );
        let stream = StreamDownloadProbe::new(
            probes.extractor.clone(),
            probes.extractor_args.clone(),
            config.platform.watch_url.clone(),
            Duration::from_secs(probes.extractor_timeout_seconds),
            &probes.error_pattern,
            executor,
        )?;
        Ok(Self {
            network: Arc::new(network),
            stream: Arc::new(stream),
        })
    }
}

/// Drives remote state toward the schedule and the liveness signals.
/// Every remote failure ends the pass.
pub struct Reconciler {
    settings: ReconcileSettings,
    window: ScheduleWindow,
    gateway: RemoteStateGateway,
    probes: LivenessProbes,
    clock: Arc<dyn Clock>,
    hysteresis: HysteresisEvaluator,
    retry: RetryWaiter,
}

impl fmt::Debug for Reconciler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reconciler")
            .field("settings", &self.settings)
            .field("window", &self.window)
            .field("probes", &self.probes)
            .finish()
    }
}

impl Reconciler {
    pub fn new(
        settings: ReconcileSettings,
        window: ScheduleWindow,
        gateway: RemoteStateGateway,
        probes: LivenessProbes,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let hysteresis = HysteresisEvaluator::new(Arc::clone(&clock));
        let retry = RetryWaiter::new(
            settings.retry_interval,
            settings.max_retries,
            Arc::clone(&clock),
        );
        Self {
            settings,
            window,
            gateway,
            probes,
            clock,
            hysteresis,
            retry,
        }
    }

    pub fn window(&self) -> &ScheduleWindow {
        &self.window
    }

    fn should_be_on(&self) -> bool {
        should_be_on(seconds_since_midnight(self.clock.now().time()), &self.window)
    }

    /// One full pass: key, schedule, then (while on air) visibility,
    /// segment length and liveness.
    pub async fn run(&self) -> Result<ReconcileReport, ReconcileError> {
        let started_at = self.clock.now();
        let should_be_on = self.should_be_on();
        let mut report = ReconcileReport::new(started_at, should_be_on, self.settings.dry_run);
        info!(
            should_be_on,
            activation = %format_seconds(self.window.activation),
            deactivation = %format_seconds(self.window.deactivation),
            dry_run = self.settings.dry_run,
            "reconcile pass started"
        );

        let state = self.gateway.fetch_state().await?;
        self.reconcile_secret_key(&state, &mut report).await?;
        let schedule_action = self.reconcile_schedule(&state, &mut report).await?;
        if !should_be_on {
            info!(actions = report.actions.len(), "off air, pass complete");
            return Ok(report);
        }

        self.reconcile_visibility(&state, &mut report).await?;
        if schedule_action == Action::StartBroadcast {
            debug!("broadcast just started, segment check skipped");
        } else {
            self.reconcile_segment_length(&state, &mut report).await?;
        }
        self.reconcile_liveness(&state, &mut report).await?;

        info!(
            actions = ?report.actions,
            observations = report.observations.len(),
            "reconcile pass complete"
        );
        Ok(report)
    }

    /// Brings the encoder's on/off flag in line with the schedule. Never
    /// starts outside the window.
    pub async fn reconcile_schedule(
        &self,
        state: &BroadcastState,
        report: &mut ReconcileReport,
    ) -> Result<Action, ReconcileError> {
        let should_be_on = self.should_be_on();
        let action = match (should_be_on, state.is_live) {
            (true, false) => Action::StartBroadcast,
            (false, true) => Action::StopBroadcast,
            _ => Action::NoOp,
        };
        match action {
            Action::StartBroadcast => {
                info!(action = ?action, "inside schedule window but encoder is off");
                self.set_live(true).await?;
                self.pause(self.settings.warmup, "warm-up").await;
            }
            Action::StopBroadcast => {
                info!(action = ?action, "outside schedule window but encoder is on");
                self.set_live(false).await?;
            }
            _ => debug!(should_be_on, "encoder already matches schedule"),
        }
        report.record(action);
        Ok(action)
    }

    /// Network first (no hysteresis by default); a network outage always
    /// ends in a bounce once the retry budget is spent or the link is back.
    /// Stream-probe failures with a healthy network are treated as probe
    /// noise.
    pub async fn reconcile_liveness(
        &self,
        state: &BroadcastState,
        report: &mut ReconcileReport,
    ) -> Result<Vec<Action>, ReconcileError> {
        let network = self
            .hysteresis
            .evaluate(self.probes.network.as_ref(), self.settings.network_policy)
            .await;
        let network_up = network.is_up();
        report.verdicts.push(network);

        let mut actions = Vec::new();
        if !network_up {
            report.observe("network probe settled down");
            actions = self.recover_network(report).await?;
        } else {
            let stream = self
                .hysteresis
                .evaluate(self.probes.stream.as_ref(), self.settings.stream_policy)
                .await;
            let stream_up = stream.is_up();
            report.verdicts.push(stream);
            if !stream_up {
                let recheck = self
                    .hysteresis
                    .evaluate(self.probes.network.as_ref(), SamplingPolicy::hairtrigger())
                    .await;
                if recheck.is_up() {
                    warn!("stream probe down while network is up, not bouncing");
                    report.observe("stream probe down with network up, treated as probe noise");
                } else {
                    report.observe("stream probe down and network recheck failed");
                    actions = self.recover_network(report).await?;
                }
                report.verdicts.push(recheck);
            }
        }

        self.observe_remote_health(state, report).await;
        Ok(actions)
    }

    async fn recover_network(
        &self,
        report: &mut ReconcileReport,
    ) -> Result<Vec<Action>, ReconcileError> {
        let hysteresis = &self.hysteresis;
        let probe = self.probes.network.as_ref();
        let policy = self.settings.network_policy;
        debug!(ceiling = ?self.retry.ceiling(), "waiting for network recovery");
        let outcome = self
            .retry
            .wait_for_recovery(|_| async move { hysteresis.evaluate(probe, policy).await.is_up() })
            .await;
        report.recovery = Some(outcome);
        if outcome.recovered {
            info!(retries = outcome.retries_used, "network recovered");
        } else {
            warn!(
                retries = outcome.retries_used,
                "network did not recover, bouncing anyway"
            );
        }
        if !self.settings.bounce_on_network_failure {
            report.observe("network outage detected, bounce disabled");
            return Ok(Vec::new());
        }
        if !outcome.recovered {
            report.observe(format!(
                "network did not recover after {} retries, bouncing anyway",
                outcome.retries_used
            ));
        }
        self.bounce(report).await
    }

    /// Stop, settle, start, warm up.
    async fn bounce(&self, report: &mut ReconcileReport) -> Result<Vec<Action>, ReconcileError> {
        info!("bouncing broadcast");
        self.set_live(false).await?;
        report.record(Action::StopBroadcast);
        self.pause(self.settings.settle, "settle").await;
        self.set_live(true).await?;
        report.record(Action::StartBroadcast);
        self.pause(self.settings.warmup, "warm-up").await;
        Ok(vec![Action::StopBroadcast, Action::StartBroadcast])
    }

    async fn observe_remote_health(&self, state: &BroadcastState, report: &mut ReconcileReport) {
        let Some(stream_id) = state.bound_stream_id() else {
            return;
        };
        let probe = RemoteHealthProbe::new(self.gateway.platform(), stream_id);
        let result = probe.probe().await;
        if let Some(reason) = &result.reason {
            report.observe(format!("platform reports {reason}"));
        }
        debug!(verdict = %result.verdict, "remote stream health");
        report.remote_health = Some(result.verdict);
    }

    /// The platform's bound stream key wins over the encoder's.
    pub async fn reconcile_secret_key(
        &self,
        state: &BroadcastState,
        report: &mut ReconcileReport,
    ) -> Result<Action, ReconcileError> {
        if self.guarded_broadcast(state, report).is_none() {
            return Ok(Action::NoOp);
        }
        let Some(remote_key) = state.secret_key() else {
            debug!("no bound stream, key check skipped");
            return Ok(Action::NoOp);
        };
        if remote_key == state.local_key {
            return Ok(Action::NoOp);
        }
        error!(
            action = ?Action::FixSecretKey,
            "platform stream key differs from encoder key, platform rotated it"
        );
        report.observe("stream key mismatch, encoder updated from platform");
        if self.settings.dry_run {
            info!("dry run: encoder key left unchanged");
        } else {
            self.gateway.set_stream_key(remote_key).await?;
        }
        report.record(Action::FixSecretKey);
        Ok(Action::FixSecretKey)
    }

    pub async fn reconcile_visibility(
        &self,
        state: &BroadcastState,
        report: &mut ReconcileReport,
    ) -> Result<Action, ReconcileError> {
        let Some(broadcast) = self.guarded_broadcast(state, report) else {
            return Ok(Action::NoOp);
        };
        let desired = self.settings.desired_visibility;
        if broadcast.visibility == desired {
            return Ok(Action::NoOp);
        }
        info!(
            action = ?Action::FixVisibility,
            current = %broadcast.visibility,
            %desired,
            "broadcast visibility drifted"
        );
        if self.settings.dry_run {
            info!("dry run: visibility left unchanged");
        } else {
            self.gateway.set_visibility(&broadcast.id, desired).await?;
        }
        report.record(Action::FixVisibility);
        Ok(Action::FixVisibility)
    }

    /// Ends the current segment and opens a new broadcast on the same
    /// ingest stream once the segment is too long.
    pub async fn reconcile_segment_length(
        &self,
        state: &BroadcastState,
        report: &mut ReconcileReport,
    ) -> Result<Vec<Action>, ReconcileError> {
        let Some(broadcast) = self.guarded_broadcast(state, report) else {
            return Ok(Vec::new());
        };
        let now = self.clock.now();
        let started_at = broadcast.segment_started_at();
        match segment_decision(started_at, now, &self.window) {
            SegmentDecision::Continue => Ok(Vec::new()),
            SegmentDecision::Extend => {
                info!(%started_at, "segment over limit but close to end of day, extending");
                report.observe("segment extended to end of window");
                Ok(Vec::new())
            }
            SegmentDecision::Split(reason) => {
                info!(?reason, %started_at, broadcast = %broadcast.id, "splitting segment");
                report.observe(format!("segment split ({reason:?})"));
                report.record(Action::SplitSegment);
                self.split(broadcast, now, report).await
            }
        }
    }

    async fn split(
        &self,
        broadcast: &PlatformBroadcast,
        now: DateTime<FixedOffset>,
        report: &mut ReconcileReport,
    ) -> Result<Vec<Action>, ReconcileError> {
        self.set_live(false).await?;
        report.record(Action::StopBroadcast);
        if self.settings.dry_run {
            info!("dry run: broadcast not completed");
        } else {
            self.gateway.complete_broadcast(&broadcast.id).await?;
        }
        self.pause(self.settings.settle, "settle").await;

        let request = NewBroadcast {
            title: self.settings.broadcast_title.clone(),
            visibility: self.settings.desired_visibility,
            scheduled_start: now.with_timezone(&Utc),
        };
        if self.settings.dry_run {
            info!("dry run: broadcast not recreated");
        } else {
            let created = self
                .gateway
                .recreate_broadcast(&request, broadcast.bound_stream_id.as_deref())
                .await?;
            info!(broadcast = %created.id, "new segment broadcast created");
        }
        report.record(Action::RecreateBroadcast);

        self.set_live(true).await?;
        report.record(Action::StartBroadcast);
        self.pause(self.settings.warmup, "warm-up").await;
        Ok(vec![
            Action::SplitSegment,
            Action::StopBroadcast,
            Action::RecreateBroadcast,
            Action::StartBroadcast,
        ])
    }

    /// The bound broadcast, unless its title says it is not ours.
    fn guarded_broadcast<'a>(
        &self,
        state: &'a BroadcastState,
        report: &mut ReconcileReport,
    ) -> Option<&'a PlatformBroadcast> {
        let broadcast = state.broadcast.as_ref()?;
        if broadcast.title != self.settings.broadcast_title {
            error!(
                expected = %self.settings.broadcast_title,
                found = %broadcast.title,
                broadcast = %broadcast.id,
                "platform returned an unexpected broadcast, leaving it alone"
            );
            let note = format!("unexpected broadcast title {:?}", broadcast.title);
            if !report.observations.contains(&note) {
                report.observe(note);
            }
            return None;
        }
        Some(broadcast)
    }

    async fn set_live(&self, live_on: bool) -> Result<(), GatewayError> {
        if self.settings.dry_run {
            info!(live_on, "dry run: encoder left unchanged");
            return Ok(());
        }
        self.gateway.set_live(live_on).await
    }

    async fn pause(&self, duration: Duration, label: &str) {
        if self.settings.dry_run || duration.is_zero() {
            return;
        }
        debug!(seconds = duration.as_secs(), label, "pausing");
        self.clock.sleep(duration).await;
    }
}
