pub mod cleanup;
pub mod clock;
pub mod config;
pub mod error;
pub mod gateway;
pub mod probe;
pub mod reconcile;
pub mod retry;
pub mod schedule;

pub use cleanup::{CleanupError, CleanupJob, CleanupReport, DeleteReason, Deletion, DurationCache};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{
    load_skywatch_config, AstronomySection, CleanupSection, NasSection, PlatformSection,
    ProbesSection, RecoverySection, ScheduleSection, SkywatchConfig, StationSection,
};
pub use error::{ConfigError, Result};
pub use gateway::nas::NasClient;
pub use gateway::platform::{PlatformClient, PlatformCredentials};
pub use gateway::{
    nas_client, platform_client, with_reauth, BroadcastState, EncoderState, EncoderUpdate,
    GatewayError, NewBroadcast, PlatformBroadcast, Reauthenticate, RemoteStateGateway,
    StreamControl, StreamStatus, VideoPage, VideoPlatform, VideoSummary, Visibility,
};
pub use probe::hysteresis::{HysteresisEvaluator, HysteresisState, SamplingPolicy};
pub use probe::{
    classify_remote_health, CommandExecutor, HealthProbe, NetworkProbe, ProbeResult,
    RemoteHealthProbe, SignalKind, StreamDownloadProbe, SystemCommandExecutor, Verdict,
};
pub use reconcile::{
    Action, LivenessProbes, ReconcileError, ReconcileReport, ReconcileSettings, Reconciler,
};
pub use retry::{RecoveryOutcome, RetryWaiter};
pub use schedule::{
    exceeds_max_segment, format_seconds, midday_split_due, seconds_since_midnight,
    segment_decision, should_be_on, time_to_seconds, AstronomicalTimes, AstronomyError,
    AstronomySource, HttpPageFetcher, PageFetcher, ScheduleError, ScheduleEvaluator,
    ScheduleWindow, SegmentDecision, SplitReason,
};
