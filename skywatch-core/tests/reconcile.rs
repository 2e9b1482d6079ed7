mod common;

use std::time::Duration;

use common::{broadcast, local, settings, stream, FakeEncoder, FakePlatform, Harness, ScriptedProbe};
use skywatch_core::{
    Action, EncoderUpdate, ReconcileError, ReconcileReport, SignalKind, Verdict, Visibility,
};

#[tokio::test]
async fn healthy_pass_changes_nothing() {
    let harness = Harness::new(local(12, 0));
    let report = harness.reconciler(settings()).run().await.unwrap();

    assert!(report.should_be_on);
    assert!(report.actions.is_empty());
    assert!(harness.encoder.saves().is_empty());
    assert!(harness.platform.log().is_empty());
    assert_eq!(report.remote_health, Some(Verdict::Up));
    assert_eq!(harness.network.calls(), 1);
    assert_eq!(harness.stream.calls(), 1);
    assert!(harness.clock.sleeps().is_empty());
}

#[tokio::test]
async fn schedule_reconcile_is_idempotent() {
    let mut harness = Harness::new(local(7, 0));
    harness.encoder = FakeEncoder::new(false, "abc-123", harness.clock.clone());
    let reconciler = harness.reconciler(settings());
    let mut report = ReconcileReport::empty(local(7, 0));

    let first = reconciler
        .reconcile_schedule(&harness.state(), &mut report)
        .await
        .unwrap();
    let second = reconciler
        .reconcile_schedule(&harness.state(), &mut report)
        .await
        .unwrap();

    assert_eq!(first, Action::StartBroadcast);
    assert_eq!(second, Action::NoOp);
    assert_eq!(report.actions, vec![Action::StartBroadcast]);
    assert_eq!(
        harness.encoder.saves(),
        vec![EncoderUpdate {
            live_on: Some(true),
            stream_key: None
        }]
    );
    // warm-up after start
    assert_eq!(harness.clock.sleeps(), vec![Duration::from_secs(60)]);
}

#[tokio::test]
async fn never_starts_outside_the_window() {
    for (hour, minute) in [(5, 59), (20, 0), (23, 30)] {
        let mut harness = Harness::new(local(hour, minute));
        harness.encoder = FakeEncoder::new(false, "abc-123", harness.clock.clone());
        let report = harness.reconciler(settings()).run().await.unwrap();

        assert!(!report.should_be_on);
        assert!(report.actions.is_empty());
        assert!(harness.encoder.saves().is_empty());
        assert_eq!(harness.network.calls(), 0);
        assert_eq!(harness.stream.calls(), 0);
    }
}

#[tokio::test]
async fn stops_after_deactivation() {
    let harness = Harness::new(local(20, 5));
    let report = harness.reconciler(settings()).run().await.unwrap();

    assert_eq!(report.actions, vec![Action::StopBroadcast]);
    assert!(!harness.encoder.live_on());
    assert_eq!(harness.network.calls(), 0);
}

#[tokio::test]
async fn network_outage_bounces_anyway_after_retries() {
    let mut harness = Harness::new(local(12, 0));
    harness.network = ScriptedProbe::always(SignalKind::Network, Verdict::Down);
    let report = harness.reconciler(settings()).run().await.unwrap();

    let recovery = report.recovery.unwrap();
    assert!(!recovery.recovered);
    assert_eq!(recovery.retries_used, 40);
    // one initial sample plus one per retry
    assert_eq!(harness.network.calls(), 41);
    assert_eq!(harness.stream.calls(), 0);
    assert_eq!(
        report.actions,
        vec![Action::StopBroadcast, Action::StartBroadcast]
    );

    let mut expected = vec![Duration::from_secs(10); 40];
    expected.push(Duration::from_secs(20));
    expected.push(Duration::from_secs(60));
    assert_eq!(harness.clock.sleeps(), expected);

    assert_eq!(
        harness.encoder.saves(),
        vec![
            EncoderUpdate {
                live_on: Some(false),
                stream_key: None
            },
            EncoderUpdate {
                live_on: Some(true),
                stream_key: None
            },
        ]
    );
    assert!(harness.encoder.live_on());
    assert!(report
        .observations
        .iter()
        .any(|note| note.contains("bouncing anyway")));
}

#[tokio::test]
async fn bounce_waits_settle_delay_between_stop_and_start() {
    let mut harness = Harness::new(local(12, 0));
    harness.network = ScriptedProbe::new(
        SignalKind::Network,
        vec![Verdict::Down, Verdict::Down],
        Verdict::Up,
    );
    let report = harness.reconciler(settings()).run().await.unwrap();

    let recovery = report.recovery.unwrap();
    assert!(recovery.recovered);
    assert_eq!(recovery.retries_used, 2);
    assert_eq!(
        report.actions,
        vec![Action::StopBroadcast, Action::StartBroadcast]
    );
    let times = harness.encoder.save_times();
    assert_eq!(times.len(), 2);
    assert_eq!((times[1] - times[0]).num_seconds(), 20);
}

#[tokio::test]
async fn recovered_network_is_not_bounced_when_disabled() {
    let mut harness = Harness::new(local(12, 0));
    harness.network = ScriptedProbe::new(SignalKind::Network, vec![Verdict::Down], Verdict::Up);
    let mut settings = settings();
    settings.bounce_on_network_failure = false;
    let report = harness.reconciler(settings).run().await.unwrap();

    assert!(report.recovery.unwrap().recovered);
    assert!(report.actions.is_empty());
    assert!(harness.encoder.saves().is_empty());
}

#[tokio::test]
async fn flaky_stream_probe_recovers_without_bounce() {
    let mut harness = Harness::new(local(12, 0));
    harness.stream = ScriptedProbe::new(
        SignalKind::StreamDownload,
        vec![Verdict::Down, Verdict::Down, Verdict::Up],
        Verdict::Down,
    );
    let report = harness.reconciler(settings()).run().await.unwrap();

    assert_eq!(harness.stream.calls(), 3);
    assert!(report.actions.is_empty());
    assert!(harness.encoder.saves().is_empty());
    assert_eq!(
        harness.clock.sleeps(),
        vec![Duration::from_secs(20), Duration::from_secs(20)]
    );
    let stream_state = report
        .verdicts
        .iter()
        .find(|state| state.signal == SignalKind::StreamDownload)
        .unwrap();
    assert_eq!(stream_state.settled, Verdict::Up);
}

#[tokio::test]
async fn stream_down_with_healthy_network_is_probe_noise() {
    let mut harness = Harness::new(local(12, 0));
    harness.stream = ScriptedProbe::always(SignalKind::StreamDownload, Verdict::Down);
    let report = harness.reconciler(settings()).run().await.unwrap();

    assert_eq!(harness.stream.calls(), 6);
    // initial sample plus the recheck
    assert_eq!(harness.network.calls(), 2);
    assert!(report.actions.is_empty());
    assert!(report.recovery.is_none());
    assert!(report
        .observations
        .iter()
        .any(|note| note.contains("probe noise")));
}

#[tokio::test]
async fn stream_down_with_failed_network_recheck_bounces() {
    let mut harness = Harness::new(local(12, 0));
    harness.stream = ScriptedProbe::always(SignalKind::StreamDownload, Verdict::Down);
    harness.network = ScriptedProbe::new(
        SignalKind::Network,
        vec![Verdict::Up, Verdict::Down],
        Verdict::Up,
    );
    let report = harness.reconciler(settings()).run().await.unwrap();

    assert_eq!(report.recovery.unwrap().retries_used, 1);
    assert_eq!(
        report.actions,
        vec![Action::StopBroadcast, Action::StartBroadcast]
    );
}

#[tokio::test]
async fn rotated_key_is_pushed_to_encoder_once() {
    let mut harness = Harness::new(local(12, 0));
    harness.encoder = FakeEncoder::new(true, "xyz-999", harness.clock.clone());
    let report = harness.reconciler(settings()).run().await.unwrap();

    assert_eq!(report.actions, vec![Action::FixSecretKey]);
    assert_eq!(
        harness.encoder.saves(),
        vec![EncoderUpdate {
            live_on: None,
            stream_key: Some("abc-123".into())
        }]
    );
}

#[tokio::test]
async fn visibility_drift_is_corrected() {
    let harness = Harness::new(local(12, 0));
    let mut drifted = broadcast(local(11, 0));
    drifted.visibility = Visibility::Unlisted;
    *harness.platform.broadcast.lock().unwrap() = Some(drifted);

    let report = harness.reconciler(settings()).run().await.unwrap();

    assert_eq!(report.actions, vec![Action::FixVisibility]);
    assert_eq!(harness.platform.log(), vec!["set_visibility bc-1 public"]);
}

#[tokio::test]
async fn long_segment_is_split_on_the_same_stream() {
    let harness = Harness::new(local(18, 31));
    *harness.platform.broadcast.lock().unwrap() = Some(broadcast(local(14, 30)));

    let report = harness.reconciler(settings()).run().await.unwrap();

    assert_eq!(
        report.actions,
        vec![
            Action::SplitSegment,
            Action::StopBroadcast,
            Action::RecreateBroadcast,
            Action::StartBroadcast,
        ]
    );
    assert_eq!(
        harness.platform.log(),
        vec![
            "complete bc-1",
            "create_broadcast Ridge Cam Live",
            "bind bc-2 st-1",
        ]
    );
    let times = harness.encoder.save_times();
    assert_eq!((times[1] - times[0]).num_seconds(), 20);
    assert!(harness.encoder.live_on());
}

#[tokio::test]
async fn late_check_still_splits_a_long_segment() {
    // 5h30m from start to deactivation, checked 4h45m in
    let harness = Harness::new(local(19, 15));
    *harness.platform.broadcast.lock().unwrap() = Some(broadcast(local(14, 30)));

    let report = harness.reconciler(settings()).run().await.unwrap();

    assert_eq!(report.actions[0], Action::SplitSegment);
    assert_eq!(harness.platform.log()[0], "complete bc-1");
}

#[tokio::test]
async fn short_trailing_segment_is_extended() {
    let harness = Harness::new(local(19, 31));
    *harness.platform.broadcast.lock().unwrap() = Some(broadcast(local(15, 30)));

    let report = harness.reconciler(settings()).run().await.unwrap();

    assert!(report.actions.is_empty());
    assert!(harness.platform.log().is_empty());
    assert!(report
        .observations
        .iter()
        .any(|note| note.contains("extended")));
}

#[tokio::test]
async fn foreign_broadcast_is_left_alone() {
    let mut harness = Harness::new(local(12, 0));
    harness.encoder = FakeEncoder::new(true, "xyz-999", harness.clock.clone());
    let mut foreign = broadcast(local(6, 0));
    foreign.title = "Somebody Else".into();
    foreign.visibility = Visibility::Private;
    *harness.platform.broadcast.lock().unwrap() = Some(foreign);

    let report = harness.reconciler(settings()).run().await.unwrap();

    assert!(report.actions.is_empty());
    assert!(harness.encoder.saves().is_empty());
    assert!(harness.platform.log().is_empty());
    assert_eq!(
        report
            .observations
            .iter()
            .filter(|note| note.contains("unexpected broadcast title"))
            .count(),
        1
    );
}

#[tokio::test]
async fn dry_run_reports_without_mutating() {
    let mut harness = Harness::new(local(12, 0));
    harness.encoder = FakeEncoder::new(false, "xyz-999", harness.clock.clone());
    let mut settings = settings();
    settings.dry_run = true;
    let report = harness.reconciler(settings).run().await.unwrap();

    assert!(report.dry_run);
    assert_eq!(
        report.actions,
        vec![Action::FixSecretKey, Action::StartBroadcast]
    );
    assert!(harness.encoder.saves().is_empty());
    assert!(harness.clock.sleeps().is_empty());
}

#[tokio::test]
async fn remote_failure_aborts_the_pass() {
    let harness = Harness::new(local(12, 0));
    *harness.platform.unauthorized.lock().unwrap() = true;

    let err = harness.reconciler(settings()).run().await.unwrap_err();

    assert!(matches!(err, ReconcileError::Gateway(ref e) if e.is_unauthorized()));
    assert!(harness.encoder.saves().is_empty());
}

#[tokio::test]
async fn no_bound_broadcast_skips_platform_checks() {
    let mut harness = Harness::new(local(12, 0));
    harness.platform = FakePlatform::with(None, Some(stream("abc-123")));
    let report = harness.reconciler(settings()).run().await.unwrap();

    assert!(report.actions.is_empty());
    assert_eq!(report.remote_health, None);
}
