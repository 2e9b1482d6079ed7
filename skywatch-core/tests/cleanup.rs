mod common;

use common::{broadcast, local, utc, FakePlatform};
use skywatch_core::{CleanupJob, CleanupSection, DeleteReason, DurationCache, VideoPage, VideoSummary};

fn video(id: &str, published: &str, live_content: &str) -> VideoSummary {
    VideoSummary {
        id: id.into(),
        title: format!("Ridge Cam Live {id}"),
        published_at: utc(published),
        live_content: live_content.into(),
    }
}

fn section() -> CleanupSection {
    CleanupSection {
        retention_days: 14,
        min_duration_seconds: 120,
        duration_cache: "durations.txt".into(),
        max_pages: 10,
    }
}

#[tokio::test]
async fn prunes_expired_and_aborted_uploads() {
    let dir = tempfile::tempdir().unwrap();
    let cache_path = dir.path().join("durations.txt");
    std::fs::write(&cache_path, "vid-short=30\n").unwrap();

    let mut live = broadcast(local(6, 0));
    live.id = "vid-live".into();
    let platform = FakePlatform::with(Some(live), None);
    {
        let mut pages = platform.pages.lock().unwrap();
        pages.insert(
            None,
            VideoPage {
                videos: vec![
                    video("vid-live", "2024-06-01T12:00:00Z", "live"),
                    video("vid-old", "2024-05-01T12:00:00Z", "none"),
                    video("vid-short", "2024-05-30T12:00:00Z", "none"),
                ],
                next_page: Some("page-2".into()),
            },
        );
        pages.insert(
            Some("page-2".into()),
            VideoPage {
                videos: vec![
                    video("vid-fresh", "2024-05-31T12:00:00Z", "none"),
                    video("vid-upcoming", "2024-06-02T12:00:00Z", "upcoming"),
                ],
                next_page: None,
            },
        );
    }
    {
        let mut durations = platform.durations.lock().unwrap();
        durations.insert("vid-old".into(), 7200);
        durations.insert("vid-fresh".into(), 14_400);
    }

    let cache = DurationCache::open(&cache_path).unwrap();
    let mut job = CleanupJob::new(platform.clone(), section(), cache, false);
    let report = job.run(utc("2024-06-01T18:00:00Z")).await.unwrap();

    assert_eq!(report.skipped_live, 2);
    assert_eq!(report.scanned, 3);
    assert_eq!(report.kept, 1);
    let deleted: Vec<(&str, DeleteReason)> = report
        .deleted
        .iter()
        .map(|deletion| (deletion.video_id.as_str(), deletion.reason))
        .collect();
    assert_eq!(
        deleted,
        vec![
            ("vid-old", DeleteReason::Expired),
            ("vid-short", DeleteReason::TooShort),
        ]
    );
    assert_eq!(platform.log(), vec!["delete vid-old", "delete vid-short"]);

    // cached ids are never looked up again
    assert_eq!(
        platform.duration_lookups(),
        vec![vec!["vid-old".to_string()], vec!["vid-fresh".to_string()]]
    );
    let reloaded = DurationCache::open(&cache_path).unwrap();
    assert_eq!(reloaded.get("vid-fresh"), Some(14_400));
    assert_eq!(reloaded.get("vid-short"), Some(30));
}

#[tokio::test]
async fn dry_run_deletes_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let platform = FakePlatform::with(None, None);
    platform.pages.lock().unwrap().insert(
        None,
        VideoPage {
            videos: vec![video("vid-old", "2024-01-01T00:00:00Z", "none")],
            next_page: None,
        },
    );

    let cache = DurationCache::open(dir.path().join("durations.txt")).unwrap();
    let mut job = CleanupJob::new(platform.clone(), section(), cache, true);
    let report = job.run(utc("2024-06-01T18:00:00Z")).await.unwrap();

    assert!(report.dry_run);
    assert_eq!(report.deleted.len(), 1);
    assert!(platform.log().is_empty());
}

#[tokio::test]
async fn page_limit_bounds_the_listing() {
    let dir = tempfile::tempdir().unwrap();
    let platform = FakePlatform::with(None, None);
    {
        let mut pages = platform.pages.lock().unwrap();
        pages.insert(
            None,
            VideoPage {
                videos: vec![video("vid-a", "2024-05-31T00:00:00Z", "none")],
                next_page: Some("p2".into()),
            },
        );
        pages.insert(
            Some("p2".into()),
            VideoPage {
                videos: vec![video("vid-b", "2024-05-31T00:00:00Z", "none")],
                next_page: Some("p3".into()),
            },
        );
    }
    let mut config = section();
    config.max_pages = 1;

    let cache = DurationCache::open(dir.path().join("durations.txt")).unwrap();
    let mut job = CleanupJob::new(platform, config, cache, false);
    let report = job.run(utc("2024-06-01T00:00:00Z")).await.unwrap();

    assert_eq!(report.scanned, 1);
    assert_eq!(report.kept, 1);
}
