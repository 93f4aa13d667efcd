//! End-to-end session and manager behavior against a fake engine.
//!
//! The fakes are shell scripts standing in for ffmpeg/ffprobe, so these tests
//! exercise the real process lifecycle (spawn, watch, harvest, kill, restart)
//! without needing a transcoder installed.
#![cfg(unix)]

mod common;

use common::*;
use lanreel::streaming::encoder::SOFTWARE_PROFILE;
use lanreel::streaming::{
    EncoderSelector, EngineTools, QualityTier, SegmentFetch, SessionManager, WaitPolicy,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

fn test_policy() -> WaitPolicy {
    WaitPolicy {
        lookahead_segments: 5,
        segment_wait: Duration::from_secs(2),
        poll_interval: Duration::from_millis(50),
    }
}

fn manager(engine: &FakeEngine, ffmpeg: Option<PathBuf>, duration_secs: f64) -> SessionManager {
    manager_with(engine, ffmpeg, duration_secs, test_policy(), Duration::from_secs(900))
}

fn manager_with(
    engine: &FakeEngine,
    ffmpeg: Option<PathBuf>,
    duration_secs: f64,
    policy: WaitPolicy,
    idle_timeout: Duration,
) -> SessionManager {
    SessionManager::new(
        EngineTools {
            ffmpeg,
            ffprobe: Some(engine.ffprobe(duration_secs)),
        },
        Arc::new(EncoderSelector::fixed(SOFTWARE_PROFILE)),
        policy,
        idle_timeout,
    )
}

async fn fetch(
    session: &Arc<lanreel::streaming::TranscodeSession>,
    index: u32,
) -> SegmentFetch {
    let token = CancellationToken::new();
    session.segment(index, &token).await
}

#[tokio::test]
async fn test_session_serves_segments_and_completes() {
    let engine = FakeEngine::new();
    let ffmpeg = engine.ffmpeg(EngineBehavior::Complete { segments: 5 });
    let media = engine.media_file("clip.mkv");
    // 20s at the low tier's 4s segments: exactly 5 segments.
    let mgr = manager(&engine, Some(ffmpeg), 20.0);

    let session = mgr
        .get_or_start("clip.mkv", media, QualityTier::Low)
        .await
        .unwrap();

    assert!(session.is_ready());
    assert!(session.error().is_none());

    match fetch(&session, 0).await {
        SegmentFetch::Data(data) => assert_eq!(data.as_ref(), segment_content(0).as_slice()),
        other => panic!("expected data, got {other:?}"),
    }

    let session_clone = Arc::clone(&session);
    assert!(
        wait_until(move || session_clone.is_complete(), Duration::from_secs(3)).await,
        "session should complete after the engine exits cleanly"
    );

    // Every listed segment is servable once complete, including the last.
    assert!(matches!(fetch(&session, 4).await, SegmentFetch::Data(_)));
    assert_eq!(session.segments_cached(), 5);
}

#[tokio::test]
async fn test_manifest_is_idempotent_and_complete() {
    let engine = FakeEngine::new();
    let ffmpeg = engine.ffmpeg(EngineBehavior::Complete { segments: 5 });
    let media = engine.media_file("clip.mkv");
    let mgr = manager(&engine, Some(ffmpeg), 18.0); // ceil(18/4) = 5 segments

    let session = mgr
        .get_or_start("clip.mkv", media, QualityTier::Low)
        .await
        .unwrap();

    let first = session.manifest().expect("manifest");
    let second = session.manifest().expect("manifest");
    assert_eq!(first, second);

    assert!(first.contains("seg0004.ts"));
    assert!(!first.contains("seg0005.ts"));
    // 18 = 4*4 + 2: the last entry carries the remainder.
    assert!(first.contains("#EXTINF:2.000,\nseg0004.ts"));
    assert!(first.ends_with("#EXT-X-ENDLIST\n"));
}

#[tokio::test]
async fn test_probe_failure_leaves_session_not_ready() {
    let engine = FakeEngine::new();
    let media = engine.media_file("clip.mkv");
    let mgr = SessionManager::new(
        EngineTools {
            ffmpeg: None,
            ffprobe: Some(engine.ffprobe_failing()),
        },
        Arc::new(EncoderSelector::fixed(SOFTWARE_PROFILE)),
        test_policy(),
        Duration::from_secs(900),
    );

    let session = mgr
        .get_or_start("clip.mkv", media, QualityTier::Auto)
        .await
        .unwrap();

    assert!(!session.is_ready());
    assert!(session.manifest().is_none());
    assert!(session.error().expect("error set").contains("probe"));
    assert!(matches!(fetch(&session, 0).await, SegmentFetch::Missing));
}

#[tokio::test]
async fn test_spawn_failure_sets_error() {
    let engine = FakeEngine::new();
    let media = engine.media_file("clip.mkv");
    let missing_ffmpeg = engine.dir.path().join("no-such-ffmpeg");
    let mgr = manager(&engine, Some(missing_ffmpeg), 20.0);

    let session = mgr
        .get_or_start("clip.mkv", media, QualityTier::Low)
        .await
        .unwrap();

    // The playlist exists (probe worked) but the engine never started.
    assert!(session.is_ready());
    assert!(session
        .error()
        .expect("error set")
        .contains("failed to start transcoder"));
}

#[tokio::test]
async fn test_at_most_one_active_process() {
    let engine = FakeEngine::new();
    let ffmpeg = engine.ffmpeg(EngineBehavior::Hang { segments: 2 });
    let mgr = manager(&engine, Some(ffmpeg), 60.0);

    for (i, name) in ["a.mkv", "b.mkv", "c.mkv"].iter().enumerate() {
        let media = engine.media_file(name);
        mgr.get_or_start(name, media, QualityTier::Low).await.unwrap();
        let expected = i + 1;
        let e = &engine;
        assert!(
            wait_until(move || e.spawned_pids().len() == expected, Duration::from_secs(3)).await,
            "transcoder {expected} should have started"
        );
    }

    let pids = engine.spawned_pids();
    assert_eq!(pids.len(), 3);
    assert!(!process_alive(pids[0]), "first transcoder must be dead");
    assert!(!process_alive(pids[1]), "second transcoder must be dead");
    assert!(process_alive(pids[2]), "third transcoder must be running");

    // Only the last session survives in the registry.
    assert_eq!(mgr.session_count().await, 1);
}

#[tokio::test]
async fn test_restart_preserves_cached_segments() {
    let engine = FakeEngine::new();
    // Writes six files per run, so the five below the in-flight one are
    // harvestable while the run hangs.
    let ffmpeg = engine.ffmpeg(EngineBehavior::Hang { segments: 6 });
    let media = engine.media_file("clip.mkv");
    let mgr = manager(&engine, Some(ffmpeg), 100.0); // 25 low-tier segments

    let session = mgr
        .get_or_start("clip.mkv", media, QualityTier::Low)
        .await
        .unwrap();

    for i in 0..5 {
        match fetch(&session, i).await {
            SegmentFetch::Data(data) => assert_eq!(data.as_ref(), segment_content(i).as_slice()),
            other => panic!("segment {i}: expected data, got {other:?}"),
        }
    }

    // Far past the frontier (4 + lookahead 5): forces a restart at index 10.
    match fetch(&session, 10).await {
        SegmentFetch::Data(data) => assert_eq!(data.as_ref(), segment_content(10).as_slice()),
        other => panic!("segment 10: expected data, got {other:?}"),
    }

    let spawns = engine.spawn_lines();
    assert_eq!(spawns.len(), 2, "exactly one restart expected");
    assert!(spawns[1].contains("-start_number 10"));
    assert!(spawns[1].contains("-ss 40"), "10 segments * 4s seek offset");

    // Previously cached segments survive the restart unchanged.
    for i in 0..5 {
        match fetch(&session, i).await {
            SegmentFetch::Data(data) => assert_eq!(data.as_ref(), segment_content(i).as_slice()),
            other => panic!("segment {i} after restart: expected data, got {other:?}"),
        }
    }
}

#[tokio::test]
async fn test_seek_threshold_boundary() {
    let engine = FakeEngine::new();
    let ffmpeg = engine.ffmpeg(EngineBehavior::Hang { segments: 3 });
    let media = engine.media_file("clip.mkv");
    let mgr = manager(&engine, Some(ffmpeg), 100.0);

    let session = mgr
        .get_or_start("clip.mkv", media, QualityTier::Low)
        .await
        .unwrap();

    // Settle the frontier: segments 0 and 1 harvested, 2 in flight.
    assert!(matches!(fetch(&session, 1).await, SegmentFetch::Data(_)));

    // highest + threshold exactly: no restart, just a bounded wait.
    assert!(matches!(fetch(&session, 6).await, SegmentFetch::Missing));
    assert_eq!(engine.spawn_lines().len(), 1, "within-threshold seek must not restart");

    // One past the threshold: exactly one restart, at the requested index.
    assert!(matches!(fetch(&session, 7).await, SegmentFetch::Data(_)));
    let spawns = engine.spawn_lines();
    assert_eq!(spawns.len(), 2);
    assert!(spawns[1].contains("-start_number 7"));
    assert!(spawns[1].contains("-ss 28"));
}

#[tokio::test]
async fn test_cancellation_wins_over_timeout() {
    let engine = FakeEngine::new();
    let ffmpeg = engine.ffmpeg(EngineBehavior::Hang { segments: 1 });
    let media = engine.media_file("clip.mkv");
    let policy = WaitPolicy {
        lookahead_segments: 5,
        segment_wait: Duration::from_secs(10),
        poll_interval: Duration::from_millis(50),
    };
    let mgr = manager_with(&engine, Some(ffmpeg), 100.0, policy, Duration::from_secs(900));

    let session = mgr
        .get_or_start("clip.mkv", media, QualityTier::Low)
        .await
        .unwrap();

    let token = CancellationToken::new();
    let canceller = token.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(200)).await;
        canceller.cancel();
    });

    let started = Instant::now();
    let result = session.segment(2, &token).await;
    assert!(
        matches!(result, SegmentFetch::Cancelled),
        "expected cancelled, got {result:?}"
    );
    assert!(
        started.elapsed() < Duration::from_secs(2),
        "cancellation must not wait for the timeout"
    );
}

#[tokio::test]
async fn test_idle_sessions_are_reaped() {
    let engine = FakeEngine::new();
    let ffmpeg = engine.ffmpeg(EngineBehavior::Hang { segments: 2 });
    let media = engine.media_file("clip.mkv");
    let mgr = manager_with(
        &engine,
        Some(ffmpeg),
        60.0,
        test_policy(),
        Duration::from_millis(300),
    );

    let session = mgr
        .get_or_start("clip.mkv", media, QualityTier::Low)
        .await
        .unwrap();
    let id = session.id();
    drop(session);

    let e = &engine;
    assert!(wait_until(move || e.spawned_pids().len() == 1, Duration::from_secs(3)).await);
    let pid = engine.spawned_pids()[0];
    assert!(process_alive(pid));

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(mgr.reap_idle().await, 1);

    assert!(mgr.get(&id).await.is_none());
    assert!(!process_alive(pid), "reaped session's transcoder must be killed");
    assert_eq!(mgr.session_count().await, 0);
}

#[tokio::test]
async fn test_same_key_reuses_session() {
    let engine = FakeEngine::new();
    let ffmpeg = engine.ffmpeg(EngineBehavior::Hang { segments: 2 });
    let media = engine.media_file("clip.mkv");
    let mgr = manager(&engine, Some(ffmpeg), 60.0);

    let first = mgr
        .get_or_start("clip.mkv", media.clone(), QualityTier::Medium)
        .await
        .unwrap();
    let second = mgr
        .get_or_start("clip.mkv", media.clone(), QualityTier::Medium)
        .await
        .unwrap();

    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(engine.spawn_lines().len(), 1, "reuse must not relaunch");

    // A different tier is a different key: the old session is evicted.
    let third = mgr
        .get_or_start("clip.mkv", media, QualityTier::Low)
        .await
        .unwrap();
    assert!(!Arc::ptr_eq(&first, &third));
    assert_eq!(mgr.session_count().await, 1);
}

#[tokio::test]
async fn test_runtime_failure_captures_last_diagnostic() {
    let engine = FakeEngine::new();
    let ffmpeg = engine.ffmpeg(EngineBehavior::Fail {
        diagnostic: "Error while opening encoder for output stream",
    });
    let media = engine.media_file("clip.mkv");
    let mgr = manager(&engine, Some(ffmpeg), 60.0);

    let session = mgr
        .get_or_start("clip.mkv", media, QualityTier::Low)
        .await
        .unwrap();

    let session_clone = Arc::clone(&session);
    assert!(
        wait_until(move || session_clone.error().is_some(), Duration::from_secs(3)).await,
        "non-zero exit should set the error field"
    );
    assert!(session
        .error()
        .unwrap()
        .contains("Error while opening encoder"));
    assert!(!session.is_complete());

    // The segment written before the failure is still servable.
    assert!(matches!(fetch(&session, 0).await, SegmentFetch::Data(_)));
}

#[tokio::test]
async fn test_segment_past_end_of_stream_is_missing() {
    let engine = FakeEngine::new();
    let ffmpeg = engine.ffmpeg(EngineBehavior::Complete { segments: 5 });
    let media = engine.media_file("clip.mkv");
    let mgr = manager(&engine, Some(ffmpeg), 20.0);

    let session = mgr
        .get_or_start("clip.mkv", media, QualityTier::Low)
        .await
        .unwrap();

    let started = Instant::now();
    assert!(matches!(fetch(&session, 99).await, SegmentFetch::Missing));
    assert!(
        started.elapsed() < Duration::from_millis(500),
        "out-of-range index must fail fast"
    );
}

#[tokio::test]
async fn test_stop_disposes_immediately() {
    let engine = FakeEngine::new();
    let ffmpeg = engine.ffmpeg(EngineBehavior::Hang { segments: 2 });
    let media = engine.media_file("clip.mkv");
    let mgr = manager(&engine, Some(ffmpeg), 60.0);

    let session = mgr
        .get_or_start("clip.mkv", media, QualityTier::Low)
        .await
        .unwrap();
    let id = session.id();
    drop(session);

    let e = &engine;
    assert!(wait_until(move || e.spawned_pids().len() == 1, Duration::from_secs(3)).await);
    let pid = engine.spawned_pids()[0];

    assert!(mgr.stop(&id).await);
    assert!(!process_alive(pid));
    assert!(mgr.get(&id).await.is_none());
}
