//! Integration tests for FrameProvider
//!
//! Drives the provider through the scripted backend and checks the state
//! machine, the restart policy and the handoff channel.

use crabframe::testing::{Exhaustion, ScriptedBackend, Step};
use crabframe::{
    CodeClassifier, DeviceError, DeviceErrorCode, ErrorClass, FrameProvider, FrameType,
    ProviderError, ProviderSettings, ProviderState, StreamConfiguration, VideoFormat,
};
use std::thread;
use std::time::{Duration, Instant};

const TIMEOUT: Duration = Duration::from_secs(5);

fn fast_settings() -> ProviderSettings {
    ProviderSettings {
        max_restart_retries: 4,
        restart_delay: Duration::from_millis(10),
    }
}

fn stream_config() -> StreamConfiguration {
    StreamConfiguration::new()
        .format(VideoFormat::H264)
        .resolution(1920, 1080)
        .framerate(30)
}

fn provider(backend: &ScriptedBackend) -> FrameProvider<ScriptedBackend> {
    FrameProvider::with_settings(
        backend.clone(),
        stream_config(),
        fast_settings(),
        CodeClassifier::default(),
    )
}

fn wait_for_state(
    provider: &FrameProvider<ScriptedBackend>,
    state: ProviderState,
    timeout: Duration,
) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if provider.state() == state {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    provider.state() == state
}

#[test]
fn test_start_then_stop_produces_no_frame() {
    let backend = ScriptedBackend::with_steps([Step::Hold]);
    let provider = provider(&backend);
    let frames = provider.frames();
    assert_eq!(provider.state(), ProviderState::Init);

    provider.start().unwrap();
    assert_eq!(provider.state(), ProviderState::Started);
    assert!(backend.wait_for_holds(1, TIMEOUT));
    assert!(provider.is_running());

    let releaser = {
        let backend = backend.clone();
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(100));
            backend.release_hold();
        })
    };
    provider.stop();
    releaser.join().unwrap();

    assert_eq!(provider.state(), ProviderState::Stopped);
    assert!(!provider.is_running());
    assert!(frames.try_recv().is_err());

    let counters = backend.counters();
    assert_eq!(counters.opens, 1);
    assert_eq!(counters.stops, 1);
    assert_eq!(counters.releases, 1);
}

#[test]
fn test_first_frame_moves_to_running() {
    let backend = ScriptedBackend::new();
    let provider = provider(&backend);
    let frames = provider.frames();

    provider.start().unwrap();
    let frame = frames.recv_timeout(TIMEOUT).unwrap();
    assert_eq!(frame.sequence, 1);
    assert_eq!(frame.frame_type, FrameType::H264Idr);
    assert!(!frame.is_error());
    assert!(wait_for_state(&provider, ProviderState::Running, TIMEOUT));

    provider.stop();
    assert_eq!(provider.state(), ProviderState::Stopped);
}

#[test]
fn test_expected_error_restarts_and_resumes() {
    let backend = ScriptedBackend::with_steps([
        Step::Frame(FrameType::H264Idr),
        Step::Error(DeviceErrorCode::InterfaceDown),
        Step::Frame(FrameType::H264Idr),
    ]);
    let provider = provider(&backend);
    let frames = provider.frames();
    provider.start().unwrap();

    let first = frames.recv_timeout(TIMEOUT).unwrap();
    let second = frames.recv_timeout(TIMEOUT).unwrap();
    assert_eq!(first.sequence, 1);
    assert_eq!(second.sequence, 2);
    assert!(!second.is_error());
    assert_eq!(provider.restart_retries(), 0);

    let stats = provider.stats();
    assert_eq!(stats.restarts, 1);
    assert_eq!(stats.restart_failures, 0);

    let counters = backend.counters();
    assert_eq!(counters.opens, 2);
    assert_eq!(counters.releases, 1);

    provider.stop();
    assert_eq!(backend.counters().releases, 2);
}

#[test]
fn test_three_failed_restarts_then_recovery() {
    let backend = ScriptedBackend::with_steps([
        Step::Error(DeviceErrorCode::Closed),
        Step::Frame(FrameType::H264Idr),
    ])
    .open_outcomes([
        None,
        Some(DeviceErrorCode::Busy),
        Some(DeviceErrorCode::Busy),
        Some(DeviceErrorCode::Busy),
    ]);
    let provider = provider(&backend);
    let frames = provider.frames();
    provider.start().unwrap();

    let frame = frames.recv_timeout(TIMEOUT).unwrap();
    assert!(!frame.is_error());
    assert_eq!(frame.frame_type, FrameType::H264Idr);
    assert_eq!(provider.restart_retries(), 0);
    assert_ne!(provider.state(), ProviderState::Error);

    let stats = provider.stats();
    assert_eq!(stats.restart_failures, 3);
    assert_eq!(stats.restarts, 1);
    assert_eq!(backend.counters().opens, 5);

    provider.stop();
}

#[test]
fn test_four_failed_restarts_enter_error() {
    let backend = ScriptedBackend::with_steps([Step::Error(DeviceErrorCode::InterfaceDown)])
        .open_outcomes([
            None,
            Some(DeviceErrorCode::Busy),
            Some(DeviceErrorCode::Busy),
            Some(DeviceErrorCode::Busy),
            Some(DeviceErrorCode::Busy),
        ]);
    let provider = provider(&backend);
    let frames = provider.frames();
    provider.start().unwrap();

    assert!(wait_for_state(&provider, ProviderState::Error, TIMEOUT));
    assert!(frames.recv_timeout(Duration::from_millis(100)).is_err());
    assert_eq!(provider.restart_retries(), 4);

    // The thread exits instead of polling again.
    let deadline = Instant::now() + TIMEOUT;
    while provider.is_running() && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(5));
    }
    assert!(!provider.is_running());

    let counters = backend.counters();
    assert_eq!(counters.opens, 5);
    assert_eq!(counters.open_failures, 4);
    assert_eq!(counters.acquires, 1);
    assert_eq!(counters.live_sessions(), 0);

    assert!(matches!(provider.start(), Err(ProviderError::Terminal)));
    assert!(matches!(provider.restart(), Err(ProviderError::Terminal)));
    assert!(provider.is_terminal());
}

#[test]
fn test_stop_after_error_moves_to_stopped_but_stays_terminal() {
    let backend = ScriptedBackend::with_steps([Step::Error(DeviceErrorCode::InterfaceDown)])
        .open_outcomes([
            None,
            Some(DeviceErrorCode::Busy),
            Some(DeviceErrorCode::Busy),
            Some(DeviceErrorCode::Busy),
            Some(DeviceErrorCode::Busy),
        ]);
    let provider = provider(&backend);
    provider.start().unwrap();
    assert!(wait_for_state(&provider, ProviderState::Error, TIMEOUT));

    provider.stop();
    assert_eq!(provider.state(), ProviderState::Stopped);
    assert!(provider.is_terminal());
    assert!(provider.stats().terminal);

    // Stopped no longer means restartable once retries ran out.
    assert!(matches!(provider.start(), Err(ProviderError::Terminal)));
    assert!(matches!(provider.restart(), Err(ProviderError::Terminal)));
    assert_eq!(provider.state(), ProviderState::Stopped);
    assert_eq!(backend.counters().opens, 5);
    assert_eq!(backend.counters().live_sessions(), 0);
}

#[test]
fn test_unexpected_error_is_forwarded_without_restart() {
    let backend = ScriptedBackend::with_steps([
        Step::Frame(FrameType::H264Idr),
        Step::Error(DeviceErrorCode::Io),
        Step::Frame(FrameType::H264P),
    ]);
    let provider = provider(&backend);
    let frames = provider.frames();
    provider.start().unwrap();

    let first = frames.recv_timeout(TIMEOUT).unwrap();
    let failed = frames.recv_timeout(TIMEOUT).unwrap();
    let third = frames.recv_timeout(TIMEOUT).unwrap();

    assert_eq!(first.sequence, 1);
    let error = failed.error.as_ref().unwrap();
    assert_eq!(error.cause.code, DeviceErrorCode::Io);
    assert!(!error.expected);
    assert!(failed.data.is_empty());
    assert_eq!(failed.frame_type, FrameType::None);
    assert_eq!(third.sequence, 2);

    assert_eq!(backend.counters().opens, 1);
    let stats = provider.stats();
    assert_eq!(stats.errors_forwarded, 1);
    assert_eq!(stats.restarts, 0);

    provider.stop();
}

#[test]
fn test_frames_arrive_in_acquisition_order() {
    let backend = ScriptedBackend::new().gop_length(10);
    let provider = provider(&backend);
    let frames = provider.frames();
    provider.start().unwrap();

    let sequences: Vec<u64> = (0..50)
        .map(|_| frames.recv_timeout(TIMEOUT).unwrap().sequence)
        .collect();
    provider.stop();

    let expected: Vec<u64> = (1..=50).collect();
    assert_eq!(sequences, expected);
}

#[test]
fn test_stop_waits_for_blocked_acquire() {
    let backend = ScriptedBackend::with_steps([Step::Hold]);
    let provider = provider(&backend);
    provider.start().unwrap();
    assert!(backend.wait_for_holds(1, TIMEOUT));

    let releaser = {
        let backend = backend.clone();
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(150));
            backend.release_hold();
        })
    };

    let started = Instant::now();
    provider.stop();
    let elapsed = started.elapsed();
    releaser.join().unwrap();

    assert!(elapsed >= Duration::from_millis(100), "stop returned after {:?}", elapsed);
    assert_eq!(backend.counters().holds_waiting, 0);
    assert_eq!(backend.counters().releases, 1);
    assert_eq!(provider.state(), ProviderState::Stopped);
}

#[test]
fn test_stop_interrupts_blocked_send() {
    let backend = ScriptedBackend::new();
    let provider = provider(&backend);
    let frames = provider.frames();
    provider.start().unwrap();

    // Slot full and the next frame already acquired.
    assert!(backend.wait_for(TIMEOUT, |c| c.acquires >= 2));
    assert_eq!(frames.len(), 1);

    let started = Instant::now();
    provider.stop();
    assert!(started.elapsed() < Duration::from_secs(1));
    assert_eq!(provider.state(), ProviderState::Stopped);

    // Only the frame that made it into the slot is delivered.
    assert_eq!(frames.try_recv().unwrap().sequence, 1);
    assert!(frames.try_recv().is_err());
}

#[test]
fn test_owner_restart_never_runs_two_acquirers() {
    let backend = ScriptedBackend::with_steps([Step::Hold]);
    let provider = provider(&backend);
    let frames = provider.frames();
    provider.start().unwrap();
    assert!(backend.wait_for_holds(1, TIMEOUT));

    thread::scope(|s| {
        let restart = s.spawn(|| provider.restart());
        thread::sleep(Duration::from_millis(50));
        assert!(!restart.is_finished(), "restart must wait for the in-flight acquire");
        assert_eq!(backend.counters().opens, 1);
        backend.release_hold();
        restart.join().unwrap().unwrap();
    });

    let frame = frames.recv_timeout(TIMEOUT).unwrap();
    assert!(!frame.is_error());

    let counters = backend.counters();
    assert_eq!(counters.max_concurrent_acquires, 1);
    assert_eq!(counters.opens, 2);
    assert_eq!(counters.releases, 1);
    assert_eq!(provider.stats().restarts, 1);

    provider.stop();
}

#[test]
fn test_owner_restart_drops_frame_waiting_for_slot() {
    let backend = ScriptedBackend::new();
    let provider = provider(&backend);
    let frames = provider.frames();
    provider.start().unwrap();

    // Frame 1 sits in the slot, frame 2 is acquired and waiting to be sent.
    assert!(backend.wait_for(TIMEOUT, |c| c.acquires >= 2 && c.active_acquires == 0));
    provider.restart().unwrap();

    assert_eq!(frames.recv_timeout(TIMEOUT).unwrap().sequence, 1);
    assert_eq!(frames.recv_timeout(TIMEOUT).unwrap().sequence, 3);
    provider.stop();
}

#[test]
fn test_stats_include_device_info() {
    let backend = ScriptedBackend::with_steps([
        Step::Frame(FrameType::H264Idr),
        Step::Frame(FrameType::H264P),
        Step::Error(DeviceErrorCode::Io),
        Step::Hold,
    ]);
    let provider = provider(&backend);
    let frames = provider.frames();

    provider.start().unwrap();
    let device = provider.stats().device;
    assert_eq!(device["width"], 1920);
    assert_eq!(device["framerate"], 30);

    for _ in 0..3 {
        frames.recv_timeout(TIMEOUT).unwrap();
    }
    assert!(backend.wait_for_holds(1, TIMEOUT));

    let stats = provider.stats();
    assert_eq!(stats.device["statistics.frame_count"], 2);
    assert_eq!(stats.device["statistics.idrframe_count"], 1);
    assert_eq!(stats.device["statistics.failed_frames"], 1);
    assert_eq!(stats.device["height"], 1080);
    let json = serde_json::to_string(&stats).unwrap();
    assert!(json.contains("\"statistics.frame_count\":2"));

    backend.release_hold();
    provider.stop();
}

#[test]
fn test_restart_reapplies_same_settings() {
    let backend = ScriptedBackend::with_steps([
        Step::Frame(FrameType::H264Idr),
        Step::Error(DeviceErrorCode::DBus),
        Step::Frame(FrameType::H264Idr),
    ]);
    let provider = provider(&backend);
    let frames = provider.frames();
    provider.start().unwrap();
    frames.recv_timeout(TIMEOUT).unwrap();
    frames.recv_timeout(TIMEOUT).unwrap();
    provider.stop();

    let applied = backend.applied_settings();
    assert_eq!(applied.len(), 2);
    assert_eq!(applied[0], stream_config().settings());
    assert_eq!(applied[0], applied[1]);

    let keys: Vec<&str> = applied[0].iter().map(|(k, _)| *k).collect();
    assert_eq!(keys, vec!["format", "width", "height", "framerate"]);
}

#[test]
fn test_control_call_preconditions() {
    let backend = ScriptedBackend::with_steps([Step::Frame(FrameType::H264Idr)]);
    let provider = provider(&backend);

    assert!(matches!(provider.restart(), Err(ProviderError::NotStarted)));
    provider.start().unwrap();
    assert!(matches!(provider.start(), Err(ProviderError::AlreadyStarted)));
    provider.stop();
    assert!(matches!(provider.restart(), Err(ProviderError::NotStarted)));
    provider.stop();
    assert_eq!(provider.state(), ProviderState::Stopped);
}

#[test]
fn test_start_after_stop_reuses_channel() {
    let backend = ScriptedBackend::new();
    let provider = provider(&backend);
    let frames = provider.frames();

    provider.start().unwrap();
    assert!(!frames.recv_timeout(TIMEOUT).unwrap().is_error());
    provider.stop();
    while frames.try_recv().is_ok() {}

    provider.start().unwrap();
    let frame = frames.recv_timeout(TIMEOUT).unwrap();
    assert!(!frame.is_error());
    provider.stop();

    let counters = backend.counters();
    assert_eq!(counters.opens, 2);
    assert_eq!(counters.releases, 2);
}

#[test]
fn test_failed_open_leaves_state_unchanged() {
    let backend = ScriptedBackend::new().open_outcomes([Some(DeviceErrorCode::NotFound)]);
    let provider = provider(&backend);

    let err = provider.start().unwrap_err();
    assert!(matches!(err, ProviderError::Open(_)));
    assert_eq!(err.device_error().unwrap().code, DeviceErrorCode::NotFound);
    assert_eq!(provider.state(), ProviderState::Init);
    assert!(!provider.is_running());

    provider.start().unwrap();
    assert!(provider.is_running());
    provider.stop();
}

#[test]
fn test_failed_start_releases_session() {
    let backend = ScriptedBackend::new().start_outcomes([Some(DeviceErrorCode::Busy)]);
    let provider = provider(&backend);

    assert!(matches!(provider.start(), Err(ProviderError::Start(_))));
    assert_eq!(provider.state(), ProviderState::Init);

    let counters = backend.counters();
    assert_eq!(counters.opens, 1);
    assert_eq!(counters.releases, 1);
    assert_eq!(counters.live_sessions(), 0);
}

#[test]
fn test_failed_owner_restart_can_be_stopped() {
    let backend = ScriptedBackend::new();
    let provider = provider(&backend);
    let frames = provider.frames();
    provider.start().unwrap();
    frames.recv_timeout(TIMEOUT).unwrap();

    backend.fail_next_opens(1, DeviceErrorCode::Busy);
    let err = provider.restart().unwrap_err();
    assert!(matches!(err, ProviderError::Restart(_)));
    assert_eq!(provider.state(), ProviderState::Restarting);
    assert!(!provider.is_running());
    assert_eq!(backend.counters().live_sessions(), 0);

    provider.stop();
    assert_eq!(provider.state(), ProviderState::Stopped);
}

#[test]
fn test_custom_classifier_decides_restarts() {
    let backend = ScriptedBackend::with_steps([
        Step::Error(DeviceErrorCode::Io),
        Step::Frame(FrameType::H264Idr),
    ]);
    let classifier = |e: &DeviceError| {
        if e.code == DeviceErrorCode::Io {
            ErrorClass::Expected
        } else {
            ErrorClass::Unexpected
        }
    };
    let provider =
        FrameProvider::with_settings(backend.clone(), stream_config(), fast_settings(), classifier);
    let frames = provider.frames();
    provider.start().unwrap();

    let frame = frames.recv_timeout(TIMEOUT).unwrap();
    assert!(!frame.is_error());
    assert_eq!(backend.counters().opens, 2);
    provider.stop();
}

#[test]
fn test_drop_stops_provider() {
    let backend = ScriptedBackend::new().exhaustion(Exhaustion::Frames);
    {
        let provider = provider(&backend);
        let frames = provider.frames();
        provider.start().unwrap();
        frames.recv_timeout(TIMEOUT).unwrap();
    }

    let counters = backend.counters();
    assert_eq!(counters.stops, 1);
    assert_eq!(counters.releases, 1);
    assert_eq!(counters.live_sessions(), 0);
}

#[test]
fn test_stats_serialize_to_json() {
    let backend = ScriptedBackend::new();
    let provider = provider(&backend);
    let json = serde_json::to_string(&provider.stats()).unwrap();
    assert!(json.contains("\"state\":\"init\""));
    assert!(json.contains("\"restart_retries\":0"));
    assert!(json.contains("\"terminal\":false"));
    assert!(json.contains("\"device\":{}"));
}
