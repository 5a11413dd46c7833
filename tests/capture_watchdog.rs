use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use crossbeam_channel::bounded;

use nvr_pipeline::capture::{CaptureWatchdog, DecoderCommand, RestartReason, WatchdogTimings};
use nvr_pipeline::frame::{frame_name, FrameShape};
use nvr_pipeline::{now_timestamp, CameraHealthMetrics, FrameArena, Signal, WatchdogState};

fn timings() -> WatchdogTimings {
    WatchdogTimings {
        retry_interval: Duration::from_millis(100),
        stall_timeout: Duration::from_secs(20),
        terminate_timeout: Duration::from_secs(5),
    }
}

fn camera_name(tag: &str) -> String {
    format!("wd{}{}{:04x}", tag, std::process::id(), rand::random::<u16>())
}

#[test]
fn silent_decoder_is_restarted_once_after_stall_timeout() -> Result<()> {
    let (tx, _rx) = bounded(2);
    let metrics = Arc::new(CameraHealthMetrics::new());
    let mut watchdog = CaptureWatchdog::new(
        &camera_name("stall"),
        DecoderCommand::new("sleep", vec!["30".to_string()]),
        FrameShape::new(4, 4),
        timings(),
        5,
        4,
        tx,
        metrics.clone(),
        Arc::new(Signal::new()),
    );
    watchdog.start()?;
    let first_pid = metrics.decoder_pid.load(std::sync::atomic::Ordering::Acquire);
    assert!(first_pid > 0);

    let now = now_timestamp();
    assert_eq!(watchdog.tick(now + 21.0), Some(RestartReason::Stalled));
    assert_eq!(metrics.restarts(), 1);
    assert_eq!(metrics.camera_fps.load(), 0.0);
    assert_eq!(metrics.state(), WatchdogState::Restarting);
    let second_pid = metrics.decoder_pid.load(std::sync::atomic::Ordering::Acquire);
    assert!(second_pid > 0);
    assert_ne!(first_pid, second_pid);

    // The relaunch reseeded the frame clock, so the next tick is quiet.
    assert_eq!(watchdog.tick(now_timestamp()), None);
    assert_eq!(metrics.restarts(), 1);

    watchdog.shutdown();
    Ok(())
}

#[test]
fn decoder_frames_reach_queue_and_shared_memory() -> Result<()> {
    let shape = FrameShape::new(8, 8);
    let frames = 3;
    let camera = camera_name("feed");
    // 3 frames of 0x2a, then stay alive like a quiet stream.
    let script = format!(
        "head -c {} /dev/zero | tr '\\000' '*'; sleep 30",
        shape.yuv_size() * frames
    );
    let (tx, rx) = bounded(8);
    let metrics = Arc::new(CameraHealthMetrics::new());
    let mut watchdog = CaptureWatchdog::new(
        &camera,
        DecoderCommand::new("sh", vec!["-c".to_string(), script]),
        shape,
        timings(),
        5,
        10,
        tx,
        metrics.clone(),
        Arc::new(Signal::new()),
    );
    watchdog.start()?;

    let mut arena = FrameArena::new();
    let mut received = Vec::new();
    while received.len() < frames {
        let frame_time = rx.recv_timeout(Duration::from_secs(10))?;
        let name = frame_name(&camera, frame_time);
        let bytes = arena.get(&name, shape.yuv_size()).map(|b| b.to_vec());
        assert_eq!(bytes, Some(vec![b'*'; shape.yuv_size()]));
        received.push(frame_time);
    }
    assert!(received.windows(2).all(|w| w[0] < w[1]));

    assert_eq!(watchdog.tick(now_timestamp()), None);
    assert_eq!(metrics.state(), WatchdogState::Running);
    assert_eq!(metrics.frames_skipped(), 0);

    // Shutdown frees every frame the ring still owns.
    for frame_time in &received {
        arena.close(&frame_name(&camera, *frame_time));
    }
    watchdog.shutdown();
    let mut fresh = FrameArena::new();
    for frame_time in &received {
        assert!(fresh.get(&frame_name(&camera, *frame_time), 1).is_none());
    }
    Ok(())
}
