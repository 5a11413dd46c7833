use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError};
use tempfile::NamedTempFile;

use nvr_pipeline::config::{CameraConfig, DetectorConfig, DetectorKind, ModelConfig};
use nvr_pipeline::frame::FrameShape;
use nvr_pipeline::{
    BoundingBox, CameraConfigUpdate, CameraPipelineProcess, DecoderCommand, DetectorProcess,
    FrameArena, LabelMap, PipelineContext, PipelineOutput,
};

/// Black I420 frame with one white square.
fn frame_with_square(shape: FrameShape, x: u32, y: u32, side: u32) -> Vec<u8> {
    let mut data = vec![0u8; shape.yuv_size()];
    for py in y..y + side {
        for px in x..x + side {
            data[(py * shape.width + px) as usize] = 255;
        }
    }
    for v in data[shape.luma_size()..].iter_mut() {
        *v = 128;
    }
    data
}

/// Decoder stand-in that replays one frame five times a second.
fn looping_decoder(frame: &NamedTempFile) -> DecoderCommand {
    let script = format!(
        "while :; do cat '{}' || exit 1; sleep 0.2; done",
        frame.path().display()
    );
    DecoderCommand::new("sh", vec!["-c".to_string(), script])
}

/// Wait for an output matching `pred`, deleting every frame seen on the way.
fn wait_for<F>(rx: &Receiver<PipelineOutput>, timeout: Duration, pred: F) -> Option<PipelineOutput>
where
    F: Fn(&PipelineOutput) -> bool,
{
    let mut arena = FrameArena::new();
    let deadline = Instant::now() + timeout;
    while let Some(left) = deadline.checked_duration_since(Instant::now()) {
        match rx.recv_timeout(left) {
            Ok(out) => {
                arena.delete(&out.frame_name).unwrap();
                if pred(&out) {
                    return Some(out);
                }
            }
            Err(RecvTimeoutError::Timeout) => return None,
            Err(RecvTimeoutError::Disconnected) => return None,
        }
    }
    None
}

#[test]
fn decoded_frames_become_tracked_objects() -> Result<()> {
    let name = format!("e2e{}{:04x}", std::process::id(), rand::random::<u16>());
    let shape = FrameShape::new(320, 240);
    let mut frame = NamedTempFile::new()?;
    std::io::Write::write_all(&mut frame, &frame_with_square(shape, 100, 80, 40))?;

    let ctx = PipelineContext::new(ModelConfig::default(), LabelMap::coco());
    let mut detector = DetectorProcess::new(
        DetectorConfig {
            name: "cpu".to_string(),
            kind: DetectorKind::Cpu,
            model_path: None,
        },
        ctx.hub.clone(),
    );
    detector.start_or_restart()?;

    let (tx, rx) = bounded(32);
    let camera = CameraConfig::new(&name, shape.width, shape.height, 5);
    let mut process = CameraPipelineProcess::start_with_command(camera, looping_decoder(&frame), &ctx, tx)?;

    let seen = wait_for(&rx, Duration::from_secs(20), |out| !out.objects.is_empty())
        .expect("no tracked object within 20s");
    assert_eq!(seen.camera, name);
    let person = seen.objects.values().next().unwrap();
    assert_eq!(person.label, "person");
    assert_eq!(person.bbox, BoundingBox::new(100, 80, 140, 120));
    let first_id = person.id.clone();

    // The same object keeps its id on later frames.
    let later = wait_for(&rx, Duration::from_secs(10), |out| out.frame_time > seen.frame_time)
        .expect("no later frame");
    assert!(later.objects.contains_key(&first_id));
    assert!(process.metrics().frames_captured.load(std::sync::atomic::Ordering::Acquire) >= 2);

    process.update_config(CameraConfigUpdate::Enabled(false))?;
    let disabled = wait_for(&rx, Duration::from_secs(10), |out| out.objects.is_empty())
        .expect("no empty output after disabling");
    assert!(disabled.regions.is_empty());
    assert!(disabled.motion_boxes.is_empty());
    // Nothing else is published while disabled.
    assert!(wait_for(&rx, Duration::from_secs(1), |_| true).is_none());

    process.stop();
    detector.stop();
    Ok(())
}
