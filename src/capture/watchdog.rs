//! Per-camera supervision of the decoder and its capture thread.
//!
//! State machine (mirrored into `CameraHealthMetrics`):
//! - `Starting`: first decoder launched, no frame yet
//! - `Running`: the current capture thread has delivered a frame
//! - `Stalled`: no frame for longer than `stall_timeout`, or camera fps stayed
//!   at `detect.fps + 10` or above for 3 consecutive ticks
//! - `Restarting`: decoder terminated and relaunched; back to `Running` once
//!   the new capture thread reports a fresh frame
//!
//! A dead capture thread goes straight to `Restarting`. The watchdog only reads
//! metrics the capture thread publishes; it never blocks the capture path.

use anyhow::{Context, Result};
use crossbeam_channel::Sender;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use super::decoder::{DecoderCommand, DecoderProcess, LogPipe};
use super::worker::{CaptureExit, CaptureOutcome, CaptureWorker};
use crate::config::FfmpegSettings;
use crate::frame::{FrameRing, FrameShape};
use crate::metrics::{CameraHealthMetrics, WatchdogState};
use crate::sync::Signal;

/// Ticks in a row above the fps ceiling before the decoder is restarted.
const FPS_OVERFLOW_TICKS: u32 = 3;
/// Margin over the configured detect fps tolerated from the decoder.
const FPS_OVERFLOW_MARGIN: f64 = 10.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartReason {
    CaptureExited,
    Stalled,
    FpsOverflow,
}

/// Timing knobs of the watchdog.
#[derive(Debug, Clone, Copy)]
pub struct WatchdogTimings {
    pub retry_interval: Duration,
    pub stall_timeout: Duration,
    pub terminate_timeout: Duration,
}

impl From<&FfmpegSettings> for WatchdogTimings {
    fn from(ffmpeg: &FfmpegSettings) -> Self {
        Self {
            retry_interval: ffmpeg.retry_interval,
            stall_timeout: ffmpeg.stall_timeout,
            terminate_timeout: ffmpeg.terminate_timeout,
        }
    }
}

pub struct CaptureWatchdog {
    camera: String,
    command: DecoderCommand,
    shape: FrameShape,
    timings: WatchdogTimings,
    detect_fps: Arc<AtomicU32>,
    frame_queue: Sender<f64>,
    metrics: Arc<CameraHealthMetrics>,
    stop: Arc<Signal>,
    log_pipe: LogPipe,
    decoder: Option<DecoderProcess>,
    capture: Option<JoinHandle<CaptureOutcome>>,
    ring: Option<FrameRing>,
    capture_stop: Arc<Signal>,
    frames_at_launch: u64,
    fps_overflow_count: u32,
}

impl CaptureWatchdog {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        camera: &str,
        command: DecoderCommand,
        shape: FrameShape,
        timings: WatchdogTimings,
        detect_fps: u32,
        shm_frame_count: usize,
        frame_queue: Sender<f64>,
        metrics: Arc<CameraHealthMetrics>,
        stop: Arc<Signal>,
    ) -> Self {
        Self {
            camera: camera.to_string(),
            command,
            shape,
            timings,
            detect_fps: Arc::new(AtomicU32::new(detect_fps)),
            frame_queue,
            metrics,
            stop,
            log_pipe: LogPipe::new(&format!("ffmpeg.{}.detect", camera)),
            decoder: None,
            capture: None,
            ring: Some(FrameRing::new(shm_frame_count)),
            capture_stop: Arc::new(Signal::new()),
            frames_at_launch: 0,
            fps_overflow_count: 0,
        }
    }

    /// Shared handle to the detect fps used by the overflow guard; updated on
    /// config reload.
    pub fn detect_fps_handle(&self) -> Arc<AtomicU32> {
        self.detect_fps.clone()
    }

    pub fn log_pipe(&self) -> &LogPipe {
        &self.log_pipe
    }

    /// Launch decoder and capture thread, then tick until the stop signal.
    pub fn run(mut self) -> Result<()> {
        self.start()?;
        while !self.stop.wait(self.timings.retry_interval) {
            self.tick(crate::now_timestamp());
        }
        self.shutdown();
        Ok(())
    }

    pub fn start(&mut self) -> Result<()> {
        self.metrics.set_state(WatchdogState::Starting);
        self.launch()
    }

    /// One health check. Returns the restart performed, if any.
    pub fn tick(&mut self, now: f64) -> Option<RestartReason> {
        let reason = self.evaluate(now)?;
        match reason {
            RestartReason::CaptureExited => {
                log::error!("{}: ffmpeg process is not running, restarting", self.camera);
                self.log_pipe.dump();
            }
            RestartReason::Stalled => {
                log::info!(
                    "{}: no frames received in {:?}, restarting ffmpeg",
                    self.camera,
                    self.timings.stall_timeout
                );
                self.metrics.set_state(WatchdogState::Stalled);
            }
            RestartReason::FpsOverflow => {
                log::info!(
                    "{}: ffmpeg is sending frames faster than detect fps, restarting",
                    self.camera
                );
                self.metrics.set_state(WatchdogState::Stalled);
            }
        }
        if let Err(e) = self.restart() {
            log::error!("{}: failed to restart capture: {:#}", self.camera, e);
        }
        Some(reason)
    }

    fn evaluate(&mut self, now: f64) -> Option<RestartReason> {
        let capture_alive = self.capture.as_ref().is_some_and(|h| !h.is_finished());
        if !capture_alive {
            return Some(RestartReason::CaptureExited);
        }

        let frames = self.metrics.frames_captured.load(Ordering::Acquire);
        if frames > self.frames_at_launch && self.metrics.state() != WatchdogState::Running {
            self.metrics.set_state(WatchdogState::Running);
        }

        let last_frame = self.metrics.last_frame_time.load();
        if now - last_frame > self.timings.stall_timeout.as_secs_f64() {
            return Some(RestartReason::Stalled);
        }

        let ceiling = self.detect_fps.load(Ordering::Acquire) as f64 + FPS_OVERFLOW_MARGIN;
        if self.metrics.camera_fps.load() >= ceiling {
            self.fps_overflow_count += 1;
            if self.fps_overflow_count >= FPS_OVERFLOW_TICKS {
                self.fps_overflow_count = 0;
                return Some(RestartReason::FpsOverflow);
            }
        } else {
            self.fps_overflow_count = 0;
        }
        None
    }

    fn restart(&mut self) -> Result<()> {
        self.metrics.set_state(WatchdogState::Restarting);
        self.metrics.reset_capture_rates();
        self.stop_capture();
        self.metrics.restarts.fetch_add(1, Ordering::AcqRel);
        self.launch()
    }

    fn launch(&mut self) -> Result<()> {
        let mut decoder = DecoderProcess::spawn(&self.command, self.log_pipe.clone())
            .with_context(|| format!("{}: launch decoder", self.camera))?;
        let stdout = decoder.take_stdout()?;
        self.metrics
            .decoder_pid
            .store(decoder.pid() as i32, Ordering::Release);
        self.metrics.last_frame_time.store(crate::now_timestamp());
        self.frames_at_launch = self.metrics.frames_captured.load(Ordering::Acquire);
        self.decoder = Some(decoder);

        self.capture_stop = Arc::new(Signal::new());
        let ring = self
            .ring
            .take()
            .unwrap_or_else(|| FrameRing::new(crate::frame::DEFAULT_SHM_FRAME_COUNT));
        let worker = CaptureWorker::new(
            &self.camera,
            self.shape,
            stdout,
            ring,
            self.frame_queue.clone(),
            self.metrics.clone(),
            self.capture_stop.clone(),
        );
        let handle = std::thread::Builder::new()
            .name(format!("capture:{}", self.camera))
            .spawn(move || worker.run())
            .with_context(|| format!("{}: spawn capture thread", self.camera))?;
        self.capture = Some(handle);
        log::info!("{}: capture started", self.camera);
        Ok(())
    }

    /// Terminate the decoder and reap the capture thread. Killing the decoder
    /// closes its stdout, which ends the capture loop.
    fn stop_capture(&mut self) {
        if let Some(mut decoder) = self.decoder.take() {
            if let Err(e) = decoder.terminate(self.timings.terminate_timeout) {
                log::warn!("{}: {:#}", self.camera, e);
            }
        }
        self.metrics.decoder_pid.store(0, Ordering::Release);
        if let Some(handle) = self.capture.take() {
            match handle.join() {
                Ok(outcome) => {
                    if outcome.exit != CaptureExit::Stopped {
                        log::debug!("{}: capture thread ended: {:?}", self.camera, outcome.exit);
                    }
                    self.ring = Some(outcome.ring);
                }
                Err(_) => log::error!("{}: capture thread panicked", self.camera),
            }
        }
    }

    /// Stop capture for good: frames the ring still owns are deleted.
    pub fn shutdown(&mut self) {
        self.capture_stop.set();
        self.stop_capture();
        if let Some(mut ring) = self.ring.take() {
            let mut arena = crate::arena::FrameArena::new();
            for name in ring.drain() {
                let _ = arena.delete(&name);
            }
        }
        self.metrics.reset_capture_rates();
        log::info!("{}: capture watchdog exited", self.camera);
    }
}

impl Drop for CaptureWatchdog {
    fn drop(&mut self) {
        if self.decoder.is_some() || self.capture.is_some() {
            self.shutdown();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::bounded;

    fn timings() -> WatchdogTimings {
        WatchdogTimings {
            retry_interval: Duration::from_millis(50),
            stall_timeout: Duration::from_secs(20),
            terminate_timeout: Duration::from_secs(5),
        }
    }

    fn silent_decoder() -> DecoderCommand {
        DecoderCommand::new("sleep", vec!["30".to_string()])
    }

    #[test]
    fn healthy_capture_needs_no_restart() -> Result<()> {
        let (tx, _rx) = bounded(2);
        let metrics = Arc::new(CameraHealthMetrics::new());
        let mut watchdog = CaptureWatchdog::new(
            "wdok",
            silent_decoder(),
            FrameShape::new(4, 4),
            timings(),
            5,
            4,
            tx,
            metrics.clone(),
            Arc::new(Signal::new()),
        );
        watchdog.start()?;
        assert_eq!(watchdog.tick(crate::now_timestamp()), None);
        assert_eq!(metrics.restarts(), 0);
        assert_eq!(metrics.state(), WatchdogState::Starting);
        watchdog.shutdown();
        Ok(())
    }

    #[test]
    fn fps_overflow_restarts_after_three_ticks() -> Result<()> {
        let (tx, _rx) = bounded(2);
        let metrics = Arc::new(CameraHealthMetrics::new());
        let mut watchdog = CaptureWatchdog::new(
            "wdfps",
            silent_decoder(),
            FrameShape::new(4, 4),
            timings(),
            5,
            4,
            tx,
            metrics.clone(),
            Arc::new(Signal::new()),
        );
        watchdog.start()?;
        let now = crate::now_timestamp();
        metrics.camera_fps.store(15.0);
        assert_eq!(watchdog.tick(now), None);
        assert_eq!(watchdog.tick(now), None);
        assert_eq!(watchdog.tick(now), Some(RestartReason::FpsOverflow));
        assert_eq!(metrics.restarts(), 1);
        assert_eq!(metrics.camera_fps.load(), 0.0);

        // A single tick under the ceiling resets the streak.
        metrics.camera_fps.store(15.0);
        assert_eq!(watchdog.tick(now), None);
        metrics.camera_fps.store(5.0);
        assert_eq!(watchdog.tick(now), None);
        metrics.camera_fps.store(15.0);
        assert_eq!(watchdog.tick(now), None);
        assert_eq!(watchdog.tick(now), None);
        assert_eq!(metrics.restarts(), 1);
        watchdog.shutdown();
        Ok(())
    }

    #[test]
    fn exited_decoder_is_relaunched() -> Result<()> {
        let (tx, _rx) = bounded(2);
        let metrics = Arc::new(CameraHealthMetrics::new());
        let mut watchdog = CaptureWatchdog::new(
            "wdexit",
            DecoderCommand::new("true", Vec::new()),
            FrameShape::new(4, 4),
            timings(),
            5,
            4,
            tx,
            metrics.clone(),
            Arc::new(Signal::new()),
        );
        watchdog.start()?;
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while watchdog.capture.as_ref().is_some_and(|h| !h.is_finished()) {
            assert!(std::time::Instant::now() < deadline, "capture thread never ended");
            std::thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(
            watchdog.tick(crate::now_timestamp()),
            Some(RestartReason::CaptureExited)
        );
        assert_eq!(metrics.restarts(), 1);
        watchdog.shutdown();
        Ok(())
    }
}
