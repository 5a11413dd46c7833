//! Rate counters and per-camera health metrics.
//!
//! `CameraHealthMetrics` is written by the capture thread and the watchdog and
//! read by health checks and the daemon. All fields are atomics so readers never
//! block the capture path.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicI32, AtomicU64, AtomicU8, Ordering};

use crate::sync::AtomicF64;

const DEFAULT_MAX_EVENTS: usize = 1000;
const DEFAULT_WINDOW_SECS: f64 = 10.0;

/// Sliding-window event rate (events per second over the last N seconds).
#[derive(Debug, Clone)]
pub struct EventsPerSecond {
    start: Option<f64>,
    max_events: usize,
    window_secs: f64,
    timestamps: VecDeque<f64>,
}

impl Default for EventsPerSecond {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_EVENTS, DEFAULT_WINDOW_SECS)
    }
}

impl EventsPerSecond {
    pub fn new(max_events: usize, window_secs: f64) -> Self {
        Self {
            start: None,
            max_events: max_events.max(1),
            window_secs,
            timestamps: VecDeque::new(),
        }
    }

    pub fn start(&mut self) {
        self.start = Some(crate::now_timestamp());
    }

    pub fn update(&mut self) {
        self.update_at(crate::now_timestamp());
    }

    pub fn eps(&mut self) -> f64 {
        self.eps_at(crate::now_timestamp())
    }

    pub fn update_at(&mut self, now: f64) {
        if self.start.is_none() {
            self.start = Some(now);
        }
        self.timestamps.push_back(now);
        while self.timestamps.len() > self.max_events {
            self.timestamps.pop_front();
        }
        self.expire(now);
    }

    pub fn eps_at(&mut self, now: f64) -> f64 {
        let start = *self.start.get_or_insert(now);
        self.expire(now);
        let mut seconds = (now - start).min(self.window_secs);
        if seconds <= 0.0 {
            seconds = 1.0;
        }
        self.timestamps.len() as f64 / seconds
    }

    fn expire(&mut self, now: f64) {
        let threshold = now - self.window_secs;
        while self.timestamps.front().is_some_and(|t| *t < threshold) {
            self.timestamps.pop_front();
        }
    }
}

/// Watchdog view of a camera's capture path.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum WatchdogState {
    Starting = 0,
    Running = 1,
    Stalled = 2,
    Restarting = 3,
}

impl WatchdogState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Running,
            2 => Self::Stalled,
            3 => Self::Restarting,
            _ => Self::Starting,
        }
    }
}

/// Shared health counters for one camera.
#[derive(Debug)]
pub struct CameraHealthMetrics {
    pub camera_fps: AtomicF64,
    pub skipped_fps: AtomicF64,
    pub detection_fps: AtomicF64,
    pub process_fps: AtomicF64,
    /// Wall-clock timestamp of the last frame read from the decoder.
    pub last_frame_time: AtomicF64,
    /// PID of the running decoder, 0 when none.
    pub decoder_pid: AtomicI32,
    pub frames_captured: AtomicU64,
    pub frames_skipped: AtomicU64,
    pub restarts: AtomicU64,
    state: AtomicU8,
}

impl Default for CameraHealthMetrics {
    fn default() -> Self {
        Self {
            camera_fps: AtomicF64::new(0.0),
            skipped_fps: AtomicF64::new(0.0),
            detection_fps: AtomicF64::new(0.0),
            process_fps: AtomicF64::new(0.0),
            last_frame_time: AtomicF64::new(0.0),
            decoder_pid: AtomicI32::new(0),
            frames_captured: AtomicU64::new(0),
            frames_skipped: AtomicU64::new(0),
            restarts: AtomicU64::new(0),
            state: AtomicU8::new(WatchdogState::Starting as u8),
        }
    }
}

impl CameraHealthMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Zero the capture-side rates. Called whenever the decoder is restarted.
    pub fn reset_capture_rates(&self) {
        self.camera_fps.store(0.0);
        self.skipped_fps.store(0.0);
    }

    pub fn state(&self) -> WatchdogState {
        WatchdogState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn set_state(&self, state: WatchdogState) {
        self.state.store(state as u8, Ordering::Release);
    }

    pub fn frames_skipped(&self) -> u64 {
        self.frames_skipped.load(Ordering::Acquire)
    }

    pub fn restarts(&self) -> u64 {
        self.restarts.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn eps_counts_events_inside_window() {
        let mut eps = EventsPerSecond::new(1000, 10.0);
        for i in 0..50 {
            eps.update_at(100.0 + i as f64 * 0.1);
        }
        // 50 events over 4.9s of history.
        let rate = eps.eps_at(104.9);
        assert!((rate - 50.0 / 4.9).abs() < 1e-6);

        // Far in the future every timestamp has expired.
        assert_eq!(eps.eps_at(200.0), 0.0);
    }

    #[test]
    fn eps_caps_history() {
        let mut eps = EventsPerSecond::new(5, 10.0);
        for i in 0..20 {
            eps.update_at(i as f64 * 0.01);
        }
        assert!(eps.timestamps.len() <= 5);
    }

    #[test]
    fn metrics_reset_zeroes_capture_rates() {
        let metrics = CameraHealthMetrics::new();
        metrics.camera_fps.store(12.0);
        metrics.skipped_fps.store(3.0);
        metrics.reset_capture_rates();
        assert_eq!(metrics.camera_fps.load(), 0.0);
        assert_eq!(metrics.skipped_fps.load(), 0.0);
        assert_eq!(metrics.state(), WatchdogState::Starting);
    }
}
