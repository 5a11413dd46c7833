//! Capture loop: decoder stdout -> shared-memory frames -> frame-time queue.

use crossbeam_channel::{Sender, TrySendError};
use std::io::{self, Read};
use std::sync::atomic::Ordering;
use std::sync::Arc;

use crate::arena::FrameArena;
use crate::frame::{frame_name, FrameRing, FrameShape};
use crate::metrics::{CameraHealthMetrics, EventsPerSecond};
use crate::sync::Signal;

/// Consecutive failed reads tolerated before the worker gives up.
const MAX_READ_ERRORS: u32 = 10;

/// Why a capture loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureExit {
    /// The stop signal was raised.
    Stopped,
    /// The decoder closed its stdout (exited or was killed).
    DecoderExited,
    /// Reads kept failing without the stream closing.
    ReadErrors,
    /// Nobody consumes frames any more.
    QueueClosed,
}

/// Result of a finished capture loop. The ring is handed back so a restarted
/// worker keeps bounding the same set of live frames.
pub struct CaptureOutcome {
    pub exit: CaptureExit,
    pub ring: FrameRing,
}

/// Reads fixed-size frames from a decoder stream into the frame arena.
pub struct CaptureWorker<R: Read> {
    camera: String,
    shape: FrameShape,
    reader: R,
    arena: FrameArena,
    ring: FrameRing,
    frame_queue: Sender<f64>,
    metrics: Arc<CameraHealthMetrics>,
    stop: Arc<Signal>,
    frame_rate: EventsPerSecond,
    skipped_rate: EventsPerSecond,
}

impl<R: Read> CaptureWorker<R> {
    pub fn new(
        camera: &str,
        shape: FrameShape,
        reader: R,
        ring: FrameRing,
        frame_queue: Sender<f64>,
        metrics: Arc<CameraHealthMetrics>,
        stop: Arc<Signal>,
    ) -> Self {
        Self {
            camera: camera.to_string(),
            shape,
            reader,
            arena: FrameArena::new(),
            ring,
            frame_queue,
            metrics,
            stop,
            frame_rate: EventsPerSecond::default(),
            skipped_rate: EventsPerSecond::default(),
        }
    }

    pub fn run(mut self) -> CaptureOutcome {
        self.frame_rate.start();
        self.skipped_rate.start();
        let frame_size = self.shape.yuv_size();
        let mut read_errors = 0u32;
        let mut last_time = 0.0f64;

        let exit = loop {
            if self.stop.is_set() {
                break CaptureExit::Stopped;
            }
            // Frame names must be unique per camera.
            let mut frame_time = crate::now_timestamp();
            if frame_time <= last_time {
                frame_time = last_time + 1e-6;
            }
            last_time = frame_time;
            self.metrics.last_frame_time.store(frame_time);
            let name = frame_name(&self.camera, frame_time);

            let buffer = match self.arena.create(&name, frame_size) {
                Ok(buffer) => buffer,
                Err(e) => {
                    log::error!("{}: unable to allocate frame {}: {:#}", self.camera, name, e);
                    read_errors += 1;
                    if read_errors >= MAX_READ_ERRORS {
                        break CaptureExit::ReadErrors;
                    }
                    continue;
                }
            };

            if let Err(e) = self.reader.read_exact(buffer) {
                self.discard(&name);
                if self.stop.is_set() {
                    break CaptureExit::Stopped;
                }
                if e.kind() == io::ErrorKind::UnexpectedEof {
                    log::error!("{}: decoder stream closed", self.camera);
                    break CaptureExit::DecoderExited;
                }
                log::warn!("{}: failed to read frame: {}", self.camera, e);
                read_errors += 1;
                if read_errors >= MAX_READ_ERRORS {
                    break CaptureExit::ReadErrors;
                }
                continue;
            }
            read_errors = 0;

            self.frame_rate.update_at(frame_time);
            self.metrics.camera_fps.store(self.frame_rate.eps_at(frame_time));
            self.metrics.frames_captured.fetch_add(1, Ordering::AcqRel);

            for evicted in self.ring.push(name.clone()) {
                self.discard(&evicted);
            }

            match self.frame_queue.try_send(frame_time) {
                Ok(()) => self.arena.close(&name),
                Err(TrySendError::Full(_)) => {
                    self.skipped_rate.update_at(frame_time);
                    self.metrics.frames_skipped.fetch_add(1, Ordering::AcqRel);
                    self.ring.forget(&name);
                    self.discard(&name);
                }
                Err(TrySendError::Disconnected(_)) => {
                    self.ring.forget(&name);
                    self.discard(&name);
                    break CaptureExit::QueueClosed;
                }
            }
            self.metrics
                .skipped_fps
                .store(self.skipped_rate.eps_at(frame_time));
        };

        if exit == CaptureExit::Stopped {
            for name in self.ring.drain() {
                if let Err(e) = self.arena.delete(&name) {
                    log::warn!("{}: failed to delete frame {}: {:#}", self.camera, name, e);
                }
            }
        }
        log::info!("{}: capture loop exited ({:?})", self.camera, exit);
        CaptureOutcome {
            exit,
            ring: self.ring,
        }
    }

    fn discard(&mut self, name: &str) {
        if let Err(e) = self.arena.delete(name) {
            log::warn!("{}: failed to delete frame {}: {:#}", self.camera, name, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::bounded;
    use std::io::Cursor;

    fn camera_name(tag: &str) -> String {
        format!("cap{}{}{:04x}", tag, std::process::id(), rand::random::<u16>())
    }

    #[test]
    fn full_queue_drops_frames_and_counts_each_skip() {
        let shape = FrameShape::new(4, 4);
        let frames = 5;
        let stream = vec![7u8; shape.yuv_size() * frames];
        let (tx, rx) = bounded(2);
        let metrics = Arc::new(CameraHealthMetrics::new());
        let camera = camera_name("bp");

        let outcome = CaptureWorker::new(
            &camera,
            shape,
            Cursor::new(stream),
            FrameRing::new(10),
            tx,
            metrics.clone(),
            Arc::new(Signal::new()),
        )
        .run();

        assert_eq!(outcome.exit, CaptureExit::DecoderExited);
        assert_eq!(metrics.frames_skipped(), (frames - 2) as u64);
        assert_eq!(metrics.frames_captured.load(Ordering::Acquire), frames as u64);

        // Queued frames are still readable, dropped ones are gone.
        let mut arena = FrameArena::new();
        let queued: Vec<f64> = rx.try_iter().collect();
        assert_eq!(queued.len(), 2);
        for frame_time in &queued {
            let name = frame_name(&camera, *frame_time);
            assert_eq!(arena.get(&name, shape.yuv_size()).map(|b| b[0]), Some(7));
            arena.delete(&name).unwrap();
        }
        assert_eq!(outcome.ring.len(), 2);
    }

    #[test]
    fn ring_overflow_deletes_oldest_frame() {
        let shape = FrameShape::new(4, 4);
        let stream = vec![1u8; shape.yuv_size() * 3];
        let (tx, rx) = bounded(8);
        let camera = camera_name("ring");

        let outcome = CaptureWorker::new(
            &camera,
            shape,
            Cursor::new(stream),
            FrameRing::new(2),
            tx,
            Arc::new(CameraHealthMetrics::new()),
            Arc::new(Signal::new()),
        )
        .run();

        let times: Vec<f64> = rx.try_iter().collect();
        assert_eq!(times.len(), 3);
        let mut arena = FrameArena::new();
        assert!(arena.get(&frame_name(&camera, times[0]), shape.yuv_size()).is_none());
        for frame_time in &times[1..] {
            let name = frame_name(&camera, *frame_time);
            assert!(arena.get(&name, shape.yuv_size()).is_some());
            arena.delete(&name).unwrap();
        }
        assert_eq!(outcome.ring.len(), 2);
    }

    #[test]
    fn raised_stop_signal_ends_loop_and_frees_frames() {
        let shape = FrameShape::new(4, 4);
        let stop = Arc::new(Signal::new());
        stop.set();
        let (tx, _rx) = bounded(2);
        let outcome = CaptureWorker::new(
            &camera_name("stop"),
            shape,
            io::repeat(0),
            FrameRing::new(4),
            tx,
            Arc::new(CameraHealthMetrics::new()),
            stop,
        )
        .run();
        assert_eq!(outcome.exit, CaptureExit::Stopped);
        assert!(outcome.ring.is_empty());
    }
}
