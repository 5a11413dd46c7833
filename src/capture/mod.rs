//! Frame capture: decoder subprocess, capture thread, watchdog.
//!
//! ```text
//! decoder stdout --read_exact(frame_size)--> FrameArena["{camera}{t}"]
//!                                              |
//!                                 frame_time --+--> bounded(2) queue --> pipeline
//! ```
//!
//! The capture thread never blocks on the queue: a full queue drops the frame.

pub mod decoder;
pub mod watchdog;
pub mod worker;

pub use decoder::{DecoderCommand, DecoderProcess, LogPipe};
pub use watchdog::{CaptureWatchdog, RestartReason, WatchdogTimings};
pub use worker::{CaptureExit, CaptureOutcome, CaptureWorker};

/// Depth of the per-camera frame-time queue.
pub const FRAME_QUEUE_DEPTH: usize = 2;
