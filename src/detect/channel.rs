//! Detector request/response channel.
//!
//! Callers (one per camera) and detector workers never share tensors through
//! memory they both own. A call goes:
//!
//! 1. caller writes the model tensor into the shared segment named `{id}`,
//! 2. clears its ready signal and sends `(id, seq)` on the hub's request queue,
//! 3. a detector worker runs inference and writes `seq` followed by a 20x6
//!    table into `out-{id}`,
//! 4. the worker raises the signal; the caller reads rows above threshold.
//!
//! A caller waits at most `DETECTION_TIMEOUT`; on timeout, or when the request
//! queue is full, the round yields no detections. A request left behind by a
//! timed-out call still gets answered later; its response carries the old
//! `seq` and is ignored. Workers publish the start time of the running inference so the
//! daemon can spot and restart a stuck worker.

use anyhow::{anyhow, Context, Result};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use super::backend::{
    read_detections, write_detections, ModelDetector, RawDetections, RAW_DETECTIONS_BYTES,
};
use super::labels::LabelMap;
use crate::arena::FrameArena;
use crate::config::{DetectorConfig, ModelConfig};
use crate::metrics::EventsPerSecond;
use crate::sync::{AtomicF64, Signal};

pub const DETECTION_TIMEOUT: Duration = Duration::from_secs(10);
/// Rows scoring below this are treated as end-of-list.
pub const DEFAULT_DETECTION_THRESHOLD: f32 = 0.4;
pub const REQUEST_QUEUE_DEPTH: usize = 64;
/// Sequence number written ahead of the table in `out-{id}`.
pub const RESPONSE_HEADER_BYTES: usize = 8;
pub const RESPONSE_BYTES: usize = RESPONSE_HEADER_BYTES + RAW_DETECTIONS_BYTES;

const WORKER_POLL: Duration = Duration::from_secs(1);
const WORKER_JOIN_TIMEOUT: Duration = Duration::from_secs(5);

pub fn output_segment_name(id: &str) -> String {
    format!("out-{}", id)
}

fn write_response(seq: u64, table: &RawDetections, out: &mut [u8]) -> Result<()> {
    if out.len() < RESPONSE_BYTES {
        return Err(anyhow!(
            "response buffer holds {} bytes, need {}",
            out.len(),
            RESPONSE_BYTES
        ));
    }
    out[..RESPONSE_HEADER_BYTES].copy_from_slice(&seq.to_ne_bytes());
    write_detections(table, &mut out[RESPONSE_HEADER_BYTES..])
}

fn read_response(bytes: &[u8]) -> Result<(u64, RawDetections)> {
    if bytes.len() < RESPONSE_BYTES {
        return Err(anyhow!(
            "response buffer holds {} bytes, need {}",
            bytes.len(),
            RESPONSE_BYTES
        ));
    }
    let mut header = [0u8; RESPONSE_HEADER_BYTES];
    header.copy_from_slice(&bytes[..RESPONSE_HEADER_BYTES]);
    let table = read_detections(&bytes[RESPONSE_HEADER_BYTES..])?;
    Ok((u64::from_ne_bytes(header), table))
}

// ----------------------------------------------------------------------------
// Hub
// ----------------------------------------------------------------------------

/// One queued inference request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DetectionRequest {
    pub id: String,
    pub seq: u64,
}

/// Shared request queue plus the ready signal of every connected caller.
pub struct DetectorHub {
    model: ModelConfig,
    requests: Sender<DetectionRequest>,
    receiver: Receiver<DetectionRequest>,
    connections: Mutex<HashMap<String, Arc<Signal>>>,
}

impl DetectorHub {
    pub fn new(model: ModelConfig) -> Self {
        Self::with_capacity(model, REQUEST_QUEUE_DEPTH)
    }

    pub fn with_capacity(model: ModelConfig, capacity: usize) -> Self {
        let (requests, receiver) = bounded(capacity.max(1));
        Self {
            model,
            requests,
            receiver,
            connections: Mutex::new(HashMap::new()),
        }
    }

    pub fn model(&self) -> &ModelConfig {
        &self.model
    }

    /// Register a caller and return its ready signal.
    pub fn connect(&self, id: &str) -> Arc<Signal> {
        let mut connections = self.connections.lock().unwrap_or_else(|e| e.into_inner());
        connections
            .entry(id.to_string())
            .or_insert_with(|| Arc::new(Signal::new()))
            .clone()
    }

    pub fn disconnect(&self, id: &str) {
        let mut connections = self.connections.lock().unwrap_or_else(|e| e.into_inner());
        connections.remove(id);
    }

    pub fn signal(&self, id: &str) -> Option<Arc<Signal>> {
        let connections = self.connections.lock().unwrap_or_else(|e| e.into_inner());
        connections.get(id).cloned()
    }

    fn submit(&self, request: DetectionRequest) -> Result<()> {
        match self.requests.try_send(request) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(anyhow!("detection request queue is full")),
            Err(TrySendError::Disconnected(_)) => Err(anyhow!("detection request queue is closed")),
        }
    }

    fn receiver(&self) -> Receiver<DetectionRequest> {
        self.receiver.clone()
    }

    pub fn pending_requests(&self) -> usize {
        self.receiver.len()
    }
}

// ----------------------------------------------------------------------------
// Caller side
// ----------------------------------------------------------------------------

/// One detection in region-relative coordinates.
#[derive(Clone, Debug, PartialEq)]
pub struct RegionDetection {
    pub label: String,
    pub score: f32,
    /// `y1, x1, y2, x2`, normalised to the region.
    pub bbox: [f32; 4],
}

/// Caller end of the detector channel for one camera.
pub struct RemoteDetector {
    id: String,
    hub: Arc<DetectorHub>,
    labels: Arc<LabelMap>,
    ready: Arc<Signal>,
    arena: FrameArena,
    tensor_size: usize,
    threshold: f32,
    timeout: Duration,
    fps: EventsPerSecond,
    seq: u64,
}

impl RemoteDetector {
    /// Creates the `{id}` and `out-{id}` segments. Their owner is whoever
    /// calls `release_connection`, normally the camera process at shutdown.
    pub fn connect(id: &str, hub: Arc<DetectorHub>, labels: Arc<LabelMap>) -> Result<Self> {
        let tensor_size = hub.model().tensor_size();
        let mut arena = FrameArena::new();
        arena
            .create(id, tensor_size)
            .with_context(|| format!("detector input buffer for {}", id))?;
        arena
            .create(&output_segment_name(id), RESPONSE_BYTES)
            .with_context(|| format!("detector output buffer for {}", id))?;
        let ready = hub.connect(id);
        let mut fps = EventsPerSecond::default();
        fps.start();
        Ok(Self {
            id: id.to_string(),
            hub,
            labels,
            ready,
            arena,
            tensor_size,
            threshold: DEFAULT_DETECTION_THRESHOLD,
            timeout: DETECTION_TIMEOUT,
            fps,
            seq: 0,
        })
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_threshold(mut self, threshold: f32) -> Self {
        self.threshold = threshold;
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Detection calls per second over the last 10s.
    pub fn fps(&mut self) -> f64 {
        self.fps.eps()
    }

    /// Run one inference. Never fails: a missing buffer, a full queue or a
    /// timeout all yield an empty list.
    pub fn detect(&mut self, tensor: &[u8]) -> Vec<RegionDetection> {
        match self.request(tensor) {
            Ok(Some(table)) => {
                self.fps.update();
                self.rows_above_threshold(&table)
            }
            Ok(None) => {
                log::warn!("detector.{}: no response within {:?}", self.id, self.timeout);
                Vec::new()
            }
            Err(e) => {
                log::warn!("detector.{}: {:#}", self.id, e);
                Vec::new()
            }
        }
    }

    fn request(&mut self, tensor: &[u8]) -> Result<Option<RawDetections>> {
        if tensor.len() != self.tensor_size {
            return Err(anyhow!(
                "tensor holds {} bytes, model needs {}",
                tensor.len(),
                self.tensor_size
            ));
        }
        let input = self
            .arena
            .get_mut(&self.id, self.tensor_size)
            .ok_or_else(|| anyhow!("input buffer {} is gone", self.id))?;
        input.copy_from_slice(tensor);

        self.seq += 1;
        self.ready.clear();
        self.hub.submit(DetectionRequest {
            id: self.id.clone(),
            seq: self.seq,
        })?;
        self.await_response(self.seq, Instant::now() + self.timeout)
    }

    /// Wait for the response to `seq`, skipping answers to earlier requests.
    fn await_response(&mut self, seq: u64, deadline: Instant) -> Result<Option<RawDetections>> {
        let out_name = output_segment_name(&self.id);
        loop {
            let Some(left) = deadline.checked_duration_since(Instant::now()) else {
                return Ok(None);
            };
            if !self.ready.wait(left) {
                return Ok(None);
            }
            self.ready.clear();
            let output = self
                .arena
                .get(&out_name, RESPONSE_BYTES)
                .ok_or_else(|| anyhow!("output buffer {} is gone", out_name))?;
            let (answered, table) = read_response(output)?;
            if answered == seq {
                return Ok(Some(table));
            }
            log::debug!("detector.{}: dropping stale response {} (waiting for {})", self.id, answered, seq);
        }
    }

    fn rows_above_threshold(&self, table: &RawDetections) -> Vec<RegionDetection> {
        table
            .iter()
            .take_while(|row| row[1] >= self.threshold)
            .map(|row| RegionDetection {
                label: self.labels.label(row[0].max(0.0) as u32),
                score: row[1],
                bbox: [row[2], row[3], row[4], row[5]],
            })
            .collect()
    }

    /// Drop mappings and the connection. Segments are left in place.
    pub fn close(&mut self) {
        self.arena.close(&self.id);
        self.arena.close(&output_segment_name(&self.id));
        self.hub.disconnect(&self.id);
    }
}

/// Delete the input and output segments of a connection.
pub fn release_connection(id: &str) -> Result<()> {
    let mut arena = FrameArena::new();
    arena.delete(id)?;
    arena.delete(&output_segment_name(id))?;
    Ok(())
}

// ----------------------------------------------------------------------------
// Detector side
// ----------------------------------------------------------------------------

/// Inference counters shared between a worker thread and its supervisor.
#[derive(Debug, Default)]
pub struct DetectorStats {
    /// Exponential average inference time in seconds (10-sample weighting).
    pub avg_inference_speed: AtomicF64,
    /// Wall-clock start of the running inference, 0 when idle.
    pub detection_start: AtomicF64,
}

impl DetectorStats {
    fn record(&self, duration: f64) {
        let avg = self.avg_inference_speed.load();
        self.avg_inference_speed.store((avg * 9.0 + duration) / 10.0);
    }
}

/// Supervised detector worker fed from the hub's request queue.
pub struct DetectorProcess {
    name: String,
    config: DetectorConfig,
    hub: Arc<DetectorHub>,
    stats: Arc<DetectorStats>,
    stop: Option<Arc<Signal>>,
    finished: Option<Arc<Signal>>,
    handle: Option<JoinHandle<()>>,
}

impl DetectorProcess {
    pub fn new(config: DetectorConfig, hub: Arc<DetectorHub>) -> Self {
        Self {
            name: config.name.clone(),
            config,
            hub,
            stats: Arc::new(DetectorStats::default()),
            stop: None,
            finished: None,
            handle: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn stats(&self) -> Arc<DetectorStats> {
        self.stats.clone()
    }

    pub fn is_running(&self) -> bool {
        self.finished.as_ref().is_some_and(|done| !done.is_set())
    }

    /// Stop the current worker (if any) and start a fresh one. Fails only when
    /// the detector cannot be built from config.
    pub fn start_or_restart(&mut self) -> Result<()> {
        if self.handle.is_some() {
            log::info!("detector.{}: restarting", self.name);
            self.stop();
        }
        let detector = ModelDetector::from_config(&self.config, self.hub.model())
            .with_context(|| format!("build detector {}", self.name))?;
        self.stats.detection_start.store(0.0);

        let stop = Arc::new(Signal::new());
        let finished = Arc::new(Signal::new());
        let worker = DetectorWorker {
            name: self.name.clone(),
            detector,
            hub: self.hub.clone(),
            requests: self.hub.receiver(),
            stats: self.stats.clone(),
            stop: stop.clone(),
            finished: finished.clone(),
        };
        let handle = thread::Builder::new()
            .name(format!("detector:{}", self.name))
            .spawn(move || worker.run())
            .with_context(|| format!("spawn detector thread {}", self.name))?;

        self.stop = Some(stop);
        self.finished = Some(finished);
        self.handle = Some(handle);
        log::info!("detector.{}: started ({})", self.name, self.config.kind.as_str());
        Ok(())
    }

    /// Ask the worker to stop and join it if it finishes within a bounded
    /// wait. A worker stuck inside inference is abandoned.
    pub fn stop(&mut self) {
        if let Some(stop) = self.stop.take() {
            stop.set();
        }
        let finished = self.finished.take();
        if let Some(handle) = self.handle.take() {
            let done = finished.is_some_and(|f| f.wait(WORKER_JOIN_TIMEOUT));
            if done {
                if handle.join().is_err() {
                    log::error!("detector.{}: worker panicked", self.name);
                }
            } else {
                log::warn!(
                    "detector.{}: worker did not stop within {:?}, abandoning it",
                    self.name,
                    WORKER_JOIN_TIMEOUT
                );
            }
        }
    }

    /// True when an inference has been running for longer than `timeout`.
    pub fn is_stuck(&self, now: f64, timeout: Duration) -> bool {
        let start = self.stats.detection_start.load();
        start > 0.0 && now - start > timeout.as_secs_f64()
    }
}

impl Drop for DetectorProcess {
    fn drop(&mut self) {
        self.stop();
    }
}

struct DetectorWorker {
    name: String,
    detector: ModelDetector,
    hub: Arc<DetectorHub>,
    requests: Receiver<DetectionRequest>,
    stats: Arc<DetectorStats>,
    stop: Arc<Signal>,
    finished: Arc<Signal>,
}

/// Raises `finished` however the worker exits.
struct FinishGuard(Arc<Signal>);

impl Drop for FinishGuard {
    fn drop(&mut self) {
        self.0.set();
    }
}

impl DetectorWorker {
    fn run(mut self) {
        let _guard = FinishGuard(self.finished.clone());
        let mut arena = FrameArena::new();
        let tensor_size = self.hub.model().tensor_size();

        while !self.stop.is_set() {
            let DetectionRequest { id, seq } = match self.requests.recv_timeout(WORKER_POLL) {
                Ok(request) => request,
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => break,
            };

            let started = Instant::now();
            self.stats.detection_start.store(crate::now_timestamp());
            let table = match arena.get(&id, tensor_size) {
                Some(input) => self.detector.detect_raw(input),
                None => Err(anyhow!("input buffer {} not found", id)),
            };
            let written = table.and_then(|table| {
                let out_name = output_segment_name(&id);
                let output = arena
                    .get_mut(&out_name, RESPONSE_BYTES)
                    .ok_or_else(|| anyhow!("output buffer {} not found", out_name))?;
                write_response(seq, &table, output)
            });
            match written {
                Ok(()) => {
                    if let Some(ready) = self.hub.signal(&id) {
                        ready.set();
                    }
                }
                Err(e) => log::warn!("detector.{}: request {}: {:#}", self.name, id, e),
            }
            self.stats.detection_start.store(0.0);
            self.stats.record(started.elapsed().as_secs_f64());
        }
        log::info!("detector.{}: exiting", self.name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DetectorKind;
    use crate::detect::backend::empty_detections;

    fn small_model() -> ModelConfig {
        ModelConfig {
            width: 32,
            height: 32,
            ..ModelConfig::default()
        }
    }

    fn cpu_detector() -> DetectorConfig {
        DetectorConfig {
            name: "cpu".to_string(),
            kind: DetectorKind::Cpu,
            model_path: None,
        }
    }

    fn unique_id(tag: &str) -> String {
        format!("nvrtest-{}-{}", tag, std::process::id())
    }

    #[test]
    fn round_trip_through_worker() {
        let hub = Arc::new(DetectorHub::new(small_model()));
        let mut process = DetectorProcess::new(cpu_detector(), hub.clone());
        process.start_or_restart().unwrap();

        let id = unique_id("chan");
        let mut remote = RemoteDetector::connect(&id, hub.clone(), Arc::new(LabelMap::coco()))
            .unwrap()
            .with_timeout(Duration::from_secs(5));

        // 8x8 white square in a 32x32 black tensor.
        let mut tensor = vec![0u8; 32 * 32 * 3];
        for y in 8..16 {
            for x in 4..12 {
                let i = (y * 32 + x) * 3;
                tensor[i..i + 3].copy_from_slice(&[255, 255, 255]);
            }
        }
        let detections = remote.detect(&tensor);
        assert_eq!(detections.len(), 1);
        assert_eq!(detections[0].label, "person");
        assert!((detections[0].bbox[0] - 0.25).abs() < 1e-6);
        assert!((detections[0].bbox[1] - 0.125).abs() < 1e-6);

        assert!(remote.detect(&vec![0u8; 32 * 32 * 3]).is_empty());
        assert!(process.stats().avg_inference_speed.load() > 0.0);

        remote.close();
        process.stop();
        release_connection(&id).unwrap();
    }

    #[test]
    fn caller_times_out_without_worker() {
        let hub = Arc::new(DetectorHub::new(small_model()));
        let id = unique_id("timeout");
        let mut remote = RemoteDetector::connect(&id, hub.clone(), Arc::new(LabelMap::coco()))
            .unwrap()
            .with_timeout(Duration::from_millis(50));
        assert!(remote.detect(&vec![0u8; 32 * 32 * 3]).is_empty());
        assert_eq!(hub.pending_requests(), 1);
        remote.close();
        release_connection(&id).unwrap();
    }

    #[test]
    fn stale_response_is_ignored() {
        let hub = Arc::new(DetectorHub::new(small_model()));
        let id = unique_id("stale");
        let mut remote = RemoteDetector::connect(&id, hub.clone(), Arc::new(LabelMap::coco()))
            .unwrap();
        let mut table = empty_detections();
        table[0] = [0.0, 0.9, 0.1, 0.1, 0.5, 0.5];

        // A late answer to request 1 arrives while request 2 is pending.
        let mut arena = FrameArena::new();
        let out = arena.get_mut(&output_segment_name(&id), RESPONSE_BYTES).unwrap();
        write_response(1, &table, out).unwrap();
        hub.signal(&id).unwrap().set();
        let deadline = Instant::now() + Duration::from_millis(50);
        assert_eq!(remote.await_response(2, deadline).unwrap(), None);

        let out = arena.get_mut(&output_segment_name(&id), RESPONSE_BYTES).unwrap();
        write_response(2, &table, out).unwrap();
        hub.signal(&id).unwrap().set();
        let deadline = Instant::now() + Duration::from_millis(50);
        assert_eq!(remote.await_response(2, deadline).unwrap(), Some(table));

        remote.close();
        release_connection(&id).unwrap();
    }

    #[test]
    fn full_queue_fails_fast() {
        let hub = Arc::new(DetectorHub::with_capacity(small_model(), 1));
        let id = unique_id("full");
        let mut remote = RemoteDetector::connect(&id, hub.clone(), Arc::new(LabelMap::coco()))
            .unwrap()
            .with_timeout(Duration::from_millis(50));
        let tensor = vec![0u8; 32 * 32 * 3];
        assert!(remote.detect(&tensor).is_empty());
        assert_eq!(hub.pending_requests(), 1);

        let mut remote = remote.with_timeout(Duration::from_secs(5));
        let started = Instant::now();
        assert!(remote.detect(&tensor).is_empty());
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(hub.pending_requests(), 1);

        remote.close();
        release_connection(&id).unwrap();
    }

    #[test]
    fn leftover_request_does_not_answer_next_call() {
        let hub = Arc::new(DetectorHub::new(small_model()));
        let id = unique_id("leftover");
        let mut remote = RemoteDetector::connect(&id, hub.clone(), Arc::new(LabelMap::coco()))
            .unwrap()
            .with_timeout(Duration::from_millis(20));
        assert!(remote.detect(&vec![0u8; 32 * 32 * 3]).is_empty());
        assert_eq!(hub.pending_requests(), 1);

        let mut process = DetectorProcess::new(cpu_detector(), hub.clone());
        process.start_or_restart().unwrap();
        let mut remote = remote.with_timeout(Duration::from_secs(5));
        let mut tensor = vec![0u8; 32 * 32 * 3];
        for y in 8..16 {
            for x in 4..12 {
                let i = (y * 32 + x) * 3;
                tensor[i..i + 3].copy_from_slice(&[255, 255, 255]);
            }
        }
        let detections = remote.detect(&tensor);
        assert_eq!(detections.len(), 1);
        assert_eq!(hub.pending_requests(), 0);

        remote.close();
        process.stop();
        release_connection(&id).unwrap();
    }

    #[test]
    fn running_state_follows_worker_lifecycle() {
        let hub = Arc::new(DetectorHub::new(small_model()));
        let mut process = DetectorProcess::new(cpu_detector(), hub);
        assert!(!process.is_running());
        process.start_or_restart().unwrap();
        assert!(process.is_running());
        process.start_or_restart().unwrap();
        assert!(process.is_running());
        process.stop();
        assert!(!process.is_running());
    }

    #[test]
    fn stuck_when_inference_exceeds_timeout() {
        let hub = Arc::new(DetectorHub::new(small_model()));
        let process = DetectorProcess::new(cpu_detector(), hub);
        let timeout = Duration::from_secs(10);
        assert!(!process.is_stuck(1000.0, timeout));
        process.stats().detection_start.store(1000.0);
        assert!(!process.is_stuck(1005.0, timeout));
        assert!(process.is_stuck(1011.0, timeout));
    }

    #[test]
    fn average_weights_ten_samples() {
        let stats = DetectorStats::default();
        stats.record(1.0);
        assert!((stats.avg_inference_speed.load() - 0.1).abs() < 1e-9);
        stats.record(1.0);
        assert!((stats.avg_inference_speed.load() - 0.19).abs() < 1e-9);
    }
}
