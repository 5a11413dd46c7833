//! External decoder subprocess.
//!
//! The decoder writes raw planar YUV 4:2:0 frames of a fixed size to stdout.
//! There is no framing: frame boundaries are purely `frame_size` based. Stderr
//! is drained by a `LogPipe` so a crash can be explained after the fact.

use anyhow::{anyhow, Context, Result};
use std::collections::VecDeque;
use std::io::{BufRead, BufReader, Read};
use std::os::unix::process::CommandExt;
use std::process::{Child, ChildStdout, Command, Stdio};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::config::{DetectSettings, FfmpegSettings};

/// Lines of decoder stderr kept for crash reports.
pub const LOG_PIPE_LINES: usize = 100;

const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Program and arguments used to launch a decoder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecoderCommand {
    pub program: String,
    pub args: Vec<String>,
}

impl DecoderCommand {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    /// FFmpeg invocation scaling the input to the detect resolution and fps.
    pub fn ffmpeg(ffmpeg: &FfmpegSettings, detect: &DetectSettings) -> Self {
        let mut args: Vec<String> = ["-hide_banner", "-loglevel", "warning", "-threads", "2"]
            .iter()
            .map(|a| a.to_string())
            .collect();
        args.extend(ffmpeg.input_args.iter().cloned());
        args.push("-i".to_string());
        args.push(ffmpeg.path.clone());
        args.extend(
            [
                "-threads",
                "2",
                "-f",
                "rawvideo",
                "-pix_fmt",
                "yuv420p",
                "-r",
            ]
            .iter()
            .map(|a| a.to_string()),
        );
        args.push(detect.fps.to_string());
        args.push("-vf".to_string());
        args.push(format!(
            "fps={},scale={}:{}",
            detect.fps, detect.width, detect.height
        ));
        args.push("pipe:".to_string());
        Self::new(ffmpeg.program.clone(), args)
    }

    /// Shell-style rendering for logs.
    pub fn display(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

// ----------------------------------------------------------------------------
// LogPipe
// ----------------------------------------------------------------------------

/// Bounded tail of a subprocess's stderr.
#[derive(Clone)]
pub struct LogPipe {
    name: String,
    lines: Arc<Mutex<VecDeque<String>>>,
}

impl LogPipe {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            lines: Arc::new(Mutex::new(VecDeque::with_capacity(LOG_PIPE_LINES))),
        }
    }

    /// Drain `reader` line by line on a background thread.
    pub fn attach<R: Read + Send + 'static>(&self, reader: R) -> Result<()> {
        let pipe = self.clone();
        std::thread::Builder::new()
            .name(format!("logpipe:{}", self.name))
            .spawn(move || {
                for line in BufReader::new(reader).lines() {
                    match line {
                        Ok(line) => pipe.push(line),
                        Err(_) => break,
                    }
                }
            })
            .context("spawn log pipe thread")?;
        Ok(())
    }

    pub fn push(&self, line: String) {
        log::debug!("{}: {}", self.name, line);
        let mut lines = self.lines.lock().unwrap_or_else(|e| e.into_inner());
        if lines.len() == LOG_PIPE_LINES {
            lines.pop_front();
        }
        lines.push_back(line);
    }

    pub fn lines(&self) -> Vec<String> {
        let lines = self.lines.lock().unwrap_or_else(|e| e.into_inner());
        lines.iter().cloned().collect()
    }

    /// Log every retained line at error level and forget them.
    pub fn dump(&self) {
        let mut lines = self.lines.lock().unwrap_or_else(|e| e.into_inner());
        if lines.is_empty() {
            log::error!("{}: decoder produced no output", self.name);
        }
        for line in lines.drain(..) {
            log::error!("{}: {}", self.name, line);
        }
    }
}

// ----------------------------------------------------------------------------
// DecoderProcess
// ----------------------------------------------------------------------------

/// A running decoder. Spawned in its own process group so termination also
/// reaches any helpers it forked.
pub struct DecoderProcess {
    child: Child,
    stdout: Option<ChildStdout>,
    log_pipe: LogPipe,
    exited: bool,
}

impl DecoderProcess {
    pub fn spawn(command: &DecoderCommand, log_pipe: LogPipe) -> Result<Self> {
        log::debug!("launching decoder: {}", command.display());
        let mut child = Command::new(&command.program)
            .args(&command.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0)
            .spawn()
            .with_context(|| format!("failed to launch decoder {}", command.program))?;
        let stdout = child.stdout.take();
        if let Some(stderr) = child.stderr.take() {
            log_pipe.attach(stderr)?;
        }
        Ok(Self {
            child,
            stdout,
            log_pipe,
            exited: false,
        })
    }

    pub fn pid(&self) -> u32 {
        self.child.id()
    }

    /// Hand the frame stream to a capture worker. Only the first call succeeds.
    pub fn take_stdout(&mut self) -> Result<ChildStdout> {
        self.stdout
            .take()
            .ok_or_else(|| anyhow!("decoder {} stdout already taken", self.pid()))
    }

    pub fn log_pipe(&self) -> &LogPipe {
        &self.log_pipe
    }

    pub fn has_exited(&mut self) -> bool {
        if !self.exited {
            self.exited = matches!(self.child.try_wait(), Ok(Some(_)));
        }
        self.exited
    }

    /// SIGTERM the process group, wait up to `timeout`, then SIGKILL.
    pub fn terminate(&mut self, timeout: Duration) -> Result<()> {
        if self.has_exited() {
            return Ok(());
        }
        log::info!("terminating decoder {}", self.pid());
        self.signal_group(libc::SIGTERM);
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if self.has_exited() {
                return Ok(());
            }
            std::thread::sleep(EXIT_POLL_INTERVAL);
        }
        log::warn!(
            "decoder {} ignored SIGTERM for {:?}, killing",
            self.pid(),
            timeout
        );
        self.signal_group(libc::SIGKILL);
        self.child
            .wait()
            .with_context(|| format!("wait for decoder {}", self.pid()))?;
        self.exited = true;
        Ok(())
    }

    fn signal_group(&self, signal: libc::c_int) {
        let pgid = self.child.id() as libc::pid_t;
        // SAFETY: plain syscall; a stale group id only yields ESRCH.
        let rc = unsafe { libc::kill(-pgid, signal) };
        if rc != 0 {
            log::debug!(
                "signal {} to decoder group {} failed: {}",
                signal,
                pgid,
                std::io::Error::last_os_error()
            );
        }
    }
}

impl Drop for DecoderProcess {
    fn drop(&mut self) {
        if !self.has_exited() {
            self.signal_group(libc::SIGKILL);
            let _ = self.child.wait();
        }
    }
}
