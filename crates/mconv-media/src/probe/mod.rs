//! Analyzer (ffprobe) subprocess.
//!
//! A [`Probe`] spawns the analyzer as soon as it is created. Bytes handed to
//! [`Probe::set_stream`] are written to the analyzer's stdin until it exits,
//! then the collected report is parsed and published. Queries made before
//! that wait for the result. [`Probe::stop`] kills a run that is still
//! waiting for input.

pub mod queries;
pub mod report;

use futures::StreamExt;
use mconv_models::ProbeResult;
use parking_lot::Mutex;
use serde_json::Value;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::error::{MediaError, MediaResult};
use crate::streams::ByteStream;

pub use queries::{parse_frame_rate, query, Query, RESULT_MAP};
pub use report::parse_report;

/// How to run the analyzer.
#[derive(Debug, Clone)]
pub struct ProbeOptions {
    /// Analyzer executable
    pub ffprobe_path: PathBuf,
    /// Forced input container type (`-f`)
    pub input_type: Option<String>,
    /// Let the analyzer open this URL itself instead of reading stdin
    pub input_url: Option<String>,
}

impl ProbeOptions {
    pub fn new(ffprobe_path: impl Into<PathBuf>) -> Self {
        Self {
            ffprobe_path: ffprobe_path.into(),
            input_type: None,
            input_url: None,
        }
    }

    /// Force the input container type.
    pub fn with_input_type(mut self, input_type: impl Into<String>) -> Self {
        self.input_type = Some(input_type.into());
        self
    }

    /// Probe a URL or device directly.
    pub fn with_input_url(mut self, url: impl Into<String>) -> Self {
        self.input_url = Some(url.into());
        self
    }

    /// Build the analyzer arguments.
    pub fn build_args(&self) -> Vec<String> {
        let mut args: Vec<String> = ["-show_streams", "-show_format", "-loglevel", "warning"]
            .into_iter()
            .map(String::from)
            .collect();

        if let Some(input_type) = &self.input_type {
            args.push("-f".to_string());
            args.push(input_type.clone());
        }

        args.push("-i".to_string());
        args.push(self.input_url.clone().unwrap_or_else(|| "pipe:0".to_string()));

        args
    }
}

/// Progress of an analyzer run.
#[derive(Debug, Clone)]
pub enum ProbeState {
    Pending,
    Done(Arc<ProbeResult>),
    Failed(MediaError),
}

impl ProbeState {
    pub fn is_pending(&self) -> bool {
        matches!(self, Self::Pending)
    }
}

/// A running (or finished) analyzer process.
pub struct Probe {
    label: String,
    state: watch::Receiver<ProbeState>,
    stdin: Mutex<Option<ChildStdin>>,
    stream_set: AtomicBool,
    stop: watch::Sender<bool>,
    pid: Option<u32>,
}

impl Probe {
    /// Spawn the analyzer. Spawn failures surface through [`Probe::result`].
    pub fn spawn(options: &ProbeOptions, label: impl Into<String>) -> Self {
        let label = label.into();
        let (state_tx, state) = watch::channel(ProbeState::Pending);
        let (stop, stop_rx) = watch::channel(false);
        let args = options.build_args();

        debug!(probe = %label, "Running analyzer: {} {}", options.ffprobe_path.display(), args.join(" "));

        let stdin_mode = if options.input_url.is_some() {
            Stdio::null()
        } else {
            Stdio::piped()
        };

        let spawned = Command::new(&options.ffprobe_path)
            .args(&args)
            .stdin(stdin_mode)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn();

        let mut child = match spawned {
            Ok(child) => child,
            Err(err) => {
                warn!(probe = %label, error = %err, "Failed to spawn analyzer");
                let program = options.ffprobe_path.display().to_string();
                state_tx.send_replace(ProbeState::Failed(MediaError::spawn_failed(program, &err)));
                return Self {
                    label,
                    state,
                    stdin: Mutex::new(None),
                    stream_set: AtomicBool::new(false),
                    stop,
                    pid: None,
                };
            }
        };

        let pid = child.id();
        let stdin = child.stdin.take();
        tokio::spawn(collect_report(child, state_tx, stop_rx, label.clone()));

        Self {
            label,
            state,
            stdin: Mutex::new(stdin),
            stream_set: AtomicBool::new(false),
            stop,
            pid,
        }
    }

    /// Feed `source` to the analyzer. May be called once.
    ///
    /// Feeding stops as soon as the analyzer exits; `source` is dropped then.
    pub fn set_stream(&self, source: ByteStream) -> MediaResult<()> {
        if self.stream_set.swap(true, Ordering::SeqCst) {
            return Err(MediaError::StreamAlreadySet);
        }

        match self.stdin.lock().take() {
            Some(stdin) => {
                tokio::spawn(feed(source, stdin, self.state.clone(), self.label.clone()));
            }
            None => debug!(probe = %self.label, "Analyzer does not read stdin, dropping source"),
        }

        Ok(())
    }

    /// Wait for the parsed result.
    pub async fn result(&self) -> MediaResult<Arc<ProbeResult>> {
        let mut rx = self.state.clone();
        let state = rx
            .wait_for(|s| !s.is_pending())
            .await
            .map_err(|_| MediaError::internal("analyzer task stopped without a result"))?
            .clone();

        match state {
            ProbeState::Done(result) => Ok(result),
            ProbeState::Failed(err) => Err(err),
            ProbeState::Pending => Err(MediaError::internal("analyzer result still pending")),
        }
    }

    /// The result, if parsing already finished successfully.
    pub fn try_result(&self) -> Option<Arc<ProbeResult>> {
        match &*self.state.borrow() {
            ProbeState::Done(result) => Some(result.clone()),
            _ => None,
        }
    }

    /// Answer a named query, waiting for the result first.
    pub async fn get_value(&self, name: &str) -> MediaResult<Option<Value>> {
        let result = self.result().await?;
        query(&result, name)
    }

    /// Kill the analyzer if it is still running.
    ///
    /// The result becomes [`MediaError::Cancelled`] and the fed source is
    /// dropped. A finished run keeps its result. Dropping the last handle
    /// to a running probe does the same.
    pub fn stop(&self) {
        self.stop.send_replace(true);
    }

    pub fn is_finished(&self) -> bool {
        !self.state.borrow().is_pending()
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }
}

impl std::fmt::Debug for Probe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Probe")
            .field("label", &self.label)
            .field("pid", &self.pid)
            .field("finished", &self.is_finished())
            .finish()
    }
}

async fn collect_report(
    mut child: Child,
    state: watch::Sender<ProbeState>,
    mut stop: watch::Receiver<bool>,
    label: String,
) {
    let started = Instant::now();
    let stdout = child.stdout.take();
    let stderr = child.stderr.take();

    let (report, errors) = tokio::select! {
        output = async { tokio::join!(read_all(stdout), read_all(stderr)) } => output,
        _ = stop_requested(&mut stop) => {
            if let Err(err) = child.start_kill() {
                debug!(probe = %label, error = %err, "Analyzer already gone");
            }
            let _ = child.wait().await;
            debug!(probe = %label, "Analyzer stopped");
            state.send_replace(ProbeState::Failed(MediaError::Cancelled));
            return;
        }
    };

    let outcome = match child.wait().await {
        Ok(status) if status.success() => {
            let elapsed = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
            let result = parse_report(&report).with_probe_time(elapsed);
            debug!(probe = %label, streams = result.streams.len(), elapsed_ms = elapsed, "Analyzer finished");
            ProbeState::Done(Arc::new(result))
        }
        Ok(status) => {
            let message = match errors.trim() {
                "" => format!("exited with code {}", status.code().unwrap_or(-1)),
                text => text.to_string(),
            };
            warn!(probe = %label, "Analyzer failed: {}", message);
            ProbeState::Failed(MediaError::ffprobe_failed(message, Some(errors)))
        }
        Err(err) => ProbeState::Failed(err.into()),
    };

    state.send_replace(outcome);
}

async fn read_all<R: AsyncRead + Unpin>(pipe: Option<R>) -> String {
    let mut buf = Vec::new();
    if let Some(mut pipe) = pipe {
        let _ = pipe.read_to_end(&mut buf).await;
    }
    String::from_utf8_lossy(&buf).into_owned()
}

async fn feed(
    mut source: ByteStream,
    mut stdin: ChildStdin,
    mut state: watch::Receiver<ProbeState>,
    label: String,
) {
    let mut written = 0usize;

    loop {
        let next = tokio::select! {
            biased;
            _ = analyzer_exited(&mut state) => break,
            next = source.next() => next,
        };

        match next {
            Some(Ok(chunk)) => {
                if let Err(err) = stdin.write_all(&chunk).await {
                    debug!(probe = %label, error = %err, "Analyzer stopped reading");
                    break;
                }
                written += chunk.len();
            }
            Some(Err(err)) => {
                debug!(probe = %label, error = %err, "Probe source failed");
                break;
            }
            None => break,
        }
    }

    debug!(probe = %label, bytes = written, "Stopped feeding analyzer");
}

async fn stop_requested(stop: &mut watch::Receiver<bool>) {
    let _ = stop.wait_for(|stop| *stop).await;
}

async fn analyzer_exited(state: &mut watch::Receiver<ProbeState>) {
    let _ = state.wait_for(|s| !s.is_pending()).await.is_ok();
}
