//! The conversion orchestrator.
//!
//! A [`Conversion`] owns inputs and outputs, waits for all of them to be
//! ready, assembles the transcoder command line, allocates pipes, spawns the
//! transcoder and wires every piped endpoint to it. Its diagnostic channel
//! is parsed for progress and failures. Every terminal path funnels through
//! one idempotent cleanup.

use std::future::Future;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use futures::future::{try_join, try_join_all};
use futures::StreamExt;
use mconv_models::{value_text, ArgValue, DEFAULT_RAW_PIXEL_FORMAT};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::process::{Child, ChildStderr, Command};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio_util::codec::{AnyDelimiterCodec, FramedRead};
use tracing::{debug, warn, Instrument};
use uuid::Uuid;

use crate::command::FfmpegCommand;
use crate::endpoint::arguments::{resolve_option, spread, OptionTarget, GLOBAL_ARGUMENTS, GLOBAL_OPERATIONS};
use crate::endpoint::{ArgumentSet, Input, InputList, InputSource, Output, OutputTarget};
use crate::error::{MediaError, MediaResult};
use crate::events::{ConversionEvent, ConversionPhase, EventSink};
use crate::logging::ConversionLogger;
use crate::pipes::{
    allocate_pipes, configure_child, descriptor_table_size, set_niceness, ExtraPipe, ParentEnd, PipeRole,
    FIRST_EXTRA_PIPE,
};
use crate::progress::{LineEvent, ProgressParser};
use crate::settings::ConversionSettings;
use crate::streams::Fork;

/// One run of the transcoder.
///
/// Handles are cheap to clone and share their state. Inputs and outputs
/// must be added from within a Tokio runtime.
#[derive(Clone)]
pub struct Conversion {
    shared: Arc<Shared>,
}

struct Shared {
    settings: Arc<ConversionSettings>,
    logger: ConversionLogger,
    events: EventSink,
    global: Mutex<ArgumentSet>,
    inputs: InputList,
    outputs: Mutex<Vec<Output>>,
    declared: AtomicUsize,
    phase: watch::Sender<ConversionPhase>,
    outcome: watch::Sender<Option<MediaResult<()>>>,
    kill: watch::Sender<bool>,
    started: AtomicBool,
    cleaned_up: AtomicBool,
    stopped: AtomicBool,
    parser: Mutex<ProgressParser>,
    pid: Mutex<Option<u32>>,
    niceness: Mutex<Option<i32>>,
}

enum Endpoint {
    Input(Input),
    Output(Output),
}

impl Endpoint {
    fn order(&self) -> usize {
        match self {
            Self::Input(input) => input.order(),
            Self::Output(output) => output.order(),
        }
    }

    fn pipe_role(&self) -> Option<PipeRole> {
        match self {
            Self::Input(input) => input.is_stream_backed().then_some(PipeRole::Input),
            Self::Output(output) => output.is_stream_backed().then_some(PipeRole::Output),
        }
    }

    fn assign_pipe(&self, pipe: u32) {
        match self {
            Self::Input(input) => input.assign_pipe(pipe),
            Self::Output(output) => output.assign_pipe(pipe),
        }
    }
}

impl Default for Conversion {
    fn default() -> Self {
        Self::new()
    }
}

impl Conversion {
    pub fn new() -> Self {
        Self::with_settings(ConversionSettings::default())
    }

    pub fn with_settings(settings: ConversionSettings) -> Self {
        let logger = ConversionLogger::new(Uuid::new_v4().to_string(), settings.debug);

        let mut global = ArgumentSet::new("conversion", GLOBAL_ARGUMENTS);
        for flag in ["hide_banner", "overwrite"] {
            if let Err(err) = global.set(flag, &[]) {
                logger.log_warning(&err.to_string());
            }
        }

        let (phase, _) = watch::channel(ConversionPhase::Idle);
        let (outcome, _) = watch::channel(None);
        let (kill, _) = watch::channel(false);

        Self {
            shared: Arc::new(Shared {
                events: EventSink::new(settings.event_capacity),
                niceness: Mutex::new(settings.niceness),
                settings: Arc::new(settings),
                logger,
                global: Mutex::new(global),
                inputs: Arc::new(Mutex::new(Vec::new())),
                outputs: Mutex::new(Vec::new()),
                declared: AtomicUsize::new(0),
                phase,
                outcome,
                kill,
                started: AtomicBool::new(false),
                cleaned_up: AtomicBool::new(false),
                stopped: AtomicBool::new(false),
                parser: Mutex::new(ProgressParser::new()),
                pid: Mutex::new(None),
            }),
        }
    }

    pub fn id(&self) -> &str {
        self.shared.logger.conversion_id()
    }

    pub fn settings(&self) -> &ConversionSettings {
        &self.shared.settings
    }

    /// Receive lifecycle events from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<ConversionEvent> {
        self.shared.events.subscribe()
    }

    pub fn phase(&self) -> ConversionPhase {
        *self.shared.phase.borrow()
    }

    /// Process id of the running transcoder.
    pub fn pid(&self) -> Option<u32> {
        *self.shared.pid.lock()
    }

    pub fn inputs(&self) -> Vec<Input> {
        self.shared.inputs.lock().clone()
    }

    pub fn outputs(&self) -> Vec<Output> {
        self.shared.outputs.lock().clone()
    }

    fn ensure_configurable(&self) -> MediaResult<()> {
        if self.shared.started.load(Ordering::SeqCst) || self.shared.stopped.load(Ordering::SeqCst) {
            return Err(MediaError::AlreadyStarted);
        }
        Ok(())
    }

    fn next_order(&self) -> usize {
        self.shared.declared.fetch_add(1, Ordering::SeqCst)
    }

    /// Add an input reading from `source`.
    pub fn add_input(&self, source: impl Into<InputSource>) -> MediaResult<Input> {
        self.ensure_configurable()?;

        let order = self.next_order();
        let mut inputs = self.shared.inputs.lock();
        let input = Input::new(
            inputs.len(),
            order,
            self.shared.settings.clone(),
            self.shared.events.clone(),
            source.into(),
        )?;
        inputs.push(input.clone());
        Ok(input)
    }

    /// Add an output read through [`Output::take_stream`].
    pub fn add_output(&self) -> MediaResult<Output> {
        self.push_output(OutputTarget::Stream)
    }

    /// Add an output written to a file.
    pub fn add_output_to(&self, path: impl Into<PathBuf>) -> MediaResult<Output> {
        self.push_output(OutputTarget::Path(path.into()))
    }

    fn push_output(&self, target: OutputTarget) -> MediaResult<Output> {
        self.ensure_configurable()?;

        let order = self.next_order();
        let mut outputs = self.shared.outputs.lock();
        let output = Output::new(
            outputs.len(),
            order,
            self.shared.settings.clone(),
            self.shared.inputs.clone(),
            target,
        )?;
        outputs.push(output.clone());
        Ok(output)
    }

    /// Add a stream output emitting whole raw video frames.
    ///
    /// Each chunk of the output stream is exactly one frame. The frame
    /// geometry can be queried as `chunk_size` once the output is ready.
    pub fn raw_frames_output(&self, pixel_format: Option<&str>) -> MediaResult<Output> {
        let output = self.add_output()?;

        output.set("video_codec", "rawvideo")?;
        output.set("format", "rawvideo")?;
        output.set("pixel_format", pixel_format.unwrap_or(DEFAULT_RAW_PIXEL_FORMAT))?;
        output.set("map", "0:v:0")?;
        output.set("disable_audio", true)?;
        output.enable_raw_frames();

        Ok(output)
    }

    /// Run a declared global setter with a single argument.
    pub fn set(&self, name: &str, value: impl Into<Value>) -> MediaResult<()> {
        self.shared.global.lock().set(name, &[value.into()])
    }

    pub fn get(&self, name: &str) -> Option<ArgValue> {
        self.shared.global.lock().get(name).cloned()
    }

    /// Apply global options by setting name, operation or flag.
    pub fn set_many<I, K>(&self, options: I) -> MediaResult<()>
    where
        I: IntoIterator<Item = (K, Value)>,
        K: AsRef<str>,
    {
        for (key, value) in options {
            let key = key.as_ref();
            match resolve_option(GLOBAL_ARGUMENTS, GLOBAL_OPERATIONS, key) {
                Some(OptionTarget::Argument(spec)) => {
                    self.shared.global.lock().set(spec.name, &spread(value))?
                }
                Some(OptionTarget::Operation("arguments")) => {
                    self.add_arguments(spread(value).iter().filter_map(value_text))
                }
                _ => return Err(MediaError::unknown_option("conversion", key)),
            }
        }
        Ok(())
    }

    /// Append verbatim global arguments.
    pub fn add_arguments<I, S>(&self, args: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.shared.global.lock().add_extra(args);
    }

    fn set_phase(&self, phase: ConversionPhase) {
        self.shared.phase.send_replace(phase);
        self.shared.logger.log_step(&format!("Phase: {:?}", phase));
    }

    /// Resolve every endpoint, spawn the transcoder and wire its pipes.
    ///
    /// Returns once the transcoder is running. Use [`Conversion::wait`] for
    /// the outcome. A failure here has already run cleanup.
    pub async fn start(&self) -> MediaResult<()> {
        if self.shared.stopped.load(Ordering::SeqCst) {
            return Err(MediaError::Cancelled);
        }
        if self.shared.started.swap(true, Ordering::SeqCst) {
            return Err(MediaError::AlreadyStarted);
        }

        let result = self.launch().await;
        if let Err(err) = &result {
            if matches!(err, MediaError::Cancelled) {
                debug!(conversion_id = %self.id(), "Stopped before the transcoder was spawned");
            } else if err.is_configuration() {
                self.shared.logger.log_warning(&err.to_string());
            } else {
                self.shared.logger.log_error(&err.to_string());
            }
            self.cleanup(Some(err.clone()));
        }
        result
    }

    /// Wait for the conversion to end.
    pub async fn wait(&self) -> MediaResult<()> {
        let mut outcome = self.shared.outcome.subscribe();
        let outcome = outcome
            .wait_for(Option::is_some)
            .await
            .map_err(|_| MediaError::internal("conversion state dropped"))?
            .clone();

        outcome.unwrap_or(Ok(()))
    }

    /// Start and wait for the outcome.
    pub async fn run(&self) -> MediaResult<()> {
        self.start().await?;
        self.wait().await
    }

    /// Stop the conversion without an error.
    pub fn stop(&self) {
        self.cleanup(None);
    }

    /// Stop the conversion with [`MediaError::Cancelled`].
    pub fn cancel(&self) {
        self.cleanup(Some(MediaError::Cancelled));
    }

    async fn launch(&self) -> MediaResult<()> {
        let inputs = self.inputs();
        let outputs = self.outputs();

        if inputs.is_empty() {
            return Err(MediaError::NoInputs);
        }
        if outputs.is_empty() {
            return Err(MediaError::NoOutputs);
        }

        self.set_phase(ConversionPhase::Preparing);
        self.unless_stopped(try_join(
            try_join_all(inputs.iter().map(Input::resolve_source)),
            self.prepare_directories(&outputs),
        ))
        .await?;

        self.set_phase(ConversionPhase::Assembling);
        let (input_tokens, output_tokens) = self
            .unless_stopped(try_join(
                try_join_all(inputs.iter().map(Input::argument_tokens)),
                try_join_all(outputs.iter().map(Output::argument_tokens)),
            ))
            .await?;

        if self.shared.stopped.load(Ordering::SeqCst) {
            return Err(MediaError::Cancelled);
        }

        self.set_phase(ConversionPhase::PipeAllocation);
        let mut endpoints: Vec<Endpoint> = inputs
            .iter()
            .cloned()
            .map(Endpoint::Input)
            .chain(outputs.iter().cloned().map(Endpoint::Output))
            .collect();
        endpoints.sort_by_key(Endpoint::order);

        let roles: Vec<Option<PipeRole>> = endpoints.iter().map(Endpoint::pipe_role).collect();
        let pipes = allocate_pipes(&roles);
        for (endpoint, pipe) in endpoints.iter().zip(&pipes) {
            if let Some(pipe) = pipe {
                endpoint.assign_pipe(*pipe);
            }
        }
        debug!(
            conversion_id = %self.id(),
            descriptors = descriptor_table_size(&pipes),
            "Pipes allocated"
        );

        let mut command = FfmpegCommand::new(&self.shared.settings.ffmpeg_path)
            .global_args(self.shared.global.lock().to_tokens());
        for (input, tokens) in inputs.iter().zip(input_tokens) {
            command = command.input(tokens, input.source_argument()?);
        }
        for (output, tokens) in outputs.iter().zip(output_tokens) {
            command = command.output(tokens, output.target_argument());
        }

        let args = command.build_args();
        self.shared.events.emit(ConversionEvent::Arguments(args.clone()));

        self.spawn_transcoder(&command, &args, &inputs, &outputs)
    }

    /// Abandon `work` as soon as the conversion is stopped.
    async fn unless_stopped<T, F>(&self, work: F) -> MediaResult<T>
    where
        F: Future<Output = MediaResult<T>>,
    {
        let mut kill = self.shared.kill.subscribe();
        tokio::select! {
            result = work => result,
            _ = kill_requested(&mut kill) => Err(MediaError::Cancelled),
        }
    }

    async fn prepare_directories(&self, outputs: &[Output]) -> MediaResult<()> {
        tokio::fs::create_dir_all(self.shared.settings.working_path()).await?;

        for output in outputs {
            if let Some(parent) = output.target_path().as_deref().and_then(|path| path.parent()) {
                if !parent.as_os_str().is_empty() {
                    tokio::fs::create_dir_all(parent).await?;
                }
            }
        }

        Ok(())
    }

    fn spawn_transcoder(
        &self,
        command: &FfmpegCommand,
        args: &[String],
        inputs: &[Input],
        outputs: &[Output],
    ) -> MediaResult<()> {
        let stdin_input = inputs.iter().find(|input| input.pipe_number() == Some(0)).cloned();
        let stdout_output = outputs.iter().find(|output| output.pipe_number() == Some(1)).cloned();

        let mut extra = Vec::new();
        for input in inputs {
            if let Some(pipe) = input.pipe_number().filter(|pipe| *pipe >= FIRST_EXTRA_PIPE) {
                extra.push((Endpoint::Input(input.clone()), ExtraPipe::open(pipe, PipeRole::Input)?));
            }
        }
        for output in outputs {
            if let Some(pipe) = output.pipe_number().filter(|pipe| *pipe >= FIRST_EXTRA_PIPE) {
                extra.push((Endpoint::Output(output.clone()), ExtraPipe::open(pipe, PipeRole::Output)?));
            }
        }

        let program = command.program().to_path_buf();
        let mut process = Command::new(&program);
        process
            .args(args)
            .stdin(if stdin_input.is_some() { Stdio::piped() } else { Stdio::null() })
            .stdout(if stdout_output.is_some() { Stdio::piped() } else { Stdio::null() })
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mappings = extra.iter().map(|(_, pipe)| pipe.mapping()).collect();
        configure_child(&mut process, mappings, self.shared.settings.niceness);

        let mut child = process
            .spawn()
            .map_err(|err| MediaError::spawn_failed(program.display().to_string(), &err))?;

        let extra: Vec<(Endpoint, ParentEnd)> = extra
            .into_iter()
            .map(|(endpoint, pipe)| (endpoint, pipe.into_parent()))
            .collect();

        let pid = child.id();
        *self.shared.pid.lock() = pid;
        self.set_phase(ConversionPhase::Running);
        self.shared.logger.log_spawn(pid, args);
        self.shared.events.emit(ConversionEvent::Start { pid });

        if let (Some(input), Some(stdin)) = (stdin_input, child.stdin.take()) {
            self.feed_input(input, stdin);
        }

        let mut output_tasks = Vec::new();
        if let (Some(output), Some(stdout)) = (stdout_output, child.stdout.take()) {
            output_tasks.push(tokio::spawn(output.pump_from(stdout)));
        }

        for (endpoint, end) in extra {
            match (endpoint, end) {
                (Endpoint::Input(input), ParentEnd::Writer(writer)) => self.feed_input(input, writer),
                (Endpoint::Output(output), ParentEnd::Reader(reader)) => {
                    output_tasks.push(tokio::spawn(output.pump_from(reader)))
                }
                _ => warn!(conversion_id = %self.id(), "Pipe direction does not match its endpoint"),
            }
        }

        let span = self.shared.logger.create_span();
        let diagnostics = tokio::spawn(
            self.clone()
                .read_diagnostics(child.stderr.take())
                .instrument(span.clone()),
        );
        tokio::spawn(
            self.clone()
                .supervise(child, output_tasks, diagnostics)
                .instrument(span),
        );

        Ok(())
    }

    fn feed_input<W>(&self, input: Input, writer: W)
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let Some(source) = input.take_source_stream() else {
            warn!(conversion_id = %self.id(), input = input.index(), "Input stream already consumed");
            return;
        };

        tokio::spawn(self.clone().write_pipe(source, writer, input.index()));
        input.resume();
    }

    async fn write_pipe<W>(self, mut source: Fork, mut writer: W, index: usize)
    where
        W: AsyncWrite + Unpin,
    {
        let mut kill = self.shared.kill.subscribe();
        let mut written = 0usize;

        loop {
            let next = tokio::select! {
                _ = kill_requested(&mut kill) => break,
                next = source.next() => next,
            };
            let Some(chunk) = next else {
                break;
            };

            match chunk {
                Ok(chunk) => {
                    if let Err(err) = writer.write_all(&chunk).await {
                        if err.kind() != std::io::ErrorKind::BrokenPipe {
                            warn!(conversion_id = %self.id(), input = index, error = %err, "Failed writing to transcoder");
                        }
                        break;
                    }
                    written += chunk.len();
                }
                Err(err) => {
                    warn!(conversion_id = %self.id(), input = index, error = %err, "Input stream failed");
                    self.cleanup(Some(err.into()));
                    break;
                }
            }
        }

        let _ = writer.shutdown().await;
        source.end();
        debug!(conversion_id = %self.id(), input = index, bytes = written, "Input pipe closed");
    }

    async fn read_diagnostics(self, stderr: Option<ChildStderr>) {
        let Some(stderr) = stderr else {
            return;
        };

        let mut lines = FramedRead::new(stderr, AnyDelimiterCodec::new(b"\r\n".to_vec(), Vec::new()));
        while let Some(line) = lines.next().await {
            match line {
                Ok(line) => self.handle_line(&String::from_utf8_lossy(&line)),
                Err(err) => {
                    debug!(conversion_id = %self.id(), error = %err, "Diagnostic channel failed");
                    break;
                }
            }
        }
    }

    fn handle_line(&self, line: &str) {
        let event = self.shared.parser.lock().feed(line);

        match event {
            LineEvent::Fatal(message) => {
                self.shared.logger.log_error(&message);
                self.cleanup(Some(MediaError::ffmpeg_failed(message, Some(line.to_string()), None)));
            }
            LineEvent::Progress(progress) => self.shared.events.emit(ConversionEvent::Progress(progress)),
            LineEvent::InputCodec(description) => {
                self.shared.events.emit(ConversionEvent::InputCodec(description))
            }
            LineEvent::SeenError(message) => debug!(conversion_id = %self.id(), "Remembering error: {}", message),
            LineEvent::Info(message) => {
                debug!(conversion_id = %self.id(), "{}", message);
                self.shared.events.emit(ConversionEvent::ConversionError(message));
            }
            LineEvent::Ignored => {}
        }
    }

    async fn supervise(self, mut child: Child, outputs: Vec<JoinHandle<()>>, diagnostics: JoinHandle<()>) {
        let mut kill = self.shared.kill.subscribe();

        let status = tokio::select! {
            status = child.wait() => status,
            _ = kill_requested(&mut kill) => {
                if let Err(err) = child.start_kill() {
                    debug!(conversion_id = %self.id(), error = %err, "Transcoder already gone");
                }
                child.wait().await
            }
        };

        let _ = diagnostics.await;
        for task in outputs {
            let _ = task.await;
        }

        match status {
            Ok(status) if status.success() => self.cleanup(None),
            Ok(status) => {
                let err = self.shared.parser.lock().exit_error(status.code());
                self.cleanup(Some(err));
            }
            Err(err) => self.cleanup(Some(err.into())),
        }
    }

    /// Release every endpoint and stop. Only the first call does anything.
    ///
    /// Stream outputs end once their pipe is drained, or carry `err` as
    /// their last item.
    fn cleanup(&self, err: Option<MediaError>) {
        if self.shared.cleaned_up.swap(true, Ordering::SeqCst) {
            return;
        }

        let err = err.or_else(|| {
            self.shared
                .parser
                .lock()
                .seen_error()
                .map(|seen| MediaError::ffmpeg_failed(seen, None, None))
        });

        for input in self.inputs() {
            input.destroy();
        }

        for output in self.outputs() {
            match &err {
                Some(err) => output.destroy(err),
                None => output.finish(),
            }
        }

        self.finish(err);
    }

    fn finish(&self, err: Option<MediaError>) {
        if self.shared.stopped.swap(true, Ordering::SeqCst) {
            return;
        }

        self.shared.kill.send_replace(true);
        self.set_phase(ConversionPhase::Ended);
        self.shared.logger.log_end(err.is_some());

        self.shared.events.emit(ConversionEvent::End(err.clone()));
        if let Some(err) = &err {
            self.shared.events.emit(ConversionEvent::Error(err.clone()));
        }

        self.shared.outcome.send_replace(Some(match err {
            Some(err) => Err(err),
            None => Ok(()),
        }));
    }

    /// Set the niceness of the running transcoder.
    ///
    /// The value is absolute, like [`ConversionSettings::niceness`]. Does
    /// nothing when the transcoder is not running or already has this
    /// niceness.
    pub fn renice(&self, niceness: i32) -> MediaResult<()> {
        if self.phase() != ConversionPhase::Running {
            return Ok(());
        }
        let Some(pid) = self.pid() else {
            return Ok(());
        };

        let mut current = self.shared.niceness.lock();
        if *current == Some(niceness) {
            return Ok(());
        }

        set_niceness(pid, niceness)?;
        *current = Some(niceness);
        debug!(conversion_id = %self.id(), pid, niceness, "Transcoder reniced");
        Ok(())
    }
}

async fn kill_requested(kill: &mut watch::Receiver<bool>) {
    let _ = kill.wait_for(|kill| *kill).await;
}

impl std::fmt::Debug for Conversion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Conversion")
            .field("id", &self.id())
            .field("phase", &self.phase())
            .field("inputs", &self.shared.inputs.lock().len())
            .field("outputs", &self.shared.outputs.lock().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn conversion() -> Conversion {
        Conversion::with_settings(
            ConversionSettings::default()
                .with_ffmpeg_path("/nonexistent/ffmpeg")
                .with_ffprobe_path("/nonexistent/ffprobe")
                .with_work_dir(std::env::temp_dir()),
        )
    }

    #[test]
    fn test_global_defaults() {
        let conversion = conversion();
        assert_eq!(conversion.get("hide_banner"), Some(ArgValue::bare()));
        assert_eq!(conversion.shared.global.lock().to_tokens(), vec!["-hide_banner", "-y"]);
        assert_eq!(conversion.phase(), ConversionPhase::Idle);
    }

    #[test]
    fn test_global_set_many() {
        let conversion = conversion();
        conversion
            .set_many([("loglevel", json!("info")), ("arguments", json!(["-nostdin"]))])
            .unwrap();

        assert_eq!(
            conversion.shared.global.lock().to_tokens(),
            vec!["-hide_banner", "-y", "-loglevel", "info", "-nostdin"]
        );
        assert!(matches!(
            conversion.set_many([("nope", json!(1))]),
            Err(MediaError::UnknownOption { endpoint: "conversion", .. })
        ));
    }

    #[tokio::test]
    async fn test_start_without_endpoints() {
        let conversion = conversion();
        assert!(matches!(conversion.start().await, Err(MediaError::NoInputs)));
        assert!(matches!(conversion.wait().await, Err(MediaError::NoInputs)));
        assert_eq!(conversion.phase(), ConversionPhase::Ended);
    }

    #[tokio::test]
    async fn test_no_outputs() {
        let conversion = conversion();
        conversion.add_input("/media/clip.mp4").unwrap();
        assert!(matches!(conversion.start().await, Err(MediaError::NoOutputs)));
    }

    #[tokio::test]
    async fn test_spawn_failure_runs_cleanup() {
        let conversion = conversion();
        let mut events = conversion.subscribe();

        let input = conversion.add_input("/media/clip.mp4").unwrap();
        input.set("video_codec", "h264").unwrap();
        let output = conversion.add_output().unwrap();
        output.set("video_codec", "libvpx").unwrap();

        let err = conversion.start().await.unwrap_err();
        assert!(matches!(err, MediaError::SpawnFailed { .. }));

        let mut ends = 0;
        let mut errors = 0;
        while let Ok(event) = events.try_recv() {
            match event {
                ConversionEvent::End(Some(_)) => ends += 1,
                ConversionEvent::Error(_) => errors += 1,
                _ => {}
            }
        }
        assert_eq!((ends, errors), (1, 1));

        conversion.stop();
        conversion.cancel();
        assert!(matches!(events.try_recv(), Err(broadcast::error::TryRecvError::Empty)));
    }

    #[tokio::test]
    async fn test_configuration_closed_after_stop() {
        let conversion = conversion();
        conversion.stop();

        assert!(matches!(conversion.add_output(), Err(MediaError::AlreadyStarted)));
        assert!(matches!(conversion.start().await, Err(MediaError::Cancelled)));
        assert!(conversion.wait().await.is_ok());
    }

    #[tokio::test]
    async fn test_raw_frames_output_settings() {
        let conversion = conversion();
        let output = conversion.raw_frames_output(Some("gray")).unwrap();

        assert_eq!(output.get("video_codec"), Some(ArgValue::from("rawvideo")));
        assert_eq!(output.get("pixel_format"), Some(ArgValue::from("gray")));
        assert_eq!(output.get("map"), Some(ArgValue::from("0:v:0")));
        assert_eq!(output.get("disable_audio"), Some(ArgValue::bare()));
    }

    #[tokio::test]
    async fn test_renice_when_not_running() {
        let conversion = conversion();
        assert!(conversion.renice(5).is_ok());
    }
}
