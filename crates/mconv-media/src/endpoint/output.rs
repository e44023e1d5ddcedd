//! Conversion outputs.

use std::collections::HashMap;
use std::fmt;
use std::io;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use bytes::Bytes;
use futures::future::{self, BoxFuture};
use futures::{FutureExt, Stream, StreamExt};
use mconv_models::{is_truthy, value_text, ArgValue, RawFrameInfo};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::io::AsyncRead;
use tokio::sync::{mpsc, watch, OnceCell};
use tokio_util::io::ReaderStream;
use tracing::{debug, info};
use uuid::Uuid;

use super::arguments::{
    resolve_option, spread, ArgumentSet, OptionTarget, OUTPUT_ARGUMENTS, OUTPUT_OPERATIONS,
};
use super::input::Input;
use super::InputList;
use crate::codecs::CodecCatalog;
use crate::command::pipe_argument;
use crate::error::{MediaError, MediaResult};
use crate::settings::ConversionSettings;
use crate::streams::FrameChunker;

/// Where an output writes to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputTarget {
    /// Bytes are piped out and read through [`Output::take_stream`]
    Stream,
    /// A file written by the transcoder itself
    Path(PathBuf),
}

/// Bytes produced by a stream output.
///
/// Ends when the transcoder closes the pipe. A failed conversion delivers
/// its error as the last item.
#[derive(Debug)]
pub struct OutputStream {
    rx: mpsc::Receiver<io::Result<Bytes>>,
}

impl Stream for OutputStream {
    type Item = io::Result<Bytes>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().rx.poll_recv(cx)
    }
}

type ChunkSender = mpsc::Sender<io::Result<Bytes>>;

#[derive(Debug, Clone)]
enum ProbeOverride {
    Value(Value),
    /// Answered from the raw frame geometry computed during readiness
    FrameInfo,
}

/// One output of a conversion.
///
/// Handles are cheap to clone and share their state.
#[derive(Clone)]
pub struct Output {
    inner: Arc<OutputInner>,
}

struct OutputInner {
    id: Uuid,
    index: usize,
    order: usize,
    settings: Arc<ConversionSettings>,
    inputs: InputList,
    state: Mutex<OutputState>,
    ready: OnceCell<()>,
    frame_info: watch::Sender<Option<RawFrameInfo>>,
    closed: watch::Sender<bool>,
}

struct OutputState {
    arguments: ArgumentSet,
    filters: Vec<(String, String)>,
    target: OutputTarget,
    allow_copy: bool,
    allow_video_copy: Option<bool>,
    overrides: HashMap<String, ProbeOverride>,
    raw_frames: bool,
    pipe_number: Option<u32>,
    sender: Option<ChunkSender>,
    stream: Option<OutputStream>,
}

impl Output {
    pub(crate) fn new(
        index: usize,
        order: usize,
        settings: Arc<ConversionSettings>,
        inputs: InputList,
        target: OutputTarget,
    ) -> MediaResult<Self> {
        let mut arguments = ArgumentSet::new("output", OUTPUT_ARGUMENTS);
        arguments.set("strict", &[Value::from(-2)])?;

        let (sender, stream) = match target {
            OutputTarget::Stream => {
                let (tx, rx) = mpsc::channel(settings.output_buffer.max(1));
                (Some(tx), Some(OutputStream { rx }))
            }
            OutputTarget::Path(_) => (None, None),
        };

        let (frame_info, _) = watch::channel(None);
        let (closed, _) = watch::channel(false);

        Ok(Self {
            inner: Arc::new(OutputInner {
                id: Uuid::new_v4(),
                index,
                order,
                settings,
                inputs,
                state: Mutex::new(OutputState {
                    arguments,
                    filters: Vec::new(),
                    target,
                    allow_copy: true,
                    allow_video_copy: None,
                    overrides: HashMap::new(),
                    raw_frames: false,
                    pipe_number: None,
                    sender,
                    stream,
                }),
                ready: OnceCell::new(),
                frame_info,
                closed,
            }),
        })
    }

    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    /// Position among the conversion's outputs.
    pub fn index(&self) -> usize {
        self.inner.index
    }

    pub(crate) fn order(&self) -> usize {
        self.inner.order
    }

    /// Run a declared setter with a single argument.
    pub fn set(&self, name: &str, value: impl Into<Value>) -> MediaResult<()> {
        self.set_with(name, &[value.into()])
    }

    /// Run a declared setter.
    pub fn set_with(&self, name: &str, args: &[Value]) -> MediaResult<()> {
        self.inner.state.lock().arguments.set(name, args)
    }

    pub fn get(&self, name: &str) -> Option<ArgValue> {
        self.inner.state.lock().arguments.get(name).cloned()
    }

    /// Apply options by setting name, operation or flag.
    pub fn set_many<I, K>(&self, options: I) -> MediaResult<()>
    where
        I: IntoIterator<Item = (K, Value)>,
        K: AsRef<str>,
    {
        for (key, value) in options {
            let key = key.as_ref();
            match resolve_option(OUTPUT_ARGUMENTS, OUTPUT_OPERATIONS, key) {
                Some(OptionTarget::Argument(spec)) => self.set_with(spec.name, &spread(value))?,
                Some(OptionTarget::Operation("filter")) => {
                    let args = spread(value);
                    let name = args.first().and_then(value_text).ok_or_else(|| {
                        MediaError::invalid_option("filter", "a filter needs a name")
                    })?;
                    let params = args.get(1).and_then(value_text).unwrap_or_default();
                    self.set_filter(name, params);
                }
                Some(OptionTarget::Operation("allow_copy")) => self.set_allow_copy(is_truthy(&value)),
                Some(OptionTarget::Operation("arguments")) => {
                    self.add_arguments(spread(value).iter().filter_map(value_text))
                }
                _ => return Err(MediaError::unknown_option("output", key)),
            }
        }
        Ok(())
    }

    /// Append verbatim arguments placed before the target.
    pub fn add_arguments<I, S>(&self, args: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.inner.state.lock().arguments.add_extra(args);
    }

    /// Add or replace a video filter. Empty `params` emits the bare name.
    ///
    /// Any filter forces the video to be re-encoded.
    pub fn set_filter(&self, name: impl Into<String>, params: impl Into<String>) {
        let (name, params) = (name.into(), params.into());
        let mut state = self.inner.state.lock();
        match state.filters.iter_mut().find(|(existing, _)| *existing == name) {
            Some(entry) => entry.1 = params,
            None => state.filters.push((name, params)),
        }
    }

    /// The `-vf` filter chain.
    pub fn filter_chain(&self) -> Option<String> {
        let state = self.inner.state.lock();
        render_filters(&state.filters)
    }

    /// Allow passing the video through when the codecs already match.
    pub fn set_allow_copy(&self, allow: bool) {
        self.inner.state.lock().allow_copy = allow;
    }

    /// Whether readiness decided to copy the video stream.
    pub fn allow_video_copy(&self) -> Option<bool> {
        self.inner.state.lock().allow_video_copy
    }

    /// Answer a probe query about this output with a fixed value.
    pub fn set_probe_override(&self, name: impl Into<String>, value: impl Into<Value>) {
        self.inner
            .state
            .lock()
            .overrides
            .insert(name.into(), ProbeOverride::Value(value.into()));
    }

    /// Re-frame the piped bytes into whole raw frames.
    pub(crate) fn enable_raw_frames(&self) {
        let mut state = self.inner.state.lock();
        state.raw_frames = true;
        state
            .overrides
            .insert("chunk_size".to_string(), ProbeOverride::FrameInfo);
    }

    /// Raw frame geometry, known once the output is ready.
    pub fn frame_info(&self) -> Option<RawFrameInfo> {
        *self.inner.frame_info.borrow()
    }

    pub fn target(&self) -> OutputTarget {
        self.inner.state.lock().target.clone()
    }

    pub fn target_path(&self) -> Option<PathBuf> {
        match &self.inner.state.lock().target {
            OutputTarget::Path(path) => Some(path.clone()),
            OutputTarget::Stream => None,
        }
    }

    /// Whether the transcoder writes this output to a pipe.
    pub fn is_stream_backed(&self) -> bool {
        self.inner.state.lock().target == OutputTarget::Stream
    }

    /// Take the byte stream of a stream output. Only one caller gets it.
    pub fn take_stream(&self) -> MediaResult<OutputStream> {
        let mut state = self.inner.state.lock();
        if let OutputTarget::Path(path) = &state.target {
            return Err(MediaError::invalid_option(
                "output",
                format!("{} is a file target and has no stream", path.display()),
            ));
        }
        state.stream.take().ok_or(MediaError::StreamTaken)
    }

    pub fn pipe_number(&self) -> Option<u32> {
        self.inner.state.lock().pipe_number
    }

    pub(crate) fn assign_pipe(&self, pipe: u32) {
        self.inner.state.lock().pipe_number = Some(pipe);
    }

    /// The trailing target argument.
    pub(crate) fn target_argument(&self) -> String {
        let state = self.inner.state.lock();
        match (&state.target, state.pipe_number) {
            (OutputTarget::Path(path), _) => path.to_string_lossy().into_owned(),
            (OutputTarget::Stream, Some(pipe)) => pipe_argument(pipe),
            (OutputTarget::Stream, None) => pipe_argument(1),
        }
    }

    fn upstream_input(&self) -> Option<Input> {
        self.inner.inputs.lock().first().cloned()
    }

    async fn upstream_value(&self, name: &str) -> MediaResult<Option<Value>> {
        match self.upstream_input() {
            Some(input) => input.probe_value(name).await,
            None => Ok(None),
        }
    }

    /// Resolve a probe query.
    ///
    /// Overrides answer first, then locally set values, then the upstream
    /// input.
    pub fn probe_value<'a>(&'a self, name: &'a str) -> BoxFuture<'a, MediaResult<Option<Value>>> {
        async move {
            let found = self.inner.state.lock().overrides.get(name).cloned();
            match found {
                Some(ProbeOverride::Value(value)) => return Ok(Some(value)),
                Some(ProbeOverride::FrameInfo) => {
                    self.ensure_ready().await?;
                    let info = self
                        .frame_info()
                        .ok_or_else(|| MediaError::missing_probe_value("Video size"))?;
                    let value = serde_json::to_value(info)
                        .map_err(|err| MediaError::internal(err.to_string()))?;
                    return Ok(Some(value));
                }
                None => {}
            }

            let local = self.inner.state.lock().arguments.lookup(name).map(ArgValue::to_json);
            if local.is_some() {
                return Ok(local);
            }

            self.upstream_value(name).await
        }
        .boxed()
    }

    /// Decide copy, fill raw video parameters and compute frame geometry.
    /// Runs once.
    pub async fn ensure_ready(&self) -> MediaResult<()> {
        self.inner
            .ready
            .get_or_try_init(|| self.make_ready())
            .await
            .map(|_| ())
    }

    async fn make_ready(&self) -> MediaResult<()> {
        let (declared, allow_copy, filtered, pixel_format, raw_frames) = {
            let state = self.inner.state.lock();
            (
                state.arguments.text("video_codec"),
                state.allow_copy,
                !state.filters.is_empty(),
                state.arguments.text("pixel_format"),
                state.raw_frames,
            )
        };

        let mut copy = false;
        if let (Some(declared), true, false) = (&declared, allow_copy, filtered) {
            if let Some(input) = self.upstream_input() {
                copy = self.copy_possible(&input, declared, pixel_format.as_deref()).await?;
            }
        }

        self.inner.state.lock().allow_video_copy = Some(copy);
        if copy {
            info!(output = %self.inner.id, "Video stream will be copied");
        }

        if !copy && declared.as_deref() == Some("rawvideo") {
            self.fill_raw_parameters().await?;
        }

        if raw_frames {
            let size = self.probe_value("video_size").await?.as_ref().and_then(value_text);
            let pixel_format = self
                .probe_value("pixel_format")
                .await?
                .as_ref()
                .and_then(value_text)
                .unwrap_or_else(|| mconv_models::DEFAULT_RAW_PIXEL_FORMAT.to_string());

            let info = size
                .as_deref()
                .and_then(|size| RawFrameInfo::from_video_size(size, &pixel_format))
                .ok_or_else(|| MediaError::missing_probe_value("Video size"))?;

            debug!(output = %self.inner.id, chunk_size = info.chunk_size, "Raw frame size resolved");
            self.inner.frame_info.send_replace(Some(info));
        }

        Ok(())
    }

    async fn copy_possible(&self, input: &Input, declared: &str, pixel_format: Option<&str>) -> MediaResult<bool> {
        let Some(codec) = input.probe_value("video_codec").await?.as_ref().and_then(value_text) else {
            return Ok(false);
        };

        if codec != declared {
            let normalized = match CodecCatalog::load(&self.inner.settings.ffmpeg_path).await {
                Ok(catalog) => catalog.preferred_encoder(&codec).map(String::from),
                Err(err) => {
                    debug!(output = %self.inner.id, error = %err, "Codec catalog unavailable");
                    None
                }
            };

            if normalized.as_deref() != Some(declared) {
                return Ok(false);
            }
        }

        if let Some(wanted) = pixel_format {
            let current = input.probe_value("pixel_format").await?.as_ref().and_then(value_text);
            if current.as_deref() != Some(wanted) {
                return Ok(false);
            }
        }

        Ok(true)
    }

    async fn fill_raw_parameters(&self) -> MediaResult<()> {
        let missing: Vec<(&str, &str, &str)> = {
            let state = self.inner.state.lock();
            [
                ("pixel_format", "pixel_format", "Pixel format"),
                ("resolution", "video_size", "Video size"),
                ("framerate", "framerate", "Framerate"),
            ]
            .into_iter()
            .filter(|(name, _, _)| state.arguments.get(name).is_none())
            .collect()
        };

        let values = future::try_join_all(missing.iter().map(|(_, query, label)| async move {
            self.upstream_value(query)
                .await?
                .filter(|value| !value.is_null())
                .ok_or_else(|| MediaError::missing_probe_value(*label))
        }))
        .await?;

        for ((name, _, _), value) in missing.iter().zip(values) {
            self.set(name, value)?;
        }

        Ok(())
    }

    /// Flags, filter chain and extra arguments, placed before the target.
    pub async fn argument_tokens(&self) -> MediaResult<Vec<String>> {
        self.ensure_ready().await?;

        let state = self.inner.state.lock();
        let overrides: &[(&str, &str)] = if state.allow_video_copy == Some(true) {
            &[("c:v", "copy")]
        } else {
            &[]
        };

        let mut tokens = state.arguments.flag_tokens(overrides);
        if let Some(chain) = render_filters(&state.filters) {
            tokens.push("-vf".to_string());
            tokens.push(chain);
        }
        tokens.extend(state.arguments.extra().iter().cloned());

        Ok(tokens)
    }

    fn sender(&self) -> Option<ChunkSender> {
        self.inner.state.lock().sender.clone()
    }

    /// Forward the transcoder's pipe to the output stream.
    ///
    /// Raw frame outputs are re-framed into whole frames. If the consumer
    /// dropped its stream the pipe is still drained so the transcoder never
    /// blocks on it. The stream itself ends with [`Output::finish`] or
    /// [`Output::destroy`], once the conversion's outcome is known.
    pub(crate) async fn pump_from<R>(self, reader: R)
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let Some(tx) = self.sender() else {
            return;
        };

        let raw_frames = self.inner.state.lock().raw_frames;
        let mut closed = self.inner.closed.subscribe();
        let mut reader = ReaderStream::new(reader);
        let mut chunker: Option<FrameChunker> = None;
        let mut consumer_gone = false;
        let mut forwarded = 0usize;

        loop {
            let next = tokio::select! {
                _ = closed_signal(&mut closed) => break,
                next = reader.next() => next,
            };

            let chunks = match next {
                Some(Ok(chunk)) if raw_frames => {
                    if chunker.is_none() {
                        match self.wait_for_frame_info(&mut closed).await {
                            Some(info) => chunker = Some(FrameChunker::new(info.chunk_size)),
                            None => break,
                        }
                    }
                    match chunker.as_mut() {
                        Some(chunker) => chunker.push(&chunk),
                        None => break,
                    }
                }
                Some(Ok(chunk)) => vec![chunk],
                Some(Err(err)) => {
                    if !consumer_gone {
                        let _ = tx.send(Err(err)).await;
                    }
                    break;
                }
                None => break,
            };

            if consumer_gone {
                continue;
            }

            for chunk in chunks {
                let len = chunk.len();
                let sent = tokio::select! {
                    _ = closed_signal(&mut closed) => return,
                    sent = tx.send(Ok(chunk)) => sent,
                };
                if sent.is_err() {
                    debug!(output = %self.inner.id, "Output stream dropped, discarding data");
                    consumer_gone = true;
                    break;
                }
                forwarded += len;
            }
        }

        debug!(output = %self.inner.id, bytes = forwarded, "Output pipe closed");
    }

    async fn wait_for_frame_info(&self, closed: &mut watch::Receiver<bool>) -> Option<RawFrameInfo> {
        let mut info = self.inner.frame_info.subscribe();
        tokio::select! {
            _ = closed_signal(closed) => None,
            found = frame_ready(&mut info) => found,
        }
    }

    /// End the output stream.
    pub(crate) fn finish(&self) {
        self.inner.state.lock().sender = None;
    }

    /// Deliver `err` to the stream consumer and close the output.
    pub fn destroy(&self, err: &MediaError) {
        let sender = self.inner.state.lock().sender.take();
        self.inner.closed.send_replace(true);

        let Some(tx) = sender else {
            return;
        };
        if let Err(mpsc::error::TrySendError::Full(item)) = tx.try_send(Err(io::Error::other(err.to_string()))) {
            // Consumer is behind; queue the error after the buffered chunks
            if let Ok(runtime) = tokio::runtime::Handle::try_current() {
                runtime.spawn(async move {
                    let _ = tx.send(item).await;
                });
            }
        }
    }
}

async fn closed_signal(closed: &mut watch::Receiver<bool>) {
    let _ = closed.wait_for(|closed| *closed).await;
}

async fn frame_ready(info: &mut watch::Receiver<Option<RawFrameInfo>>) -> Option<RawFrameInfo> {
    info.wait_for(Option::is_some).await.ok().and_then(|info| *info)
}

fn render_filters(filters: &[(String, String)]) -> Option<String> {
    if filters.is_empty() {
        return None;
    }

    let chain = filters
        .iter()
        .map(|(name, params)| {
            if params.is_empty() {
                name.clone()
            } else {
                format!("{name}={params}")
            }
        })
        .collect::<Vec<_>>()
        .join(",");

    Some(chain)
}

impl fmt::Debug for Output {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("Output")
            .field("id", &self.inner.id)
            .field("target", &state.target)
            .field("pipe_number", &state.pipe_number)
            .field("allow_video_copy", &state.allow_video_copy)
            .finish()
    }
}
