//! Conversion inputs.

use std::fmt;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::Bytes;
use futures::future::{self, BoxFuture};
use futures::{FutureExt, Stream, StreamExt};
use mconv_models::{is_network_source, is_truthy, value_text, ArgValue};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::io::AsyncRead;
use tokio::sync::OnceCell;
use tokio_util::io::ReaderStream;
use tracing::{debug, warn};

use super::arguments::{
    resolve_option, spread, ArgumentSet, OptionTarget, INPUT_ARGUMENTS, INPUT_OPERATIONS,
};
use super::output::Output;
use crate::command::pipe_argument;
use crate::error::{MediaError, MediaResult};
use crate::events::{ConversionEvent, EventSink};
use crate::probe::{Probe, ProbeOptions};
use crate::settings::ConversionSettings;
use crate::streams::{ByteStream, Fork, StreamForker};

/// Produces an input's real source once, while the conversion prepares.
pub type SourceProvider = Box<dyn FnOnce() -> BoxFuture<'static, MediaResult<InputSource>> + Send>;

/// Where an input reads from.
pub enum InputSource {
    /// A local file, opened by the transcoder itself
    Path(PathBuf),
    /// A network address or device, opened by the transcoder itself
    Url(String),
    /// Bytes piped into the transcoder
    Stream(ByteStream),
    /// The stream output of another conversion
    Output(Output),
    Deferred(SourceProvider),
}

impl InputSource {
    /// Pipe any async reader.
    pub fn reader<R>(reader: R) -> Self
    where
        R: AsyncRead + Send + 'static,
    {
        Self::Stream(ReaderStream::new(reader).boxed())
    }

    pub fn stream<S>(stream: S) -> Self
    where
        S: Stream<Item = std::io::Result<Bytes>> + Send + 'static,
    {
        Self::Stream(stream.boxed())
    }

    /// Resolve the source lazily.
    pub fn deferred<F, Fut>(provider: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = MediaResult<InputSource>> + Send + 'static,
    {
        Self::Deferred(Box::new(move || provider().boxed()))
    }
}

impl From<&str> for InputSource {
    fn from(source: &str) -> Self {
        if is_network_source(source) {
            Self::Url(source.to_string())
        } else {
            Self::Path(PathBuf::from(source))
        }
    }
}

impl From<String> for InputSource {
    fn from(source: String) -> Self {
        Self::from(source.as_str())
    }
}

impl From<PathBuf> for InputSource {
    fn from(path: PathBuf) -> Self {
        Self::Path(path)
    }
}

impl From<&Path> for InputSource {
    fn from(path: &Path) -> Self {
        Self::Path(path.to_path_buf())
    }
}

impl From<Output> for InputSource {
    fn from(output: Output) -> Self {
        Self::Output(output)
    }
}

impl fmt::Debug for InputSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Path(path) => f.debug_tuple("Path").field(path).finish(),
            Self::Url(url) => f.debug_tuple("Url").field(url).finish(),
            Self::Stream(_) => f.write_str("Stream"),
            Self::Output(output) => f.debug_tuple("Output").field(&output.id()).finish(),
            Self::Deferred(_) => f.write_str("Deferred"),
        }
    }
}

/// One input of a conversion.
///
/// Handles are cheap to clone and share their state.
#[derive(Clone)]
pub struct Input {
    inner: Arc<InputInner>,
}

struct InputInner {
    index: usize,
    order: usize,
    settings: Arc<ConversionSettings>,
    events: EventSink,
    state: Mutex<InputState>,
    source_ready: OnceCell<()>,
    ready: OnceCell<()>,
}

struct InputState {
    arguments: ArgumentSet,
    location: Option<String>,
    is_network_source: bool,
    provider: Option<SourceProvider>,
    forker: Option<StreamForker>,
    source_stream: Option<Fork>,
    stream_backed: bool,
    upstream: Option<Output>,
    probe: Option<Arc<Probe>>,
    make_it_live: bool,
    pipe_number: Option<u32>,
    destroyed: bool,
}

impl Input {
    pub(crate) fn new(
        index: usize,
        order: usize,
        settings: Arc<ConversionSettings>,
        events: EventSink,
        source: InputSource,
    ) -> MediaResult<Self> {
        let input = Self {
            inner: Arc::new(InputInner {
                index,
                order,
                settings,
                events,
                state: Mutex::new(InputState {
                    arguments: ArgumentSet::new("input", INPUT_ARGUMENTS),
                    location: None,
                    is_network_source: false,
                    provider: None,
                    forker: None,
                    source_stream: None,
                    stream_backed: false,
                    upstream: None,
                    probe: None,
                    make_it_live: false,
                    pipe_number: None,
                    destroyed: false,
                }),
                source_ready: OnceCell::new(),
                ready: OnceCell::new(),
            }),
        };

        input.set_source(source)?;
        Ok(input)
    }

    /// Position among the conversion's inputs.
    pub fn index(&self) -> usize {
        self.inner.index
    }

    /// Position among all endpoints of the conversion.
    pub(crate) fn order(&self) -> usize {
        self.inner.order
    }

    fn label(&self) -> String {
        format!("input-{}", self.inner.index)
    }

    /// Replace the source.
    ///
    /// A stream source is wrapped in a [`StreamForker`] right away so it can
    /// be probed and transcoded without being read twice. Only one stream
    /// can ever be attached.
    pub fn set_source(&self, source: InputSource) -> MediaResult<()> {
        let mut state = self.inner.state.lock();

        if state.stream_backed {
            return Err(MediaError::StreamAlreadySet);
        }

        match source {
            InputSource::Path(path) => {
                state.location = Some(path.to_string_lossy().into_owned());
                state.is_network_source = false;
            }
            InputSource::Url(url) => {
                state.is_network_source = is_network_source(&url) || url.contains("://");
                state.location = Some(url);
            }
            InputSource::Stream(stream) => self.attach_stream(&mut state, stream)?,
            InputSource::Output(output) => {
                let stream = output.take_stream()?;
                self.attach_stream(&mut state, stream.boxed())?;
                debug!(input = self.inner.index, upstream = %output.id(), "Input chained to output");
                state.upstream = Some(output);
            }
            InputSource::Deferred(provider) => state.provider = Some(provider),
        }

        Ok(())
    }

    fn attach_stream(&self, state: &mut InputState, stream: ByteStream) -> MediaResult<()> {
        let forker = StreamForker::new(stream, self.label());
        state.source_stream = Some(forker.fork()?);
        if state.make_it_live {
            forker.resume();
        }
        state.forker = Some(forker);
        state.stream_backed = true;
        state.location = None;
        Ok(())
    }

    /// Keep the source flowing before the transcoder reads it.
    ///
    /// A live source drops nothing but buffers in memory until the conversion
    /// starts. A source that is not live is held paused.
    pub fn set_live(&self, live: bool) {
        let mut state = self.inner.state.lock();
        state.make_it_live = live;
        if let Some(forker) = &state.forker {
            if live {
                forker.resume();
            } else {
                forker.pause();
            }
        }
    }

    pub fn is_live(&self) -> bool {
        self.inner.state.lock().make_it_live
    }

    pub fn is_network_source(&self) -> bool {
        self.inner.state.lock().is_network_source
    }

    /// Whether the transcoder reads this input from a pipe.
    pub fn is_stream_backed(&self) -> bool {
        self.inner.state.lock().stream_backed
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
            match resolve_option(INPUT_ARGUMENTS, INPUT_OPERATIONS, key) {
                Some(OptionTarget::Argument(spec)) => self.set_with(spec.name, &spread(value))?,
                Some(OptionTarget::Operation("live")) => self.set_live(is_truthy(&value)),
                Some(OptionTarget::Operation("arguments")) => {
                    self.add_arguments(spread(value).iter().filter_map(value_text))
                }
                _ => return Err(MediaError::unknown_option("input", key)),
            }
        }
        Ok(())
    }

    /// Append verbatim arguments placed before `-i`.
    pub fn add_arguments<I, S>(&self, args: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.inner.state.lock().arguments.add_extra(args);
    }

    pub fn pipe_number(&self) -> Option<u32> {
        self.inner.state.lock().pipe_number
    }

    pub(crate) fn assign_pipe(&self, pipe: u32) {
        self.inner.state.lock().pipe_number = Some(pipe);
    }

    /// The `-i` argument.
    pub(crate) fn source_argument(&self) -> MediaResult<String> {
        let state = self.inner.state.lock();
        match (state.pipe_number, &state.location) {
            (Some(pipe), _) => Ok(pipe_argument(pipe)),
            (None, Some(location)) => Ok(location.clone()),
            (None, None) => Err(MediaError::MissingSource(self.inner.index)),
        }
    }

    pub(crate) fn take_source_stream(&self) -> Option<Fork> {
        self.inner.state.lock().source_stream.take()
    }

    pub(crate) fn resume(&self) {
        if let Some(forker) = &self.inner.state.lock().forker {
            forker.resume();
        }
    }

    /// Run the deferred provider, if any, and check a source exists.
    pub(crate) async fn resolve_source(&self) -> MediaResult<()> {
        self.inner
            .source_ready
            .get_or_try_init(|| async {
                let provider = self.inner.state.lock().provider.take();
                if let Some(provider) = provider {
                    let source = provider().await?;
                    if matches!(source, InputSource::Deferred(_)) {
                        return Err(MediaError::internal("a deferred source resolved to another deferred source"));
                    }
                    self.set_source(source)?;
                }

                let state = self.inner.state.lock();
                if state.location.is_none() && !state.stream_backed {
                    return Err(MediaError::MissingSource(self.inner.index));
                }
                Ok(())
            })
            .await
            .map(|_| ())
    }

    /// The probe of this input, spawned on first use.
    pub async fn probe(&self) -> MediaResult<Arc<Probe>> {
        self.resolve_source().await?;

        let mut state = self.inner.state.lock();
        if let Some(probe) = &state.probe {
            return Ok(probe.clone());
        }
        self.spawn_probe(&mut state)
    }

    /// Replace the probe with a fresh run.
    ///
    /// A stream source only feeds the new run the bytes that arrive from now on.
    pub async fn reprobe(&self) -> MediaResult<Arc<Probe>> {
        self.resolve_source().await?;
        let mut state = self.inner.state.lock();
        self.spawn_probe(&mut state)
    }

    fn spawn_probe(&self, state: &mut InputState) -> MediaResult<Arc<Probe>> {
        if state.destroyed {
            return Err(MediaError::Cancelled);
        }

        let mut options = ProbeOptions::new(&self.inner.settings.ffprobe_path);
        if let Some(format) = state.arguments.text("format") {
            options = options.with_input_type(format);
        }

        let probe = match (&state.forker, &state.location) {
            (Some(forker), _) => {
                let fork = forker.fork()?;
                let probe = Probe::spawn(&options, self.label());
                probe.set_stream(fork.boxed())?;
                forker.resume();
                probe
            }
            (None, Some(location)) => Probe::spawn(&options.with_input_url(location.clone()), self.label()),
            (None, None) => return Err(MediaError::MissingSource(self.inner.index)),
        };

        let probe = Arc::new(probe);
        state.probe = Some(probe.clone());

        let events = self.inner.events.clone();
        let index = self.inner.index;
        let watched = probe.clone();
        tokio::spawn(async move {
            if let Ok(result) = watched.result().await {
                events.emit(ConversionEvent::Probed { input: index, result });
            }
        });

        Ok(probe)
    }

    /// Resolve a probe query.
    ///
    /// The upstream output answers first, once it is ready. Then locally set
    /// values, by setting name or flag. Then this input's own probe.
    pub fn probe_value<'a>(&'a self, name: &'a str) -> BoxFuture<'a, MediaResult<Option<Value>>> {
        async move {
            let upstream = self.inner.state.lock().upstream.clone();
            if let Some(upstream) = upstream {
                upstream.ensure_ready().await?;
                if let Some(value) = upstream.probe_value(name).await? {
                    return Ok(Some(value));
                }
            }

            let local = self.inner.state.lock().arguments.lookup(name).map(ArgValue::to_json);
            if local.is_some() {
                return Ok(local);
            }

            let probe = self.probe().await?;
            probe.get_value(name).await
        }
        .boxed()
    }

    async fn required_value(&self, name: &str, label: &str) -> MediaResult<Value> {
        self.probe_value(name)
            .await?
            .filter(|value| !value.is_null())
            .ok_or_else(|| MediaError::missing_probe_value(label))
    }

    /// Resolve everything the argument list depends on. Runs once.
    pub async fn ensure_ready(&self) -> MediaResult<()> {
        self.inner
            .ready
            .get_or_try_init(|| self.make_ready())
            .await
            .map(|_| ())
    }

    async fn make_ready(&self) -> MediaResult<()> {
        self.resolve_source().await?;

        let codec = match self.probe_value("video_codec").await {
            Ok(value) => value.as_ref().and_then(value_text),
            Err(err) => {
                warn!(input = self.inner.index, error = %err, "Could not determine input codec");
                None
            }
        };

        if codec.as_deref() == Some("rawvideo") {
            self.set("format", "rawvideo")?;

            let (pixel_format, video_size, framerate) = future::try_join3(
                self.required_value("pixel_format", "Pixel format"),
                self.required_value("video_size", "Video size"),
                self.required_value("framerate", "Framerate"),
            )
            .await?;

            self.set("pixel_format", pixel_format)?;
            self.set("resolution", video_size)?;
            self.set("framerate", framerate)?;
            debug!(input = self.inner.index, "Raw video input parameters resolved");
        }

        Ok(())
    }

    /// Flags and extra arguments, placed before `-i`.
    pub async fn argument_tokens(&self) -> MediaResult<Vec<String>> {
        self.ensure_ready().await?;
        Ok(self.inner.state.lock().arguments.to_tokens())
    }

    /// Release the source.
    ///
    /// The forker is resumed so no sibling fork stays blocked, and the fork
    /// this input held for the transcoder is ended. A probe still running is
    /// killed, and no new one can be started.
    pub fn destroy(&self) {
        let (forker, fork, probe) = {
            let mut state = self.inner.state.lock();
            state.destroyed = true;
            (state.forker.take(), state.source_stream.take(), state.probe.clone())
        };

        if let Some(probe) = probe {
            probe.stop();
        }
        if let Some(forker) = &forker {
            forker.resume();
        }
        if let Some(fork) = fork {
            fork.end();
        }
    }
}

impl fmt::Debug for Input {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("Input")
            .field("index", &self.inner.index)
            .field("location", &state.location)
            .field("stream_backed", &state.stream_backed)
            .field("pipe_number", &state.pipe_number)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;
    use serde_json::json;

    fn make_input(source: impl Into<InputSource>) -> Input {
        let settings = ConversionSettings::default().with_ffprobe_path("/nonexistent/ffprobe");
        Input::new(0, 0, Arc::new(settings), EventSink::new(8), source.into()).unwrap()
    }

    fn bytes(chunks: &'static [&'static [u8]]) -> InputSource {
        InputSource::stream(stream::iter(
            chunks.iter().map(|c| Ok(Bytes::from_static(*c))),
        ))
    }

    #[test]
    fn test_source_classification() {
        assert!(matches!(InputSource::from("http://host/live.ts"), InputSource::Url(_)));
        assert!(matches!(InputSource::from("/dev/video0"), InputSource::Url(_)));
        assert!(matches!(InputSource::from("/media/clip.mp4"), InputSource::Path(_)));
    }

    #[tokio::test]
    async fn test_path_source_argument() {
        let input = make_input("/media/clip.mp4");
        assert!(!input.is_stream_backed());
        assert!(!input.is_network_source());
        assert_eq!(input.source_argument().unwrap(), "/media/clip.mp4");

        let camera = make_input("rtsp://camera/stream");
        assert!(camera.is_network_source());
    }

    #[tokio::test]
    async fn test_no_probe_after_destroy() {
        let input = make_input("/media/clip.mp4");
        input.destroy();
        assert!(matches!(input.probe().await, Err(MediaError::Cancelled)));
    }

    #[tokio::test]
    async fn test_stream_source_uses_pipe() {
        let input = make_input(bytes(&[b"abc"]));
        assert!(input.is_stream_backed());
        assert!(matches!(input.source_argument(), Err(MediaError::MissingSource(0))));

        input.assign_pipe(0);
        assert_eq!(input.source_argument().unwrap(), "pipe:0");
        assert!(matches!(
            input.set_source(bytes(&[b"def"])),
            Err(MediaError::StreamAlreadySet)
        ));
    }

    #[tokio::test]
    async fn test_local_values_skip_probe() {
        let input = make_input("/media/clip.mp4");
        input.set("video_codec", "h264").unwrap();
        input.set("resolution", "320x240").unwrap();

        assert_eq!(input.probe_value("video_codec").await.unwrap(), Some(json!("h264")));
        assert_eq!(input.probe_value("video_size").await.unwrap(), Some(json!("320x240")));
    }

    #[tokio::test]
    async fn test_probe_failure_is_not_fatal_for_readiness() {
        let input = make_input("/media/clip.mp4");
        input.set("seek", 5).unwrap();

        assert_eq!(input.argument_tokens().await.unwrap(), vec!["-ss", "5"]);
    }

    #[tokio::test]
    async fn test_raw_input_requires_parameters() {
        let input = make_input("/media/frames.raw");
        input.set("video_codec", "rawvideo").unwrap();
        input.set("pixel_format", "gray").unwrap();

        let err = input.ensure_ready().await.unwrap_err();
        assert!(matches!(err, MediaError::SpawnFailed { .. } | MediaError::MissingProbeValue { .. }));
    }

    #[tokio::test]
    async fn test_raw_input_with_explicit_parameters() {
        let input = make_input(bytes(&[b"\0\0\0\0"]));
        input
            .set_many([
                ("video_codec", json!("rawvideo")),
                ("pix_fmt", json!("gray")),
                ("video_size", json!("2x2")),
                ("framerate", json!(10)),
            ])
            .unwrap();

        let tokens = input.argument_tokens().await.unwrap();
        assert_eq!(
            tokens,
            vec!["-c:v", "rawvideo", "-pix_fmt", "gray", "-video_size", "2x2", "-r", "10", "-f", "rawvideo"]
        );
    }

    #[tokio::test]
    async fn test_set_many_operations() {
        let input = make_input(bytes(&[b"abc"]));
        input
            .set_many([("live", json!(true)), ("arguments", json!(["-thread_queue_size", 512]))])
            .unwrap();

        assert!(input.is_live());
        assert_eq!(input.argument_tokens().await.unwrap(), vec!["-thread_queue_size", "512"]);

        let err = input.set_many([("bogus", json!(1))]).unwrap_err();
        assert!(matches!(err, MediaError::UnknownOption { endpoint: "input", .. }));
    }

    #[tokio::test]
    async fn test_deferred_source() {
        let input = make_input(InputSource::deferred(|| async { Ok(InputSource::from("/media/late.mp4")) }));
        assert!(input.source_argument().is_err());

        input.resolve_source().await.unwrap();
        assert_eq!(input.source_argument().unwrap(), "/media/late.mp4");
    }

    #[tokio::test]
    async fn test_destroy_releases_stream() {
        let input = make_input(bytes(&[b"abc"]));
        input.destroy();
        assert!(input.take_source_stream().is_none());
    }
}
