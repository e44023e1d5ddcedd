//! Stand-in transcoder and analyzer executables.
//!
//! The fake transcoder copies stdin to stdout, appends descriptor 3 when an
//! input is piped there and writes `side` to descriptor 4. An output format
//! of `fail_exit` or `fail_fatal` makes it fail instead. The fake analyzer
//! reads stdin to the end and reports the byte count as the format `size`.

#![allow(dead_code)]

use std::fs;
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Duration;

use bytes::Bytes;
use futures::stream::{self, BoxStream};
use futures::StreamExt;
use mconv_media::{init_tracing, ConversionEvent, ConversionSettings, LogFormat};
use tempfile::TempDir;
use tokio::sync::broadcast;

const FAKE_FFMPEG: &str = r#"#!/bin/sh
args=" $* "
case "$args" in
  *" -codecs "*|*" -formats "*) exit 0 ;;
esac
case "$args" in
  *" fail_exit "*)
    echo "Unrecognized option 'bogus'." >&2
    exit 1 ;;
  *" fail_fatal "*)
    echo "Error while opening encoder for output stream #0:0" >&2
    echo "Conversion failed!" >&2
    exit 1 ;;
esac
echo "Input #0, mpegts, from 'pipe:0':" >&2
echo "    Stream #0:0[0x100]: Video: h264 (High), yuv420p, 4x2, 25 fps" >&2
printf 'frame=    1 fps=0.0 q=-1.0 size=       0kB time=00:00:00.04\r' >&2
case "$args" in
  *" pipe:1 "*) cat ;;
  *" pipe:0 "*) cat > /dev/null ;;
esac
case "$args" in
  *" pipe:3 "*) cat <&3 ;;
esac
case "$args" in
  *" pipe:4 "*) printf 'side' >&4 ;;
esac
echo "frame=    2 fps=0.0 q=-1.0 Lsize=       1kB time=00:00:00.08" >&2
exit 0
"#;

const FAKE_FFPROBE: &str = r#"#!/bin/sh
size=$(wc -c | tr -d ' ')
cat <<EOF
[STREAM]
index=0
codec_name=h264
codec_type=video
width=4
height=2
pix_fmt=yuv420p
r_frame_rate=25/1
[/STREAM]
[FORMAT]
format_name=mpegts
size=$size
duration=N/A
[/FORMAT]
EOF
"#;

pub const TIMEOUT: Duration = Duration::from_secs(10);

struct Tools {
    _dir: TempDir,
    ffmpeg: PathBuf,
    ffprobe: PathBuf,
}

/// Written once per test binary so no executable is still open for
/// writing while another test spawns it.
fn tools() -> &'static Tools {
    static TOOLS: OnceLock<Tools> = OnceLock::new();
    TOOLS.get_or_init(|| {
        let dir = tempfile::tempdir().expect("create tool directory");
        let ffmpeg = write_script(dir.path(), "ffmpeg", FAKE_FFMPEG).expect("write fake ffmpeg");
        let ffprobe = write_script(dir.path(), "ffprobe", FAKE_FFPROBE).expect("write fake ffprobe");
        Tools {
            _dir: dir,
            ffmpeg,
            ffprobe,
        }
    })
}

fn write_script(dir: &Path, name: &str, body: &str) -> io::Result<PathBuf> {
    let path = dir.join(name);
    fs::write(&path, body)?;
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755))?;
    Ok(path)
}

pub fn ffprobe_path() -> &'static Path {
    &tools().ffprobe
}

pub fn settings(work_dir: &Path) -> ConversionSettings {
    init_tracing(LogFormat::from_env());
    let tools = tools();
    ConversionSettings::default()
        .with_ffmpeg_path(&tools.ffmpeg)
        .with_ffprobe_path(&tools.ffprobe)
        .with_niceness(None)
        .with_work_dir(work_dir)
}

pub fn byte_stream(data: &'static [u8], chunk: usize) -> BoxStream<'static, io::Result<Bytes>> {
    stream::iter(data.chunks(chunk).map(|part| Ok(Bytes::from_static(part)))).boxed()
}

/// Every event already sent to `rx`.
pub fn drain(rx: &mut broadcast::Receiver<ConversionEvent>) -> Vec<ConversionEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

pub fn arguments(events: &[ConversionEvent]) -> Vec<String> {
    events
        .iter()
        .find_map(|event| match event {
            ConversionEvent::Arguments(args) => Some(args.clone()),
            _ => None,
        })
        .unwrap_or_default()
}

pub fn contains_pair(args: &[String], flag: &str, value: &str) -> bool {
    args.windows(2).any(|pair| pair[0] == flag && pair[1] == value)
}
