//! Transcoder progress and diagnostics parsing.
//!
//! Every line the transcoder writes to its diagnostic channel is classified
//! by [`ProgressParser::feed`].

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;

use crate::error::MediaError;

static PROGRESS_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)frame=\W*(\d+)\s+fps=\W*(\d*\.?\d*)\s+q=\W*(\d*\.?\d*)\s+L?size=\W*(\d*\.?\d*)\s*ki?b",
    )
    .expect("progress pattern is valid")
});

static VIDEO_STREAM: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"Stream #.*?Video: \S+").expect("video stream pattern is valid")
});

/// Progress information from the transcoder.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FfmpegProgress {
    /// Frames processed so far
    pub frame: u64,
    /// Current processing speed in frames per second
    pub fps: f64,
    /// Current quantizer
    pub q: f64,
    /// Output size in bytes
    pub size: u64,
}

/// Parse a `frame=.. fps=.. q=.. size=..kB` status line.
pub fn parse_progress(line: &str) -> Option<FfmpegProgress> {
    let caps = PROGRESS_LINE.captures(line)?;
    let number = |i: usize| caps.get(i).and_then(|m| m.as_str().parse::<f64>().ok());

    Some(FfmpegProgress {
        frame: caps.get(1)?.as_str().parse().ok()?,
        fps: number(2).unwrap_or(0.0),
        q: number(3).unwrap_or(0.0),
        size: (number(4).unwrap_or(0.0) * 1024.0).round() as u64,
    })
}

/// What a diagnostic line means for the conversion.
#[derive(Debug, Clone, PartialEq)]
pub enum LineEvent {
    /// The conversion cannot succeed
    Fatal(String),
    Progress(FfmpegProgress),
    /// First description of the input video stream
    InputCodec(String),
    /// Remembered for exit classification
    SeenError(String),
    /// Non-fatal message worth surfacing
    Info(String),
    Ignored,
}

/// Stateful classifier for the transcoder's diagnostic lines.
#[derive(Debug, Default)]
pub struct ProgressParser {
    last_line: Option<String>,
    input_codec: Option<String>,
    seen_error: Option<String>,
}

impl ProgressParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Classify one line.
    pub fn feed(&mut self, line: &str) -> LineEvent {
        let line = line.trim();
        if line.is_empty() {
            return LineEvent::Ignored;
        }

        let event = self.classify(line);
        self.last_line = Some(line.to_string());
        event
    }

    fn classify(&mut self, line: &str) -> LineEvent {
        if line.contains("onversion failed") {
            let detail = self.last_line.as_deref().unwrap_or(line);
            return LineEvent::Fatal(format!("Conversion failed: {detail}"));
        }

        if line.contains("o such file or") {
            return LineEvent::Fatal(line.to_string());
        }

        if let Some(progress) = parse_progress(line) {
            return LineEvent::Progress(progress);
        }

        if line.contains("Metadata:") || line.starts_with("[lib") || line.contains("Copyright") {
            return LineEvent::Ignored;
        }

        if let Some(found) = VIDEO_STREAM.find(line) {
            if self.input_codec.is_some() {
                return LineEvent::Ignored;
            }
            let description = found.as_str().to_string();
            self.input_codec = Some(description.clone());
            return LineEvent::InputCodec(description);
        }

        if line.contains("Failed to initialize encoder") || line.contains("Invalid data") {
            return LineEvent::Fatal(line.to_string());
        }

        if line.contains("Error reading log file") {
            self.seen_error = Some(line.to_string());
            return LineEvent::SeenError(line.to_string());
        }

        LineEvent::Info(line.to_string())
    }

    /// Last non-empty line seen.
    pub fn last_line(&self) -> Option<&str> {
        self.last_line.as_deref()
    }

    pub fn seen_error(&self) -> Option<&str> {
        self.seen_error.as_deref()
    }

    pub fn input_codec(&self) -> Option<&str> {
        self.input_codec.as_deref()
    }

    /// Error for a transcoder that exited with `exit_code`.
    ///
    /// A remembered error wins over the last line, which wins over a bare
    /// exit code message.
    pub fn exit_error(&self, exit_code: Option<i32>) -> MediaError {
        let code = exit_code.map_or_else(|| "signal".to_string(), |c| c.to_string());

        let message = match (&self.seen_error, &self.last_line) {
            (Some(seen), _) => seen.clone(),
            (None, Some(last)) => format!("FFmpeg exited with code {code}: {last}"),
            (None, None) => format!("FFmpeg exited with code {code}"),
        };

        MediaError::ffmpeg_failed(message, self.last_line.clone(), exit_code)
    }
}
