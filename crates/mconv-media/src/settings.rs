//! Conversion settings.

use std::path::PathBuf;

/// Niceness applied to transcoder processes unless configured otherwise.
pub const DEFAULT_NICENESS: i32 = 19;
/// Bounded capacity of each stream output's chunk channel.
pub const DEFAULT_OUTPUT_BUFFER: usize = 32;
/// Capacity of the conversion event channel.
pub const DEFAULT_EVENT_CAPACITY: usize = 256;

/// Settings shared by every endpoint of a conversion.
#[derive(Debug, Clone)]
pub struct ConversionSettings {
    /// Transcoder executable
    pub ffmpeg_path: PathBuf,
    /// Analyzer executable
    pub ffprobe_path: PathBuf,
    /// Niceness applied to the transcoder, `None` to inherit ours
    pub niceness: Option<i32>,
    /// Base directory for scratch files
    pub work_dir: PathBuf,
    /// Log lifecycle events at info level instead of debug
    pub debug: bool,
    /// Chunks buffered per stream output before the transcoder is backpressured
    pub output_buffer: usize,
    /// Events buffered per subscriber
    pub event_capacity: usize,
}

impl Default for ConversionSettings {
    fn default() -> Self {
        Self {
            ffmpeg_path: PathBuf::from("ffmpeg"),
            ffprobe_path: PathBuf::from("ffprobe"),
            niceness: Some(DEFAULT_NICENESS),
            work_dir: std::env::temp_dir(),
            debug: false,
            output_buffer: DEFAULT_OUTPUT_BUFFER,
            event_capacity: DEFAULT_EVENT_CAPACITY,
        }
    }
}

impl ConversionSettings {
    /// Create settings from environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();

        Self {
            ffmpeg_path: std::env::var("MCONV_FFMPEG_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.ffmpeg_path),
            ffprobe_path: std::env::var("MCONV_FFPROBE_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.ffprobe_path),
            niceness: match std::env::var("MCONV_NICENESS") {
                Ok(v) if v.eq_ignore_ascii_case("none") => None,
                Ok(v) => v.parse().ok().or(defaults.niceness),
                Err(_) => defaults.niceness,
            },
            work_dir: std::env::var("MCONV_WORK_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.work_dir),
            debug: std::env::var("MCONV_DEBUG")
                .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
                .unwrap_or(false),
            output_buffer: std::env::var("MCONV_OUTPUT_BUFFER")
                .ok()
                .and_then(|s| s.parse().ok())
                .filter(|n| *n > 0)
                .unwrap_or(DEFAULT_OUTPUT_BUFFER),
            event_capacity: std::env::var("MCONV_EVENT_CAPACITY")
                .ok()
                .and_then(|s| s.parse().ok())
                .filter(|n| *n > 0)
                .unwrap_or(DEFAULT_EVENT_CAPACITY),
        }
    }

    /// Load a `.env` file, if present, then read the environment.
    pub fn from_env_file() -> Self {
        dotenvy::dotenv().ok();
        Self::from_env()
    }

    /// Use a specific transcoder executable.
    pub fn with_ffmpeg_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.ffmpeg_path = path.into();
        self
    }

    /// Use a specific analyzer executable.
    pub fn with_ffprobe_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.ffprobe_path = path.into();
        self
    }

    /// Set the niceness of spawned transcoders.
    pub fn with_niceness(mut self, niceness: Option<i32>) -> Self {
        self.niceness = niceness;
        self
    }

    /// Set the scratch base directory.
    pub fn with_work_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.work_dir = dir.into();
        self
    }

    /// Raise lifecycle logging to info level.
    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    /// Scratch directory used by conversions.
    pub fn working_path(&self) -> PathBuf {
        self.work_dir.join("mc-tmp")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let settings = ConversionSettings::default();
        assert_eq!(settings.ffmpeg_path, PathBuf::from("ffmpeg"));
        assert_eq!(settings.niceness, Some(DEFAULT_NICENESS));
        assert_eq!(settings.output_buffer, DEFAULT_OUTPUT_BUFFER);
        assert!(!settings.debug);
    }

    #[test]
    fn test_builders() {
        let settings = ConversionSettings::default()
            .with_ffmpeg_path("/opt/ffmpeg/bin/ffmpeg")
            .with_niceness(None)
            .with_work_dir("/var/tmp");

        assert_eq!(settings.ffmpeg_path, PathBuf::from("/opt/ffmpeg/bin/ffmpeg"));
        assert_eq!(settings.niceness, None);
        assert_eq!(settings.working_path(), PathBuf::from("/var/tmp/mc-tmp"));
    }
}
