//! Error types for media operations.

use std::sync::Arc;
use thiserror::Error;

/// Result type for media operations.
pub type MediaResult<T> = Result<T, MediaError>;

/// Errors that can occur while configuring or running a conversion.
///
/// Errors are cloneable so a single terminal failure can be handed to every
/// observer of a conversion.
#[derive(Debug, Clone, Error)]
pub enum MediaError {
    #[error("FFmpeg not found: {0}")]
    FfmpegNotFound(String),

    #[error("FFprobe not found: {0}")]
    FfprobeNotFound(String),

    #[error("Failed to spawn {program}: {message}")]
    SpawnFailed { program: String, message: String },

    #[error("{message}")]
    FfmpegFailed {
        message: String,
        stderr: Option<String>,
        exit_code: Option<i32>,
    },

    #[error("FFprobe failed: {message}")]
    FfprobeFailed {
        message: String,
        stderr: Option<String>,
    },

    #[error("Unknown option \"{name}\" for {endpoint}")]
    UnknownOption { endpoint: &'static str, name: String },

    #[error("Invalid value for \"{name}\": {message}")]
    InvalidOption { name: String, message: String },

    #[error("Stream already set")]
    StreamAlreadySet,

    #[error("Unknown probe value \"{0}\"")]
    UnknownProbeValue(String),

    #[error("{name} not found, can not process raw video")]
    MissingProbeValue { name: String },

    #[error("Stream forker has already been destroyed")]
    ForkerDestroyed,

    #[error("No source has been set for input {0}")]
    MissingSource(usize),

    #[error("Output stream has already been taken")]
    StreamTaken,

    #[error("Conversion has no inputs")]
    NoInputs,

    #[error("Conversion has no outputs")]
    NoOutputs,

    #[error("Conversion has already been started")]
    AlreadyStarted,

    #[error("Operation cancelled")]
    Cancelled,

    #[error("IO error: {0}")]
    Io(Arc<std::io::Error>),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<std::io::Error> for MediaError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(Arc::new(err))
    }
}

impl MediaError {
    /// Create a spawn failure error.
    pub fn spawn_failed(program: impl Into<String>, err: &std::io::Error) -> Self {
        Self::SpawnFailed {
            program: program.into(),
            message: err.to_string(),
        }
    }

    /// Create an FFmpeg failure error.
    pub fn ffmpeg_failed(
        message: impl Into<String>,
        stderr: Option<String>,
        exit_code: Option<i32>,
    ) -> Self {
        Self::FfmpegFailed {
            message: message.into(),
            stderr,
            exit_code,
        }
    }

    /// Create an FFprobe failure error.
    pub fn ffprobe_failed(message: impl Into<String>, stderr: Option<String>) -> Self {
        Self::FfprobeFailed {
            message: message.into(),
            stderr,
        }
    }

    /// Create an unknown option error.
    pub fn unknown_option(endpoint: &'static str, name: impl Into<String>) -> Self {
        Self::UnknownOption {
            endpoint,
            name: name.into(),
        }
    }

    /// Create an invalid option error.
    pub fn invalid_option(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidOption {
            name: name.into(),
            message: message.into(),
        }
    }

    /// Create a missing probe value error.
    pub fn missing_probe_value(name: impl Into<String>) -> Self {
        Self::MissingProbeValue { name: name.into() }
    }

    /// Create an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// Whether this error is raised while configuring endpoints rather than
    /// while running a conversion.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            Self::UnknownOption { .. }
                | Self::InvalidOption { .. }
                | Self::StreamAlreadySet
                | Self::StreamTaken
                | Self::AlreadyStarted
        )
    }

    /// Exit code of the transcoder, when the error came from one.
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            Self::FfmpegFailed { exit_code, .. } => *exit_code,
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_errors_are_shared() {
        let err: MediaError = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe").into();
        let copy = err.clone();
        assert!(matches!(copy, MediaError::Io(_)));
        assert_eq!(err.to_string(), "IO error: pipe");
    }

    #[test]
    fn test_configuration_errors() {
        assert!(MediaError::unknown_option("input", "bogus").is_configuration());
        assert!(MediaError::StreamAlreadySet.is_configuration());
        assert!(!MediaError::Cancelled.is_configuration());
        assert!(!MediaError::ffmpeg_failed("boom", None, Some(1)).is_configuration());
    }

    #[test]
    fn test_display() {
        let err = MediaError::missing_probe_value("Video size");
        assert_eq!(err.to_string(), "Video size not found, can not process raw video");

        let err = MediaError::ffmpeg_failed("FFmpeg exited with code 1", None, Some(1));
        assert_eq!(err.exit_code(), Some(1));
    }
}
