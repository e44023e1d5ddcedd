//! FFmpeg command line assembly and executable discovery.

use std::path::{Path, PathBuf};

use crate::error::{MediaError, MediaResult};
use crate::settings::ConversionSettings;

/// Source argument for an input reading from descriptor `pipe`.
pub fn pipe_argument(pipe: u32) -> String {
    format!("pipe:{}", pipe)
}

/// Builder for a transcoder invocation with any number of inputs and outputs.
#[derive(Debug, Clone)]
pub struct FfmpegCommand {
    /// Transcoder executable
    program: PathBuf,
    /// Arguments placed before every input
    global_args: Vec<String>,
    /// Per input: its own flags and the `-i` source
    inputs: Vec<(Vec<String>, String)>,
    /// Per output: its own flags and the trailing target
    outputs: Vec<(Vec<String>, String)>,
}

impl FfmpegCommand {
    /// Create a new command for `program`.
    pub fn new(program: impl AsRef<Path>) -> Self {
        Self {
            program: program.as_ref().to_path_buf(),
            global_args: Vec::new(),
            inputs: Vec::new(),
            outputs: Vec::new(),
        }
    }

    /// Add global arguments.
    pub fn global_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.global_args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Add an input block: `args... -i source`.
    pub fn input<I, S>(mut self, args: I, source: impl Into<String>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.inputs
            .push((args.into_iter().map(Into::into).collect(), source.into()));
        self
    }

    /// Add an output block: `args... target`.
    pub fn output<I, S>(mut self, args: I, target: impl Into<String>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.outputs
            .push((args.into_iter().map(Into::into).collect(), target.into()));
        self
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    /// Build the command arguments.
    ///
    /// Global flags come first, then every input block, then every output
    /// block, each in the order they were added.
    pub fn build_args(&self) -> Vec<String> {
        let mut args = self.global_args.clone();

        for (input_args, source) in &self.inputs {
            args.extend(input_args.iter().cloned());
            args.push("-i".to_string());
            args.push(source.clone());
        }

        for (output_args, target) in &self.outputs {
            args.extend(output_args.iter().cloned());
            args.push(target.clone());
        }

        args
    }
}

/// Check if the configured FFmpeg is available.
pub fn check_ffmpeg(settings: &ConversionSettings) -> MediaResult<PathBuf> {
    which::which(&settings.ffmpeg_path)
        .map_err(|_| MediaError::FfmpegNotFound(settings.ffmpeg_path.display().to_string()))
}

/// Check if the configured FFprobe is available.
pub fn check_ffprobe(settings: &ConversionSettings) -> MediaResult<PathBuf> {
    which::which(&settings.ffprobe_path)
        .map_err(|_| MediaError::FfprobeNotFound(settings.ffprobe_path.display().to_string()))
}
