#![deny(unreachable_patterns)]
#![cfg(unix)]
//! FFmpeg process orchestration.
//!
//! This crate provides:
//! - Conversions with any number of stream, file and URL endpoints
//! - Automatic pipe allocation, including descriptors beyond stdin/stdout
//! - FFprobe analysis of streamed inputs, answered through probe queries
//! - Stream forking so one source can feed several consumers
//! - Video stream copy detection and raw frame outputs
//! - Progress and failure parsing from the transcoder's diagnostics

pub mod codecs;
pub mod command;
pub mod conversion;
pub mod endpoint;
pub mod error;
pub mod events;
pub mod logging;
pub mod pipes;
pub mod probe;
pub mod profiles;
pub mod progress;
pub mod settings;
pub mod streams;

pub use codecs::CodecCatalog;
pub use command::{check_ffmpeg, check_ffprobe, FfmpegCommand};
pub use conversion::Conversion;
pub use endpoint::{Input, InputSource, Output, OutputStream, OutputTarget};
pub use error::{MediaError, MediaResult};
pub use events::{ConversionEvent, ConversionPhase, EventSink};
pub use logging::{init_tracing, ConversionLogger, LogFormat};
pub use probe::{Probe, ProbeOptions};
pub use profiles::{Profile, ProfileOptions};
pub use progress::{FfmpegProgress, ProgressParser};
pub use settings::ConversionSettings;
pub use streams::{ByteStream, Fork, FrameChunker, MjpegExtractor, StreamForker};

// Shared models
pub use mconv_models::{ArgValue, ProbeResult, RawFrameInfo};
