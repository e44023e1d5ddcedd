//! Shared data models for media conversion pipelines.
//!
//! This crate provides Serde-serializable types for:
//! - Values stored behind transcoder command-line flags
//! - Parsed analyzer (ffprobe) reports
//! - Raw frame geometry and pixel format depths
//! - Codec and container format descriptors
//! - Source classification

pub mod argument;
pub mod codec;
pub mod pixel;
pub mod probe;
pub mod source;

// Re-export common types
pub use argument::{is_truthy, value_text, ArgValue};
pub use codec::{CodecInfo, CodecKind, FormatInfo};
pub use pixel::{bytes_per_pixel, parse_video_size, RawFrameInfo, DEFAULT_RAW_PIXEL_FORMAT};
pub use probe::{FieldMap, ProbeResult};
pub use source::is_network_source;
