//! Byte stream plumbing: forking and re-framing.

pub mod chunker;
pub mod forker;
pub mod mjpeg;
pub mod rate;

use bytes::Bytes;
use futures::stream::BoxStream;

pub use chunker::FrameChunker;
pub use forker::{Fork, StreamForker};
pub use mjpeg::MjpegExtractor;
pub use rate::{rate_limited, DEFAULT_FPS};

/// A boxed stream of byte chunks.
pub type ByteStream = BoxStream<'static, std::io::Result<Bytes>>;
