//! Fixed-size re-framing of byte streams.

use bytes::{Bytes, BytesMut};
use futures::Stream;
use std::io;
use tokio_util::codec::{Decoder, FramedRead};
use tokio_util::io::StreamReader;

/// Splits arbitrarily sized input into frames of exactly `chunk_size` bytes.
///
/// A trailing partial frame is dropped when the input ends.
#[derive(Debug)]
pub struct FrameChunker {
    chunk_size: usize,
    buffer: BytesMut,
}

impl FrameChunker {
    pub fn new(chunk_size: usize) -> Self {
        Self {
            chunk_size: chunk_size.max(1),
            buffer: BytesMut::new(),
        }
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Bytes waiting for the rest of their frame.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Append `data` and return every frame that is now complete.
    pub fn push(&mut self, data: &[u8]) -> Vec<Bytes> {
        self.buffer.extend_from_slice(data);

        let mut frames = Vec::with_capacity(self.buffer.len() / self.chunk_size);
        while self.buffer.len() >= self.chunk_size {
            frames.push(self.buffer.split_to(self.chunk_size).freeze());
        }
        frames
    }
}

impl Decoder for FrameChunker {
    type Item = Bytes;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> io::Result<Option<Bytes>> {
        if src.len() < self.chunk_size {
            return Ok(None);
        }
        Ok(Some(src.split_to(self.chunk_size).freeze()))
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> io::Result<Option<Bytes>> {
        let frame = self.decode(src)?;
        if frame.is_none() {
            src.clear();
        }
        Ok(frame)
    }
}

/// Re-frame a byte stream into `chunk_size` pieces.
pub fn chunked<S>(stream: S, chunk_size: usize) -> impl Stream<Item = io::Result<Bytes>>
where
    S: Stream<Item = io::Result<Bytes>>,
{
    FramedRead::new(StreamReader::new(stream), FrameChunker::new(chunk_size))
}
