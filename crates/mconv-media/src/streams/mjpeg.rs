//! JPEG image extraction from MJPEG byte streams.

use bytes::{Buf, Bytes, BytesMut};
use futures::Stream;
use std::io;
use tokio_util::codec::{Decoder, FramedRead};
use tokio_util::io::StreamReader;

const START_OF_IMAGE: [u8; 2] = [0xFF, 0xD8];
const END_OF_IMAGE: [u8; 2] = [0xFF, 0xD9];

/// Emits each complete JPEG image found between SOI and EOI markers.
#[derive(Debug, Default)]
pub struct MjpegExtractor;

impl MjpegExtractor {
    pub fn new() -> Self {
        Self
    }
}

impl Decoder for MjpegExtractor {
    type Item = Bytes;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> io::Result<Option<Bytes>> {
        let Some(start) = find(&src[..], &START_OF_IMAGE) else {
            // A trailing 0xFF may be the first half of a marker.
            let keep = usize::from(src.last() == Some(&0xFF));
            src.advance(src.len() - keep);
            return Ok(None);
        };
        src.advance(start);

        let Some(end) = find(&src[START_OF_IMAGE.len()..], &END_OF_IMAGE) else {
            return Ok(None);
        };

        let length = START_OF_IMAGE.len() + end + END_OF_IMAGE.len();
        Ok(Some(src.split_to(length).freeze()))
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> io::Result<Option<Bytes>> {
        let image = self.decode(src)?;
        if image.is_none() {
            src.clear();
        }
        Ok(image)
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Extract JPEG images from an MJPEG byte stream.
pub fn mjpeg_images<S>(stream: S) -> impl Stream<Item = io::Result<Bytes>>
where
    S: Stream<Item = io::Result<Bytes>>,
{
    FramedRead::new(StreamReader::new(stream), MjpegExtractor::new())
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::{stream, StreamExt};

    #[test]
    fn test_decode_skips_garbage() {
        let mut extractor = MjpegExtractor::new();
        let mut buf = BytesMut::from(&[0x00, 0x01, 0xFF, 0xD8, 0x10, 0x20, 0xFF, 0xD9, 0x42][..]);

        let image = extractor.decode(&mut buf).unwrap().unwrap();
        assert_eq!(&image[..], &[0xFF, 0xD8, 0x10, 0x20, 0xFF, 0xD9]);
        assert_eq!(&buf[..], &[0x42]);
    }

    #[test]
    fn test_decode_keeps_split_marker() {
        let mut extractor = MjpegExtractor::new();
        let mut buf = BytesMut::from(&[0x00, 0x00, 0xFF][..]);
        assert!(extractor.decode(&mut buf).unwrap().is_none());
        assert_eq!(&buf[..], &[0xFF]);
    }

    #[tokio::test]
    async fn test_images_across_chunk_boundaries() {
        let input = stream::iter(vec![
            Ok(Bytes::from_static(&[0xFF, 0xD8, 0x01])),
            Ok(Bytes::from_static(&[0x02, 0xFF])),
            Ok(Bytes::from_static(&[0xD9, 0xFF, 0xD8, 0x03, 0xFF, 0xD9])),
            Ok(Bytes::from_static(&[0xFF, 0xD8, 0x04])),
        ]);

        let images: Vec<Bytes> = mjpeg_images(input).map(|i| i.unwrap()).collect().await;
        assert_eq!(images.len(), 2);
        assert_eq!(&images[0][..], &[0xFF, 0xD8, 0x01, 0x02, 0xFF, 0xD9]);
        assert_eq!(&images[1][..], &[0xFF, 0xD8, 0x03, 0xFF, 0xD9]);
    }
}
