//! Parsed analyzer (ffprobe) reports.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A block of `key=value` attributes with coerced values.
pub type FieldMap = serde_json::Map<String, Value>;

/// Structured result of one analyzer run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProbeResult {
    /// Wall time the analyzer took, in milliseconds
    pub probe_time_ms: u64,
    /// Per-stream records, ordered by stream index
    pub streams: Vec<FieldMap>,
    /// Container format attributes
    pub format: FieldMap,
    /// Container tags with the `TAG:` marker stripped
    pub metadata: FieldMap,
    /// Index of the first video stream
    pub video_index: Option<usize>,
    /// Index of the first audio stream
    pub audio_index: Option<usize>,
}

impl ProbeResult {
    /// Build a result, recording the first video and first audio stream.
    pub fn new(streams: Vec<FieldMap>, format: FieldMap, metadata: FieldMap) -> Self {
        let first_of = |kind: &str| {
            streams
                .iter()
                .position(|s| s.get("codec_type").and_then(Value::as_str) == Some(kind))
        };

        Self {
            probe_time_ms: 0,
            video_index: first_of("video"),
            audio_index: first_of("audio"),
            streams,
            format,
            metadata,
        }
    }

    /// Set the measured probe time.
    pub fn with_probe_time(mut self, probe_time_ms: u64) -> Self {
        self.probe_time_ms = probe_time_ms;
        self
    }

    /// The first video stream, if any.
    pub fn video(&self) -> Option<&FieldMap> {
        self.video_index.and_then(|i| self.streams.get(i))
    }

    /// The first audio stream, if any.
    pub fn audio(&self) -> Option<&FieldMap> {
        self.audio_index.and_then(|i| self.streams.get(i))
    }

    /// Resolve a dotted path such as `video.codec_name`, `format.duration`,
    /// `metadata.title` or `streams.1.codec_type`.
    ///
    /// `null` values resolve to `None`.
    pub fn lookup(&self, path: &str) -> Option<&Value> {
        let mut parts = path.split('.');

        let record = match parts.next()? {
            "video" => self.video()?,
            "audio" => self.audio()?,
            "format" => &self.format,
            "metadata" => &self.metadata,
            "streams" => {
                let index: usize = parts.next()?.parse().ok()?;
                self.streams.get(index)?
            }
            _ => return None,
        };

        let mut value = record.get(parts.next()?)?;
        for part in parts {
            value = match value {
                Value::Object(map) => map.get(part)?,
                Value::Array(items) => items.get(part.parse::<usize>().ok()?)?,
                _ => return None,
            };
        }

        (!value.is_null()).then_some(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(value: Value) -> FieldMap {
        match value {
            Value::Object(map) => map,
            _ => FieldMap::new(),
        }
    }

    fn sample() -> ProbeResult {
        ProbeResult::new(
            vec![
                record(json!({"codec_type": "audio", "codec_name": "aac"})),
                record(json!({"codec_type": "video", "codec_name": "h264", "width": 320})),
                record(json!({"codec_type": "video", "codec_name": "mjpeg"})),
            ],
            record(json!({"format_name": "mov,mp4", "duration": 12.5})),
            record(json!({"title": "Example"})),
        )
    }

    #[test]
    fn test_first_stream_per_type_wins() {
        let result = sample();
        assert_eq!(result.video_index, Some(1));
        assert_eq!(result.audio_index, Some(0));
        assert_eq!(result.streams.len(), 3);
    }

    #[test]
    fn test_lookup_paths() {
        let result = sample();
        assert_eq!(result.lookup("video.codec_name"), Some(&json!("h264")));
        assert_eq!(result.lookup("audio.codec_name"), Some(&json!("aac")));
        assert_eq!(result.lookup("format.duration"), Some(&json!(12.5)));
        assert_eq!(result.lookup("metadata.title"), Some(&json!("Example")));
        assert_eq!(result.lookup("streams.2.codec_name"), Some(&json!("mjpeg")));
        assert_eq!(result.lookup("video.height"), None);
        assert_eq!(result.lookup("nothing.here"), None);
    }

    #[test]
    fn test_no_video_stream() {
        let result = ProbeResult::new(
            vec![record(json!({"codec_type": "audio"}))],
            FieldMap::new(),
            FieldMap::new(),
        );
        assert!(result.video().is_none());
        assert_eq!(result.lookup("video.codec_name"), None);
    }
}
