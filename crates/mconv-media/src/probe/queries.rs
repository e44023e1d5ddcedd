//! Named queries answered from a parsed report.

use mconv_models::{value_text, ProbeResult};
use serde_json::Value;

use crate::error::{MediaError, MediaResult};

/// Frame rate reported when the source has no video stream.
pub const FALLBACK_FRAMERATE: u32 = 25;

/// How a named query is answered.
#[derive(Clone, Copy)]
pub enum Query {
    /// Dotted path into the result
    Path(&'static str),
    /// Value derived from the whole result
    Derived(fn(&ProbeResult) -> Option<Value>),
}

/// Every query a probe can answer.
pub static RESULT_MAP: &[(&str, Query)] = &[
    ("video_codec", Query::Path("video.codec_name")),
    ("audio_codec", Query::Path("audio.codec_name")),
    ("pixel_format", Query::Path("video.pix_fmt")),
    ("width", Query::Path("video.width")),
    ("height", Query::Path("video.height")),
    ("duration", Query::Path("format.duration")),
    ("bit_rate", Query::Path("format.bit_rate")),
    ("format_name", Query::Path("format.format_name")),
    ("video_size", Query::Derived(video_size)),
    ("framerate", Query::Derived(framerate)),
];

/// Answer `name` against `result`. `Ok(None)` means the value is absent.
pub fn query(result: &ProbeResult, name: &str) -> MediaResult<Option<Value>> {
    let (_, query) = RESULT_MAP
        .iter()
        .find(|(n, _)| *n == name)
        .ok_or_else(|| MediaError::UnknownProbeValue(name.to_string()))?;

    Ok(match query {
        Query::Path(path) => result.lookup(path).cloned(),
        Query::Derived(derive) => derive(result),
    })
}

fn video_size(result: &ProbeResult) -> Option<Value> {
    let video = result.video()?;
    let width = value_text(video.get("width")?)?;
    let height = value_text(video.get("height")?)?;
    Some(Value::String(format!("{width}x{height}")))
}

fn framerate(result: &ProbeResult) -> Option<Value> {
    let Some(video) = result.video() else {
        return Some(Value::from(FALLBACK_FRAMERATE));
    };

    match video.get("r_frame_rate")? {
        Value::Number(n) => Some(Value::Number(n.clone())),
        Value::String(rate) => {
            let rate = parse_frame_rate(rate)?;
            if rate.fract() == 0.0 {
                Some(Value::from(rate as u64))
            } else {
                serde_json::Number::from_f64(rate).map(Value::Number)
            }
        }
        _ => None,
    }
}

/// Reduce a rational frame rate such as `30000/1001` to a decimal.
pub fn parse_frame_rate(rate: &str) -> Option<f64> {
    let value = match rate.split_once('/') {
        Some((num, den)) => {
            let num: f64 = num.trim().parse().ok()?;
            let den: f64 = den.trim().parse().ok()?;
            if den == 0.0 {
                return None;
            }
            num / den
        }
        None => rate.trim().parse().ok()?,
    };

    (value.is_finite() && value > 0.0).then_some(value)
}
