//! Parser for the analyzer's block-structured text report.
//!
//! The report holds one `[STREAM]`..`[/STREAM]` block per media stream and a
//! single `[FORMAT]`..`[/FORMAT]` block, each made of `key=value` lines.

use mconv_models::{FieldMap, ProbeResult};
use regex::Regex;
use serde_json::Value;
use std::sync::LazyLock;

static NUMERIC: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\d+\.?\d*$").expect("numeric pattern is valid"));

const TAG_MARKER: &str = "TAG:";

/// Parse a complete analyzer report.
pub fn parse_report(text: &str) -> ProbeResult {
    let streams = section(text, "[STREAM]", "[/STREAM]")
        .map(parse_streams)
        .unwrap_or_default();

    let (format, metadata) = section(text, "[FORMAT]", "[/FORMAT]")
        .map(parse_format)
        .unwrap_or_default();

    ProbeResult::new(streams, format, metadata)
}

/// Coerce one report value.
///
/// Pure numbers become JSON numbers, `N/A` is absent, anything else is text.
pub fn parse_field(raw: &str) -> Option<Value> {
    let raw = raw.trim();

    if raw == "N/A" {
        return None;
    }

    if NUMERIC.is_match(raw) {
        if !raw.contains('.') {
            if let Ok(n) = raw.parse::<u64>() {
                return Some(Value::from(n));
            }
        }
        if let Some(n) = raw.parse::<f64>().ok().and_then(serde_json::Number::from_f64) {
            return Some(Value::Number(n));
        }
    }

    Some(Value::String(raw.to_string()))
}

/// Text between the first `open` marker and the last `close` marker.
fn section<'a>(text: &'a str, open: &str, close: &str) -> Option<&'a str> {
    let start = text.find(open)? + open.len();
    let end = text.rfind(close)?;
    (start <= end).then(|| &text[start..end])
}

/// Parse `key=value` lines, ignoring anything else.
fn parse_block(block: &str) -> FieldMap {
    let mut fields = FieldMap::new();

    for line in block.lines() {
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let key = key.trim();
        if key.is_empty() {
            continue;
        }
        if let Some(value) = parse_field(value) {
            fields.insert(key.to_string(), value);
        }
    }

    fields
}

fn parse_streams(section: &str) -> Vec<FieldMap> {
    let mut streams: Vec<(usize, FieldMap)> = section
        .split("[/STREAM]")
        .map(parse_block)
        .filter(|fields| !fields.is_empty())
        .enumerate()
        .map(|(position, mut fields)| {
            let index = fields
                .remove("index")
                .and_then(|v| v.as_u64())
                .and_then(|v| usize::try_from(v).ok())
                .unwrap_or(position);
            (index, fields)
        })
        .collect();

    streams.sort_by_key(|(index, _)| *index);
    streams.into_iter().map(|(_, fields)| fields).collect()
}

fn parse_format(section: &str) -> (FieldMap, FieldMap) {
    let mut format = FieldMap::new();
    let mut metadata = FieldMap::new();

    for (key, value) in parse_block(section) {
        if key == "filename" {
            continue;
        }
        match key.strip_prefix(TAG_MARKER) {
            Some(tag) => {
                metadata.insert(tag.to_string(), value);
            }
            None => {
                format.insert(key, value);
            }
        }
    }

    (format, metadata)
}
