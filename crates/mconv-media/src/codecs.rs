//! Codec and container format catalog reported by the transcoder.
//!
//! Listings are fetched once per executable path and cached for the life of
//! the process.

use mconv_models::{CodecInfo, CodecKind, FormatInfo};
use parking_lot::Mutex;
use regex::Regex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, LazyLock};
use tokio::process::Command;
use tracing::debug;

use crate::error::{MediaError, MediaResult};

static CATALOGS: LazyLock<Mutex<HashMap<PathBuf, Arc<CodecCatalog>>>> =
    LazyLock::new(|| Mutex::new(HashMap::new()));

static DECODERS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\(decoders: ([^)]*)\)").expect("decoders pattern is valid"));

static ENCODERS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\(encoders: ([^)]*)\)").expect("encoders pattern is valid"));

/// Codecs and formats supported by one transcoder build.
#[derive(Debug, Clone, Default)]
pub struct CodecCatalog {
    codecs: HashMap<String, CodecInfo>,
    formats: HashMap<String, FormatInfo>,
}

impl CodecCatalog {
    /// Load (or reuse) the catalog of the transcoder at `ffmpeg_path`.
    pub async fn load(ffmpeg_path: &Path) -> MediaResult<Arc<Self>> {
        if let Some(catalog) = CATALOGS.lock().get(ffmpeg_path) {
            return Ok(catalog.clone());
        }

        let (codecs, formats) = tokio::try_join!(
            run_listing(ffmpeg_path, "-codecs"),
            run_listing(ffmpeg_path, "-formats"),
        )?;

        let catalog = Arc::new(Self::parse(&codecs, &formats));
        debug!(
            ffmpeg = %ffmpeg_path.display(),
            codecs = catalog.codecs.len(),
            formats = catalog.formats.len(),
            "Loaded codec catalog"
        );

        CATALOGS
            .lock()
            .insert(ffmpeg_path.to_path_buf(), catalog.clone());
        Ok(catalog)
    }

    /// Build a catalog from `-codecs` and `-formats` listings.
    pub fn parse(codecs_listing: &str, formats_listing: &str) -> Self {
        let codecs = table_rows(codecs_listing)
            .filter_map(parse_codec_row)
            .map(|codec| (codec.name.clone(), codec))
            .collect();

        let mut formats: HashMap<String, FormatInfo> = HashMap::new();
        for format in table_rows(formats_listing).flat_map(parse_format_row) {
            formats
                .entry(format.name.clone())
                .and_modify(|known| {
                    known.demuxing |= format.demuxing;
                    known.muxing |= format.muxing;
                })
                .or_insert(format);
        }

        Self { codecs, formats }
    }

    pub fn codec(&self, name: &str) -> Option<&CodecInfo> {
        self.codecs.get(name)
    }

    pub fn format(&self, name: &str) -> Option<&FormatInfo> {
        self.formats.get(name)
    }

    /// First encoder listed for `codec`.
    pub fn preferred_encoder(&self, codec: &str) -> Option<&str> {
        self.codec(codec).and_then(CodecInfo::preferred_encoder)
    }

    pub fn codecs(&self) -> impl Iterator<Item = &CodecInfo> {
        self.codecs.values()
    }

    pub fn formats(&self) -> impl Iterator<Item = &FormatInfo> {
        self.formats.values()
    }
}

async fn run_listing(ffmpeg_path: &Path, flag: &str) -> MediaResult<String> {
    let output = Command::new(ffmpeg_path)
        .args(["-hide_banner", flag])
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await
        .map_err(|err| MediaError::spawn_failed(ffmpeg_path.display().to_string(), &err))?;

    if !output.status.success() {
        return Err(MediaError::ffmpeg_failed(
            format!("{} {} failed", ffmpeg_path.display(), flag),
            Some(String::from_utf8_lossy(&output.stderr).to_string()),
            output.status.code(),
        ));
    }

    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Rows after the dashed separator that ends the legend.
fn table_rows(listing: &str) -> impl Iterator<Item = &str> {
    listing
        .lines()
        .skip_while(|line| !line.trim_start().starts_with("--"))
        .skip(1)
        .filter(|line| !line.trim().is_empty())
}

fn parse_codec_row(row: &str) -> Option<CodecInfo> {
    let row = row.trim();
    let (flags, rest) = row.split_once(char::is_whitespace)?;
    let flags: Vec<char> = flags.chars().collect();
    if flags.len() != 6 {
        return None;
    }

    let rest = rest.trim_start();
    let (name, description) = rest.split_once(char::is_whitespace).unwrap_or((rest, ""));

    let names = |pattern: &Regex| -> Vec<String> {
        pattern
            .captures(description)
            .and_then(|caps| caps.get(1))
            .map(|m| m.as_str().split_whitespace().map(String::from).collect())
            .unwrap_or_default()
    };

    let plain = description
        .split(" (decoders:")
        .next()
        .unwrap_or_default()
        .split(" (encoders:")
        .next()
        .unwrap_or_default()
        .trim();

    Some(CodecInfo {
        name: name.to_string(),
        description: plain.to_string(),
        kind: CodecKind::from_flag(flags[2]),
        decoding: flags[0] == 'D',
        encoding: flags[1] == 'E',
        intra_only: flags[3] == 'I',
        lossy: flags[4] == 'L',
        lossless: flags[5] == 'S',
        decoders: names(&DECODERS),
        encoders: names(&ENCODERS),
    })
}

fn parse_format_row(row: &str) -> Vec<FormatInfo> {
    let mut tokens = row.split_whitespace().peekable();
    let Some(flags) = tokens.next() else {
        return Vec::new();
    };
    if !flags.chars().all(|c| matches!(c, 'D' | 'E' | 'd')) {
        return Vec::new();
    }
    // Device marker column
    if tokens.peek() == Some(&"d") {
        tokens.next();
    }
    let Some(names) = tokens.next() else {
        return Vec::new();
    };
    let description = tokens.collect::<Vec<_>>().join(" ");

    names
        .split(',')
        .filter(|name| !name.is_empty())
        .map(|name| FormatInfo {
            name: name.to_string(),
            description: description.clone(),
            demuxing: flags.contains('D'),
            muxing: flags.contains('E'),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const CODECS: &str = "\
Codecs:
 D..... = Decoding supported
 .E.... = Encoding supported
 ..V... = Video codec
 -------
 DEV.LS h264                 H.264 / AVC / MPEG-4 AVC / MPEG-4 part 10 (decoders: h264 h264_v4l2m2m ) (encoders: libx264 libx264rgb h264_nvenc )
 DEVIL. mjpeg                Motion JPEG
 DEA.L. aac                  AAC (Advanced Audio Coding) (decoders: aac aac_fixed )
 DEVI.S rawvideo             raw video
";

    const FORMATS: &str = "\
File formats:
 D. = Demuxing supported
 .E = Muxing supported
 --
 D  aac             raw ADTS AAC (Advanced Audio Coding)
  E mp4             MP4 (MPEG-4 Part 14)
 D  mov,mp4,m4a,3gp,3g2,mj2 QuickTime / MOV
 DE mpegts          MPEG-TS (MPEG-2 Transport Stream)
 D  d lavfi         Libavfilter virtual input device
";

    #[test]
    fn test_parse_codecs() {
        let catalog = CodecCatalog::parse(CODECS, "");
        let h264 = catalog.codec("h264").unwrap();

        assert_eq!(h264.kind, CodecKind::Video);
        assert!(h264.decoding && h264.encoding && h264.lossy && h264.lossless);
        assert!(!h264.intra_only);
        assert_eq!(h264.description, "H.264 / AVC / MPEG-4 AVC / MPEG-4 part 10");
        assert_eq!(h264.decoders, vec!["h264", "h264_v4l2m2m"]);
        assert_eq!(catalog.preferred_encoder("h264"), Some("libx264"));

        let aac = catalog.codec("aac").unwrap();
        assert_eq!(aac.kind, CodecKind::Audio);
        assert!(aac.encoders.is_empty());
        assert_eq!(catalog.preferred_encoder("aac"), None);
        assert!(catalog.codec("mjpeg").unwrap().intra_only);
        assert_eq!(catalog.codecs().count(), 4);
    }

    #[test]
    fn test_parse_formats() {
        let catalog = CodecCatalog::parse("", FORMATS);

        let mp4 = catalog.format("mp4").unwrap();
        assert!(mp4.demuxing && mp4.muxing);

        let mpegts = catalog.format("mpegts").unwrap();
        assert_eq!(mpegts.description, "MPEG-TS (MPEG-2 Transport Stream)");

        assert!(catalog.format("3gp").unwrap().demuxing);
        assert!(catalog.format("lavfi").is_some());
        assert!(!catalog.format("aac").unwrap().muxing);
    }

    #[tokio::test]
    async fn test_load_missing_executable() {
        let err = CodecCatalog::load(Path::new("/nonexistent/ffmpeg")).await.unwrap_err();
        assert!(matches!(err, MediaError::SpawnFailed { .. }));
    }
}
