//! Codec and container format descriptors.

use serde::{Deserialize, Serialize};

/// Media type a codec handles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CodecKind {
    Video,
    Audio,
    Subtitle,
    Data,
    Attachment,
    Unknown,
}

impl CodecKind {
    /// Map the kind column of a `-codecs` listing.
    pub fn from_flag(flag: char) -> Self {
        match flag {
            'V' => Self::Video,
            'A' => Self::Audio,
            'S' => Self::Subtitle,
            'D' => Self::Data,
            'T' => Self::Attachment,
            _ => Self::Unknown,
        }
    }
}

/// One codec known to the transcoder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CodecInfo {
    pub name: String,
    pub description: String,
    pub kind: CodecKind,
    pub decoding: bool,
    pub encoding: bool,
    pub intra_only: bool,
    pub lossy: bool,
    pub lossless: bool,
    /// Named decoders, when they differ from the codec name
    #[serde(default)]
    pub decoders: Vec<String>,
    /// Named encoders, when they differ from the codec name
    #[serde(default)]
    pub encoders: Vec<String>,
}

impl CodecInfo {
    /// The encoder the transcoder picks first for this codec.
    pub fn preferred_encoder(&self) -> Option<&str> {
        self.encoders.first().map(String::as_str)
    }
}

/// One container format known to the transcoder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FormatInfo {
    pub name: String,
    pub description: String,
    pub demuxing: bool,
    pub muxing: bool,
}
