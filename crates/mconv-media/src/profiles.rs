//! Output presets.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::conversion::Conversion;
use crate::endpoint::{Input, Output};
use crate::error::{MediaError, MediaResult};

/// A named bundle of output settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Profile {
    /// VP8 and Vorbis in WebM
    Webm,
    /// Audio only MP3
    Mp3,
    /// Baseline H.264 and AAC in fragmented MP4
    Mp4,
    /// MPEG-1 video in MPEG-TS, no audio
    Jsmpeg,
    /// Copy both streams into MPEG-TS
    Copy,
}

/// Options some profiles react to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfileOptions {
    /// Short keyframe intervals for live playback (`mp4`)
    #[serde(default)]
    pub realtime: bool,
    /// Matroska with passthrough timestamps (`copy`)
    #[serde(default)]
    pub variable_framerate: bool,
}

impl Profile {
    pub const ALL: [Profile; 5] = [Self::Webm, Self::Mp3, Self::Mp4, Self::Jsmpeg, Self::Copy];

    pub fn name(&self) -> &'static str {
        match self {
            Self::Webm => "webm",
            Self::Mp3 => "mp3",
            Self::Mp4 => "mp4",
            Self::Jsmpeg => "jsmpeg",
            Self::Copy => "copy",
        }
    }

    /// Apply this profile to `output`. Only `copy` touches the input.
    pub fn apply(&self, input: Option<&Input>, output: &Output, options: ProfileOptions) -> MediaResult<()> {
        match self {
            Self::Webm => {
                output.set("audio_codec", "libvorbis")?;
                output.set("video_codec", "libvpx")?;
                output.set("format", "webm")?;
                output.add_arguments(["-qmin", "10", "-qmax", "40"]);
            }
            Self::Mp3 => {
                output.set("audio_codec", "libmp3lame")?;
                output.set("format", "mp3")?;
            }
            Self::Mp4 => {
                output.add_arguments(["-profile:v", "baseline", "-level", "3.0"]);
                output.set("audio_codec", "aac")?;
                output.set("video_codec", "libx264")?;
                output.set("format", "mp4")?;
                output.set("movflags", "isml+empty_moov+default_base_moof+frag_keyframe")?;
                output.set("audio_bsf", "aac_adtstoasc")?;

                if options.realtime {
                    output.add_arguments(["-x264opts", "keyint=5:min-keyint=5:scenecut=-1"]);
                }
            }
            Self::Jsmpeg => {
                output.set("video_codec", "mpeg1video")?;
                output.set("format", "mpegts")?;
                output.set("disable_audio", true)?;
                output.add_arguments(["-b:v", "1500k", "-bf", "0"]);
            }
            Self::Copy => {
                output.set("audio_codec", "copy")?;
                output.set("video_codec", "copy")?;
                output.set("format", "mpegts")?;

                if options.variable_framerate {
                    output.set("format", "matroska")?;
                    if let Some(input) = input {
                        input.set("copy_ts", false)?;
                    }
                    output.add_arguments(["-vsync", "2"]);
                }

                output.add_arguments(["-bsf:v", "h264_mp4toannexb"]);
            }
        }

        Ok(())
    }
}

impl fmt::Display for Profile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Profile {
    type Err = MediaError;

    fn from_str(name: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|profile| profile.name() == name)
            .ok_or_else(|| MediaError::invalid_option("profile", format!("profile \"{name}\" does not exist")))
    }
}

impl Conversion {
    /// Apply `profile` to `output`, with the conversion's first input.
    pub fn use_profile(&self, output: &Output, profile: Profile, options: ProfileOptions) -> MediaResult<()> {
        let input = self.inputs().into_iter().next();
        profile.apply(input.as_ref(), output, options)
    }

    /// Settings that keep a live encode cheap: a small rate buffer, the
    /// fastest presets and two threads.
    pub fn use_realtime_defaults(&self, output: &Output) -> MediaResult<()> {
        output.set("bufsize", "128k")?;
        output.set("deadline", "realtime")?;
        output.set("preset", "ultrafast")?;
        self.set("threads", 2)
    }
}
