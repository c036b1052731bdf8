//! Format contracts at the graph boundaries.
//!
//! Every constant here is part of the mixing contract: the composite layout,
//! the per-tile size, and the raw audio format both mixers agree on. None of
//! them is user configurable.

use std::fmt::{Display, Formatter};
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Maximum number of sources, and therefore of tracks per kind.
pub const MAX_SOURCES: usize = 3;

pub const TILE_WIDTH: u32 = 640;
pub const TILE_HEIGHT: u32 = 1080;

pub const OUTPUT_WIDTH: u32 = 1920;
pub const OUTPUT_HEIGHT: u32 = 1080;

/// Capacity of the buffer decoupling the sink from media production.
pub const BUFFER_MAX_TIME: Duration = Duration::from_secs(5);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TrackKind {
    Video,
    Audio,
}

impl Display for TrackKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            TrackKind::Video => write!(f, "video"),
            TrackKind::Audio => write!(f, "audio"),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Fraction {
    pub num: i32,
    pub den: i32,
}

impl Fraction {
    pub const fn new(num: i32, den: i32) -> Self {
        Self { num, den }
    }
}

impl Display for Fraction {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.num, self.den)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PixelFormat {
    I420,
    Nv12,
    Yuy2,
    Rgba,
    Bgra,
}

impl PixelFormat {
    pub fn name(&self) -> &'static str {
        match self {
            PixelFormat::I420 => "I420",
            PixelFormat::Nv12 => "NV12",
            PixelFormat::Yuy2 => "YUY2",
            PixelFormat::Rgba => "RGBA",
            PixelFormat::Bgra => "BGRA",
        }
    }
}

/// Raw video format. A `None` field leaves that property unconstrained, which
/// is how the per-tile constraint only pins size and aspect ratio.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VideoFormat {
    #[serde(default)]
    pub width: Option<u32>,
    #[serde(default)]
    pub height: Option<u32>,
    #[serde(default)]
    pub framerate: Option<Fraction>,
    #[serde(default)]
    pub pixel_format: Option<PixelFormat>,
    #[serde(default)]
    pub pixel_aspect_ratio: Option<Fraction>,
}

impl VideoFormat {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width: Some(width),
            height: Some(height),
            ..Default::default()
        }
    }

    pub fn with_framerate(mut self, framerate: Fraction) -> Self {
        self.framerate = Some(framerate);
        self
    }

    pub fn with_pixel_format(mut self, pixel_format: PixelFormat) -> Self {
        self.pixel_format = Some(pixel_format);
        self
    }

    pub fn with_pixel_aspect_ratio(mut self, par: Fraction) -> Self {
        self.pixel_aspect_ratio = Some(par);
        self
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SampleFormat {
    U8,
    S16LE,
    S32LE,
    F32LE,
}

impl SampleFormat {
    pub fn name(&self) -> &'static str {
        match self {
            SampleFormat::U8 => "U8",
            SampleFormat::S16LE => "S16LE",
            SampleFormat::S32LE => "S32LE",
            SampleFormat::F32LE => "F32LE",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SampleLayout {
    Interleaved,
    NonInterleaved,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AudioFormat {
    pub sample_format: SampleFormat,
    pub layout: SampleLayout,
    pub rate: u32,
    pub channels: u32,
    pub channel_mask: u64,
}

/// Negotiated (or required) format of one elementary stream.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Caps {
    Video(VideoFormat),
    Audio(AudioFormat),
}

impl Caps {
    pub fn kind(&self) -> TrackKind {
        match self {
            Caps::Video(_) => TrackKind::Video,
            Caps::Audio(_) => TrackKind::Audio,
        }
    }

    /// Exact equality, the test used to pick passthrough over adaptation.
    pub fn is_equal(&self, other: &Caps) -> bool {
        self == other
    }
}

impl Display for Caps {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Caps::Video(v) => {
                write!(f, "video/x-raw")?;
                if let Some(w) = v.width {
                    write!(f, ", width=(int){}", w)?;
                }
                if let Some(h) = v.height {
                    write!(f, ", height=(int){}", h)?;
                }
                if let Some(r) = v.framerate {
                    write!(f, ", framerate=(fraction){}", r)?;
                }
                if let Some(p) = v.pixel_format {
                    write!(f, ", format=(string){}", p.name())?;
                }
                if let Some(par) = v.pixel_aspect_ratio {
                    write!(f, ", pixel-aspect-ratio=(fraction){}", par)?;
                }
                Ok(())
            }
            Caps::Audio(a) => write!(
                f,
                "audio/x-raw, format=(string){}, layout=(string){}, rate=(int){}, channels=(int){}, channel-mask=(bitmask)0x{:02x}",
                a.sample_format.name(),
                match a.layout {
                    SampleLayout::Interleaved => "interleaved",
                    SampleLayout::NonInterleaved => "non-interleaved",
                },
                a.rate,
                a.channels,
                a.channel_mask
            ),
        }
    }
}

/// Format produced by the video mixer's output-format node.
pub fn mixer_video_caps() -> Caps {
    Caps::Video(
        VideoFormat::new(OUTPUT_WIDTH, OUTPUT_HEIGHT)
            .with_framerate(Fraction::new(30, 1))
            .with_pixel_format(PixelFormat::I420)
            .with_pixel_aspect_ratio(Fraction::new(1, 1)),
    )
}

/// Size every video track is letterboxed into before reaching its tile.
pub fn tile_caps() -> Caps {
    Caps::Video(
        VideoFormat::new(TILE_WIDTH, TILE_HEIGHT).with_pixel_aspect_ratio(Fraction::new(1, 1)),
    )
}

/// Input and output format of the audio mixer.
pub fn mixer_audio_format() -> AudioFormat {
    AudioFormat {
        sample_format: SampleFormat::S16LE,
        layout: SampleLayout::Interleaved,
        rate: 44100,
        channels: 2,
        channel_mask: 0x3,
    }
}

pub fn mixer_audio_caps() -> Caps {
    Caps::Audio(mixer_audio_format())
}
