//! Reads the elementary tracks of real media files into [`MediaDescription`]s
//! so the in-process library plays what the files actually contain.

use ffmpeg_next::ffi::{AVCodecParameters, AVPixelFormat, AVSampleFormat};
use ffmpeg_next::media::Type;

use crate::caps::{AudioFormat, Caps, Fraction, PixelFormat, SampleFormat, SampleLayout, VideoFormat};
use crate::memory::MediaDescription;

/// Opens `locator` (a path or `file://` URI) and lists its audio and video
/// tracks in stream order.
pub fn probe(locator: &str) -> anyhow::Result<MediaDescription> {
    let path = locator.strip_prefix("file://").unwrap_or(locator);
    let input = ffmpeg_next::format::input(path)
        .map_err(|e| anyhow::anyhow!("failed to open {}: {}", locator, e))?;

    let mut tracks = Vec::new();
    for stream in input.streams() {
        let params = stream.parameters();
        let medium = params.medium();
        let (width, height, format, sample_rate, channels) = raw_parameters(&params);
        match medium {
            Type::Video => {
                let mut video = VideoFormat::new(width, height);
                let rate = stream.avg_frame_rate();
                if rate.numerator() > 0 && rate.denominator() > 0 {
                    video = video.with_framerate(Fraction::new(rate.numerator(), rate.denominator()));
                }
                if let Some(p) = pixel_format(format) {
                    video = video.with_pixel_format(p);
                }
                tracks.push(Caps::Video(video));
            }
            Type::Audio => {
                let (sample_format, layout) = sample_format(format);
                tracks.push(Caps::Audio(AudioFormat {
                    sample_format,
                    layout,
                    rate: sample_rate,
                    channels,
                    // canonical front-first layout
                    channel_mask: (1_u64 << channels.min(63)) - 1,
                }));
            }
            _ => log::debug!("{}: skipping {:?} stream {}", locator, medium, stream.index()),
        }
    }
    log::info!("{}: {} tracks", locator, tracks.len());
    Ok(MediaDescription::new(tracks))
}

/// Width, height, format, sample rate and channel count straight from the
/// codec parameters (not all exposed by ffmpeg-next).
fn raw_parameters(params: &ffmpeg_next::codec::Parameters) -> (u32, u32, i32, u32, u32) {
    unsafe {
        let ptr = params.as_ptr() as *const AVCodecParameters;
        (
            (*ptr).width.max(0) as u32,
            (*ptr).height.max(0) as u32,
            (*ptr).format,
            (*ptr).sample_rate.max(0) as u32,
            (*ptr).ch_layout.nb_channels.max(0) as u32,
        )
    }
}

fn pixel_format(format: i32) -> Option<PixelFormat> {
    match format {
        f if f == AVPixelFormat::AV_PIX_FMT_YUV420P as i32 => Some(PixelFormat::I420),
        f if f == AVPixelFormat::AV_PIX_FMT_NV12 as i32 => Some(PixelFormat::Nv12),
        f if f == AVPixelFormat::AV_PIX_FMT_YUYV422 as i32 => Some(PixelFormat::Yuy2),
        f if f == AVPixelFormat::AV_PIX_FMT_RGBA as i32 => Some(PixelFormat::Rgba),
        f if f == AVPixelFormat::AV_PIX_FMT_BGRA as i32 => Some(PixelFormat::Bgra),
        _ => None,
    }
}

/// Unknown formats are reported as planar float, which never matches the
/// mixer contract and so always gets converted.
fn sample_format(format: i32) -> (SampleFormat, SampleLayout) {
    use SampleLayout::{Interleaved, NonInterleaved};
    match format {
        f if f == AVSampleFormat::AV_SAMPLE_FMT_U8 as i32 => (SampleFormat::U8, Interleaved),
        f if f == AVSampleFormat::AV_SAMPLE_FMT_S16 as i32 => (SampleFormat::S16LE, Interleaved),
        f if f == AVSampleFormat::AV_SAMPLE_FMT_S16P as i32 => (SampleFormat::S16LE, NonInterleaved),
        f if f == AVSampleFormat::AV_SAMPLE_FMT_S32 as i32 => (SampleFormat::S32LE, Interleaved),
        f if f == AVSampleFormat::AV_SAMPLE_FMT_S32P as i32 => (SampleFormat::S32LE, NonInterleaved),
        f if f == AVSampleFormat::AV_SAMPLE_FMT_FLT as i32 => (SampleFormat::F32LE, Interleaved),
        _ => (SampleFormat::F32LE, NonInterleaved),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sample_format_mapping() {
        assert_eq!(
            sample_format(AVSampleFormat::AV_SAMPLE_FMT_S16 as i32),
            (SampleFormat::S16LE, SampleLayout::Interleaved)
        );
        assert_eq!(
            sample_format(AVSampleFormat::AV_SAMPLE_FMT_FLTP as i32),
            (SampleFormat::F32LE, SampleLayout::NonInterleaved)
        );
    }

    #[test]
    fn test_probe_missing_file_fails() {
        crate::init().unwrap();
        assert!(probe("file:///nonexistent/clip.webm").is_err());
    }
}
