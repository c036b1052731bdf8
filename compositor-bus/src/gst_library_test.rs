use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use gst::prelude::*;
use gstreamer as gst;

use super::{GstLibrary, caps_from_gst, init};
use crate::broadcaster::Broadcaster;
use crate::caps::{Caps, Fraction, PixelFormat, mixer_audio_caps, mixer_video_caps};
use crate::config::BroadcastConfig;
use crate::library::{PropValue, RunState, TransformLibrary};

fn work_dir(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("compositor-{}-{}", name, std::process::id()));
    let _ = std::fs::remove_dir_all(&dir);
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

/// Encodes a short test pattern with a tone into an FLV file.
fn write_input(path: &Path, width: u32, height: u32) -> anyhow::Result<()> {
    let description = format!(
        "videotestsrc num-buffers=45 ! video/x-raw,width={},height={},framerate=30/1 ! \
         x264enc ! flvmux name=mux ! filesink location={} \
         audiotestsrc num-buffers=60 ! audioconvert ! avenc_aac ! mux.",
        width,
        height,
        path.display()
    );
    let pipeline = gst::parse::launch(&description)?;
    pipeline.set_state(gst::State::Playing)?;
    let bus = pipeline
        .bus()
        .ok_or(anyhow::anyhow!("pipeline has no bus"))?;
    let msg = bus.timed_pop_filtered(
        gst::ClockTime::from_seconds(30),
        &[gst::MessageType::Eos, gst::MessageType::Error],
    );
    pipeline.set_state(gst::State::Null)?;
    match msg.as_ref().map(|m| m.view()) {
        Some(gst::MessageView::Eos(..)) => Ok(()),
        other => Err(anyhow::anyhow!("input not written: {:?}", other)),
    }
}

#[test]
fn test_raw_video_caps_are_read() -> anyhow::Result<()> {
    init()?;
    let caps = gst::Caps::from_str(
        "video/x-raw, width=(int)1280, height=(int)720, framerate=(fraction)25/1, \
         format=(string)NV12, pixel-aspect-ratio=(fraction)1/1, interlace-mode=(string)progressive",
    )?;
    let Some(Caps::Video(video)) = caps_from_gst(&caps) else {
        panic!("expected video caps");
    };
    assert_eq!(video.width, Some(1280));
    assert_eq!(video.height, Some(720));
    assert_eq!(video.framerate, Some(Fraction::new(25, 1)));
    assert_eq!(video.pixel_format, Some(PixelFormat::Nv12));
    Ok(())
}

#[test]
fn test_mixer_contract_survives_gstreamer_parsing() -> anyhow::Result<()> {
    init()?;
    for contract in [mixer_audio_caps(), mixer_video_caps()] {
        let caps = gst::Caps::from_str(&contract.to_string())?;
        assert_eq!(caps_from_gst(&caps), Some(contract));
    }

    let encoded = gst::Caps::from_str("video/x-h264, stream-format=(string)avc")?;
    assert_eq!(caps_from_gst(&encoded), None);
    Ok(())
}

#[test]
fn test_properties_follow_the_element_types() -> anyhow::Result<()> {
    init()?;
    let lib = GstLibrary::new()?;
    let queue = lib.create("queue", Some("buffer"))?;
    let mixer = lib.create("compositor", None)?;
    let constraint = lib.create("capsfilter", None)?;

    // u64 in GStreamer
    lib.set_property(queue, "max-size-time", 5_000_000_000_i64.into())?;
    assert_eq!(
        lib.property(queue, "max-size-time"),
        Some(PropValue::UInt(5_000_000_000))
    );
    // enum set by value
    lib.set_property(mixer, "background", 1_i64.into())?;
    lib.set_property(constraint, "caps", mixer_audio_caps().into())?;
    assert_eq!(
        lib.property(constraint, "caps"),
        Some(PropValue::Caps(mixer_audio_caps()))
    );

    assert!(lib.set_property(queue, "no-such-property", true.into()).is_err());
    assert!(lib.set_property(queue, "max-size-time", "soon".into()).is_err());
    Ok(())
}

#[test]
fn test_request_pads_are_placed_and_released() -> anyhow::Result<()> {
    init()?;
    let lib = GstLibrary::new()?;
    let mixer = lib.create("compositor", Some("video_mixer"))?;
    lib.add(mixer)?;

    let pad = lib.request_pad(mixer, "sink_%u")?;
    lib.set_pad_property(&pad, "xpos", 640_i64.into())?;
    assert_eq!(lib.pad_property(&pad, "xpos"), Some(PropValue::Int(640)));

    lib.release_pad(&pad)?;
    assert_eq!(lib.pad_property(&pad, "xpos"), None);
    lib.destroy(mixer)?;
    assert!(lib.destroy(mixer).is_err());
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_three_files_are_mixed_into_flv() -> anyhow::Result<()> {
    init()?;
    let dir = work_dir("gst-mix");
    let mut locators = Vec::new();
    for (i, (width, height)) in [(320, 240), (640, 360), (1280, 720)].into_iter().enumerate() {
        let input = dir.join(format!("input{}.flv", i + 1));
        write_input(&input, width, height)?;
        locators.push(format!("file://{}", input.display()));
    }
    let output = dir.join("out.flv");

    let lib = Arc::new(GstLibrary::new()?);
    let mut broadcaster = Broadcaster::new(lib.clone()).with_dot_dir(dir.join("dot"));
    let config = locators
        .iter()
        .fold(BroadcastConfig::builder(), |b, l| b.source(l.as_str()))
        .file_sink(output.display().to_string())
        .build();
    broadcaster.init(&config)?;
    tokio::time::timeout(Duration::from_secs(60), broadcaster.run()).await??;

    let report = broadcaster.report();
    assert_eq!(report.linked_video, 3);
    assert_eq!(report.linked_audio, 3);
    assert_eq!(lib.state(), RunState::Null);

    let written = std::fs::metadata(&output)?.len();
    assert!(written > 0, "{} is empty", output.display());
    let header = std::fs::read(&output)?;
    assert_eq!(&header[..3], b"FLV");
    assert!(std::fs::read_dir(dir.join("dot"))?.next().is_some());

    let _ = std::fs::remove_dir_all(&dir);
    Ok(())
}
