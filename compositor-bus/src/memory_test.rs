use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::{MediaDescription, MemoryLibrary};
use crate::caps::{mixer_audio_caps, tile_caps};
use crate::library::{BusMessage, DiscoveredTrack, PadRef, PropValue, RunState, TransformLibrary, link_many};

#[test]
fn test_create_unknown_factory_fails() {
    let lib = MemoryLibrary::new();
    assert!(lib.create("no-such-element", None).is_err());
    assert_eq!(lib.node_count(), 0);
}

#[test]
fn test_link_requires_nodes_in_graph() -> anyhow::Result<()> {
    let lib = MemoryLibrary::new();
    let a = lib.create("videoscale", None)?;
    let b = lib.create("capsfilter", None)?;
    assert!(lib.link_nodes(a, b).is_err());

    lib.add(a)?;
    lib.add(b)?;
    lib.link_nodes(a, b)?;
    assert!(lib.is_linked(a, b));
    // the pads are taken now
    assert!(lib.link(&PadRef::src(a), &PadRef::sink(b)).is_err());
    Ok(())
}

#[test]
fn test_duplicate_names_rejected_on_add() -> anyhow::Result<()> {
    let lib = MemoryLibrary::new();
    let a = lib.create("queue", Some("buffer"))?;
    let b = lib.create("queue", Some("buffer"))?;
    lib.add(a)?;
    assert!(lib.add(b).is_err());
    Ok(())
}

#[test]
fn test_link_nodes_requests_muxer_pads() -> anyhow::Result<()> {
    let lib = MemoryLibrary::new();
    let venc = lib.create("x264enc", None)?;
    let aenc = lib.create("avenc_aac", None)?;
    let mux = lib.create("flvmux", None)?;
    for n in [venc, aenc, mux] {
        lib.add(n)?;
    }
    lib.link_nodes(venc, mux)?;
    lib.link_nodes(aenc, mux)?;
    let pads = lib.requested_pads(mux);
    assert_eq!(pads.len(), 2);
    assert_eq!(pads[0].name, "sink_0");
    assert_eq!(pads[1].name, "sink_1");
    Ok(())
}

#[test]
fn test_refused_link_releases_requested_pad() -> anyhow::Result<()> {
    let lib = MemoryLibrary::new();
    let enc = lib.create("x264enc", None)?;
    let mux = lib.create("flvmux", None)?;
    lib.add(enc)?;
    lib.add(mux)?;
    lib.fail_link_into("flvmux");
    assert!(lib.link_nodes(enc, mux).is_err());
    assert!(lib.requested_pads(mux).is_empty());
    Ok(())
}

#[test]
fn test_release_pad_drops_its_link() -> anyhow::Result<()> {
    let lib = MemoryLibrary::new();
    let filter = lib.create("capsfilter", None)?;
    let mixer = lib.create("compositor", None)?;
    lib.add(filter)?;
    lib.add(mixer)?;
    let pad = lib.request_pad(mixer, "sink_%u")?;
    lib.link(&PadRef::src(filter), &pad)?;
    lib.release_pad(&pad)?;
    assert!(lib.links().is_empty());
    assert!(lib.release_pad(&PadRef::src(mixer)).is_err());
    Ok(())
}

#[test]
fn test_sync_state_follows_graph() -> anyhow::Result<()> {
    let lib = MemoryLibrary::new();
    let n = lib.create("audioconvert", None)?;
    assert!(lib.sync_state_with_parent(n).is_err(), "no parent yet");
    lib.add(n)?;
    lib.set_state(RunState::Paused)?;
    let late = lib.create("audioresample", None)?;
    lib.add(late)?;
    assert_eq!(lib.node_state(late), Some(RunState::Null));
    assert_eq!(lib.sync_state_with_parent(late)?, RunState::Paused);
    assert_eq!(lib.node_state(late), Some(RunState::Paused));

    lib.fail_state_sync("audioresample");
    assert!(lib.sync_state_with_parent(late).is_err());
    Ok(())
}

#[test]
fn test_destroy_removes_links_and_node() -> anyhow::Result<()> {
    let lib = MemoryLibrary::new();
    let a = lib.create("audioresample", None)?;
    let b = lib.create("audioconvert", None)?;
    let c = lib.create("capsfilter", None)?;
    for n in [a, b, c] {
        lib.add(n)?;
    }
    link_many(&lib, &[a, b, c])?;
    lib.destroy(b)?;
    assert!(lib.links().is_empty());
    assert_eq!(lib.node_count(), 2);
    assert_eq!(lib.created_count("audioconvert"), 1);
    assert!(lib.destroy(b).is_err());
    Ok(())
}

#[test]
fn test_properties_round_trip() -> anyhow::Result<()> {
    let lib = MemoryLibrary::new();
    let f = lib.create("capsfilter", None)?;
    lib.set_property(f, "caps", tile_caps().into())?;
    assert_eq!(lib.property(f, "caps"), Some(PropValue::Caps(tile_caps())));
    assert_eq!(lib.property(f, "missing"), None);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_playing_sources_discover_tracks_then_eos() -> anyhow::Result<()> {
    let lib = MemoryLibrary::new().with_media(
        "file:///a.webm",
        MediaDescription::new(vec![tile_caps(), mixer_audio_caps()])
            .with_delay(Duration::from_millis(5)),
    );
    let src = lib.create("uridecodebin", Some("source1"))?;
    lib.set_property(src, "uri", "file:///a.webm".into())?;
    lib.add(src)?;

    let seen = Arc::new(Mutex::new(Vec::new()));
    let seen_clone = Arc::clone(&seen);
    lib.connect_track_discovered(
        src,
        Arc::new(move |track: DiscoveredTrack| seen_clone.lock().unwrap().push(track)),
    )?;

    let mut bus = lib.subscribe();
    lib.set_state(RunState::Playing)?;

    let mut state_changes = 0;
    loop {
        let msg = tokio::time::timeout(Duration::from_secs(5), bus.recv()).await??;
        match msg {
            BusMessage::StateChanged { .. } => state_changes += 1,
            BusMessage::EndOfStream => break,
            BusMessage::Error { message, .. } => anyhow::bail!("unexpected error {}", message),
        }
    }
    assert_eq!(state_changes, 3);

    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 2);
    assert_eq!(seen[0].pad.name, "src_0");
    assert_eq!(seen[1].caps, mixer_audio_caps());
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_unknown_locator_posts_error() -> anyhow::Result<()> {
    let lib = MemoryLibrary::new();
    let src = lib.create("uridecodebin", Some("source1"))?;
    lib.set_property(src, "uri", "https://nowhere.invalid/x.webm".into())?;
    lib.add(src)?;
    let mut bus = lib.subscribe();
    lib.set_state(RunState::Playing)?;

    loop {
        match tokio::time::timeout(Duration::from_secs(5), bus.recv()).await?? {
            BusMessage::Error { node, .. } => {
                assert_eq!(node, "source1");
                break;
            }
            BusMessage::EndOfStream => anyhow::bail!("eos must not follow a failed source"),
            BusMessage::StateChanged { .. } => {}
        }
    }
    Ok(())
}

#[test]
fn test_fail_start() {
    let lib = MemoryLibrary::new();
    lib.fail_start();
    assert!(lib.set_state(RunState::Playing).is_err());
    assert_eq!(lib.state(), RunState::Null);
}

#[test]
fn test_dump_dot_lists_graph_nodes() -> anyhow::Result<()> {
    let lib = MemoryLibrary::new();
    let a = lib.create("queue", Some("buffer"))?;
    let b = lib.create("filesink", Some("file-sink"))?;
    lib.add(a)?;
    lib.add(b)?;
    lib.link_nodes(a, b)?;
    let dot = lib.dump_dot().unwrap();
    assert!(dot.contains("buffer"));
    assert!(dot.contains("file-sink"));
    assert!(dot.contains("->"));
    Ok(())
}
