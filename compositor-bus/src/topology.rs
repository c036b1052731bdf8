//! Fixed backbone of the broadcast.
//!
//! ```text
//! source1..3 ~> [router splices] ~> video_mixer -> video_mixer_capsfilter -> video-enc -> muxer -> buffer -> sink
//!                                 ~> audio_mixer -> aac_encoder ---------------------------^
//! ```
//!
//! Sources have no output until the graph plays, so nothing downstream of
//! them is linked here; the router connects them as their tracks appear.

use std::sync::Arc;

use crate::caps::{BUFFER_MAX_TIME, mixer_video_caps};
use crate::config::ValidatedConfig;
use crate::error::BroadcastError;
use crate::graph::CompositingGraph;
use crate::library::{NodeId, PropValue, TransformLibrary};
use crate::router::TrackRouter;
use crate::source::{Source, SourceId};

pub struct Topology {
    pub router: Arc<TrackRouter>,
    pub sources: Vec<Source>,
    pub sink: NodeId,
}

struct Backbone {
    sources: Vec<Source>,
    video_mixer: NodeId,
    audio_mixer: NodeId,
    sink: NodeId,
}

/// Builds and links every fixed node, then subscribes the router to each
/// source. On failure nothing created here survives.
pub fn build(
    library: Arc<dyn TransformLibrary>,
    config: &ValidatedConfig,
) -> Result<Topology, BroadcastError> {
    let mut graph = CompositingGraph::new(Arc::clone(&library));
    let backbone = match assemble(&mut graph, config) {
        Ok(backbone) => backbone,
        Err(e) => {
            graph.teardown();
            return Err(e);
        }
    };

    let router = Arc::new(TrackRouter::new(
        graph,
        backbone.sources.clone(),
        backbone.video_mixer,
        backbone.audio_mixer,
    ));
    for source in backbone.sources.iter() {
        if let Err(e) = library.connect_track_discovered(source.node, router.listener_for(source.id))
        {
            router.teardown();
            return Err(BroadcastError::construction(
                format!("failed to subscribe to {}", source.id),
                e,
            ));
        }
    }

    log::info!(
        "topology ready: {} sources into {}",
        backbone.sources.len(),
        config.sink.location()
    );
    Ok(Topology {
        router,
        sources: backbone.sources,
        sink: backbone.sink,
    })
}

fn assemble(
    graph: &mut CompositingGraph,
    config: &ValidatedConfig,
) -> Result<Backbone, BroadcastError> {
    let mut sources = Vec::with_capacity(config.sources.len());
    for (i, locator) in config.sources.iter().enumerate() {
        let id = SourceId(i + 1);
        let node = make(graph, "uridecodebin", &id.to_string())?;
        set(graph, node, "uri", locator.as_str().into())?;
        sources.push(Source::new(id, locator, node));
    }

    let video_mixer = make(graph, "compositor", "video_mixer")?;
    // 1 = black
    set(graph, video_mixer, "background", 1_i64.into())?;
    let audio_mixer = make(graph, "audiomixer", "audio_mixer")?;
    let video_format = make(graph, "capsfilter", "video_mixer_capsfilter")?;
    set(graph, video_format, "caps", mixer_video_caps().into())?;
    let video_encoder = make(graph, "x264enc", "video-enc")?;
    let audio_encoder = make(graph, "avenc_aac", "aac_encoder")?;
    let muxer = make(graph, "flvmux", "muxer")?;
    let buffer = make(graph, "queue", "buffer")?;
    set(
        graph,
        buffer,
        "max-size-time",
        (BUFFER_MAX_TIME.as_nanos() as u64).into(),
    )?;
    let sink = make(graph, config.sink.factory(), config.sink.node_name())?;
    set(graph, sink, "location", config.sink.location().into())?;

    graph
        .add_many(graph.nodes())
        .map_err(|e| BroadcastError::construction("elements could not be added", e))?;
    graph
        .link_many(&[video_mixer, video_format, video_encoder, muxer, buffer, sink])
        .map_err(|e| BroadcastError::construction("video elements could not be linked", e))?;
    graph
        .link_many(&[audio_mixer, audio_encoder, muxer])
        .map_err(|e| BroadcastError::construction("audio elements could not be linked", e))?;

    Ok(Backbone {
        sources,
        video_mixer,
        audio_mixer,
        sink,
    })
}

fn make(
    graph: &mut CompositingGraph,
    factory: &str,
    name: &str,
) -> Result<NodeId, BroadcastError> {
    graph
        .make(factory, Some(name))
        .map_err(|e| BroadcastError::construction(format!("{} could not be created", name), e))
}

fn set(
    graph: &CompositingGraph,
    node: NodeId,
    key: &str,
    value: PropValue,
) -> Result<(), BroadcastError> {
    graph
        .library()
        .set_property(node, key, value)
        .map_err(|e| BroadcastError::construction(format!("failed to set {}", key), e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::caps::{mixer_audio_caps, tile_caps};
    use crate::config::SinkConfig;
    use crate::library::RunState;
    use crate::memory::{MediaDescription, MemoryLibrary};

    fn config(sink: SinkConfig) -> ValidatedConfig {
        ValidatedConfig {
            sources: [
                "file:///a.webm".to_string(),
                "file:///b.webm".to_string(),
                "file:///c.webm".to_string(),
            ],
            sink,
        }
    }

    fn file_sink() -> SinkConfig {
        SinkConfig::File {
            path: "out.flv".to_string(),
        }
    }

    #[test]
    fn test_build_creates_and_links_backbone() -> anyhow::Result<()> {
        let lib = Arc::new(MemoryLibrary::new());
        let topology = build(lib.clone(), &config(file_sink()))?;

        assert_eq!(lib.node_count(), 11);
        for name in ["source1", "source2", "source3"] {
            let node = lib.find(name).unwrap();
            assert!(lib.in_graph(node));
        }
        assert_eq!(
            lib.property(lib.find("source2").unwrap(), "uri"),
            Some(PropValue::Str("file:///b.webm".to_string()))
        );

        let node = |name: &str| lib.find(name).unwrap();
        assert!(lib.is_linked(node("video_mixer"), node("video_mixer_capsfilter")));
        assert!(lib.is_linked(node("video_mixer_capsfilter"), node("video-enc")));
        assert!(lib.is_linked(node("video-enc"), node("muxer")));
        assert!(lib.is_linked(node("aac_encoder"), node("muxer")));
        assert!(lib.is_linked(node("muxer"), node("buffer")));
        assert!(lib.is_linked(node("buffer"), node("file-sink")));
        assert!(lib.is_linked(node("audio_mixer"), node("aac_encoder")));
        assert_eq!(topology.sink, node("file-sink"));

        assert_eq!(
            lib.property(node("buffer"), "max-size-time"),
            Some(PropValue::UInt(5_000_000_000))
        );
        assert_eq!(
            lib.property(node("video_mixer"), "background"),
            Some(PropValue::Int(1))
        );
        assert_eq!(
            lib.property(node("file-sink"), "location"),
            Some(PropValue::Str("out.flv".to_string()))
        );
        // nothing is wired to the mixers until tracks arrive
        assert!(lib.requested_pads(node("video_mixer")).is_empty());
        Ok(())
    }

    #[test]
    fn test_rtmp_sink_location() -> anyhow::Result<()> {
        let lib = Arc::new(MemoryLibrary::new());
        build(
            lib.clone(),
            &config(SinkConfig::Net {
                url: "rtmp://127.0.0.1/live".to_string(),
            }),
        )?;
        let sink = lib.find("rtmp-sink").unwrap();
        assert_eq!(
            lib.property(sink, "location"),
            Some(PropValue::Str("rtmp://127.0.0.1/live live=true".to_string()))
        );
        assert!(lib.find("file-sink").is_none());
        Ok(())
    }

    #[test]
    fn test_creation_failure_releases_partial_graph() {
        let lib = Arc::new(MemoryLibrary::new());
        lib.fail_create("x264enc");
        let err = build(lib.clone(), &config(file_sink())).err().unwrap();
        assert!(matches!(err, BroadcastError::Construction { .. }));
        assert!(err.to_string().contains("video-enc"));
        assert_eq!(lib.node_count(), 0);
        assert!(lib.created_count("compositor") > 0);
    }

    #[test]
    fn test_link_failure_releases_partial_graph() {
        let lib = Arc::new(MemoryLibrary::new());
        lib.fail_link_into("filesink");
        let err = build(lib.clone(), &config(file_sink())).err().unwrap();
        assert!(err.to_string().contains("could not be linked"));
        assert_eq!(lib.node_count(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_sources_feed_router_once_playing() -> anyhow::Result<()> {
        let lib = Arc::new(MemoryLibrary::new());
        for locator in ["file:///a.webm", "file:///b.webm", "file:///c.webm"] {
            lib.insert_media(
                locator,
                MediaDescription::new(vec![tile_caps(), mixer_audio_caps()]),
            );
        }
        let topology = build(lib.clone(), &config(file_sink()))?;

        let mut bus = lib.subscribe();
        lib.set_state(RunState::Playing)?;
        loop {
            let msg = tokio::time::timeout(std::time::Duration::from_secs(5), bus.recv()).await??;
            if matches!(msg, crate::library::BusMessage::EndOfStream) {
                break;
            }
        }

        let report = topology.router.report();
        assert_eq!(report.linked_video, 3);
        assert_eq!(report.linked_audio, 3);
        topology.router.teardown();
        assert_eq!(lib.node_count(), 0);
        Ok(())
    }
}
