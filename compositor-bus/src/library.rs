//! Boundary to the media transform library.
//!
//! The core never processes media itself. It creates named transforms, sets
//! their properties, links them and drives run states through
//! [`TransformLibrary`]; everything else (decoding, mixing, encoding, muxing,
//! sink IO) happens behind it.

use std::fmt::{Display, Formatter};
use std::sync::Arc;

use crate::caps::Caps;

pub type BusSender = tokio::sync::broadcast::Sender<BusMessage>;
pub type BusReceiver = tokio::sync::broadcast::Receiver<BusMessage>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub u64);

impl Display for NodeId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "node#{}", self.0)
    }
}

/// One pad of one node, e.g. `(scaler, "sink")` or `(video_mixer, "sink_2")`.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct PadRef {
    pub node: NodeId,
    pub name: String,
}

impl PadRef {
    pub fn new(node: NodeId, name: &str) -> Self {
        Self {
            node,
            name: name.to_string(),
        }
    }

    pub fn src(node: NodeId) -> Self {
        Self::new(node, "src")
    }

    pub fn sink(node: NodeId) -> Self {
        Self::new(node, "sink")
    }
}

impl Display for PadRef {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.node, self.name)
    }
}

/// Run state of the graph and of each node in it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum RunState {
    Null,
    Ready,
    Paused,
    Playing,
}

impl RunState {
    pub fn name(&self) -> &'static str {
        match self {
            RunState::Null => "NULL",
            RunState::Ready => "READY",
            RunState::Paused => "PAUSED",
            RunState::Playing => "PLAYING",
        }
    }
}

impl Display for RunState {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum PropValue {
    Bool(bool),
    Int(i64),
    UInt(u64),
    Str(String),
    Caps(Caps),
}

impl Display for PropValue {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            PropValue::Bool(v) => write!(f, "{}", v),
            PropValue::Int(v) => write!(f, "{}", v),
            PropValue::UInt(v) => write!(f, "{}", v),
            PropValue::Str(v) => write!(f, "{}", v),
            PropValue::Caps(v) => write!(f, "{}", v),
        }
    }
}

impl From<bool> for PropValue {
    fn from(v: bool) -> Self {
        PropValue::Bool(v)
    }
}

impl From<i64> for PropValue {
    fn from(v: i64) -> Self {
        PropValue::Int(v)
    }
}

impl From<u64> for PropValue {
    fn from(v: u64) -> Self {
        PropValue::UInt(v)
    }
}

impl From<&str> for PropValue {
    fn from(v: &str) -> Self {
        PropValue::Str(v.to_string())
    }
}

impl From<String> for PropValue {
    fn from(v: String) -> Self {
        PropValue::Str(v)
    }
}

impl From<Caps> for PropValue {
    fn from(v: Caps) -> Self {
        PropValue::Caps(v)
    }
}

/// Notifications posted by the running graph.
#[derive(Clone, Debug)]
pub enum BusMessage {
    /// Graph-level run state transition.
    StateChanged { old: RunState, new: RunState },
    EndOfStream,
    Error {
        node: String,
        message: String,
        debug: Option<String>,
    },
}

/// A source node finished negotiating one elementary track and exposed `pad`.
#[derive(Clone, Debug)]
pub struct DiscoveredTrack {
    pub source: NodeId,
    pub pad: PadRef,
    pub caps: Caps,
}

/// Invoked on a library-owned thread, possibly concurrently for different
/// sources.
pub type TrackListener = Arc<dyn Fn(DiscoveredTrack) + Send + Sync>;

pub trait TransformLibrary: Send + Sync {
    /// Creates a node from a factory. The node is not part of the graph yet.
    fn create(&self, factory: &str, name: Option<&str>) -> anyhow::Result<NodeId>;

    fn set_property(&self, node: NodeId, key: &str, value: PropValue) -> anyhow::Result<()>;

    fn property(&self, node: NodeId, key: &str) -> Option<PropValue>;

    /// Registers a created node into the graph.
    fn add(&self, node: NodeId) -> anyhow::Result<()>;

    /// Unlinks, removes from the graph (if added) and frees a node.
    fn destroy(&self, node: NodeId) -> anyhow::Result<()>;

    fn link(&self, src: &PadRef, sink: &PadRef) -> anyhow::Result<()>;

    fn unlink(&self, src: &PadRef, sink: &PadRef) -> anyhow::Result<()>;

    /// Links `src` to `sink` picking compatible pads, requesting a sink pad
    /// when `sink` only offers request pads (muxers).
    fn link_nodes(&self, src: NodeId, sink: NodeId) -> anyhow::Result<()>;

    fn request_pad(&self, node: NodeId, template: &str) -> anyhow::Result<PadRef>;

    fn release_pad(&self, pad: &PadRef) -> anyhow::Result<()>;

    fn set_pad_property(&self, pad: &PadRef, key: &str, value: PropValue) -> anyhow::Result<()>;

    fn pad_property(&self, pad: &PadRef, key: &str) -> Option<PropValue>;

    /// Brings a node to the graph's current run state and returns that state.
    fn sync_state_with_parent(&self, node: NodeId) -> anyhow::Result<RunState>;

    fn set_state(&self, state: RunState) -> anyhow::Result<()>;

    fn state(&self) -> RunState;

    fn connect_track_discovered(
        &self,
        source: NodeId,
        listener: TrackListener,
    ) -> anyhow::Result<()>;

    fn subscribe(&self) -> BusReceiver;

    /// Graphviz rendering of the graph, when the library can produce one.
    fn dump_dot(&self) -> Option<String> {
        None
    }
}

/// Links every consecutive pair of `nodes`.
pub fn link_many(library: &dyn TransformLibrary, nodes: &[NodeId]) -> anyhow::Result<()> {
    for pair in nodes.windows(2) {
        library.link_nodes(pair[0], pair[1])?;
    }
    Ok(())
}
