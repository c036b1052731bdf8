//! In-process transform library.
//!
//! Models nodes, pads, links, properties and run states without touching any
//! media. Source nodes (`uridecodebin`) play a catalog of [`MediaDescription`]s:
//! once the graph reaches PLAYING each source discovers its tracks on its own
//! thread and notifies the connected listeners, then end-of-stream is posted
//! when every finite source is done. Faults can be injected per factory to
//! exercise every failure path of the core.

use std::{
    collections::{BTreeMap, HashMap, HashSet},
    fmt::Write as _,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use serde::{Deserialize, Serialize};

use crate::caps::Caps;
use crate::library::{
    BusMessage, BusReceiver, BusSender, DiscoveredTrack, NodeId, PadRef, PropValue, RunState,
    TrackListener, TransformLibrary,
};

/// What a source locator resolves to once opened.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct MediaDescription {
    /// Elementary tracks, in the order the decoder resolves them.
    pub tracks: Vec<Caps>,
    /// Simulated container/codec negotiation latency before the first track.
    #[serde(default)]
    pub discovery_delay_ms: u64,
    /// Live sources never reach end-of-stream.
    #[serde(default)]
    pub live: bool,
}

impl MediaDescription {
    pub fn new(tracks: Vec<Caps>) -> Self {
        Self {
            tracks,
            ..Default::default()
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.discovery_delay_ms = delay.as_millis() as u64;
        self
    }

    pub fn live(mut self) -> Self {
        self.live = true;
        self
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum PadDirection {
    Src,
    Sink,
}

#[derive(Clone, Copy)]
struct FactoryTemplate {
    sink: bool,
    src: bool,
    request_sink: Option<&'static str>,
    dynamic_src: bool,
}

impl FactoryTemplate {
    const fn filter() -> Self {
        Self {
            sink: true,
            src: true,
            request_sink: None,
            dynamic_src: false,
        }
    }

    fn lookup(factory: &str) -> Option<Self> {
        match factory {
            "uridecodebin" => Some(Self {
                sink: false,
                src: false,
                request_sink: None,
                dynamic_src: true,
            }),
            "compositor" | "audiomixer" | "flvmux" => Some(Self {
                sink: false,
                src: true,
                request_sink: Some("sink_%u"),
                dynamic_src: false,
            }),
            "capsfilter" | "videoscale" | "videoconvert" | "audioresample" | "audioconvert"
            | "x264enc" | "avenc_aac" | "queue" => Some(Self::filter()),
            "filesink" | "rtmpsink" | "fakesink" => Some(Self {
                sink: true,
                src: false,
                request_sink: None,
                dynamic_src: false,
            }),
            _ => None,
        }
    }
}

struct Pad {
    name: String,
    direction: PadDirection,
    requested: bool,
    props: BTreeMap<String, PropValue>,
}

impl Pad {
    fn new(name: &str, direction: PadDirection) -> Self {
        Self {
            name: name.to_string(),
            direction,
            requested: false,
            props: BTreeMap::new(),
        }
    }
}

struct Node {
    factory: String,
    name: String,
    template: FactoryTemplate,
    props: BTreeMap<String, PropValue>,
    in_graph: bool,
    state: RunState,
    pads: Vec<Pad>,
    next_request: u32,
    next_dynamic: u32,
}

impl Node {
    fn pad(&self, name: &str) -> Option<&Pad> {
        self.pads.iter().find(|p| p.name == name)
    }

    fn pad_mut(&mut self, name: &str) -> Option<&mut Pad> {
        self.pads.iter_mut().find(|p| p.name == name)
    }
}

#[derive(Default)]
struct Faults {
    create: HashSet<String>,
    link_into: HashSet<String>,
    state_sync: HashSet<String>,
    request_pad: HashSet<String>,
    start: bool,
}

struct Inner {
    next_id: u64,
    nodes: HashMap<NodeId, Node>,
    links: Vec<(PadRef, PadRef)>,
    state: RunState,
    generation: u64,
    listeners: HashMap<NodeId, Vec<TrackListener>>,
    catalog: HashMap<String, MediaDescription>,
    history: Vec<String>,
    faults: Faults,
}

impl Inner {
    fn node(&self, id: NodeId) -> anyhow::Result<&Node> {
        self.nodes
            .get(&id)
            .ok_or(anyhow::anyhow!("{} does not exist", id))
    }

    fn node_mut(&mut self, id: NodeId) -> anyhow::Result<&mut Node> {
        self.nodes
            .get_mut(&id)
            .ok_or(anyhow::anyhow!("{} does not exist", id))
    }

    fn is_pad_linked(&self, pad: &PadRef) -> bool {
        self.links.iter().any(|(s, d)| s == pad || d == pad)
    }

    fn check_link(&self, src: &PadRef, sink: &PadRef) -> anyhow::Result<()> {
        let src_node = self.node(src.node)?;
        let sink_node = self.node(sink.node)?;
        if !src_node.in_graph || !sink_node.in_graph {
            return Err(anyhow::anyhow!(
                "cannot link {} -> {}: both nodes must be in the graph",
                src_node.name,
                sink_node.name
            ));
        }
        match src_node.pad(&src.name) {
            Some(p) if p.direction == PadDirection::Src => {}
            _ => return Err(anyhow::anyhow!("{} has no src pad {}", src_node.name, src.name)),
        }
        match sink_node.pad(&sink.name) {
            Some(p) if p.direction == PadDirection::Sink => {}
            _ => {
                return Err(anyhow::anyhow!(
                    "{} has no sink pad {}",
                    sink_node.name,
                    sink.name
                ));
            }
        }
        if self.is_pad_linked(src) || self.is_pad_linked(sink) {
            return Err(anyhow::anyhow!("pad already linked: {} -> {}", src, sink));
        }
        if self.faults.link_into.contains(&sink_node.factory) {
            return Err(anyhow::anyhow!(
                "link refused: {}:{} -> {}:{}",
                src_node.name,
                src.name,
                sink_node.name,
                sink.name
            ));
        }
        Ok(())
    }

    fn add_request_pad(&mut self, node: NodeId, template: &str) -> anyhow::Result<PadRef> {
        let refuse = {
            let n = self.node(node)?;
            if n.template.request_sink != Some(template) {
                return Err(anyhow::anyhow!(
                    "{} has no request pad template {}",
                    n.name,
                    template
                ));
            }
            self.faults.request_pad.contains(&n.factory)
        };
        let n = self.node_mut(node)?;
        if refuse {
            return Err(anyhow::anyhow!("{} refused pad request", n.name));
        }
        let name = template.replace("%u", &n.next_request.to_string());
        n.next_request += 1;
        let mut pad = Pad::new(&name, PadDirection::Sink);
        pad.requested = true;
        n.pads.push(pad);
        Ok(PadRef::new(node, &name))
    }

    fn remove_pad(&mut self, pad: &PadRef) -> anyhow::Result<()> {
        self.links.retain(|(s, d)| s != pad && d != pad);
        let n = self.node_mut(pad.node)?;
        match n.pad(&pad.name) {
            Some(p) if p.requested => {
                n.pads.retain(|p| p.name != pad.name);
                Ok(())
            }
            Some(_) => Err(anyhow::anyhow!("{} is not a request pad", pad)),
            None => Err(anyhow::anyhow!("{} does not exist", pad)),
        }
    }
}

pub struct MemoryLibrary {
    inner: Arc<Mutex<Inner>>,
    bus: BusSender,
}

impl MemoryLibrary {
    pub fn new() -> Self {
        Self::with_bus_capacity(256)
    }

    /// Messages a subscriber may fall behind by before it lags.
    pub fn with_bus_capacity(capacity: usize) -> Self {
        let (bus, _) = tokio::sync::broadcast::channel(capacity);
        Self {
            inner: Arc::new(Mutex::new(Inner {
                next_id: 0,
                nodes: HashMap::new(),
                links: Vec::new(),
                state: RunState::Null,
                generation: 0,
                listeners: HashMap::new(),
                catalog: HashMap::new(),
                history: Vec::new(),
                faults: Faults::default(),
            })),
            bus,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        lock_inner(&self.inner)
    }

    /// Registers what `locator` resolves to when a source opens it.
    pub fn insert_media(&self, locator: &str, media: MediaDescription) {
        self.lock().catalog.insert(locator.to_string(), media);
    }

    pub fn with_media(self, locator: &str, media: MediaDescription) -> Self {
        self.insert_media(locator, media);
        self
    }

    pub fn fail_create(&self, factory: &str) {
        self.lock().faults.create.insert(factory.to_string());
    }

    /// Every link whose downstream node was made by `factory` is refused.
    pub fn fail_link_into(&self, factory: &str) {
        self.lock().faults.link_into.insert(factory.to_string());
    }

    pub fn fail_state_sync(&self, factory: &str) {
        self.lock().faults.state_sync.insert(factory.to_string());
    }

    pub fn fail_request_pad(&self, factory: &str) {
        self.lock().faults.request_pad.insert(factory.to_string());
    }

    pub fn fail_start(&self) {
        self.lock().faults.start = true;
    }

    pub fn clear_faults(&self) {
        self.lock().faults = Faults::default();
    }

    /// Posts a message as if the running graph had raised it.
    pub fn post(&self, message: BusMessage) {
        let _ = self.bus.send(message);
    }

    pub fn node_count(&self) -> usize {
        self.lock().nodes.len()
    }

    pub fn nodes_by_factory(&self, factory: &str) -> Vec<NodeId> {
        let inner = self.lock();
        let mut ids: Vec<NodeId> = inner
            .nodes
            .iter()
            .filter(|(_, n)| n.factory == factory)
            .map(|(id, _)| *id)
            .collect();
        ids.sort();
        ids
    }

    pub fn find(&self, name: &str) -> Option<NodeId> {
        self.lock()
            .nodes
            .iter()
            .find(|(_, n)| n.name == name)
            .map(|(id, _)| *id)
    }

    pub fn node_state(&self, node: NodeId) -> Option<RunState> {
        self.lock().nodes.get(&node).map(|n| n.state)
    }

    pub fn in_graph(&self, node: NodeId) -> bool {
        self.lock().nodes.get(&node).is_some_and(|n| n.in_graph)
    }

    /// How many nodes were ever created from `factory`, destroyed ones included.
    pub fn created_count(&self, factory: &str) -> usize {
        self.lock().history.iter().filter(|f| *f == factory).count()
    }

    pub fn links(&self) -> Vec<(PadRef, PadRef)> {
        self.lock().links.clone()
    }

    pub fn is_linked(&self, src: NodeId, sink: NodeId) -> bool {
        self.lock()
            .links
            .iter()
            .any(|(s, d)| s.node == src && d.node == sink)
    }

    /// Pad on the other end of `pad`'s link.
    pub fn peer(&self, pad: &PadRef) -> Option<PadRef> {
        self.lock().links.iter().find_map(|(s, d)| {
            if s == pad {
                Some(d.clone())
            } else if d == pad {
                Some(s.clone())
            } else {
                None
            }
        })
    }

    pub fn requested_pads(&self, node: NodeId) -> Vec<PadRef> {
        self.lock()
            .nodes
            .get(&node)
            .map(|n| {
                n.pads
                    .iter()
                    .filter(|p| p.requested)
                    .map(|p| PadRef::new(node, &p.name))
                    .collect()
            })
            .unwrap_or_default()
    }

    fn start_sources(&self, generation: u64) {
        let plans: Vec<(NodeId, String, Option<MediaDescription>, Option<String>)> = {
            let inner = self.lock();
            let mut plans: Vec<_> = inner
                .nodes
                .iter()
                .filter(|(_, n)| n.in_graph && n.template.dynamic_src)
                .map(|(id, n)| {
                    let uri = match n.props.get("uri") {
                        Some(PropValue::Str(uri)) => Some(uri.clone()),
                        _ => None,
                    };
                    let media = uri.as_ref().and_then(|u| inner.catalog.get(u).cloned());
                    (*id, n.name.clone(), media, uri)
                })
                .collect();
            plans.sort_by_key(|(id, ..)| *id);
            plans
        };

        let mut handles = Vec::new();
        let mut failed = false;
        let mut live = false;
        for (node, name, media, uri) in plans {
            let Some(media) = media else {
                failed = true;
                let _ = self.bus.send(BusMessage::Error {
                    node: name,
                    message: "Resource not found.".to_string(),
                    debug: uri,
                });
                continue;
            };
            live |= media.live;
            let inner = Arc::clone(&self.inner);
            let spawned = std::thread::Builder::new()
                .name(format!("{}-discover", name))
                .spawn(move || discover_tracks(inner, node, media, generation));
            match spawned {
                Ok(handle) => handles.push(handle),
                Err(e) => {
                    failed = true;
                    let _ = self.bus.send(BusMessage::Error {
                        node: name,
                        message: format!("failed to start source thread: {}", e),
                        debug: None,
                    });
                }
            }
        }

        let inner = Arc::clone(&self.inner);
        let bus = self.bus.clone();
        let _ = std::thread::Builder::new()
            .name("memory-eos".to_string())
            .spawn(move || {
                for handle in handles {
                    let _ = handle.join();
                }
                let current = {
                    let inner = lock_inner(&inner);
                    inner.generation == generation && inner.state == RunState::Playing
                };
                if current && !failed && !live {
                    let _ = bus.send(BusMessage::EndOfStream);
                }
            });
    }
}

impl Default for MemoryLibrary {
    fn default() -> Self {
        Self::new()
    }
}

fn lock_inner(inner: &Mutex<Inner>) -> MutexGuard<'_, Inner> {
    inner.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Body of a source's discovery thread. Listeners are called without the
/// library lock held, since they mutate the graph.
fn discover_tracks(
    inner: Arc<Mutex<Inner>>,
    node: NodeId,
    media: MediaDescription,
    generation: u64,
) {
    if media.discovery_delay_ms > 0 {
        std::thread::sleep(Duration::from_millis(media.discovery_delay_ms));
    }
    for caps in media.tracks {
        let (pad, listeners) = {
            let mut guard = lock_inner(&inner);
            if guard.generation != generation || guard.state != RunState::Playing {
                return;
            }
            let listeners = guard.listeners.get(&node).cloned().unwrap_or_default();
            let Some(n) = guard.nodes.get_mut(&node) else {
                return;
            };
            let name = format!("src_{}", n.next_dynamic);
            n.next_dynamic += 1;
            n.pads.push(Pad::new(&name, PadDirection::Src));
            (PadRef::new(node, &name), listeners)
        };
        log::debug!("{} exposed {} ({})", node, pad, caps);
        for listener in listeners {
            listener(DiscoveredTrack {
                source: node,
                pad: pad.clone(),
                caps: caps.clone(),
            });
        }
    }
}

impl TransformLibrary for MemoryLibrary {
    fn create(&self, factory: &str, name: Option<&str>) -> anyhow::Result<NodeId> {
        let mut inner = self.lock();
        if inner.faults.create.contains(factory) {
            return Err(anyhow::anyhow!("factory {} failed to create a node", factory));
        }
        let template = FactoryTemplate::lookup(factory)
            .ok_or(anyhow::anyhow!("no such factory: {}", factory))?;
        let id = NodeId(inner.next_id);
        inner.next_id += 1;
        let name = match name {
            Some(n) => n.to_string(),
            None => format!("{}{}", factory, id.0),
        };
        let mut pads = Vec::new();
        if template.sink {
            pads.push(Pad::new("sink", PadDirection::Sink));
        }
        if template.src {
            pads.push(Pad::new("src", PadDirection::Src));
        }
        inner.nodes.insert(
            id,
            Node {
                factory: factory.to_string(),
                name,
                template,
                props: BTreeMap::new(),
                in_graph: false,
                state: RunState::Null,
                pads,
                next_request: 0,
                next_dynamic: 0,
            },
        );
        inner.history.push(factory.to_string());
        Ok(id)
    }

    fn set_property(&self, node: NodeId, key: &str, value: PropValue) -> anyhow::Result<()> {
        let mut inner = self.lock();
        inner.node_mut(node)?.props.insert(key.to_string(), value);
        Ok(())
    }

    fn property(&self, node: NodeId, key: &str) -> Option<PropValue> {
        self.lock()
            .nodes
            .get(&node)
            .and_then(|n| n.props.get(key).cloned())
    }

    fn add(&self, node: NodeId) -> anyhow::Result<()> {
        let mut inner = self.lock();
        let name = inner.node(node)?.name.clone();
        let duplicate = inner
            .nodes
            .iter()
            .any(|(id, n)| *id != node && n.in_graph && n.name == name);
        if duplicate {
            return Err(anyhow::anyhow!("name {} is already used in the graph", name));
        }
        let n = inner.node_mut(node)?;
        if n.in_graph {
            return Err(anyhow::anyhow!("{} is already in the graph", name));
        }
        n.in_graph = true;
        Ok(())
    }

    fn destroy(&self, node: NodeId) -> anyhow::Result<()> {
        let mut inner = self.lock();
        if inner.nodes.remove(&node).is_none() {
            return Err(anyhow::anyhow!("{} does not exist", node));
        }
        inner.links.retain(|(s, d)| s.node != node && d.node != node);
        inner.listeners.remove(&node);
        Ok(())
    }

    fn link(&self, src: &PadRef, sink: &PadRef) -> anyhow::Result<()> {
        let mut inner = self.lock();
        inner.check_link(src, sink)?;
        inner.links.push((src.clone(), sink.clone()));
        Ok(())
    }

    fn unlink(&self, src: &PadRef, sink: &PadRef) -> anyhow::Result<()> {
        let mut inner = self.lock();
        let before = inner.links.len();
        inner.links.retain(|(s, d)| !(s == src && d == sink));
        if inner.links.len() == before {
            return Err(anyhow::anyhow!("{} is not linked to {}", src, sink));
        }
        Ok(())
    }

    fn link_nodes(&self, src: NodeId, sink: NodeId) -> anyhow::Result<()> {
        let mut inner = self.lock();
        let src_pad = {
            let n = inner.node(src)?;
            n.pads
                .iter()
                .find(|p| {
                    p.direction == PadDirection::Src
                        && !inner.is_pad_linked(&PadRef::new(src, &p.name))
                })
                .map(|p| PadRef::new(src, &p.name))
                .ok_or(anyhow::anyhow!("{} has no free src pad", n.name))?
        };
        let (sink_template, sink_static) = {
            let n = inner.node(sink)?;
            (n.template.request_sink, n.template.sink)
        };
        if sink_static {
            let sink_pad = PadRef::sink(sink);
            inner.check_link(&src_pad, &sink_pad)?;
            inner.links.push((src_pad, sink_pad));
            return Ok(());
        }
        let template =
            sink_template.ok_or(anyhow::anyhow!("{} cannot accept links", sink))?;
        let sink_pad = inner.add_request_pad(sink, template)?;
        if let Err(e) = inner.check_link(&src_pad, &sink_pad) {
            let _ = inner.remove_pad(&sink_pad);
            return Err(e);
        }
        inner.links.push((src_pad, sink_pad));
        Ok(())
    }

    fn request_pad(&self, node: NodeId, template: &str) -> anyhow::Result<PadRef> {
        self.lock().add_request_pad(node, template)
    }

    fn release_pad(&self, pad: &PadRef) -> anyhow::Result<()> {
        self.lock().remove_pad(pad)
    }

    fn set_pad_property(&self, pad: &PadRef, key: &str, value: PropValue) -> anyhow::Result<()> {
        let mut inner = self.lock();
        let n = inner.node_mut(pad.node)?;
        let p = n
            .pad_mut(&pad.name)
            .ok_or(anyhow::anyhow!("{} does not exist", pad))?;
        p.props.insert(key.to_string(), value);
        Ok(())
    }

    fn pad_property(&self, pad: &PadRef, key: &str) -> Option<PropValue> {
        self.lock()
            .nodes
            .get(&pad.node)
            .and_then(|n| n.pad(&pad.name))
            .and_then(|p| p.props.get(key).cloned())
    }

    fn sync_state_with_parent(&self, node: NodeId) -> anyhow::Result<RunState> {
        let mut inner = self.lock();
        let target = inner.state;
        let refuse = inner.faults.state_sync.contains(&inner.node(node)?.factory);
        let n = inner.node_mut(node)?;
        if !n.in_graph {
            return Err(anyhow::anyhow!("{} has no parent", n.name));
        }
        if refuse {
            return Err(anyhow::anyhow!("{} failed to change state to {}", n.name, target));
        }
        n.state = target;
        Ok(target)
    }

    fn set_state(&self, state: RunState) -> anyhow::Result<()> {
        let (old, generation) = {
            let mut inner = self.lock();
            if state == RunState::Playing && inner.faults.start {
                return Err(anyhow::anyhow!("state change to {} failed", state));
            }
            let old = inner.state;
            inner.state = state;
            if state != old {
                inner.generation += 1;
            }
            for n in inner.nodes.values_mut().filter(|n| n.in_graph) {
                n.state = state;
            }
            (old, inner.generation)
        };
        if old == state {
            return Ok(());
        }

        // one message per step, like a real state machine walking the ladder
        let steps = [
            RunState::Null,
            RunState::Ready,
            RunState::Paused,
            RunState::Playing,
        ];
        let (from, to) = (old as usize, state as usize);
        if from < to {
            for pair in steps[from..=to].windows(2) {
                self.post(BusMessage::StateChanged {
                    old: pair[0],
                    new: pair[1],
                });
            }
        } else {
            for pair in steps[to..=from].windows(2).rev() {
                self.post(BusMessage::StateChanged {
                    old: pair[1],
                    new: pair[0],
                });
            }
        }

        if state == RunState::Playing {
            self.start_sources(generation);
        }
        Ok(())
    }

    fn state(&self) -> RunState {
        self.lock().state
    }

    fn connect_track_discovered(
        &self,
        source: NodeId,
        listener: TrackListener,
    ) -> anyhow::Result<()> {
        let mut inner = self.lock();
        let n = inner.node(source)?;
        if !n.template.dynamic_src {
            return Err(anyhow::anyhow!("{} never exposes tracks", n.name));
        }
        inner.listeners.entry(source).or_default().push(listener);
        Ok(())
    }

    fn subscribe(&self) -> BusReceiver {
        self.bus.subscribe()
    }

    fn dump_dot(&self) -> Option<String> {
        let inner = self.lock();
        let mut ids: Vec<&NodeId> = inner.nodes.keys().collect();
        ids.sort();
        let mut dot = String::from("digraph pipeline {\n  rankdir=LR;\n");
        for id in ids {
            let n = &inner.nodes[id];
            if !n.in_graph {
                continue;
            }
            let _ = writeln!(
                dot,
                "  n{} [label=\"{}\\n{}\\n{}\"];",
                id.0, n.name, n.factory, n.state
            );
        }
        for (s, d) in inner.links.iter() {
            let _ = writeln!(
                dot,
                "  n{} -> n{} [taillabel=\"{}\", headlabel=\"{}\"];",
                s.node.0, d.node.0, s.name, d.name
            );
        }
        dot.push_str("}\n");
        Some(dot)
    }
}

#[cfg(test)]
#[path = "memory_test.rs"]
mod memory_test;
