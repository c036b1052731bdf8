//! The live compositing graph and the scoped acquisition used to extend it.

use std::sync::Arc;

use crate::caps::TrackKind;
use crate::error::SpliceError;
use crate::guard;
use crate::library::{NodeId, PadRef, PropValue, RunState, TransformLibrary};

/// Owns every node created for the broadcast, fixed or spliced in.
pub struct CompositingGraph {
    library: Arc<dyn TransformLibrary>,
    nodes: Vec<NodeId>,
}

impl CompositingGraph {
    pub fn new(library: Arc<dyn TransformLibrary>) -> Self {
        Self {
            library,
            nodes: Vec::new(),
        }
    }

    pub fn library(&self) -> &dyn TransformLibrary {
        self.library.as_ref()
    }

    /// Nodes currently owned, in creation order.
    pub fn nodes(&self) -> &[NodeId] {
        &self.nodes
    }

    /// Creates a node and takes ownership of it.
    pub fn make(&mut self, factory: &str, name: Option<&str>) -> anyhow::Result<NodeId> {
        let node = self
            .library
            .create(factory, name)
            .map_err(|e| anyhow::anyhow!("failed to create {}: {:#}", factory, e))?;
        self.nodes.push(node);
        Ok(node)
    }

    pub fn add_many(&self, nodes: &[NodeId]) -> anyhow::Result<()> {
        for node in nodes {
            self.library.add(*node)?;
        }
        Ok(())
    }

    pub fn link_many(&self, nodes: &[NodeId]) -> anyhow::Result<()> {
        crate::library::link_many(self.library.as_ref(), nodes)
    }

    /// Starts a splice. Whatever the scope acquires is released again unless
    /// [`SpliceScope::commit`] is reached.
    pub fn scope(&mut self) -> SpliceScope<'_> {
        SpliceScope {
            graph: self,
            nodes: Vec::new(),
            pads: Vec::new(),
            links: Vec::new(),
            committed: false,
        }
    }

    /// Stops the graph and frees every owned node, last created first.
    pub fn teardown(&mut self) {
        if self.library.state() != RunState::Null {
            if let Err(e) = self.library.set_state(RunState::Null) {
                log::error!("failed to stop graph: {:#}", e);
            }
        }
        while let Some(node) = self.nodes.pop() {
            if let Err(e) = self.library.destroy(node) {
                log::warn!("failed to release {}: {:#}", node, e);
            }
        }
    }
}

/// Resources acquired by one splice attempt.
pub struct SpliceScope<'g> {
    graph: &'g mut CompositingGraph,
    nodes: Vec<(NodeId, &'static str)>,
    pads: Vec<PadRef>,
    links: Vec<(PadRef, PadRef)>,
    committed: bool,
}

impl SpliceScope<'_> {
    fn label(&self, node: NodeId) -> String {
        match self.nodes.iter().find(|(id, _)| *id == node) {
            Some((id, factory)) => format!("{}({})", factory, id),
            None => node.to_string(),
        }
    }

    pub fn make(&mut self, factory: &'static str) -> Result<NodeId, SpliceError> {
        let node = self
            .graph
            .library
            .create(factory, None)
            .map_err(|source| SpliceError::NodeCreation { factory, source })?;
        self.nodes.push((node, factory));
        Ok(node)
    }

    pub fn set_property(
        &self,
        node: NodeId,
        key: &'static str,
        value: PropValue,
    ) -> Result<(), SpliceError> {
        self.graph
            .library
            .set_property(node, key, value)
            .map_err(|source| SpliceError::Property {
                target: self.label(node),
                key,
                source,
            })
    }

    pub fn add(&self, nodes: &[NodeId]) -> Result<(), SpliceError> {
        for node in nodes {
            self.graph
                .library
                .add(*node)
                .map_err(|source| SpliceError::AddToGraph {
                    node: self.label(*node),
                    source,
                })?;
        }
        Ok(())
    }

    /// Brings freshly added nodes to the graph's run state.
    pub fn sync(&self, nodes: &[NodeId]) -> Result<(), SpliceError> {
        guard::sync_with_graph(self.graph.library(), nodes).map_err(|(node, source)| {
            SpliceError::StateSync {
                node: self.label(node),
                source,
            }
        })?;
        Ok(())
    }

    pub fn request_pad(&mut self, mixer: NodeId, kind: TrackKind) -> Result<PadRef, SpliceError> {
        let pad = self
            .graph
            .library
            .request_pad(mixer, "sink_%u")
            .map_err(|source| SpliceError::SlotRequest { kind, source })?;
        self.pads.push(pad.clone());
        Ok(pad)
    }

    pub fn set_pad_property(
        &self,
        pad: &PadRef,
        key: &'static str,
        value: PropValue,
    ) -> Result<(), SpliceError> {
        self.graph
            .library
            .set_pad_property(pad, key, value)
            .map_err(|source| SpliceError::Property {
                target: pad.to_string(),
                key,
                source,
            })
    }

    pub fn link(&mut self, src: &PadRef, sink: &PadRef) -> Result<(), SpliceError> {
        self.graph
            .library
            .link(src, sink)
            .map_err(|source| SpliceError::Link {
                from: format!("{}:{}", self.label(src.node), src.name),
                to: format!("{}:{}", self.label(sink.node), sink.name),
                source,
            })?;
        self.links.push((src.clone(), sink.clone()));
        Ok(())
    }

    /// Links `from` into the first node of `chain`, then the chain in order,
    /// then its last node into `to`.
    pub fn link_chain(
        &mut self,
        from: &PadRef,
        chain: &[NodeId],
        to: &PadRef,
    ) -> Result<(), SpliceError> {
        let mut upstream = from.clone();
        for node in chain {
            self.link(&upstream, &PadRef::sink(*node))?;
            upstream = PadRef::src(*node);
        }
        self.link(&upstream, to)
    }

    /// Hands every acquired node over to the graph.
    pub fn commit(mut self) {
        self.committed = true;
        let nodes: Vec<NodeId> = self.nodes.drain(..).map(|(id, _)| id).collect();
        self.graph.nodes.extend(nodes);
    }

    fn rollback(&mut self) {
        let library = self.graph.library();
        for (src, sink) in self.links.drain(..).rev() {
            if let Err(e) = library.unlink(&src, &sink) {
                log::warn!("rollback: unlink {} -> {}: {:#}", src, sink, e);
            }
        }
        for pad in self.pads.drain(..).rev() {
            if let Err(e) = library.release_pad(&pad) {
                log::warn!("rollback: release {}: {:#}", pad, e);
            }
        }
        for (node, factory) in self.nodes.drain(..).rev() {
            if let Err(e) = library.destroy(node) {
                log::warn!("rollback: destroy {}({}): {:#}", factory, node, e);
            }
        }
    }
}

impl Drop for SpliceScope<'_> {
    fn drop(&mut self) {
        if !self.committed {
            self.rollback();
        }
    }
}

#[cfg(test)]
#[path = "graph_test.rs"]
mod graph_test;
