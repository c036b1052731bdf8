//! Graph mutation guard.
//!
//! Track discovery is reported on library threads, one per source, and those
//! can fire at the same time. Mixer pad requests and graph additions must not
//! interleave, so every splice runs as one critical section over the whole
//! router state: counter check, node creation, state sync, linking, counter
//! increment.

use std::sync::{Mutex, PoisonError};

use crate::library::{NodeId, RunState, TransformLibrary};

pub struct MutationGuard<T> {
    inner: Mutex<T>,
}

impl<T> MutationGuard<T> {
    pub fn new(value: T) -> Self {
        Self {
            inner: Mutex::new(value),
        }
    }

    /// Runs `f` with exclusive access. Poisoning is ignored: counters are
    /// only bumped once a splice has fully succeeded.
    pub fn with<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        let mut guard = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut guard)
    }
}

/// Brings each node to the run state of the graph before data can reach it.
/// Stops at the first node that fails.
pub fn sync_with_graph(
    library: &dyn TransformLibrary,
    nodes: &[NodeId],
) -> Result<RunState, (NodeId, anyhow::Error)> {
    let target = library.state();
    for node in nodes {
        let reached = library.sync_state_with_parent(*node).map_err(|e| (*node, e))?;
        if reached != target {
            return Err((
                *node,
                anyhow::anyhow!("reached {} while the graph is {}", reached, target),
            ));
        }
    }
    Ok(target)
}
