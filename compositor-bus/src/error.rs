//! Failure taxonomy.
//!
//! [`BroadcastError`] is what the lifecycle calls fail with. [`SpliceError`]
//! never leaves the track router: a failed splice drops that one track and
//! the running graph carries on.

use crate::caps::TrackKind;
use crate::library::RunState;

#[derive(Debug, thiserror::Error)]
pub enum BroadcastError {
    /// A required setting was absent before initialization.
    #[error("configuration incomplete: {missing} is required")]
    Configuration { missing: &'static str },

    /// A fixed node could not be created or linked.
    #[error("failed to build the static topology: {reason}")]
    Construction {
        reason: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("broadcaster is not initialized")]
    NotInitialized,

    #[error("operation not allowed while {state}")]
    InvalidState { state: &'static str },

    #[error("unable to set the graph to {target}: {source}")]
    StateChange {
        target: RunState,
        #[source]
        source: anyhow::Error,
    },

    /// A fatal error reported by the running graph.
    #[error("error received from {node}: {message}")]
    RuntimeFault {
        node: String,
        message: String,
        debug: Option<String>,
    },

    #[error("message bus closed before the stream ended")]
    BusClosed,

    /// The bus overflowed and dropped messages, possibly an error or the
    /// end-of-stream.
    #[error("message bus lagged, {skipped} messages lost")]
    BusLagged { skipped: u64 },
}

impl BroadcastError {
    pub fn construction(reason: impl Into<String>, source: anyhow::Error) -> Self {
        Self::Construction {
            reason: reason.into(),
            source,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SpliceError {
    #[error("failed to create {factory}: {source}")]
    NodeCreation {
        factory: &'static str,
        #[source]
        source: anyhow::Error,
    },

    #[error("failed to add {node} to the graph: {source}")]
    AddToGraph {
        node: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("failed to sync state of {node} with the graph: {source}")]
    StateSync {
        node: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("failed to get {kind} mixer sink pad: {source}")]
    SlotRequest {
        kind: TrackKind,
        #[source]
        source: anyhow::Error,
    },

    #[error("failed to set {key} on {target}: {source}")]
    Property {
        target: String,
        key: &'static str,
        #[source]
        source: anyhow::Error,
    },

    #[error("failed to link {from} and {to}: {source}")]
    Link {
        from: String,
        to: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("{source_id} exposed a track for an unknown source node")]
    UnknownSource { source_id: String },
}
