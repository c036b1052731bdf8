use std::fmt::{Display, Formatter};

use crate::caps::{Caps, TrackKind};
use crate::library::{NodeId, PadRef};

/// 1-based index of a configured source, shown as `source1`, `source2`, ...
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SourceId(pub usize);

impl Display for SourceId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "source{}", self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DiscoveryState {
    NotResolved,
    VideoLinked,
    AudioLinked,
    BothLinked,
}

impl DiscoveryState {
    pub fn has(&self, kind: TrackKind) -> bool {
        matches!(
            (self, kind),
            (DiscoveryState::BothLinked, _)
                | (DiscoveryState::VideoLinked, TrackKind::Video)
                | (DiscoveryState::AudioLinked, TrackKind::Audio)
        )
    }

    pub fn with(self, kind: TrackKind) -> Self {
        match (self, kind) {
            (DiscoveryState::NotResolved, TrackKind::Video) => DiscoveryState::VideoLinked,
            (DiscoveryState::NotResolved, TrackKind::Audio) => DiscoveryState::AudioLinked,
            (DiscoveryState::VideoLinked, TrackKind::Audio)
            | (DiscoveryState::AudioLinked, TrackKind::Video) => DiscoveryState::BothLinked,
            (state, _) => state,
        }
    }
}

/// One configured input endpoint and the decoder node reading it.
#[derive(Clone, Debug)]
pub struct Source {
    pub id: SourceId,
    pub locator: String,
    pub node: NodeId,
    pub state: DiscoveryState,
}

impl Source {
    pub fn new(id: SourceId, locator: &str, node: NodeId) -> Self {
        Self {
            id,
            locator: locator.to_string(),
            node,
            state: DiscoveryState::NotResolved,
        }
    }
}

/// A fully resolved elementary track. Moved into the router, so it is
/// consumed exactly once.
#[derive(Debug)]
pub struct TrackEvent {
    pub source: SourceId,
    pub kind: TrackKind,
    pub format: Caps,
    pub pad: PadRef,
}

impl TrackEvent {
    pub fn new(source: SourceId, format: Caps, pad: PadRef) -> Self {
        Self {
            source,
            kind: format.kind(),
            format,
            pad,
        }
    }
}
