//! Dynamic track router.
//!
//! Every source resolves its tracks on its own schedule, after the graph is
//! already PLAYING. For each resolved track the router decides admission,
//! builds whatever adaptation the track needs and splices it into the
//! matching mixer, all inside one [`MutationGuard`] section.
//!
//! Video tiles are assigned in arrival order, left to right. Which source
//! lands in which tile is a race between sources and not tied to the
//! configured source index.

use std::sync::{Arc, Weak};

use crate::caps::{TILE_HEIGHT, TILE_WIDTH, TrackKind, mixer_audio_caps, tile_caps};
use crate::error::SpliceError;
use crate::graph::{CompositingGraph, SpliceScope};
use crate::guard::MutationGuard;
use crate::library::{DiscoveredTrack, NodeId, PadRef, TrackListener};
use crate::source::{DiscoveryState, Source, SourceId, TrackEvent};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AdmissionCounter {
    linked: usize,
    max: usize,
}

impl AdmissionCounter {
    pub fn new(max: usize) -> Self {
        Self { linked: 0, max }
    }

    pub fn linked(&self) -> usize {
        self.linked
    }

    pub fn max(&self) -> usize {
        self.max
    }

    pub fn is_full(&self) -> bool {
        self.linked >= self.max
    }

    fn increment(&mut self) {
        debug_assert!(!self.is_full());
        self.linked += 1;
    }
}

/// Region of the composite a video slot is drawn into.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Placement {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl Placement {
    /// The `index`-th tile, counting accepted video tracks from zero.
    pub fn tile(index: usize) -> Self {
        Self {
            x: index as u32 * TILE_WIDTH,
            y: 0,
            width: TILE_WIDTH,
            height: TILE_HEIGHT,
        }
    }

    fn apply(&self, scope: &SpliceScope<'_>, pad: &PadRef) -> Result<(), SpliceError> {
        scope.set_pad_property(pad, "xpos", i64::from(self.x).into())?;
        scope.set_pad_property(pad, "ypos", i64::from(self.y).into())?;
        scope.set_pad_property(pad, "width", i64::from(self.width).into())?;
        scope.set_pad_property(pad, "height", i64::from(self.height).into())?;
        Ok(())
    }
}

/// A mixer input pad handed to one accepted track.
#[derive(Clone, Debug, PartialEq)]
pub struct MixerSlot {
    pub source: SourceId,
    pub kind: TrackKind,
    pub pad: PadRef,
    /// Video only.
    pub placement: Option<Placement>,
}

/// Conversion nodes between an audio track and its slot, upstream first.
#[derive(Clone, Debug, PartialEq)]
pub struct AdaptationChain {
    pub source: SourceId,
    pub resample: NodeId,
    pub convert: NodeId,
    pub constraint: NodeId,
}

impl AdaptationChain {
    pub fn nodes(&self) -> [NodeId; 3] {
        [self.resample, self.convert, self.constraint]
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RejectReason {
    /// Every slot of this kind is taken.
    QuotaFull,
    /// The source already has a linked track of this kind.
    AlreadyLinked,
}

#[derive(Clone, Debug, PartialEq)]
pub enum Admission {
    Linked(MixerSlot),
    Rejected(RejectReason),
}

/// Snapshot of what the router has done so far.
#[derive(Clone, Debug, Default)]
pub struct RouterReport {
    pub linked_video: usize,
    pub linked_audio: usize,
    pub max_tracks: usize,
    pub slots: Vec<MixerSlot>,
    pub adaptation_chains: Vec<AdaptationChain>,
    pub sources: Vec<(SourceId, DiscoveryState)>,
}

impl RouterReport {
    /// x offsets of the video tiles, in acceptance order.
    pub fn tile_offsets(&self) -> Vec<u32> {
        self.slots
            .iter()
            .filter_map(|s| s.placement.map(|p| p.x))
            .collect()
    }

    pub fn source_state(&self, id: SourceId) -> Option<DiscoveryState> {
        self.sources
            .iter()
            .find(|(s, _)| *s == id)
            .map(|(_, state)| *state)
    }
}

struct RouterState {
    graph: CompositingGraph,
    video_mixer: NodeId,
    audio_mixer: NodeId,
    video: AdmissionCounter,
    audio: AdmissionCounter,
    sources: Vec<Source>,
    slots: Vec<MixerSlot>,
    chains: Vec<AdaptationChain>,
}

impl RouterState {
    fn counter(&self, kind: TrackKind) -> &AdmissionCounter {
        match kind {
            TrackKind::Video => &self.video,
            TrackKind::Audio => &self.audio,
        }
    }

    fn counter_mut(&mut self, kind: TrackKind) -> &mut AdmissionCounter {
        match kind {
            TrackKind::Video => &mut self.video,
            TrackKind::Audio => &mut self.audio,
        }
    }
}

/// Sole owner of the graph once the static topology is built.
pub struct TrackRouter {
    state: MutationGuard<RouterState>,
}

impl TrackRouter {
    /// Both admission bounds equal the number of configured sources.
    pub fn new(
        graph: CompositingGraph,
        sources: Vec<Source>,
        video_mixer: NodeId,
        audio_mixer: NodeId,
    ) -> Self {
        let max = sources.len();
        Self {
            state: MutationGuard::new(RouterState {
                graph,
                video_mixer,
                audio_mixer,
                video: AdmissionCounter::new(max),
                audio: AdmissionCounter::new(max),
                sources,
                slots: Vec::new(),
                chains: Vec::new(),
            }),
        }
    }

    /// Listener to attach to `source`'s decoder. Holds the router weakly so
    /// the graph does not keep it alive.
    pub fn listener_for(self: &Arc<Self>, source: SourceId) -> TrackListener {
        let router: Weak<Self> = Arc::downgrade(self);
        Arc::new(move |track: DiscoveredTrack| {
            if let Some(router) = router.upgrade() {
                router.dispatch(TrackEvent::new(source, track.caps, track.pad));
            }
        })
    }

    /// Handles one event and logs the outcome. Failures stay local to the
    /// track.
    pub fn dispatch(&self, event: TrackEvent) {
        log::info!(
            "received new pad '{}' from '{}': {}",
            event.pad.name,
            event.source,
            event.format
        );
        let (source, kind) = (event.source, event.kind);
        match self.handle(event) {
            Ok(Admission::Linked(slot)) => match slot.placement {
                Some(p) => log::info!(
                    "link succeeded ({} from {}) into {} at x={}",
                    kind,
                    source,
                    slot.pad,
                    p.x
                ),
                None => log::info!("link succeeded ({} from {}) into {}", kind, source, slot.pad),
            },
            Ok(Admission::Rejected(reason)) => {
                log::info!("{} track from {} ignored: {:?}", kind, source, reason)
            }
            Err(e) => log::error!("{} track from {} dropped: {:#}", kind, source, e),
        }
    }

    /// Admits and splices one track. Rejections are not errors; on error the
    /// graph is left exactly as it was before the call.
    pub fn handle(&self, event: TrackEvent) -> Result<Admission, SpliceError> {
        self.state.with(|state| {
            let index = state
                .sources
                .iter()
                .position(|s| s.id == event.source)
                .ok_or(SpliceError::UnknownSource {
                    source_id: event.source.to_string(),
                })?;
            if state.counter(event.kind).is_full() {
                return Ok(Admission::Rejected(RejectReason::QuotaFull));
            }
            if state.sources[index].state.has(event.kind) {
                return Ok(Admission::Rejected(RejectReason::AlreadyLinked));
            }

            let (slot, chain) = match event.kind {
                TrackKind::Video => (splice_video(state, &event)?, None),
                TrackKind::Audio => splice_audio(state, &event)?,
            };

            state.counter_mut(event.kind).increment();
            let source = &mut state.sources[index];
            source.state = source.state.with(event.kind);
            state.slots.push(slot.clone());
            if let Some(chain) = chain {
                state.chains.push(chain);
            }
            Ok(Admission::Linked(slot))
        })
    }

    pub fn report(&self) -> RouterReport {
        self.state.with(|state| RouterReport {
            linked_video: state.video.linked(),
            linked_audio: state.audio.linked(),
            max_tracks: state.video.max(),
            slots: state.slots.clone(),
            adaptation_chains: state.chains.clone(),
            sources: state.sources.iter().map(|s| (s.id, s.state)).collect(),
        })
    }

    /// Stops the graph and frees every node. Splices arriving afterwards
    /// fail to find their mixers and are dropped.
    pub fn teardown(&self) {
        self.state.with(|state| state.graph.teardown());
    }
}

/// track -> videoscale (letterbox) -> capsfilter (tile size) -> mixer slot
fn splice_video(state: &mut RouterState, event: &TrackEvent) -> Result<MixerSlot, SpliceError> {
    let placement = Placement::tile(state.video.linked());
    let mixer = state.video_mixer;
    let mut scope = state.graph.scope();

    let scaler = scope.make("videoscale")?;
    let constraint = scope.make("capsfilter")?;
    // pad rather than crop
    scope.set_property(scaler, "add-borders", true.into())?;
    scope.set_property(constraint, "caps", tile_caps().into())?;
    scope.add(&[scaler, constraint])?;
    scope.sync(&[scaler, constraint])?;

    let pad = scope.request_pad(mixer, TrackKind::Video)?;
    placement.apply(&scope, &pad)?;
    scope.link_chain(&event.pad, &[scaler, constraint], &pad)?;
    scope.commit();

    Ok(MixerSlot {
        source: event.source,
        kind: TrackKind::Video,
        pad,
        placement: Some(placement),
    })
}

/// Passthrough when the track already matches the mixer, otherwise
/// track -> audioresample -> audioconvert -> capsfilter -> mixer slot.
fn splice_audio(
    state: &mut RouterState,
    event: &TrackEvent,
) -> Result<(MixerSlot, Option<AdaptationChain>), SpliceError> {
    let mixer = state.audio_mixer;
    let contract = mixer_audio_caps();
    let mut scope = state.graph.scope();

    let pad = scope.request_pad(mixer, TrackKind::Audio)?;
    let slot = MixerSlot {
        source: event.source,
        kind: TrackKind::Audio,
        pad: pad.clone(),
        placement: None,
    };

    if event.format.is_equal(&contract) {
        scope.link(&event.pad, &pad)?;
        scope.commit();
        return Ok((slot, None));
    }

    log::debug!(
        "{} audio is {}, converting to {}",
        event.source,
        event.format,
        contract
    );
    let resample = scope.make("audioresample")?;
    let convert = scope.make("audioconvert")?;
    let constraint = scope.make("capsfilter")?;
    scope.set_property(constraint, "caps", contract.into())?;
    let chain = [resample, convert, constraint];
    scope.add(&chain)?;
    scope.sync(&chain)?;
    scope.link_chain(&event.pad, &chain, &pad)?;
    scope.commit();

    Ok((
        slot,
        Some(AdaptationChain {
            source: event.source,
            resample,
            convert,
            constraint,
        }),
    ))
}

#[cfg(test)]
#[path = "router_test.rs"]
mod router_test;
