//! GStreamer implementation of [`TransformLibrary`].
//!
//! Every node is a `gst::Element` inside one `gst::Pipeline`. Bus messages are
//! pumped from the pipeline bus on a dedicated thread and fanned out over a
//! broadcast channel, the same way [`crate::memory::MemoryLibrary`] posts
//! them.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;

use gst::glib;
use gst::prelude::*;
use gstreamer as gst;
use tokio_util::sync::CancellationToken;

use crate::caps::{
    AudioFormat, Caps, Fraction, PixelFormat, SampleFormat, SampleLayout, VideoFormat,
};
use crate::library::{
    BusMessage, BusReceiver, BusSender, DiscoveredTrack, NodeId, PadRef, PropValue, RunState,
    TrackListener, TransformLibrary,
};

const BUS_POLL: Duration = Duration::from_millis(100);

/// Initializes GStreamer. Call once before creating a [`GstLibrary`].
pub fn init() -> anyhow::Result<()> {
    gst::init().map_err(|e| anyhow::anyhow!("gstreamer init: {}", e))
}

pub struct GstLibrary {
    pipeline: gst::Pipeline,
    elements: Mutex<HashMap<NodeId, gst::Element>>,
    next_id: AtomicU64,
    bus: BusSender,
    cancel: CancellationToken,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl GstLibrary {
    pub fn new() -> anyhow::Result<Self> {
        let pipeline = gst::Pipeline::with_name("pipeline");
        let (bus, _) = tokio::sync::broadcast::channel(256);
        let cancel = CancellationToken::new();
        let gst_bus = pipeline
            .bus()
            .ok_or(anyhow::anyhow!("pipeline has no bus"))?;

        let pump = {
            let pipeline = pipeline.clone();
            let sender = bus.clone();
            let cancel = cancel.clone();
            std::thread::Builder::new()
                .name("gst-bus".to_string())
                .spawn(move || pump_bus(pipeline, gst_bus, sender, cancel))?
        };

        Ok(Self {
            pipeline,
            elements: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(0),
            bus,
            cancel,
            pump: Mutex::new(Some(pump)),
        })
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<NodeId, gst::Element>> {
        self.elements.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Clones the element out so no lock is held while GStreamer runs
    /// callbacks that may come back into the library.
    fn element(&self, node: NodeId) -> anyhow::Result<gst::Element> {
        self.lock()
            .get(&node)
            .cloned()
            .ok_or(anyhow::anyhow!("{} does not exist", node))
    }

    fn pad(&self, pad: &PadRef) -> anyhow::Result<gst::Pad> {
        let element = self.element(pad.node)?;
        element
            .static_pad(&pad.name)
            .ok_or(anyhow::anyhow!("{} has no pad {}", element.name(), pad.name))
    }
}

impl Drop for GstLibrary {
    fn drop(&mut self) {
        self.cancel.cancel();
        let _ = self.pipeline.set_state(gst::State::Null);
        let pump = self
            .pump
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(pump) = pump {
            let _ = pump.join();
        }
    }
}

fn pump_bus(pipeline: gst::Pipeline, bus: gst::Bus, sender: BusSender, cancel: CancellationToken) {
    let timeout = gst::ClockTime::from_mseconds(BUS_POLL.as_millis() as u64);
    while !cancel.is_cancelled() {
        let Some(msg) = bus.timed_pop(timeout) else {
            continue;
        };
        let message = match msg.view() {
            gst::MessageView::Eos(..) => BusMessage::EndOfStream,
            gst::MessageView::Error(err) => BusMessage::Error {
                node: msg
                    .src()
                    .map(|s| s.name().to_string())
                    .unwrap_or_else(|| "unknown".to_string()),
                message: err.error().to_string(),
                debug: err.debug().map(|d| d.to_string()),
            },
            gst::MessageView::StateChanged(change)
                if msg.src() == Some(pipeline.upcast_ref::<gst::Object>()) =>
            {
                BusMessage::StateChanged {
                    old: run_state(change.old()),
                    new: run_state(change.current()),
                }
            }
            _ => continue,
        };
        // no subscriber yet is fine
        let _ = sender.send(message);
    }
    log::debug!("bus pump stopped");
}

fn run_state(state: gst::State) -> RunState {
    match state {
        gst::State::Ready => RunState::Ready,
        gst::State::Paused => RunState::Paused,
        gst::State::Playing => RunState::Playing,
        _ => RunState::Null,
    }
}

fn gst_state(state: RunState) -> gst::State {
    match state {
        RunState::Null => gst::State::Null,
        RunState::Ready => gst::State::Ready,
        RunState::Paused => gst::State::Paused,
        RunState::Playing => gst::State::Playing,
    }
}

/// Converts `value` into the type `pspec` expects.
fn to_value(pspec: &glib::ParamSpec, value: PropValue) -> anyhow::Result<glib::Value> {
    let ty = pspec.value_type();
    let converted = match value {
        PropValue::Bool(v) if ty == bool::static_type() => v.to_value(),
        PropValue::Int(v) if ty == i32::static_type() => i32::try_from(v)?.to_value(),
        PropValue::Int(v) if ty == u32::static_type() => u32::try_from(v)?.to_value(),
        PropValue::Int(v) if ty == i64::static_type() => v.to_value(),
        PropValue::Int(v) if ty == u64::static_type() => u64::try_from(v)?.to_value(),
        PropValue::UInt(v) if ty == u64::static_type() => v.to_value(),
        PropValue::UInt(v) if ty == u32::static_type() => u32::try_from(v)?.to_value(),
        PropValue::UInt(v) if ty == i64::static_type() => i64::try_from(v)?.to_value(),
        PropValue::UInt(v) if ty == i32::static_type() => i32::try_from(v)?.to_value(),
        PropValue::Str(v) if ty == String::static_type() => v.to_value(),
        PropValue::Caps(caps) if ty == gst::Caps::static_type() => {
            gst::Caps::from_str(&caps.to_string())?.to_value()
        }
        // enums, flags and anything else GStreamer can parse from text
        other => glib::Value::deserialize(&other.to_string(), ty)
            .map_err(|e| anyhow::anyhow!("{} is not a valid {}: {}", other, ty, e))?,
    };
    Ok(converted)
}

fn from_value(value: &glib::Value) -> Option<PropValue> {
    if let Ok(v) = value.get::<bool>() {
        return Some(PropValue::Bool(v));
    }
    if let Ok(v) = value.get::<i32>() {
        return Some(PropValue::Int(v.into()));
    }
    if let Ok(v) = value.get::<i64>() {
        return Some(PropValue::Int(v));
    }
    if let Ok(v) = value.get::<u32>() {
        return Some(PropValue::UInt(v.into()));
    }
    if let Ok(v) = value.get::<u64>() {
        return Some(PropValue::UInt(v));
    }
    if let Ok(Some(caps)) = value.get::<Option<gst::Caps>>() {
        return caps_from_gst(&caps).map(PropValue::Caps);
    }
    if let Ok(Some(v)) = value.get::<Option<String>>() {
        return Some(PropValue::Str(v));
    }
    value.serialize().ok().map(|s| PropValue::Str(s.to_string()))
}

fn set_object_property(
    object: &impl IsA<glib::Object>,
    key: &str,
    value: PropValue,
) -> anyhow::Result<()> {
    let pspec = object
        .find_property(key)
        .ok_or(anyhow::anyhow!("no property {}", key))?;
    if !pspec.flags().contains(glib::ParamFlags::WRITABLE) {
        return Err(anyhow::anyhow!("property {} is read-only", key));
    }
    let value = to_value(&pspec, value)?;
    object.set_property_from_value(key, &value);
    Ok(())
}

fn object_property(object: &impl IsA<glib::Object>, key: &str) -> Option<PropValue> {
    object.find_property(key)?;
    from_value(&object.property_value(key))
}

/// Maps negotiated raw caps to [`Caps`]. Encoded or non-media caps yield
/// `None`.
pub fn caps_from_gst(caps: &gst::CapsRef) -> Option<Caps> {
    let s = caps.structure(0)?;
    let fraction = |field: &str| {
        s.get::<gst::Fraction>(field)
            .ok()
            .map(|f| Fraction::new(f.numer(), f.denom()))
    };
    let uint = |field: &str| s.get::<i32>(field).ok().and_then(|v| u32::try_from(v).ok());

    match s.name().as_str() {
        "video/x-raw" => Some(Caps::Video(VideoFormat {
            width: uint("width"),
            height: uint("height"),
            framerate: fraction("framerate"),
            pixel_format: s.get::<&str>("format").ok().and_then(pixel_format),
            pixel_aspect_ratio: fraction("pixel-aspect-ratio"),
        })),
        "audio/x-raw" => Some(Caps::Audio(AudioFormat {
            // only ever compared against the mixer contract
            sample_format: s
                .get::<&str>("format")
                .ok()
                .and_then(sample_format)
                .unwrap_or(SampleFormat::F32LE),
            layout: match s.get::<&str>("layout") {
                Ok("non-interleaved") => SampleLayout::NonInterleaved,
                _ => SampleLayout::Interleaved,
            },
            rate: uint("rate").unwrap_or(0),
            channels: uint("channels").unwrap_or(0),
            channel_mask: s
                .get::<gst::Bitmask>("channel-mask")
                .map(|m| m.0)
                .unwrap_or(0),
        })),
        _ => None,
    }
}

fn pixel_format(name: &str) -> Option<PixelFormat> {
    [
        PixelFormat::I420,
        PixelFormat::Nv12,
        PixelFormat::Yuy2,
        PixelFormat::Rgba,
        PixelFormat::Bgra,
    ]
    .into_iter()
    .find(|f| f.name() == name)
}

fn sample_format(name: &str) -> Option<SampleFormat> {
    [
        SampleFormat::U8,
        SampleFormat::S16LE,
        SampleFormat::S32LE,
        SampleFormat::F32LE,
    ]
    .into_iter()
    .find(|f| f.name() == name)
}

impl TransformLibrary for GstLibrary {
    fn create(&self, factory: &str, name: Option<&str>) -> anyhow::Result<NodeId> {
        let mut builder = gst::ElementFactory::make(factory);
        if let Some(name) = name {
            builder = builder.name(name);
        }
        let element = builder
            .build()
            .map_err(|e| anyhow::anyhow!("{}: {}", factory, e))?;
        let id = NodeId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.lock().insert(id, element);
        Ok(id)
    }

    fn set_property(&self, node: NodeId, key: &str, value: PropValue) -> anyhow::Result<()> {
        set_object_property(&self.element(node)?, key, value)
    }

    fn property(&self, node: NodeId, key: &str) -> Option<PropValue> {
        object_property(&self.element(node).ok()?, key)
    }

    fn add(&self, node: NodeId) -> anyhow::Result<()> {
        self.pipeline.add(&self.element(node)?)?;
        Ok(())
    }

    fn destroy(&self, node: NodeId) -> anyhow::Result<()> {
        let element = self
            .lock()
            .remove(&node)
            .ok_or(anyhow::anyhow!("{} does not exist", node))?;
        element.set_state(gst::State::Null)?;
        if element.parent().is_some() {
            self.pipeline.remove(&element)?;
        }
        Ok(())
    }

    fn link(&self, src: &PadRef, sink: &PadRef) -> anyhow::Result<()> {
        self.pad(src)?.link(&self.pad(sink)?)?;
        Ok(())
    }

    fn unlink(&self, src: &PadRef, sink: &PadRef) -> anyhow::Result<()> {
        self.pad(src)?.unlink(&self.pad(sink)?)?;
        Ok(())
    }

    fn link_nodes(&self, src: NodeId, sink: NodeId) -> anyhow::Result<()> {
        self.element(src)?.link(&self.element(sink)?)?;
        Ok(())
    }

    fn request_pad(&self, node: NodeId, template: &str) -> anyhow::Result<PadRef> {
        let element = self.element(node)?;
        let pad = element
            .request_pad_simple(template)
            .ok_or(anyhow::anyhow!("{} refused a {} pad", element.name(), template))?;
        Ok(PadRef::new(node, pad.name().as_str()))
    }

    fn release_pad(&self, pad: &PadRef) -> anyhow::Result<()> {
        let element = self.element(pad.node)?;
        element.release_request_pad(&self.pad(pad)?);
        Ok(())
    }

    fn set_pad_property(&self, pad: &PadRef, key: &str, value: PropValue) -> anyhow::Result<()> {
        set_object_property(&self.pad(pad)?, key, value)
    }

    fn pad_property(&self, pad: &PadRef, key: &str) -> Option<PropValue> {
        object_property(&self.pad(pad).ok()?, key)
    }

    fn sync_state_with_parent(&self, node: NodeId) -> anyhow::Result<RunState> {
        self.element(node)?.sync_state_with_parent()?;
        Ok(self.state())
    }

    fn set_state(&self, state: RunState) -> anyhow::Result<()> {
        self.pipeline.set_state(gst_state(state))?;
        Ok(())
    }

    fn state(&self) -> RunState {
        match self.pipeline.pending_state() {
            gst::State::VoidPending => run_state(self.pipeline.current_state()),
            pending => run_state(pending),
        }
    }

    fn connect_track_discovered(
        &self,
        source: NodeId,
        listener: TrackListener,
    ) -> anyhow::Result<()> {
        self.element(source)?.connect_pad_added(move |element, pad| {
            let caps = pad.current_caps().unwrap_or_else(|| pad.query_caps(None));
            match caps_from_gst(&caps) {
                Some(caps) => listener(DiscoveredTrack {
                    source,
                    pad: PadRef::new(source, pad.name().as_str()),
                    caps,
                }),
                None => log::debug!(
                    "{} exposed {} with {}, ignored",
                    element.name(),
                    pad.name(),
                    caps
                ),
            }
        });
        Ok(())
    }

    fn subscribe(&self) -> BusReceiver {
        self.bus.subscribe()
    }

    fn dump_dot(&self) -> Option<String> {
        Some(
            self.pipeline
                .debug_to_dot_data(gst::DebugGraphDetails::all())
                .to_string(),
        )
    }
}

#[cfg(test)]
#[path = "gst_library_test.rs"]
mod gst_library_test;
