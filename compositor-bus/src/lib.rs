/// Registers FFmpeg components. Call once at startup before probing media.
#[cfg(feature = "ffmpeg")]
pub fn init() -> anyhow::Result<()> {
    ffmpeg_next::init().map_err(|e| anyhow::anyhow!("ffmpeg_next init: {}", e))
}

pub mod broadcaster;
pub mod caps;
pub mod config;
pub mod error;
pub mod graph;
#[cfg(feature = "gstreamer")]
pub mod gst_library;
pub mod guard;
pub mod library;
pub mod memory;
#[cfg(feature = "ffmpeg")]
pub mod probe;
pub mod router;
pub mod source;
pub mod topology;

pub use broadcaster::{Broadcaster, LifecycleState};
pub use config::{BroadcastConfig, SinkConfig};
pub use error::{BroadcastError, SpliceError};
pub use library::TransformLibrary;
pub use memory::{MediaDescription, MemoryLibrary};
#[cfg(feature = "gstreamer")]
pub use gst_library::GstLibrary;
