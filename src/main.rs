use std::path::Path;
use std::sync::Arc;

use compositor_bus::{Broadcaster, TransformLibrary};

mod config;

use config::{AppConfig, DEFAULT_CONFIG_PATH};

fn init_logging() {
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .filter_module("compositor_bus", log::LevelFilter::Debug)
        .init();
}

#[tokio::main]
async fn main() {
    init_logging();
    let path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string());

    let code = match run(Path::new(&path)).await {
        Ok(()) => 0,
        Err(e) => {
            log::error!("{:#}", e);
            1
        }
    };
    std::process::exit(code);
}

async fn run(path: &Path) -> anyhow::Result<()> {
    let mut config = AppConfig::load(path)?;
    config.apply_env(|key| std::env::var(key).ok());

    let library = open_library(&config)?;
    let mut broadcaster = Broadcaster::new(library);
    if let Some(dir) = config.dot_dir.as_ref() {
        broadcaster = broadcaster.with_dot_dir(dir);
    }
    broadcaster.init(&config.broadcast)?;

    let interrupt = broadcaster.interrupt_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            log::info!("ctrl-c received, stopping");
            interrupt.cancel();
        }
    });

    broadcaster.run().await?;

    let report = broadcaster.report();
    log::info!(
        "linked {} video and {} audio tracks, {} converted",
        report.linked_video,
        report.linked_audio,
        report.adaptation_chains.len()
    );
    Ok(())
}

/// Media is decoded, mixed and written by GStreamer.
#[cfg(feature = "gstreamer")]
fn open_library(_config: &AppConfig) -> anyhow::Result<Arc<dyn TransformLibrary>> {
    compositor_bus::gst_library::init()?;
    Ok(Arc::new(compositor_bus::GstLibrary::new()?))
}

/// Routing only: tracks come from the declared (or probed) media catalog and
/// nothing is written to the sink.
#[cfg(not(feature = "gstreamer"))]
fn open_library(config: &AppConfig) -> anyhow::Result<Arc<dyn TransformLibrary>> {
    log::warn!("built without the gstreamer feature, the sink receives no media");
    let library = Arc::new(compositor_bus::MemoryLibrary::new());
    for (locator, media) in config.media.iter() {
        library.insert_media(locator, media.clone());
    }

    #[cfg(feature = "ffmpeg")]
    {
        compositor_bus::init()?;
        for locator in config.sources() {
            match compositor_bus::probe::probe(locator) {
                Ok(media) => library.insert_media(locator, media),
                Err(e) => log::warn!("probe {} failed: {:#}", locator, e),
            }
        }
    }

    for locator in config.sources() {
        if !config.media.contains_key(locator) && !cfg!(feature = "ffmpeg") {
            log::warn!("no media declared for {}, it will fail to open", locator);
        }
    }
    Ok(library)
}
