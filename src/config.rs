use std::collections::HashMap;
use std::path::{Path, PathBuf};

use compositor_bus::{BroadcastConfig, MediaDescription, SinkConfig};
use serde::Deserialize;

pub const DEFAULT_CONFIG_PATH: &str = "compositor.json";

#[derive(Debug, Default, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub broadcast: BroadcastConfig,
    /// Track layout of each source locator, for the in-process library.
    #[serde(default)]
    pub media: HashMap<String, MediaDescription>,
    /// Directory receiving a Graphviz dump on every graph state change.
    #[serde(default)]
    pub dot_dir: Option<PathBuf>,
}

impl AppConfig {
    /// Reads `path`. A missing file yields an empty config, so the
    /// environment alone can drive a run.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        match std::fs::read_to_string(path) {
            Ok(text) => serde_json::from_str(&text)
                .map_err(|e| anyhow::anyhow!("invalid config {}: {}", path.display(), e)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                log::info!("{} not found, using environment only", path.display());
                Ok(Self::default())
            }
            Err(e) => Err(anyhow::anyhow!("failed to read {}: {}", path.display(), e)),
        }
    }

    /// Overrides broadcast settings from `COMPOSITOR_*` variables. A file
    /// sink takes precedence over an RTMP address.
    pub fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) {
        let config = &mut self.broadcast;
        for (key, slot) in [
            ("COMPOSITOR_SOURCE1", &mut config.source1),
            ("COMPOSITOR_SOURCE2", &mut config.source2),
            ("COMPOSITOR_SOURCE3", &mut config.source3),
        ] {
            if let Some(value) = var(key) {
                *slot = Some(value);
            }
        }

        if let Some(path) = var("COMPOSITOR_FILE_SINK") {
            config.sink = Some(SinkConfig::File { path });
        } else if let Some(url) = var("COMPOSITOR_RTMP_ADDRESS") {
            config.sink = Some(SinkConfig::Net { url });
        }
    }

    pub fn sources(&self) -> impl Iterator<Item = &str> {
        [
            &self.broadcast.source1,
            &self.broadcast.source2,
            &self.broadcast.source3,
        ]
        .into_iter()
        .filter_map(|s| s.as_deref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let pairs: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| pairs.get(key).cloned()
    }

    #[test]
    fn test_parse_full_config() {
        let config: AppConfig = serde_json::from_str(
            r#"{
                "broadcast": {
                    "source1": "file:///a.webm",
                    "source2": "file:///b.webm",
                    "source3": "file:///c.webm",
                    "sink": { "type": "net", "url": "rtmp://127.0.0.1/live" }
                },
                "media": {
                    "file:///a.webm": {
                        "tracks": [
                            { "kind": "video", "width": 1280, "height": 720 },
                            {
                                "kind": "audio",
                                "sample_format": "S16LE",
                                "layout": "Interleaved",
                                "rate": 44100,
                                "channels": 2,
                                "channel_mask": 3
                            }
                        ],
                        "discovery_delay_ms": 50
                    }
                },
                "dot_dir": "/tmp/dots"
            }"#,
        )
        .unwrap();

        assert!(config.broadcast.validate().is_ok());
        let media = &config.media["file:///a.webm"];
        assert_eq!(media.tracks.len(), 2);
        assert_eq!(media.tracks[1], compositor_bus::caps::mixer_audio_caps());
        assert_eq!(config.dot_dir, Some(PathBuf::from("/tmp/dots")));
        assert_eq!(config.sources().count(), 3);
    }

    #[test]
    fn test_env_overrides_file_values() {
        let mut config = AppConfig::default();
        config.broadcast.source1 = Some("file:///from-file.webm".to_string());
        config.apply_env(env(&[
            ("COMPOSITOR_SOURCE1", "file:///a.webm"),
            ("COMPOSITOR_SOURCE3", "file:///c.webm"),
            ("COMPOSITOR_RTMP_ADDRESS", "rtmp://127.0.0.1/live"),
        ]));
        assert_eq!(config.broadcast.source1.as_deref(), Some("file:///a.webm"));
        assert_eq!(config.broadcast.source2, None);
        assert_eq!(
            config.broadcast.sink,
            Some(SinkConfig::Net {
                url: "rtmp://127.0.0.1/live".to_string()
            })
        );
    }

    #[test]
    fn test_file_sink_wins_over_rtmp() {
        let mut config = AppConfig::default();
        config.apply_env(env(&[
            ("COMPOSITOR_FILE_SINK", "out.flv"),
            ("COMPOSITOR_RTMP_ADDRESS", "rtmp://127.0.0.1/live"),
        ]));
        assert_eq!(
            config.broadcast.sink,
            Some(SinkConfig::File {
                path: "out.flv".to_string()
            })
        );
    }

    #[test]
    fn test_missing_file_is_empty_config() -> anyhow::Result<()> {
        let config = AppConfig::load(Path::new("/nonexistent/compositor.json"))?;
        assert!(config.media.is_empty());
        assert!(config.broadcast.validate().is_err());
        Ok(())
    }
}
