use serde::{Deserialize, Serialize};

use crate::caps::MAX_SOURCES;
use crate::error::BroadcastError;

/// Where the muxed output goes.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum SinkConfig {
    File { path: String },
    Net { url: String },
}

impl SinkConfig {
    pub fn factory(&self) -> &'static str {
        match self {
            SinkConfig::File { .. } => "filesink",
            SinkConfig::Net { .. } => "rtmpsink",
        }
    }

    pub fn node_name(&self) -> &'static str {
        match self {
            SinkConfig::File { .. } => "file-sink",
            SinkConfig::Net { .. } => "rtmp-sink",
        }
    }

    /// Value of the sink's `location` property.
    pub fn location(&self) -> String {
        match self {
            SinkConfig::File { path } => path.clone(),
            SinkConfig::Net { url } => format!("{} live=true", url),
        }
    }
}

/// Broadcast settings as supplied by the caller; every field is required
/// before `init`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BroadcastConfig {
    #[serde(default)]
    pub source1: Option<String>,
    #[serde(default)]
    pub source2: Option<String>,
    #[serde(default)]
    pub source3: Option<String>,
    #[serde(default)]
    pub sink: Option<SinkConfig>,
}

/// A configuration that passed [`BroadcastConfig::validate`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ValidatedConfig {
    pub sources: [String; MAX_SOURCES],
    pub sink: SinkConfig,
}

impl BroadcastConfig {
    pub fn builder() -> BroadcastConfigBuilder {
        BroadcastConfigBuilder::default()
    }

    pub fn validate(&self) -> Result<ValidatedConfig, BroadcastError> {
        fn required(value: &Option<String>, name: &'static str) -> Result<String, BroadcastError> {
            match value.as_deref().map(str::trim) {
                Some(v) if !v.is_empty() => Ok(v.to_string()),
                _ => Err(BroadcastError::Configuration { missing: name }),
            }
        }

        let sources = [
            required(&self.source1, "source1")?,
            required(&self.source2, "source2")?,
            required(&self.source3, "source3")?,
        ];
        let sink = match &self.sink {
            Some(SinkConfig::File { path }) => Some(path.trim())
                .filter(|p| !p.is_empty())
                .map(|p| SinkConfig::File { path: p.to_string() }),
            Some(SinkConfig::Net { url }) => Some(url.trim())
                .filter(|u| !u.is_empty())
                .map(|u| SinkConfig::Net { url: u.to_string() }),
            None => None,
        }
        .ok_or(BroadcastError::Configuration { missing: "sink" })?;

        Ok(ValidatedConfig { sources, sink })
    }
}

#[derive(Default)]
pub struct BroadcastConfigBuilder {
    sources: Vec<String>,
    sink: Option<SinkConfig>,
}

impl BroadcastConfigBuilder {
    /// Adds the next source. Extra sources beyond the mixer's capacity are
    /// ignored.
    pub fn source(mut self, locator: impl Into<String>) -> Self {
        if self.sources.len() < MAX_SOURCES {
            self.sources.push(locator.into());
        }
        self
    }

    /// Writes the output to a local file. Replaces any previous sink.
    pub fn file_sink(mut self, path: impl Into<String>) -> Self {
        self.sink = Some(SinkConfig::File { path: path.into() });
        self
    }

    /// Publishes the output to an RTMP endpoint. Replaces any previous sink.
    pub fn rtmp_sink(mut self, url: impl Into<String>) -> Self {
        self.sink = Some(SinkConfig::Net { url: url.into() });
        self
    }

    pub fn build(self) -> BroadcastConfig {
        let mut sources = self.sources.into_iter();
        BroadcastConfig {
            source1: sources.next(),
            source2: sources.next(),
            source3: sources.next(),
            sink: self.sink,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_fills_sources_in_order() {
        let config = BroadcastConfig::builder()
            .source("file:///a.webm")
            .source("file:///b.webm")
            .source("file:///c.webm")
            .source("file:///d.webm")
            .file_sink("out.flv")
            .build();
        assert_eq!(config.source1.as_deref(), Some("file:///a.webm"));
        assert_eq!(config.source3.as_deref(), Some("file:///c.webm"));
        assert_eq!(
            config.sink,
            Some(SinkConfig::File {
                path: "out.flv".to_string()
            })
        );
        let validated = config.validate().unwrap();
        assert_eq!(validated.sources[1], "file:///b.webm");
    }

    #[test]
    fn test_validate_names_first_missing_field() {
        let config = BroadcastConfig::builder()
            .source("a")
            .source("b")
            .file_sink("out.flv")
            .build();
        match config.validate() {
            Err(BroadcastError::Configuration { missing }) => assert_eq!(missing, "source3"),
            other => panic!("unexpected {:?}", other),
        }

        let config = BroadcastConfig::builder()
            .source("a")
            .source("b")
            .source("c")
            .build();
        match config.validate() {
            Err(BroadcastError::Configuration { missing }) => assert_eq!(missing, "sink"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_blank_values_count_as_missing() {
        let config = BroadcastConfig {
            source1: Some("a".to_string()),
            source2: Some("  ".to_string()),
            source3: Some("c".to_string()),
            sink: Some(SinkConfig::Net { url: String::new() }),
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_blank_sink_counts_as_missing() {
        for sink in [
            SinkConfig::File {
                path: "  ".to_string(),
            },
            SinkConfig::Net {
                url: "\t ".to_string(),
            },
        ] {
            let config = BroadcastConfig {
                source1: Some("a".to_string()),
                source2: Some("b".to_string()),
                source3: Some("c".to_string()),
                sink: Some(sink),
            };
            match config.validate() {
                Err(BroadcastError::Configuration { missing }) => assert_eq!(missing, "sink"),
                other => panic!("unexpected {:?}", other),
            }
        }
    }

    #[test]
    fn test_sink_is_trimmed() {
        let config = BroadcastConfig::builder()
            .source("a")
            .source("b")
            .source("c")
            .rtmp_sink(" rtmp://127.0.0.1/live ")
            .build();
        let validated = config.validate().unwrap();
        assert_eq!(validated.sink.location(), "rtmp://127.0.0.1/live live=true");
    }

    #[test]
    fn test_rtmp_location_is_live() {
        let sink = SinkConfig::Net {
            url: "rtmp://127.0.0.1/live".to_string(),
        };
        assert_eq!(sink.factory(), "rtmpsink");
        assert_eq!(sink.location(), "rtmp://127.0.0.1/live live=true");
    }

    #[test]
    fn test_deserialize_from_json() {
        let config: BroadcastConfig = serde_json::from_str(
            r#"{
                "source1": "file:///a.webm",
                "source2": "file:///b.webm",
                "source3": "file:///c.webm",
                "sink": { "type": "file", "path": "out.flv" }
            }"#,
        )
        .unwrap();
        assert!(config.validate().is_ok());

        let partial: BroadcastConfig = serde_json::from_str(r#"{ "source1": "x" }"#).unwrap();
        assert_eq!(partial.sink, None);
    }
}
