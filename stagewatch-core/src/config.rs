use chrono::{DateTime, Utc};
use config::{Config as ConfigBuilder, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Dashboard configuration
///
/// Loaded once at startup and re-read on an explicit settings save. A reload
/// triggers a full feed-set rebuild: every feed runtime is torn down and
/// recreated from the new descriptor list.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub event: EventConfig,
    pub upstream: UpstreamConfig,
    pub producer: ProducerConfig,
    pub logging: LoggingConfig,
    pub prefs: PrefsConfig,
    pub feeds: Vec<FeedConfig>,
    pub break_videos: Vec<BreakVideoConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EventConfig {
    pub name: String,
    /// Dashboard refuses to start monitoring once this instant has passed.
    pub expires_at: Option<DateTime<Utc>>,
}

impl Default for EventConfig {
    fn default() -> Self {
        Self {
            name: "Crew Dashboard".to_string(),
            expires_at: None,
        }
    }
}

impl EventConfig {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|expiry| now > expiry)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UpstreamConfig {
    /// Base URL for the status / break / health endpoints.
    pub api_base: String,
    /// Base URL playback manifests are built from (`{stream_base}{playback_id}.m3u8`).
    pub stream_base: String,
    pub connect_timeout_seconds: u64,
    pub request_timeout_seconds: u64,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            api_base: "http://127.0.0.1:8888/api".to_string(),
            stream_base: "https://stream.mux.com/".to_string(),
            connect_timeout_seconds: 5,
            request_timeout_seconds: 10,
        }
    }
}

impl UpstreamConfig {
    /// Build the playback manifest URL for a content id.
    #[must_use]
    pub fn manifest_url(&self, playback_id: &str) -> String {
        let base = self.stream_base.trim_end_matches('/');
        format!("{base}/{playback_id}.m3u8")
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ProducerConfig {
    /// Shared secret gating producer actions (break toggles, settings save).
    pub secret: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String, // "json" or "pretty"
    pub file_path: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
            file_path: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PrefsConfig {
    /// Where feed-local UI preferences are persisted. Local only, never shared.
    pub path: String,
}

impl Default for PrefsConfig {
    fn default() -> Self {
        Self {
            path: "./stagewatch-prefs.json".to_string(),
        }
    }
}

/// One configured camera/stage feed.
///
/// `live_stream_id` identifies the encoder for status checks; `playback_id`
/// builds the manifest URL. A feed configured without a playback id can still
/// go live: the status endpoint surfaces one once the encoder connects.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FeedConfig {
    pub name: String,
    pub tag: Option<String>,
    pub live_stream_id: Option<String>,
    pub playback_id: Option<String>,
    /// Break video library ids assigned to this feed's two break slots.
    pub break_video_1: Option<String>,
    pub break_video_2: Option<String>,
}

/// One entry in the break video library.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakVideoConfig {
    pub id: String,
    pub name: String,
    pub playback_id: String,
}

impl Config {
    /// Look up a break video library entry by id.
    #[must_use]
    pub fn break_video(&self, id: &str) -> Option<&BreakVideoConfig> {
        self.break_videos
            .iter()
            .find(|video| video.id == id && !video.playback_id.is_empty())
    }

    /// Validate the configuration, returning every problem found.
    pub fn validate(&self) -> std::result::Result<(), Vec<String>> {
        let mut errors = Vec::new();

        for (index, feed) in self.feeds.iter().enumerate() {
            if feed.name.is_empty() {
                errors.push(format!("feed {index} has no name"));
            }
            for slot_id in [&feed.break_video_1, &feed.break_video_2]
                .into_iter()
                .flatten()
            {
                if !self.break_videos.iter().any(|video| &video.id == slot_id) {
                    errors.push(format!(
                        "feed {index} references unknown break video \"{slot_id}\""
                    ));
                }
            }
        }

        let mut seen = std::collections::HashSet::new();
        for video in &self.break_videos {
            if !seen.insert(&video.id) {
                errors.push(format!("duplicate break video id \"{}\"", video.id));
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

/// Load configuration from multiple sources with priority:
/// 1. Environment variables (highest priority)
/// 2. Config file (explicit path, or `stagewatch.toml` if present)
/// 3. Defaults (lowest priority)
///
/// An explicitly-given file that is missing or does not deserialize is
/// configuration-fatal; the implicit default file is optional.
pub fn load_config(path: Option<&Path>) -> crate::Result<Config> {
    let mut builder = ConfigBuilder::builder();

    match path {
        Some(path) => {
            builder = builder.add_source(File::with_name(&path.to_string_lossy()));
        }
        None => {
            if Path::new("stagewatch.toml").exists() {
                builder = builder.add_source(File::with_name("stagewatch"));
            }
        }
    }

    let settings = builder
        .add_source(
            Environment::with_prefix("STAGEWATCH")
                .separator("__")
                .try_parsing(true),
        )
        .build()?;

    Ok(settings.try_deserialize()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert!(config.feeds.is_empty());
        assert_eq!(config.upstream.stream_base, "https://stream.mux.com/");
        assert!(config.event.expires_at.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_manifest_url() {
        let upstream = UpstreamConfig::default();
        assert_eq!(
            upstream.manifest_url("abc123"),
            "https://stream.mux.com/abc123.m3u8"
        );

        let no_slash = UpstreamConfig {
            stream_base: "https://cdn.example.com/hls".to_string(),
            ..UpstreamConfig::default()
        };
        assert_eq!(
            no_slash.manifest_url("abc123"),
            "https://cdn.example.com/hls/abc123.m3u8"
        );
    }

    #[test]
    fn test_expiry_check() {
        let event = EventConfig {
            name: "Test Event".to_string(),
            expires_at: Some(Utc.with_ymd_and_hms(2025, 1, 27, 23, 59, 0).single().expect("valid date")),
        };
        let before = Utc.with_ymd_and_hms(2025, 1, 26, 10, 0, 0).single().expect("valid date");
        let after = Utc.with_ymd_and_hms(2025, 1, 28, 0, 0, 0).single().expect("valid date");

        assert!(!event.is_expired(before));
        assert!(event.is_expired(after));
        assert!(!EventConfig::default().is_expired(after));
    }

    #[test]
    fn test_validate_unknown_break_video() {
        let config = Config {
            feeds: vec![FeedConfig {
                name: "Main Stage".to_string(),
                break_video_1: Some("missing".to_string()),
                ..FeedConfig::default()
            }],
            ..Config::default()
        };

        let errors = config.validate().expect_err("should flag unknown break video");
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("missing"));
    }

    #[test]
    fn test_validate_duplicate_break_video_ids() {
        let video = BreakVideoConfig {
            id: "break-1".to_string(),
            name: "Holding Loop".to_string(),
            playback_id: "pb1".to_string(),
        };
        let config = Config {
            break_videos: vec![video.clone(), video],
            ..Config::default()
        };

        let errors = config.validate().expect_err("should flag duplicate ids");
        assert!(errors[0].contains("break-1"));
    }

    #[test]
    fn test_break_video_lookup_skips_empty_playback_id() {
        let config = Config {
            break_videos: vec![BreakVideoConfig {
                id: "break-1".to_string(),
                name: "Placeholder".to_string(),
                playback_id: String::new(),
            }],
            ..Config::default()
        };

        assert!(config.break_video("break-1").is_none());
        assert!(config.break_video("break-2").is_none());
    }
}
