//! Feed-local UI preferences
//!
//! Bandwidth mode and stat visibility toggles, persisted to a local JSON
//! file so they survive a restart. Local only; never shared across devices.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BandwidthMode {
    Low,
    #[default]
    Medium,
    High,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VisibilityPrefs {
    pub health: bool,
    pub duration: bool,
    pub bitrate: bool,
    pub viewers: bool,
}

impl Default for VisibilityPrefs {
    fn default() -> Self {
        Self {
            health: true,
            duration: true,
            bitrate: false,
            viewers: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Preferences {
    pub bandwidth: BandwidthMode,
    pub visibility: VisibilityPrefs,
}

/// JSON-file-backed preferences store.
pub struct PreferencesStore {
    path: PathBuf,
}

impl PreferencesStore {
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Load preferences; a missing or unreadable file yields defaults.
    #[must_use]
    pub fn load(&self) -> Preferences {
        match std::fs::read_to_string(&self.path) {
            Ok(contents) => serde_json::from_str(&contents).unwrap_or_else(|e| {
                warn!(path = %self.path.display(), "Preferences file corrupt, using defaults: {e}");
                Preferences::default()
            }),
            Err(_) => Preferences::default(),
        }
    }

    pub fn save(&self, prefs: &Preferences) -> crate::Result<()> {
        let contents = serde_json::to_string_pretty(prefs)?;
        std::fs::write(&self.path, contents)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_file_yields_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = PreferencesStore::new(dir.path().join("prefs.json"));
        assert_eq!(store.load(), Preferences::default());
    }

    #[test]
    fn test_round_trip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = PreferencesStore::new(dir.path().join("prefs.json"));

        let prefs = Preferences {
            bandwidth: BandwidthMode::High,
            visibility: VisibilityPrefs {
                bitrate: true,
                viewers: true,
                ..VisibilityPrefs::default()
            },
        };
        store.save(&prefs).expect("save succeeds");
        assert_eq!(store.load(), prefs);
    }

    #[test]
    fn test_corrupt_file_yields_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("prefs.json");
        std::fs::write(&path, "{ not json").expect("write");

        let store = PreferencesStore::new(path);
        assert_eq!(store.load(), Preferences::default());
    }
}
