//! Manifest verifier
//!
//! The status oracle alone cannot distinguish a live encoder from the
//! provider's reconnect window, during which the status stays "active" while
//! the endpoint serves the previously-recorded tail. The loaded playlist's
//! shape can: an open-ended playlist is live, one with an end marker is a
//! finished recording. The verdict here is authoritative and overrides
//! whatever the oracle said.

use tracing::info;

/// Details carried by the first loaded media playlist.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlaylistDetails {
    /// True for an open-ended live playlist, false when the playlist carries
    /// an end/duration marker (finished or recorded content).
    pub live: bool,
    /// Bitrate of the selected level, for the stats display.
    pub bitrate_bps: Option<u64>,
}

/// Outcome of verifying one playback session's first playlist.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    /// Confirmed live: begin playback and hold the feed in LIVE.
    Live { bitrate_bps: Option<u64> },
    /// Finished/recorded content: stop immediately and block reload attempts
    /// until the upstream reports truly idle.
    Finished,
}

/// Classify the first loaded playlist for a feed.
#[must_use]
pub fn verify(feed_index: usize, details: &PlaylistDetails) -> Verdict {
    if details.live {
        info!(feed = feed_index, "Playlist confirmed live");
        Verdict::Live {
            bitrate_bps: details.bitrate_bps,
        }
    } else {
        info!(feed = feed_index, "Playlist is finished/recorded content");
        Verdict::Finished
    }
}
