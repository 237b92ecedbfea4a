//! Snapshots of playback state as mirrored to the dashboard.
//!
//! Snapshots are built wholesale from live player state right before they
//! are sent and are never updated in place.

use std::time::Duration;

use serde::Serialize;
use serde_with::{serde_as, DurationSeconds};

use crate::track::Track;

/// Artwork shown when a track has none, or when nothing is playing.
pub const DEFAULT_THUMBNAIL: &str = "https://i.imgur.com/opTLRNC.png";

/// Title of the canonical "nothing playing" snapshot.
pub const IDLE_TITLE: &str = "No track playing";

/// Truncates to whole seconds, the precision the dashboard displays.
fn whole_seconds(duration: Duration) -> Duration {
    Duration::from_secs(duration.as_secs())
}

/// The now-playing view.
#[serde_as]
#[derive(Clone, PartialEq, Eq, Debug, Serialize)]
pub struct PlaybackSnapshot {
    pub title: String,
    pub artist: String,
    pub thumbnail: String,
    #[serde_as(as = "DurationSeconds<u64>")]
    pub duration: Duration,
    #[serde_as(as = "DurationSeconds<u64>")]
    pub position: Duration,
}

impl PlaybackSnapshot {
    /// The canonical "nothing playing" snapshot.
    #[must_use]
    pub fn idle() -> Self {
        Self {
            title: IDLE_TITLE.to_owned(),
            artist: String::new(),
            thumbnail: DEFAULT_THUMBNAIL.to_owned(),
            duration: Duration::ZERO,
            position: Duration::ZERO,
        }
    }

    #[must_use]
    pub fn playing(track: &Track, position: Duration) -> Self {
        let position = if track.is_stream() {
            position
        } else {
            position.min(track.length)
        };

        Self {
            title: track.title.clone(),
            artist: track.author.clone(),
            thumbnail: track
                .artwork
                .clone()
                .unwrap_or_else(|| DEFAULT_THUMBNAIL.to_owned()),
            duration: whole_seconds(track.length),
            position: whole_seconds(position),
        }
    }

    #[must_use]
    pub fn is_idle(&self) -> bool {
        self == &Self::idle()
    }
}

/// One upcoming track.
#[serde_as]
#[derive(Clone, PartialEq, Eq, Debug, Serialize)]
pub struct QueueEntry {
    pub title: String,
    pub artist: String,
    /// Absent for streams of unknown length.
    #[serde_as(as = "Option<DurationSeconds<u64>>")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration: Option<Duration>,
}

impl From<&Track> for QueueEntry {
    fn from(track: &Track) -> Self {
        Self {
            title: track.title.clone(),
            artist: track.author.clone(),
            duration: (!track.is_stream()).then(|| whole_seconds(track.length)),
        }
    }
}

/// The upcoming tracks in playback order, truncated to a bounded prefix.
#[derive(Clone, PartialEq, Eq, Debug, Default, Serialize)]
pub struct QueueSnapshot {
    pub queue: Vec<QueueEntry>,
}

impl QueueSnapshot {
    /// Builds a snapshot of at most `limit` entries from `tracks`.
    pub fn new<'a, I>(tracks: I, limit: usize) -> Self
    where
        I: IntoIterator<Item = &'a Track>,
    {
        Self {
            queue: tracks.into_iter().take(limit).map(QueueEntry::from).collect(),
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

/// Track metadata included in a successful search result.
#[serde_as]
#[derive(Clone, PartialEq, Eq, Debug, Serialize)]
pub struct TrackInfo {
    pub title: String,
    pub artist: String,
    pub thumbnail: String,
    #[serde_as(as = "DurationSeconds<u64>")]
    pub duration: Duration,
}

impl From<&Track> for TrackInfo {
    fn from(track: &Track) -> Self {
        Self {
            title: track.title.clone(),
            artist: track.author.clone(),
            thumbnail: track
                .artwork
                .clone()
                .unwrap_or_else(|| DEFAULT_THUMBNAIL.to_owned()),
            duration: whole_seconds(track.length),
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::{json, Value};

    use super::*;
    use crate::protocol::Outbound;

    fn track(n: usize) -> Track {
        Track::new(format!("Song {n}"), "Band", Duration::from_millis(201_999))
    }

    #[test]
    fn idle_snapshot_is_canonical() {
        let frame = Outbound::NowPlaying(PlaybackSnapshot::idle()).encode().unwrap();
        let value: Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(
            value,
            json!({
                "type": "now_playing",
                "title": "No track playing",
                "artist": "",
                "thumbnail": DEFAULT_THUMBNAIL,
                "duration": 0,
                "position": 0,
            })
        );
        assert!(PlaybackSnapshot::idle().is_idle());
    }

    #[test]
    fn playing_snapshot_truncates_to_seconds() {
        let snapshot = PlaybackSnapshot::playing(
            &track(1).with_artwork("https://img.example/1.jpg"),
            Duration::from_millis(1_900),
        );
        assert_eq!(snapshot.duration, Duration::from_secs(201));
        assert_eq!(snapshot.position, Duration::from_secs(1));
        assert_eq!(snapshot.thumbnail, "https://img.example/1.jpg");
        assert!(!snapshot.is_idle());
    }

    #[test]
    fn queue_snapshot_is_bounded() {
        let tracks: Vec<_> = (0..25).map(track).collect();
        let snapshot = QueueSnapshot::new(&tracks, 10);
        assert_eq!(snapshot.len(), 10);
        assert_eq!(snapshot.queue[0].title, "Song 0");
        assert_eq!(snapshot.queue[9].title, "Song 9");

        let short = QueueSnapshot::new(&tracks[..3], 10);
        assert_eq!(short.len(), 3);
    }

    #[test]
    fn streams_have_no_queue_duration() {
        let stream = Track::new("Radio", "Station", Duration::ZERO);
        let frame = Outbound::QueueUpdate(QueueSnapshot::new([&stream, &track(2)], 10))
            .encode()
            .unwrap();
        let value: Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(
            value,
            json!({
                "type": "queue_update",
                "queue": [
                    {"title": "Radio", "artist": "Station"},
                    {"title": "Song 2", "artist": "Band", "duration": 201},
                ],
            })
        );
    }
}
