//! Tracks as known to the playback agent and the search backend.

use std::{fmt, time::Duration};

/// A playable track.
///
/// This is a value type: players hand out copies and the dashboard only ever
/// sees snapshots built from it.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct Track {
    pub title: String,
    pub author: String,

    /// Zero for live streams and other tracks of unknown length.
    pub length: Duration,

    /// Artwork URL, if the source provides one.
    pub artwork: Option<String>,

    /// Where the track was found, e.g. a video page.
    pub uri: Option<String>,

    /// Opaque handle the audio backend uses to play the track.
    pub encoded: Option<String>,
}

impl Track {
    #[must_use]
    pub fn new(title: impl Into<String>, author: impl Into<String>, length: Duration) -> Self {
        Self {
            title: title.into(),
            author: author.into(),
            length,
            ..Default::default()
        }
    }

    #[must_use]
    pub fn with_artwork(mut self, artwork: impl Into<String>) -> Self {
        self.artwork = Some(artwork.into());
        self
    }

    #[must_use]
    pub fn is_stream(&self) -> bool {
        self.length.is_zero()
    }
}

impl fmt::Display for Track {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.author.is_empty() {
            write!(f, "{}", self.title)
        } else {
            write!(f, "{} - {}", self.author, self.title)
        }
    }
}
