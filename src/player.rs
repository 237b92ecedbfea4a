//! Interface to the playback agent.
//!
//! The playback agent is the chat bot holding the audio-player connection.
//! It is an external collaborator: the link only ever talks to it through
//! the traits in this module, so the agent can be a real voice bot, the
//! in-process [`local`](crate::local) agent, or a test fake.
//!
//! # Structure
//!
//! * [`Agent`] - the bot, enumerating its [`Guild`]s
//! * [`Guild`] - one server context, with at most one live [`Player`]
//! * [`Player`] - the audio player, with an optional queue capability
//! * [`Search`] - the remote track lookup
//!
//! [`Context`] is handed to the dispatcher and the event listener at
//! construction time and holds the agent once it has finished starting.

use std::{
    fmt,
    sync::{Arc, OnceLock},
    time::Duration,
};

use async_trait::async_trait;

use crate::{
    error::{Error, Result},
    track::Track,
};

/// A voice destination a player can connect to.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct VoiceChannel {
    pub id: u64,
    pub name: String,
    /// Number of (non-bot) members currently in the channel.
    pub listeners: usize,
}

impl fmt::Display for VoiceChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{} ({})", self.name, self.id)
    }
}

/// The playback agent.
pub trait Agent: Send + Sync {
    /// Server contexts the agent is part of, in a stable order.
    fn guilds(&self) -> Vec<Arc<dyn Guild>>;
}

/// One server context of the playback agent.
#[async_trait]
pub trait Guild: Send + Sync {
    fn id(&self) -> u64;

    /// The live player of this guild, if connected to voice.
    fn player(&self) -> Option<Arc<dyn Player>>;

    fn voice_channels(&self) -> Vec<VoiceChannel>;

    /// Connects a new player to `channel`.
    async fn connect(&self, channel: &VoiceChannel) -> Result<Arc<dyn Player>>;
}

/// A live audio player.
///
/// Queue support is a capability: players without a queue keep the default
/// implementations, which report an empty queue with looping off and refuse
/// to modify it.
#[async_trait]
pub trait Player: Send + Sync {
    /// Whether a track is loaded, paused or not.
    fn is_playing(&self) -> bool;

    fn is_paused(&self) -> bool;

    fn current(&self) -> Option<Track>;

    fn position(&self) -> Duration;

    async fn pause(&self, paused: bool) -> Result<()>;

    /// Stops the current track. Players with a queue advance to the next.
    async fn stop(&self) -> Result<()>;

    /// Stops playback and leaves the voice channel.
    async fn disconnect(&self) -> Result<()>;

    /// Starts `track` immediately, replacing the current one.
    async fn play(&self, track: Track) -> Result<()>;

    fn has_queue(&self) -> bool {
        false
    }

    fn queue_len(&self) -> usize {
        0
    }

    /// Upcoming tracks in playback order.
    fn queued(&self) -> Vec<Track> {
        Vec::new()
    }

    fn enqueue(&self, _track: Track) -> Result<()> {
        Err(Error::unimplemented("player has no queue"))
    }

    fn shuffle_queue(&self) -> Result<()> {
        Err(Error::unimplemented("player has no queue"))
    }

    fn queue_loop(&self) -> bool {
        false
    }

    fn set_queue_loop(&self, _enabled: bool) -> Result<()> {
        Err(Error::unimplemented("player has no queue"))
    }
}

/// Remote track lookup.
#[async_trait]
pub trait Search: Send + Sync {
    /// Returns candidate tracks for `query`, best match first. May be empty.
    async fn search(&self, query: &str) -> Result<Vec<Track>>;
}

/// Holds the playback agent once it is ready.
///
/// Commands arriving before [`Context::install`] find no agent and are
/// dropped by the dispatcher.
#[derive(Default)]
pub struct Context {
    agent: OnceLock<Arc<dyn Agent>>,
}

impl Context {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes `agent` available. Only the first call has effect.
    pub fn install(&self, agent: Arc<dyn Agent>) {
        if self.agent.set(agent).is_err() {
            warn!("playback agent already installed");
        }
    }

    #[must_use]
    pub fn agent(&self) -> Option<Arc<dyn Agent>> {
        self.agent.get().cloned()
    }

    /// Resolves the guild commands apply to.
    ///
    /// Prefers the first guild with a live player and falls back to the
    /// first known guild, which `search` uses to start a new player.
    #[must_use]
    pub fn active_guild(&self) -> Option<Arc<dyn Guild>> {
        let guilds = self.agent()?.guilds();
        guilds
            .iter()
            .find(|guild| guild.player().is_some())
            .or_else(|| guilds.first())
            .cloned()
    }
}

/// Picks the voice channel to join: the first with listeners, else the first.
#[must_use]
pub fn preferred_channel(channels: &[VoiceChannel]) -> Option<&VoiceChannel> {
    channels
        .iter()
        .find(|channel| channel.listeners > 0)
        .or_else(|| channels.first())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn channel(id: u64, listeners: usize) -> VoiceChannel {
        VoiceChannel {
            id,
            name: format!("voice-{id}"),
            listeners,
        }
    }

    #[test]
    fn prefers_channels_with_listeners() {
        let channels = [channel(1, 0), channel(2, 3), channel(3, 1)];
        assert_eq!(preferred_channel(&channels).map(|c| c.id), Some(2));

        let empty = [channel(7, 0), channel(8, 0)];
        assert_eq!(preferred_channel(&empty).map(|c| c.id), Some(7));

        assert!(preferred_channel(&[]).is_none());
    }

    #[test]
    fn context_starts_empty() {
        let context = Context::new();
        assert!(context.agent().is_none());
        assert!(context.active_guild().is_none());
    }
}
