//! Executes dashboard commands against the playback agent.
//!
//! The [`Dispatcher`] is the [`Handler`] of the link. It decodes each inbound
//! frame, resolves the player the command applies to, runs the command and
//! answers with exactly one correlated frame:
//!
//! * `search` answers with a `search_result`
//! * every other known action answers with a `command_response`
//!
//! Nothing is answered for malformed frames, heartbeat acknowledgements,
//! frames without an action, unknown actions, or commands that arrive before
//! the playback agent is ready. No failure ever leaves the dispatcher: failed
//! commands become `{"success": false, "message": ...}` answers.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use serde_json::Value;

use crate::{
    error::Error,
    link::Handler,
    player::{self, Context, Player, Search},
    protocol::{self, Action, Inbound, Outbound, TrackInfo},
    publisher::Publisher,
    track::Track,
};

const NOT_CONNECTED: &str = "Not connected to a voice channel";
const NOTHING_PLAYING: &str = "Nothing is playing";
const QUEUE_UNAVAILABLE: &str = "Queue empty or not available";
const NO_QUERY: &str = "No search query given";
const NO_TRACKS: &str = "No tracks found";
const SEARCH_UNAVAILABLE: &str = "Search not available";
const SEARCH_TIMED_OUT: &str = "Search timed out";
const NO_VOICE_CHANNEL: &str = "No voice channel available";

/// A command that could not be carried out, with the message shown on the
/// dashboard.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("{0}")]
pub struct Failure(String);

impl Failure {
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }

    #[must_use]
    pub fn message(&self) -> &str {
        &self.0
    }
}

impl From<Error> for Failure {
    fn from(e: Error) -> Self {
        Self(e.message())
    }
}

type Outcome<T = String> = std::result::Result<T, Failure>;

pub struct Dispatcher {
    context: Arc<Context>,
    search: Arc<dyn Search>,
    publisher: Publisher,
    search_timeout: Duration,
}

impl Dispatcher {
    #[must_use]
    pub fn new(
        context: Arc<Context>,
        search: Arc<dyn Search>,
        publisher: Publisher,
        search_timeout: Duration,
    ) -> Self {
        Self {
            context,
            search,
            publisher,
            search_timeout,
        }
    }

    /// Handles one raw inbound frame.
    pub async fn dispatch(&self, frame: &str) {
        let (action, payload) = match Inbound::decode(frame) {
            Ok(Inbound::Command { action, payload }) => (action, payload),
            Ok(Inbound::HeartbeatAck) => {
                trace!("heartbeat acknowledged");
                return;
            }
            Ok(Inbound::Ignored) => {
                debug!("ignoring frame without action: {frame}");
                return;
            }
            Err(e) => {
                error!("dropping malformed frame {frame:?}: {e}");
                return;
            }
        };

        if let Action::Unknown(name) = &action {
            debug!("ignoring unknown action {name:?}");
            return;
        }

        if self.context.agent().is_none() {
            warn!("playback agent not ready, dropping {action}");
            return;
        }

        debug!("handling {action} with payload {payload}");
        let answer = match action {
            Action::Search => self.search(&payload).await,
            Action::Stop => {
                let outcome = self.stop().await;
                Self::answer(action, outcome)
            }
            _ => {
                let outcome = self.control(&action).await;
                Self::answer(action, outcome)
            }
        };

        self.publisher.send(answer).await;
    }

    fn answer(action: Action, outcome: Outcome) -> Outbound {
        let (success, message) = match outcome {
            Ok(message) => (true, message),
            Err(failure) => {
                warn!("{action} failed: {failure}");
                (false, failure.0)
            }
        };

        Outbound::CommandResponse {
            action,
            success,
            message,
        }
    }

    fn live_player(&self) -> Option<Arc<dyn Player>> {
        self.context.active_guild().and_then(|guild| guild.player())
    }

    /// Disconnects the active player, if any, and always publishes the idle
    /// state. Never stops first: that would start the next queued track.
    async fn stop(&self) -> Outcome {
        let outcome = match self.live_player() {
            Some(player) => player
                .disconnect()
                .await
                .map(|()| "Stopped playback and disconnected".to_owned())
                .map_err(Failure::from),
            None => Ok("Nothing to stop".to_owned()),
        };

        self.publisher.idle().await;
        outcome
    }

    /// Commands that operate on a live player.
    async fn control(&self, action: &Action) -> Outcome {
        let player = self.live_player().ok_or(Failure::new(NOT_CONNECTED))?;

        match action {
            Action::PlayPause => {
                if !player.is_playing() {
                    return Err(Failure::new(NOTHING_PLAYING));
                }
                let paused = player.is_paused();
                player.pause(!paused).await?;
                Ok(if paused { "Resumed" } else { "Paused" }.to_owned())
            }

            Action::Skip => {
                if !player.is_playing() {
                    return Err(Failure::new(NOTHING_PLAYING));
                }
                player.stop().await?;
                Ok("Skipped".to_owned())
            }

            Action::Previous => Err(Failure::new("Previous track is not supported")),

            Action::Loop => {
                let enabled = !player.queue_loop();
                player.set_queue_loop(enabled)?;
                Ok(format!(
                    "Queue loop {}",
                    if enabled { "enabled" } else { "disabled" }
                ))
            }

            Action::Shuffle => {
                if !player.has_queue() || player.queue_len() < 2 {
                    return Err(Failure::new(QUEUE_UNAVAILABLE));
                }
                player.shuffle_queue()?;
                self.publisher.queue(Some(player.as_ref())).await;
                Ok("Queue shuffled".to_owned())
            }

            Action::Stop | Action::Search | Action::Unknown(_) => {
                Err(Failure::new(format!("Unsupported action: {action}")))
            }
        }
    }

    async fn search(&self, payload: &Value) -> Outbound {
        match self.search_and_play(payload).await {
            Ok((message, track)) => Outbound::SearchResult {
                success: true,
                message,
                track: Some(TrackInfo::from(&track)),
            },
            Err(failure) => {
                warn!("search failed: {failure}");
                Outbound::SearchResult {
                    success: false,
                    message: failure.0,
                    track: None,
                }
            }
        }
    }

    /// Looks up the query and plays or enqueues the best match, joining a
    /// voice channel first if needed.
    async fn search_and_play(&self, payload: &Value) -> Outcome<(String, Track)> {
        let query = protocol::query(payload).ok_or(Failure::new(NO_QUERY))?;
        let guild = self
            .context
            .active_guild()
            .ok_or(Failure::new(SEARCH_UNAVAILABLE))?;

        let player = match guild.player() {
            Some(player) => player,
            None => {
                let channels = guild.voice_channels();
                let channel =
                    player::preferred_channel(&channels).ok_or(Failure::new(NO_VOICE_CHANNEL))?;
                info!("joining voice channel {channel} in guild {}", guild.id());
                guild.connect(channel).await?
            }
        };

        debug!("searching for {query:?}");
        let tracks = tokio::time::timeout(self.search_timeout, self.search.search(query))
            .await
            .map_err(|_| Failure::new(SEARCH_TIMED_OUT))??;
        let track = tracks
            .into_iter()
            .next()
            .ok_or(Failure::new(NO_TRACKS))?;

        if player.is_playing() {
            player.enqueue(track.clone())?;
            self.publisher.queue(Some(player.as_ref())).await;
            Ok((format!("Added to queue: {}", track.title), track))
        } else {
            player.play(track.clone()).await?;
            self.publisher
                .now_playing(Some(&track), Duration::ZERO)
                .await;
            Ok((format!("Now playing: {}", track.title), track))
        }
    }
}

#[async_trait]
impl Handler for Dispatcher {
    async fn handle(&self, frame: String) {
        self.dispatch(&frame).await;
    }
}
