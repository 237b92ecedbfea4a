//! Playback events and their mirroring to the dashboard.
//!
//! The playback agent reports track starts and ends as [`Event`]s. The
//! [`Listener`] turns them into state pushes:
//!
//! * a track start publishes the now-playing snapshot, then the queue
//! * a track that finished with nothing queued publishes the idle state,
//!   unless something else started playing within the grace period

use std::{fmt, sync::Arc, time::Duration};

use tokio::{sync::mpsc, task::JoinSet};

use crate::{player::Player, publisher::Publisher, track::Track};

/// Why a track stopped playing.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum EndReason {
    /// Played to the end.
    Finished,
    LoadFailed,
    /// Stopped explicitly, e.g. skipped.
    Stopped,
    /// Replaced by another track.
    Replaced,
    /// The player was torn down.
    Cleanup,
}

impl fmt::Display for EndReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Finished => write!(f, "finished"),
            Self::LoadFailed => write!(f, "load failed"),
            Self::Stopped => write!(f, "stopped"),
            Self::Replaced => write!(f, "replaced"),
            Self::Cleanup => write!(f, "cleanup"),
        }
    }
}

/// Events emitted by the playback agent.
#[derive(Clone)]
pub enum Event {
    TrackStart {
        player: Arc<dyn Player>,
        track: Track,
    },
    TrackEnd {
        player: Arc<dyn Player>,
        track: Track,
        reason: EndReason,
    },
}

impl fmt::Debug for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TrackStart { track, .. } => f
                .debug_struct("TrackStart")
                .field("track", track)
                .finish_non_exhaustive(),
            Self::TrackEnd { track, reason, .. } => f
                .debug_struct("TrackEnd")
                .field("track", track)
                .field("reason", reason)
                .finish_non_exhaustive(),
        }
    }
}

/// Mirrors playback events to the dashboard.
#[derive(Clone, Debug)]
pub struct Listener {
    publisher: Publisher,
    idle_grace: Duration,
}

impl Listener {
    #[must_use]
    pub fn new(publisher: Publisher, idle_grace: Duration) -> Self {
        Self {
            publisher,
            idle_grace,
        }
    }

    /// Handles one event to completion, including the grace period of a
    /// finished track.
    pub async fn handle(&self, event: Event) {
        match event {
            Event::TrackStart { player, track } => {
                // Stopped or replaced before we got to it.
                if player.current().as_ref() != Some(&track) {
                    debug!("skipping stale track start: {track}");
                    return;
                }

                info!("now playing: {track}");
                self.publisher.player_state(player.as_ref()).await;
                self.publisher.queue(Some(player.as_ref())).await;
            }

            Event::TrackEnd {
                player,
                track,
                reason,
            } => {
                debug!("track ended ({reason}): {track}");
                if reason != EndReason::Finished || player.queue_len() > 0 {
                    return;
                }

                tokio::time::sleep(self.idle_grace).await;
                if player.is_playing() {
                    trace!("playback resumed within grace period");
                } else {
                    self.publisher.idle().await;
                }
            }
        }
    }

    /// Drains `events` until every sender is gone.
    ///
    /// Track ends are handled on their own task so the grace period does not
    /// hold back the events behind them. Those tasks belong to this future:
    /// dropping or aborting it cancels them.
    pub async fn run(self, mut events: mpsc::UnboundedReceiver<Event>) {
        let mut pending = JoinSet::new();

        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Some(event @ Event::TrackStart { .. }) => self.handle(event).await,
                    Some(event @ Event::TrackEnd { .. }) => {
                        let listener = self.clone();
                        pending.spawn(async move { listener.handle(event).await });
                    }
                    None => break,
                },

                Some(joined) = pending.join_next(), if !pending.is_empty() => {
                    if let Err(e) = joined {
                        if e.is_panic() {
                            error!("track end handler panicked: {e}");
                        }
                    }
                }
            }
        }

        // Let pending grace periods run out.
        while pending.join_next().await.is_some() {}
        trace!("event listener stopped");
    }
}

#[cfg(test)]
mod tests {
    use tokio::sync::mpsc;

    use super::*;
    use crate::{
        config::Config,
        endpoint::Endpoint,
        link::{Handler, Link, LinkState},
        local::LocalAgent,
        player::{Guild, VoiceChannel},
        transport::testing::{MockConnector, Remote},
    };

    struct Mute;

    #[async_trait::async_trait]
    impl Handler for Mute {
        async fn handle(&self, _frame: String) {}
    }

    async fn connected() -> (Link, Remote, Listener) {
        let config = Config::new(Endpoint::default(), "secret".parse().unwrap());
        let (connector, mut remotes) = MockConnector::new();
        let link = Link::new(&config, connector);

        link.start(Arc::new(Mute)).await;
        let remote = remotes.recv().await.unwrap();
        link.handle()
            .subscribe()
            .wait_for(|state| *state == LinkState::Connected)
            .await
            .unwrap();

        let listener = Listener::new(
            Publisher::new(link.handle(), config.queue_preview_len),
            config.idle_grace,
        );
        (link, remote, listener)
    }

    /// Asserts nothing but heartbeats was sent.
    fn assert_quiet(remote: &mut Remote) {
        while let Ok(frame) = remote.outbound.try_recv() {
            assert_eq!(frame, r#"{"type":"heartbeat"}"#);
        }
    }

    fn lounge() -> VoiceChannel {
        VoiceChannel {
            id: 1,
            name: "lounge".to_owned(),
            listeners: 1,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn track_start_publishes_now_playing_then_queue() {
        let (link, mut remote, listener) = connected().await;
        let (events, mut rx) = mpsc::unbounded_channel();
        let mut agent = LocalAgent::new(events);
        let guild = agent.add_guild(1, vec![lounge()]);
        let player = guild.connect(&lounge()).await.unwrap();

        player
            .play(Track::new("One", "Band", Duration::from_secs(60)))
            .await
            .unwrap();
        player
            .enqueue(Track::new("Two", "Band", Duration::from_secs(60)))
            .unwrap();
        listener.handle(rx.recv().await.unwrap()).await;

        let now_playing = remote.next_message().await;
        assert_eq!(now_playing["type"], "now_playing");
        assert_eq!(now_playing["title"], "One");
        let queue = remote.next_message().await;
        assert_eq!(queue["queue"][0]["title"], "Two");

        link.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn finished_track_with_empty_queue_goes_idle_after_grace() {
        let (link, mut remote, listener) = connected().await;
        let (events, mut rx) = mpsc::unbounded_channel();
        let mut agent = LocalAgent::new(events);
        let guild = agent.add_guild(1, vec![lounge()]);
        let player = guild.connect(&lounge()).await.unwrap();

        player
            .play(Track::new("One", "Band", Duration::from_secs(60)))
            .await
            .unwrap();
        let start = rx.recv().await.unwrap();
        listener.handle(start).await;
        remote.next_message().await;
        remote.next_message().await;

        let ended = rx.recv().await.unwrap();
        assert!(matches!(
            ended,
            Event::TrackEnd {
                reason: EndReason::Finished,
                ..
            }
        ));

        let started = tokio::time::Instant::now();
        listener.handle(ended).await;
        assert_eq!(started.elapsed(), Duration::from_secs(1));

        let idle = remote.next_message().await;
        assert_eq!(idle["title"], "No track playing");
        link.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn resumed_playback_suppresses_idle() {
        let (link, mut remote, listener) = connected().await;
        let (events, mut rx) = mpsc::unbounded_channel();
        let mut agent = LocalAgent::new(events);
        let guild = agent.add_guild(1, vec![lounge()]);
        let player = guild.connect(&lounge()).await.unwrap();

        player
            .play(Track::new("One", "Band", Duration::from_secs(60)))
            .await
            .unwrap();
        let _start = rx.recv().await.unwrap();
        let ended = rx.recv().await.unwrap();

        player
            .play(Track::new("Two", "Band", Duration::from_secs(60)))
            .await
            .unwrap();
        listener.handle(ended).await;
        assert_quiet(&mut remote);

        link.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn stopped_tracks_do_not_go_idle() {
        let (link, mut remote, listener) = connected().await;
        let (events, _rx) = mpsc::unbounded_channel();
        let mut agent = LocalAgent::new(events);
        let guild = agent.add_guild(1, vec![lounge()]);
        let player = guild.connect(&lounge()).await.unwrap();

        listener
            .handle(Event::TrackEnd {
                player,
                track: Track::new("One", "Band", Duration::from_secs(60)),
                reason: EndReason::Stopped,
            })
            .await;
        assert_quiet(&mut remote);

        link.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn track_start_of_torn_down_player_is_skipped() {
        let (link, mut remote, listener) = connected().await;
        let (events, mut rx) = mpsc::unbounded_channel();
        let mut agent = LocalAgent::new(events);
        let guild = agent.add_guild(1, vec![lounge()]);
        let player = guild.connect(&lounge()).await.unwrap();

        player
            .play(Track::new("One", "Band", Duration::from_secs(60)))
            .await
            .unwrap();
        let start = rx.recv().await.unwrap();
        player.disconnect().await.unwrap();

        listener.handle(start).await;
        assert_quiet(&mut remote);

        link.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn aborting_run_cancels_pending_idle_pushes() {
        let (link, mut remote, listener) = connected().await;
        let (events, _rx) = mpsc::unbounded_channel();
        let mut agent = LocalAgent::new(events);
        let guild = agent.add_guild(1, vec![lounge()]);
        let player = guild.connect(&lounge()).await.unwrap();

        let (tx, rx) = mpsc::unbounded_channel();
        let running = tokio::spawn(listener.run(rx));
        tx.send(Event::TrackEnd {
            player,
            track: Track::new("One", "Band", Duration::from_secs(60)),
            reason: EndReason::Finished,
        })
        .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        running.abort();
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_quiet(&mut remote);

        link.close().await;
    }
}
