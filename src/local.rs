//! A silent, in-process playback agent.
//!
//! [`LocalAgent`] behaves like a voice bot whose players keep time without
//! producing audio: tracks start, end after their length and advance through
//! the queue, emitting the same [`Event`]s a real agent would. It lets the
//! link run end to end without a chat platform attached.

use std::{
    collections::VecDeque,
    sync::{Arc, Mutex, MutexGuard, PoisonError, Weak},
    time::Duration,
};

use async_trait::async_trait;
use tokio::{sync::mpsc, time::Instant};

use crate::{
    error::{Error, Result},
    events::{EndReason, Event},
    player::{Agent, Guild, Player, VoiceChannel},
    track::Track,
};

/// The in-process playback agent.
pub struct LocalAgent {
    events: mpsc::UnboundedSender<Event>,
    guilds: Vec<Arc<LocalGuild>>,
}

impl LocalAgent {
    /// Creates an agent without guilds whose players report to `events`.
    #[must_use]
    pub fn new(events: mpsc::UnboundedSender<Event>) -> Self {
        Self {
            events,
            guilds: Vec::new(),
        }
    }

    /// Adds a guild with the given voice channels.
    pub fn add_guild(&mut self, id: u64, channels: Vec<VoiceChannel>) -> Arc<LocalGuild> {
        let guild = Arc::new(LocalGuild {
            id,
            channels,
            events: self.events.clone(),
            player: Mutex::new(None),
        });
        self.guilds.push(Arc::clone(&guild));
        guild
    }
}

impl Agent for LocalAgent {
    fn guilds(&self) -> Vec<Arc<dyn Guild>> {
        self.guilds
            .iter()
            .map(|guild| Arc::clone(guild) as Arc<dyn Guild>)
            .collect()
    }
}

pub struct LocalGuild {
    id: u64,
    channels: Vec<VoiceChannel>,
    events: mpsc::UnboundedSender<Event>,
    player: Mutex<Option<LocalPlayer>>,
}

impl LocalGuild {
    /// The connected player of this guild, if any.
    #[must_use]
    pub fn local_player(&self) -> Option<LocalPlayer> {
        let mut slot = self.player.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.as_ref().is_some_and(|player| !player.is_connected()) {
            *slot = None;
        }
        slot.clone()
    }
}

#[async_trait]
impl Guild for LocalGuild {
    fn id(&self) -> u64 {
        self.id
    }

    fn player(&self) -> Option<Arc<dyn Player>> {
        self.local_player()
            .map(|player| Arc::new(player) as Arc<dyn Player>)
    }

    fn voice_channels(&self) -> Vec<VoiceChannel> {
        self.channels.clone()
    }

    async fn connect(&self, channel: &VoiceChannel) -> Result<Arc<dyn Player>> {
        if !self.channels.iter().any(|known| known.id == channel.id) {
            return Err(Error::not_found(format!(
                "voice channel {channel} not in guild {}",
                self.id
            )));
        }

        let player = match self.local_player() {
            Some(player) => {
                player.state().channel = channel.clone();
                player
            }
            None => {
                let player = LocalPlayer::new(channel.clone(), self.events.clone());
                *self.player.lock().unwrap_or_else(PoisonError::into_inner) = Some(player.clone());
                player
            }
        };

        debug!("guild {} player joined {channel}", self.id);
        Ok(Arc::new(player))
    }
}

struct State {
    channel: VoiceChannel,
    connected: bool,

    current: Option<Track>,
    paused: bool,
    /// Play time accumulated up to `resumed_at`.
    elapsed: Duration,
    /// Set while the clock runs.
    resumed_at: Option<Instant>,

    queue: VecDeque<Track>,
    queue_loop: bool,

    /// Bumped on every change that invalidates a pending end timer.
    epoch: u64,
}

impl State {
    fn position(&self) -> Duration {
        let position = self.elapsed + self.resumed_at.map_or(Duration::ZERO, |at| at.elapsed());
        match &self.current {
            Some(track) if !track.is_stream() => position.min(track.length),
            _ => position,
        }
    }

    /// Makes `track` current with the clock running from zero.
    fn load(&mut self, track: Option<Track>) -> Option<Track> {
        self.epoch += 1;
        self.paused = false;
        self.elapsed = Duration::ZERO;
        self.resumed_at = track.as_ref().map(|_| Instant::now());
        std::mem::replace(&mut self.current, track)
    }

    /// Ends the current track and moves on to the next queued one.
    fn advance(&mut self) -> (Option<Track>, Option<Track>) {
        let next = self.queue.pop_front();
        let ended = self.load(next.clone());
        if self.queue_loop {
            if let Some(ended) = &ended {
                self.queue.push_back(ended.clone());
            }
        }
        (ended, next)
    }

    fn remaining(&self) -> Option<Duration> {
        let track = self.current.as_ref()?;
        (!track.is_stream() && !self.paused).then(|| track.length.saturating_sub(self.position()))
    }
}

struct Inner {
    state: Mutex<State>,
    events: mpsc::UnboundedSender<Event>,
}

/// A player of a [`LocalGuild`].
#[derive(Clone)]
pub struct LocalPlayer {
    inner: Arc<Inner>,
}

impl LocalPlayer {
    fn new(channel: VoiceChannel, events: mpsc::UnboundedSender<Event>) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State {
                    channel,
                    connected: true,
                    current: None,
                    paused: false,
                    elapsed: Duration::ZERO,
                    resumed_at: None,
                    queue: VecDeque::new(),
                    queue_loop: false,
                    epoch: 0,
                }),
                events,
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    #[must_use]
    pub fn channel(&self) -> VoiceChannel {
        self.state().channel.clone()
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.state().connected
    }

    fn connected_state(&self) -> Result<MutexGuard<'_, State>> {
        let state = self.state();
        if state.connected {
            Ok(state)
        } else {
            Err(Error::failed_precondition("player is disconnected"))
        }
    }

    /// Ends the current track after its remaining time, unless something
    /// else changes the player first.
    fn arm(&self, state: &State) {
        let Some(remaining) = state.remaining() else {
            return;
        };

        let epoch = state.epoch;
        let player = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            tokio::time::sleep(remaining).await;
            if let Some(inner) = Weak::upgrade(&player) {
                LocalPlayer { inner }.finish(epoch);
            }
        });
    }

    fn finish(&self, epoch: u64) {
        let (ended, next) = {
            let mut state = self.state();
            if state.epoch != epoch || !state.connected {
                return;
            }
            let transition = state.advance();
            self.arm(&state);
            transition
        };

        self.transitioned(ended, EndReason::Finished, next);
    }

    fn transitioned(&self, ended: Option<Track>, reason: EndReason, next: Option<Track>) {
        if let Some(track) = ended {
            trace!("track ended ({reason}): {track}");
            self.emit(Event::TrackEnd {
                player: Arc::new(self.clone()),
                track,
                reason,
            });
        }
        if let Some(track) = next {
            self.emit(Event::TrackStart {
                player: Arc::new(self.clone()),
                track,
            });
        }
    }

    fn emit(&self, event: Event) {
        if self.inner.events.send(event).is_err() {
            trace!("no event listener");
        }
    }
}

#[async_trait]
impl Player for LocalPlayer {
    fn is_playing(&self) -> bool {
        self.state().current.is_some()
    }

    fn is_paused(&self) -> bool {
        self.state().paused
    }

    fn current(&self) -> Option<Track> {
        self.state().current.clone()
    }

    fn position(&self) -> Duration {
        self.state().position()
    }

    async fn pause(&self, paused: bool) -> Result<()> {
        let mut state = self.connected_state()?;
        if state.current.is_none() || state.paused == paused {
            return Ok(());
        }

        state.epoch += 1;
        state.paused = paused;
        if paused {
            let position = state.position();
            state.elapsed = position;
            state.resumed_at = None;
        } else {
            state.resumed_at = Some(Instant::now());
            self.arm(&state);
        }
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        let (ended, next) = {
            let mut state = self.connected_state()?;
            let transition = state.advance();
            self.arm(&state);
            transition
        };

        self.transitioned(ended, EndReason::Stopped, next);
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        let ended = {
            let mut state = self.state();
            if !state.connected {
                return Ok(());
            }
            state.connected = false;
            state.queue.clear();
            state.load(None)
        };

        debug!("player left voice channel");
        self.transitioned(ended, EndReason::Cleanup, None);
        Ok(())
    }

    async fn play(&self, track: Track) -> Result<()> {
        let replaced = {
            let mut state = self.connected_state()?;
            let replaced = state.load(Some(track.clone()));
            self.arm(&state);
            replaced
        };

        self.transitioned(replaced, EndReason::Replaced, Some(track));
        Ok(())
    }

    fn has_queue(&self) -> bool {
        true
    }

    fn queue_len(&self) -> usize {
        self.state().queue.len()
    }

    fn queued(&self) -> Vec<Track> {
        self.state().queue.iter().cloned().collect()
    }

    fn enqueue(&self, track: Track) -> Result<()> {
        self.connected_state()?.queue.push_back(track);
        Ok(())
    }

    fn shuffle_queue(&self) -> Result<()> {
        let mut state = self.connected_state()?;
        fastrand::shuffle(state.queue.make_contiguous());
        Ok(())
    }

    fn queue_loop(&self) -> bool {
        self.state().queue_loop
    }

    fn set_queue_loop(&self, enabled: bool) -> Result<()> {
        self.connected_state()?.queue_loop = enabled;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lounge() -> VoiceChannel {
        VoiceChannel {
            id: 7,
            name: "lounge".to_owned(),
            listeners: 0,
        }
    }

    fn song(title: &str, secs: u64) -> Track {
        Track::new(title, "Band", Duration::from_secs(secs))
    }

    async fn player() -> (Arc<LocalGuild>, Arc<dyn Player>, mpsc::UnboundedReceiver<Event>) {
        let (events, rx) = mpsc::unbounded_channel();
        let mut agent = LocalAgent::new(events);
        let guild = agent.add_guild(3, vec![lounge()]);
        let player = guild.connect(&lounge()).await.unwrap();
        (guild, player, rx)
    }

    fn started(event: Event) -> String {
        match event {
            Event::TrackStart { track, .. } => track.title,
            other => panic!("expected track start, got {other:?}"),
        }
    }

    fn ended(event: Event) -> (String, EndReason) {
        match event {
            Event::TrackEnd { track, reason, .. } => (track.title, reason),
            other => panic!("expected track end, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn unknown_channels_are_refused() {
        let (events, _rx) = mpsc::unbounded_channel();
        let mut agent = LocalAgent::new(events);
        let guild = agent.add_guild(3, vec![lounge()]);

        let elsewhere = VoiceChannel {
            id: 99,
            name: "elsewhere".to_owned(),
            listeners: 0,
        };
        assert!(guild.connect(&elsewhere).await.is_err());
        assert!(guild.player().is_none());
        assert_eq!(agent.guilds().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn clock_pauses_and_resumes() {
        let (_guild, player, _rx) = player().await;
        player.play(song("One", 100)).await.unwrap();

        tokio::time::sleep(Duration::from_secs(10)).await;
        player.pause(true).await.unwrap();
        tokio::time::sleep(Duration::from_secs(500)).await;
        assert_eq!(player.position(), Duration::from_secs(10));
        assert!(player.is_playing());

        player.pause(false).await.unwrap();
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(player.position(), Duration::from_secs(15));
    }

    #[tokio::test(start_paused = true)]
    async fn finished_tracks_advance_the_queue() {
        let (_guild, player, mut rx) = player().await;
        player.play(song("One", 60)).await.unwrap();
        player.enqueue(song("Two", 60)).unwrap();
        assert_eq!(started(rx.recv().await.unwrap()), "One");

        assert_eq!(
            ended(rx.recv().await.unwrap()),
            ("One".to_owned(), EndReason::Finished)
        );
        assert_eq!(started(rx.recv().await.unwrap()), "Two");
        assert_eq!(player.queue_len(), 0);

        assert_eq!(
            ended(rx.recv().await.unwrap()),
            ("Two".to_owned(), EndReason::Finished)
        );
        assert!(!player.is_playing());
    }

    #[tokio::test(start_paused = true)]
    async fn queue_loop_requeues_finished_tracks() {
        let (_guild, player, mut rx) = player().await;
        player.set_queue_loop(true).unwrap();
        player.play(song("One", 30)).await.unwrap();
        player.enqueue(song("Two", 30)).unwrap();
        assert_eq!(started(rx.recv().await.unwrap()), "One");

        ended(rx.recv().await.unwrap());
        assert_eq!(started(rx.recv().await.unwrap()), "Two");
        assert_eq!(player.queued(), vec![song("One", 30)]);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_skips_to_next() {
        let (_guild, player, mut rx) = player().await;
        player.play(song("One", 60)).await.unwrap();
        player.enqueue(song("Two", 60)).unwrap();
        started(rx.recv().await.unwrap());

        player.stop().await.unwrap();
        assert_eq!(
            ended(rx.recv().await.unwrap()),
            ("One".to_owned(), EndReason::Stopped)
        );
        assert_eq!(started(rx.recv().await.unwrap()), "Two");
        assert_eq!(player.position(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn streams_never_end() {
        let (_guild, player, mut rx) = player().await;
        player.play(song("Radio", 0)).await.unwrap();
        started(rx.recv().await.unwrap());

        tokio::time::sleep(Duration::from_secs(3600)).await;
        assert!(player.is_playing());
        assert_eq!(player.position(), Duration::from_secs(3600));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_detaches_player() {
        let (guild, player, mut rx) = player().await;
        player.play(song("One", 60)).await.unwrap();
        player.enqueue(song("Two", 60)).unwrap();
        started(rx.recv().await.unwrap());

        player.disconnect().await.unwrap();
        assert_eq!(
            ended(rx.recv().await.unwrap()),
            ("One".to_owned(), EndReason::Cleanup)
        );
        assert!(guild.player().is_none());
        assert!(player.play(song("Three", 60)).await.is_err());

        // Reconnecting gives a fresh player.
        let fresh = guild.connect(&lounge()).await.unwrap();
        assert!(!fresh.is_playing());
        assert_eq!(fresh.queue_len(), 0);
    }

    #[tokio::test]
    async fn shuffle_keeps_tracks() {
        let (_guild, player, _rx) = player().await;
        for n in 0..20 {
            player.enqueue(song(&format!("Song {n}"), 60)).unwrap();
        }
        player.shuffle_queue().unwrap();

        let mut titles: Vec<_> = player.queued().into_iter().map(|track| track.title).collect();
        titles.sort();
        let mut expected: Vec<_> = (0..20).map(|n| format!("Song {n}")).collect();
        expected.sort();
        assert_eq!(titles, expected);
    }
}
