//! Pushes playback state to the dashboard.

use std::time::Duration;

use crate::{
    link::{Delivery, Handle},
    player::Player,
    protocol::{Outbound, PlaybackSnapshot, QueueSnapshot},
    track::Track,
};

/// Formats snapshots from live player state and sends them over the link.
///
/// Every publish is a no-op while the link is down, and a failed send only
/// degrades the link: nothing here returns an error or retries.
#[derive(Clone, Debug)]
pub struct Publisher {
    link: Handle,
    queue_preview_len: usize,
}

impl Publisher {
    #[must_use]
    pub fn new(link: Handle, queue_preview_len: usize) -> Self {
        Self {
            link,
            queue_preview_len,
        }
    }

    /// Publishes `track` at `position`, or the canonical idle snapshot for
    /// `None`.
    pub async fn now_playing(&self, track: Option<&Track>, position: Duration) -> Delivery {
        let snapshot = match track {
            Some(track) => PlaybackSnapshot::playing(track, position),
            None => PlaybackSnapshot::idle(),
        };
        self.send(Outbound::NowPlaying(snapshot)).await
    }

    pub async fn idle(&self) -> Delivery {
        self.now_playing(None, Duration::ZERO).await
    }

    /// Publishes what `player` is playing right now.
    pub async fn player_state(&self, player: &dyn Player) -> Delivery {
        self.now_playing(player.current().as_ref(), player.position())
            .await
    }

    /// Publishes the upcoming tracks of `player`, or an empty queue.
    pub async fn queue(&self, player: Option<&dyn Player>) -> Delivery {
        let queued = player.map(|player| player.queued()).unwrap_or_default();
        let snapshot = QueueSnapshot::new(&queued, self.queue_preview_len);
        if queued.len() > snapshot.len() {
            trace!(
                "queue of {} tracks truncated to {}",
                queued.len(),
                snapshot.len()
            );
        }
        self.send(Outbound::QueueUpdate(snapshot)).await
    }

    /// Sends any frame, subject to the same rules as the snapshots.
    pub async fn send(&self, frame: Outbound) -> Delivery {
        let kind = frame.kind();
        let delivery = self.link.send(&frame).await;
        match delivery {
            Delivery::Sent => trace!("published {kind}"),
            Delivery::NotConnected => debug!("link down, dropped {kind}"),
            Delivery::Failed => debug!("publishing {kind} failed, link degraded"),
        }
        delivery
    }
}
