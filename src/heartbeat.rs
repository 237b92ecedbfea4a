//! Periodic liveness frames.
//!
//! The dashboard drops sessions it has not heard from in a while, and a
//! write on a half-open connection is the fastest way to notice it is gone.
//! Each generation of the link runs exactly one monitor, which ends together
//! with its generation.

use std::{sync::Arc, time::Duration};

use tokio::time::{self, Instant, MissedTickBehavior};

use crate::{link::Generation, protocol::Outbound};

/// Sends a heartbeat every `period` until the generation ends.
///
/// The first heartbeat goes out one full period after the generation
/// started. A failed or timed out send fails the generation, which makes the
/// supervisor reconnect, and stops the monitor. A send still in flight when
/// the generation ends is abandoned.
pub async fn run(generation: Arc<Generation>, period: Duration) {
    let mut ticks = time::interval_at(Instant::now() + period, period);
    ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;

            () = generation.ended() => break,

            _ = ticks.tick() => {
                let sent = tokio::select! {
                    biased;

                    () = generation.ended() => break,
                    sent = generation.session().send(&Outbound::Heartbeat) => sent,
                };

                if let Err(e) = sent {
                    generation.fail(&format!("heartbeat failed: {e}"));
                    break;
                }
                trace!("heartbeat sent on generation {}", generation.id());
            }
        }
    }
}
