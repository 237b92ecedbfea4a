//! The self-healing link to the dashboard.
//!
//! A [`Link`] owns a single supervisor task that drives the connection
//! through its states:
//!
//! ```text
//! Idle -> Connecting -> Connected -> Connecting -> ... -> GivenUp
//!                    \-> Closing -> Idle (on close)
//! ```
//!
//! Every successful connect starts a new [`Generation`]: the session plus
//! exactly one receive loop and one heartbeat monitor bound to it. Any
//! failure of the generation (the remote hanging up, a receive error, a
//! failed heartbeat or a failed state push) cancels the generation's token.
//! The supervisor then stops the generation's tasks, closes the session and
//! reconnects. Callbacks holding on to a stale generation cannot affect the
//! current one.
//!
//! # Retry policy
//!
//! Failed connect attempts are retried after a constant backoff. Reaching
//! [`RetryPolicy::max_attempts`] consecutive failures, or the lifetime cap,
//! moves the link to [`LinkState::GivenUp`]: no further attempts are made
//! until [`Link::start`] is called again. The consecutive counter resets on
//! every successful connect; both counters reset on `start`.

use std::{
    fmt,
    sync::{
        atomic::{AtomicU32, AtomicU64, Ordering},
        Arc, PoisonError, RwLock,
    },
    time::Duration,
};

use async_trait::async_trait;
use futures_util::StreamExt;
use tokio::{sync::watch, task::JoinHandle, task::JoinSet};
use tokio_util::sync::CancellationToken;

use crate::{
    config::{Config, RetryPolicy},
    endpoint::Endpoint,
    heartbeat,
    protocol::Outbound,
    token::ApiToken,
    transport::{Connector, FrameStream, Session},
};

/// Connection state of the link.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub enum LinkState {
    /// Not started, or closed.
    #[default]
    Idle,
    Connecting,
    Connected,
    Closing,
    /// Retries exhausted. Terminal until the link is started again.
    GivenUp,
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Connecting => write!(f, "connecting"),
            Self::Connected => write!(f, "connected"),
            Self::Closing => write!(f, "closing"),
            Self::GivenUp => write!(f, "given up"),
        }
    }
}

/// Outcome of sending a frame through a [`Handle`].
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Delivery {
    Sent,
    /// The link was down; nothing was sent.
    NotConnected,
    /// The send failed and the link is now reconnecting.
    Failed,
}

/// Receives inbound frames of the link.
#[async_trait]
pub trait Handler: Send + Sync + 'static {
    /// Handles one raw frame. Must not fail: errors are dealt with inside.
    async fn handle(&self, frame: String);
}

/// One underlying connection and the tasks bound to it.
pub struct Generation {
    id: u64,
    session: Session,
    failed: CancellationToken,
}

impl Generation {
    fn new(id: u64, session: Session) -> Self {
        Self {
            id,
            session,
            failed: CancellationToken::new(),
        }
    }

    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[must_use]
    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Marks this generation as failed, which makes the supervisor
    /// reconnect. Only the first failure is reported.
    pub fn fail(&self, reason: &str) {
        if !self.failed.is_cancelled() {
            warn!("link generation {} failed: {reason}", self.id);
            self.failed.cancel();
        }
    }

    #[must_use]
    pub fn is_live(&self) -> bool {
        !self.failed.is_cancelled()
    }

    /// Completes when the generation has failed or is being shut down.
    pub async fn ended(&self) {
        self.failed.cancelled().await;
    }
}

struct Shared {
    state: watch::Sender<LinkState>,
    current: RwLock<Option<Arc<Generation>>>,
    attempts: AtomicU32,
    lifetime_failures: AtomicU32,
    generations: AtomicU64,
}

/// Cheap, cloneable access to the link for components that send frames.
#[derive(Clone)]
pub struct Handle {
    shared: Arc<Shared>,
}

impl Handle {
    fn new() -> Self {
        let (state, _) = watch::channel(LinkState::Idle);
        Self {
            shared: Arc::new(Shared {
                state,
                current: RwLock::new(None),
                attempts: AtomicU32::new(0),
                lifetime_failures: AtomicU32::new(0),
                generations: AtomicU64::new(0),
            }),
        }
    }

    #[must_use]
    pub fn state(&self) -> LinkState {
        *self.shared.state.borrow()
    }

    /// Watches state transitions.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<LinkState> {
        self.shared.state.subscribe()
    }

    /// Failed connect attempts in the current reconnection episode.
    #[must_use]
    pub fn attempts(&self) -> u32 {
        self.shared.attempts.load(Ordering::SeqCst)
    }

    /// Whether a live generation exists right now.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.current().is_some()
    }

    /// Sends `frame` on the current generation.
    ///
    /// Does nothing when the link is down. A failed send fails the
    /// generation instead of returning an error, so callers never block on
    /// or retry a dead link.
    pub async fn send(&self, frame: &Outbound) -> Delivery {
        let Some(generation) = self.current() else {
            debug!("link down, not sending {}", frame.kind());
            return Delivery::NotConnected;
        };

        match generation.session.send(frame).await {
            Ok(()) => Delivery::Sent,
            Err(e) => {
                generation.fail(&format!("sending {} failed: {e}", frame.kind()));
                Delivery::Failed
            }
        }
    }

    fn current(&self) -> Option<Arc<Generation>> {
        self.shared
            .current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .filter(|generation| generation.is_live())
            .cloned()
    }

    fn set_state(&self, state: LinkState) {
        let previous = self.shared.state.send_replace(state);
        if previous != state {
            debug!("link state: {previous} -> {state}");
        }
    }

    fn install(&self, generation: Arc<Generation>) {
        *self
            .shared
            .current
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(generation);
        self.set_state(LinkState::Connected);
    }

    fn uninstall(&self, id: u64) {
        let mut current = self
            .shared
            .current
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if current.as_ref().is_some_and(|generation| generation.id == id) {
            *current = None;
        }
    }

    fn reset_attempts(&self) {
        self.shared.attempts.store(0, Ordering::SeqCst);
        self.shared.lifetime_failures.store(0, Ordering::SeqCst);
    }
}

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handle")
            .field("state", &self.state())
            .field("attempts", &self.attempts())
            .finish()
    }
}

struct Supervision {
    shutdown: CancellationToken,
    task: JoinHandle<()>,
}

/// The link to the dashboard.
pub struct Link {
    endpoint: Endpoint,
    token: ApiToken,
    retry: RetryPolicy,
    heartbeat_interval: Duration,
    connector: Arc<dyn Connector>,
    handle: Handle,
    supervision: tokio::sync::Mutex<Option<Supervision>>,
}

impl Link {
    #[must_use]
    pub fn new(config: &Config, connector: Arc<dyn Connector>) -> Self {
        Self {
            endpoint: config.endpoint.clone(),
            token: config.api_token.clone(),
            retry: config.retry,
            heartbeat_interval: config.heartbeat_interval,
            connector,
            handle: Handle::new(),
            supervision: tokio::sync::Mutex::new(None),
        }
    }

    #[must_use]
    pub fn handle(&self) -> Handle {
        self.handle.clone()
    }

    #[must_use]
    pub fn state(&self) -> LinkState {
        self.handle.state()
    }

    /// Starts connecting, routing inbound frames to `handler`.
    ///
    /// Does nothing while the link is already running. After the link gave
    /// up, this is the explicit restart: attempt counters are reset.
    pub async fn start(&self, handler: Arc<dyn Handler>) {
        let mut supervision = self.supervision.lock().await;
        if supervision
            .as_ref()
            .is_some_and(|running| !running.task.is_finished())
        {
            debug!("link already running");
            return;
        }

        self.handle.reset_attempts();
        self.handle.set_state(LinkState::Connecting);

        let shutdown = CancellationToken::new();
        let supervisor = Supervisor {
            endpoint: self.endpoint.clone(),
            token: self.token.clone(),
            retry: self.retry,
            heartbeat_interval: self.heartbeat_interval,
            connector: Arc::clone(&self.connector),
            handle: self.handle.clone(),
            handler,
            shutdown: shutdown.clone(),
        };

        *supervision = Some(Supervision {
            shutdown,
            task: tokio::spawn(supervisor.run()),
        });
    }

    /// Closes the link and stops reconnecting. Safe to call more than once.
    pub async fn close(&self) {
        if let Some(supervision) = self.supervision.lock().await.take() {
            self.handle.set_state(LinkState::Closing);
            supervision.shutdown.cancel();
            if let Err(e) = supervision.task.await {
                error!("link supervisor ended abnormally: {e}");
            }
            info!("link to {} closed", self.endpoint);
        }

        self.handle.set_state(LinkState::Idle);
    }
}

/// The single task owning the connection lifecycle.
struct Supervisor {
    endpoint: Endpoint,
    token: ApiToken,
    retry: RetryPolicy,
    heartbeat_interval: Duration,
    connector: Arc<dyn Connector>,
    handle: Handle,
    handler: Arc<dyn Handler>,
    shutdown: CancellationToken,
}

impl Supervisor {
    async fn run(self) {
        while let Some(session) = self.connect().await {
            let id = self.handle.shared.generations.fetch_add(1, Ordering::SeqCst) + 1;
            let generation = Arc::new(Generation::new(id, session));
            let Some(frames) = generation.session.receive() else {
                error!("session of generation {id} has no reader");
                generation.session.close().await;
                continue;
            };

            self.handle.install(Arc::clone(&generation));
            info!("connected to {} (generation {id})", self.endpoint);

            let receiver = tokio::spawn(receive(
                Arc::clone(&generation),
                frames,
                Arc::clone(&self.handler),
            ));
            let heartbeat = tokio::spawn(heartbeat::run(
                Arc::clone(&generation),
                self.heartbeat_interval,
            ));

            tokio::select! {
                biased;

                () = self.shutdown.cancelled() => generation.failed.cancel(),
                () = generation.ended() => {}
            }

            self.handle.uninstall(id);
            for (name, task) in [("receive loop", receiver), ("heartbeat", heartbeat)] {
                task.abort();
                match task.await {
                    Err(e) if e.is_panic() => {
                        error!("{name} of generation {id} panicked: {e}");
                    }
                    _ => {}
                }
            }
            generation.session.close().await;

            if self.shutdown.is_cancelled() {
                break;
            }

            info!("connection to {} lost, reconnecting", self.endpoint);
            self.handle.set_state(LinkState::Connecting);
        }

        trace!("link supervisor stopped");
    }

    /// Attempts to connect until success, shutdown or exhausted retries.
    async fn connect(&self) -> Option<Session> {
        let shared = &self.handle.shared;
        let max_attempts = self.retry.max_attempts.get();

        loop {
            if self.shutdown.is_cancelled() {
                return None;
            }
            self.handle.set_state(LinkState::Connecting);

            let attempt = shared.attempts.load(Ordering::SeqCst) + 1;
            info!(
                "connecting to {} (attempt {attempt}/{max_attempts})",
                self.endpoint
            );

            let result = tokio::select! {
                biased;

                () = self.shutdown.cancelled() => return None,
                result = self.connector.open(&self.endpoint, &self.token) => result,
            };

            let e = match result {
                Ok(session) => {
                    shared.attempts.store(0, Ordering::SeqCst);
                    return Some(session);
                }
                Err(e) => e,
            };

            let failed = shared.attempts.fetch_add(1, Ordering::SeqCst) + 1;
            let lifetime = shared.lifetime_failures.fetch_add(1, Ordering::SeqCst) + 1;
            warn!("connecting to {} failed: {e}", self.endpoint);

            let lifetime_exhausted = self
                .retry
                .lifetime_cap
                .is_some_and(|cap| lifetime >= cap.get());
            if failed >= max_attempts || lifetime_exhausted {
                error!(
                    "giving up on {} after {failed} consecutive failed attempts ({lifetime} in total); restart to try again",
                    self.endpoint
                );
                self.handle.set_state(LinkState::GivenUp);
                return None;
            }

            info!("retrying in {:.1}s", self.retry.backoff.as_secs_f32());
            tokio::select! {
                biased;

                () = self.shutdown.cancelled() => return None,
                () = tokio::time::sleep(self.retry.backoff) => {}
            }
        }
    }
}

/// Reads frames of one generation in arrival order and hands each to the
/// handler on its own task, so a slow command never stalls the next.
///
/// In-flight handlers are aborted when the generation ends.
async fn receive(generation: Arc<Generation>, mut frames: FrameStream, handler: Arc<dyn Handler>) {
    let mut handlers = JoinSet::new();

    loop {
        tokio::select! {
            biased;

            () = generation.ended() => break,

            frame = frames.next() => match frame {
                Some(Ok(frame)) => {
                    trace!("received {frame}");
                    let handler = Arc::clone(&handler);
                    handlers.spawn(async move { handler.handle(frame).await });
                }
                Some(Err(e)) => {
                    generation.fail(&format!("receive error: {e}"));
                    break;
                }
                None => {
                    generation.fail("connection closed by remote");
                    break;
                }
            },

            Some(joined) = handlers.join_next(), if !handlers.is_empty() => {
                if let Err(e) = joined {
                    if e.is_panic() {
                        error!("command handler panicked: {e}");
                    }
                }
            }
        }
    }

    handlers.shutdown().await;
}
