//! Transport sessions to the dashboard.
//!
//! A [`Session`] owns one underlying connection and knows nothing about the
//! protocol beyond sending and receiving text frames. Sessions are opened by
//! a [`Connector`]; [`WebsocketConnector`] is the production implementation
//! and authenticates every handshake with the shared secret in the
//! `x-api-token` header.

use std::{
    fmt,
    pin::Pin,
    sync::{Mutex, PoisonError},
    time::Duration,
};

use async_trait::async_trait;
use futures_util::{future, Sink, SinkExt, Stream, StreamExt};
use http::{header::USER_AGENT, HeaderValue};
use tokio_tungstenite::tungstenite::{client::IntoClientRequest, Message as WebsocketMessage};

use crate::{
    config::Config,
    endpoint::Endpoint,
    error::{Error, Result},
    protocol::Outbound,
    token::{self, ApiToken},
};

/// Writing half of a session.
pub type FrameSink = Pin<Box<dyn Sink<String, Error = Error> + Send>>;

/// Reading half of a session. Ends when the remote closes the connection;
/// transport errors are yielded as items.
pub type FrameStream = Pin<Box<dyn Stream<Item = Result<String>> + Send>>;

/// One open connection to the dashboard.
pub struct Session {
    writer: tokio::sync::Mutex<Option<FrameSink>>,
    reader: Mutex<Option<FrameStream>>,
}

impl Session {
    /// Time allowed for a graceful close before the connection is dropped.
    const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

    /// Upper bound on a single write, including waiting for the writer.
    pub const SEND_TIMEOUT: Duration = Duration::from_secs(10);

    #[must_use]
    pub fn new(writer: FrameSink, reader: FrameStream) -> Self {
        Self {
            writer: tokio::sync::Mutex::new(Some(writer)),
            reader: Mutex::new(Some(reader)),
        }
    }

    /// Sends one frame.
    ///
    /// # Errors
    ///
    /// Returns an error if the session is closed, the transport fails, or the
    /// write does not complete within [`Self::SEND_TIMEOUT`].
    pub async fn send(&self, frame: &Outbound) -> Result<()> {
        let text = frame.encode()?;
        trace!("sending {text}");

        tokio::time::timeout(Self::SEND_TIMEOUT, async {
            let mut writer = self.writer.lock().await;
            match writer.as_mut() {
                Some(sink) => sink.send(text).await,
                None => Err(Error::unavailable("session is closed")),
            }
        })
        .await?
    }

    /// Takes the inbound frame stream.
    ///
    /// A session has a single reader: only the first call returns a stream.
    pub fn receive(&self) -> Option<FrameStream> {
        self.reader
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    /// Closes the session and releases the connection. Safe to call more
    /// than once.
    pub async fn close(&self) {
        drop(self.receive());

        let writer = match tokio::time::timeout(Self::SEND_TIMEOUT, self.writer.lock()).await {
            Ok(mut writer) => writer.take(),
            Err(_) => {
                debug!("session writer stuck, dropping connection");
                return;
            }
        };
        if let Some(mut sink) = writer {
            match tokio::time::timeout(Self::CLOSE_TIMEOUT, sink.close()).await {
                Ok(Ok(())) => trace!("session closed"),
                Ok(Err(e)) => debug!("error closing session: {e}"),
                Err(_) => debug!("session did not close in time, dropping it"),
            }
        }
    }

    pub async fn is_closed(&self) -> bool {
        self.writer.lock().await.is_none()
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session").finish_non_exhaustive()
    }
}

/// Opens sessions to an endpoint.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Opens an authenticated session.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection or the handshake fails.
    async fn open(&self, endpoint: &Endpoint, token: &ApiToken) -> Result<Session>;
}

/// Websocket sessions over TCP, with TLS for secure endpoints.
#[derive(Clone, Debug)]
pub struct WebsocketConnector {
    user_agent: String,
}

impl WebsocketConnector {
    /// Upper bound on TCP connect, TLS and websocket handshake combined.
    const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

    #[must_use]
    pub fn new(config: &Config) -> Self {
        Self {
            user_agent: config.user_agent.clone(),
        }
    }
}

#[async_trait]
impl Connector for WebsocketConnector {
    async fn open(&self, endpoint: &Endpoint, token: &ApiToken) -> Result<Session> {
        let url = endpoint.url()?;
        let mut request = url.as_str().into_client_request()?;
        let headers = request.headers_mut();
        headers.insert(token::HEADER_NAME, token.header_value()?);
        headers.insert(USER_AGENT, HeaderValue::from_str(&self.user_agent)?);

        let (ws_stream, response) = tokio::time::timeout(
            Self::HANDSHAKE_TIMEOUT,
            tokio_tungstenite::connect_async(request),
        )
        .await??;
        debug!("handshake with {endpoint} completed: {}", response.status());

        let (ws_tx, ws_rx) = ws_stream.split();

        let writer = ws_tx.with(|text: String| {
            future::ready(Ok::<_, Error>(WebsocketMessage::text(text)))
        });

        // Pings are answered by tungstenite itself on the next write or
        // flush, so only text frames are of interest here.
        let reader = ws_rx
            .take_while(|message| {
                future::ready(!matches!(message, Ok(WebsocketMessage::Close(_))))
            })
            .filter_map(|message| {
                future::ready(match message {
                    Ok(WebsocketMessage::Text(text)) => Some(Ok(text.as_str().to_owned())),
                    Ok(WebsocketMessage::Binary(data)) => {
                        debug!("ignoring binary frame of {} bytes", data.len());
                        None
                    }
                    Ok(_) => None,
                    Err(e) => Some(Err(e.into())),
                })
            });

        Ok(Session::new(Box::pin(writer), Box::pin(reader)))
    }
}


#[cfg(test)]
mod tests {
    use super::{
        testing::{MockConnector, StalledConnector},
        *,
    };

    #[tokio::test]
    async fn session_sends_and_closes_idempotently() {
        let (connector, mut remotes) = MockConnector::new();
        let session = connector
            .open(&Endpoint::default(), &"secret".parse().unwrap())
            .await
            .unwrap();
        let mut remote = remotes.recv().await.unwrap();

        session.send(&Outbound::Heartbeat).await.unwrap();
        assert_eq!(remote.next_frame().await["type"], "heartbeat");

        assert!(session.receive().is_some());
        assert!(session.receive().is_none());

        session.close().await;
        session.close().await;
        assert!(session.is_closed().await);
        assert!(session.send(&Outbound::Heartbeat).await.is_err());
    }

    #[tokio::test]
    async fn broken_writes_surface_as_send_errors() {
        let (connector, mut remotes) = MockConnector::new();
        let session = connector
            .open(&Endpoint::default(), &"secret".parse().unwrap())
            .await
            .unwrap();
        let remote = remotes.recv().await.unwrap();

        remote.break_writes();
        assert!(session.send(&Outbound::Heartbeat).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_writes_time_out() {
        let session = StalledConnector::default()
            .open(&Endpoint::default(), &"secret".parse().unwrap())
            .await
            .unwrap();

        let started = tokio::time::Instant::now();
        let e = session.send(&Outbound::Heartbeat).await.unwrap_err();
        assert_eq!(e.kind, crate::error::ErrorKind::DeadlineExceeded);
        assert_eq!(started.elapsed(), Session::SEND_TIMEOUT);

        // Closing gives up on the stuck sink instead of waiting forever.
        tokio::time::timeout(Duration::from_secs(60), session.close())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn reader_ends_when_remote_hangs_up() {
        let (connector, mut remotes) = MockConnector::new();
        let session = connector
            .open(&Endpoint::default(), &"secret".parse().unwrap())
            .await
            .unwrap();
        let remote = remotes.recv().await.unwrap();
        let mut frames = session.receive().unwrap();

        remote.push(r#"{"action":"skip"}"#);
        drop(remote);

        assert_eq!(
            frames.next().await.unwrap().unwrap(),
            r#"{"action":"skip"}"#
        );
        assert!(frames.next().await.is_none());
    }
}
