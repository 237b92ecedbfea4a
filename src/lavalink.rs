//! Track search over the Lavalink v4 REST API.
//!
//! Only the `loadtracks` endpoint is used. Plain queries are resolved as
//! YouTube searches, URLs are passed through as-is.
//!
//! Requests are rate limited to 10 calls per 5 seconds, bursting, so a
//! dashboard hammering the search box can't get the node to throttle us.

use std::{fmt, num::NonZeroU32, time::Duration};

use async_trait::async_trait;
use governor::{DefaultDirectRateLimiter, Quota};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use serde::Deserialize;
use url::Url;
use veil::Redact;

use crate::{
    config::Config,
    error::{Error, Result},
    player::Search,
    track::Track,
};

/// Address and credentials of a Lavalink node.
#[derive(Clone, Redact, PartialEq, Eq)]
pub struct Node {
    pub host: String,
    pub port: u16,
    #[redact]
    pub password: String,
    pub secure: bool,
}

impl Node {
    pub const DEFAULT_PORT: u16 = 2333;

    /// Base URL of the node's REST API.
    ///
    /// # Errors
    ///
    /// Returns an error if `host` does not form a valid URL.
    pub fn base_url(&self) -> Result<Url> {
        let scheme = if self.secure { "https" } else { "http" };
        let url = Url::parse(&format!("{scheme}://{}:{}/", self.host, self.port))?;
        Ok(url)
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Result of a `loadtracks` call.
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(tag = "loadType", content = "data", rename_all = "camelCase")]
enum LoadResult {
    Track(RemoteTrack),
    Search(Vec<RemoteTrack>),
    Playlist(Playlist),
    Empty(serde_json::Value),
    Error(Exception),
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
struct Playlist {
    tracks: Vec<RemoteTrack>,
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
struct Exception {
    message: Option<String>,
    severity: String,
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
struct RemoteTrack {
    encoded: String,
    info: TrackInfo,
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TrackInfo {
    title: String,
    author: String,
    /// Milliseconds.
    length: u64,
    is_stream: bool,
    uri: Option<String>,
    artwork_url: Option<String>,
}

impl From<RemoteTrack> for Track {
    fn from(remote: RemoteTrack) -> Self {
        let info = remote.info;
        Self {
            title: info.title,
            author: info.author,
            length: if info.is_stream {
                Duration::ZERO
            } else {
                Duration::from_millis(info.length)
            },
            artwork: info.artwork_url,
            uri: info.uri,
            encoded: Some(remote.encoded),
        }
    }
}

impl LoadResult {
    fn into_tracks(self) -> Result<Vec<Track>> {
        let tracks = match self {
            Self::Track(track) => vec![track],
            Self::Search(tracks) => tracks,
            Self::Playlist(playlist) => playlist.tracks,
            Self::Empty(_) => Vec::new(),
            Self::Error(exception) => {
                let message = exception
                    .message
                    .unwrap_or_else(|| "unknown error".to_owned());
                return Err(Error::unavailable(format!(
                    "loading tracks failed ({} severity): {message}",
                    exception.severity
                )));
            }
        };

        Ok(tracks.into_iter().map(Track::from).collect())
    }
}

/// Identifier to load for `query`.
fn identifier(query: &str) -> String {
    if Url::parse(query).is_ok_and(|url| matches!(url.scheme(), "http" | "https")) {
        query.to_owned()
    } else {
        format!("ytsearch:{query}")
    }
}

/// Rate-limited client of one Lavalink node.
pub struct Client {
    node: Node,
    base_url: Url,
    http: reqwest::Client,
    rate_limiter: DefaultDirectRateLimiter,
}

impl Client {
    const RATE_LIMIT_INTERVAL: Duration = Duration::from_secs(5);
    const RATE_LIMIT_CALLS_PER_INTERVAL: u8 = 10;

    const KEEPALIVE_TIMEOUT: Duration = Duration::from_secs(60);
    const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

    /// Creates a client for `node`.
    ///
    /// # Errors
    ///
    /// Returns an error if the node address or password is invalid, or the
    /// HTTP client can't be built.
    pub fn new(config: &Config, node: Node) -> Result<Self> {
        let mut password = HeaderValue::from_str(&node.password)?;
        password.set_sensitive(true);
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, password);

        let http = reqwest::Client::builder()
            .tcp_keepalive(Self::KEEPALIVE_TIMEOUT)
            .timeout(Self::REQUEST_TIMEOUT)
            .default_headers(headers)
            .user_agent(&config.user_agent)
            .build()?;

        let calls = NonZeroU32::new(Self::RATE_LIMIT_CALLS_PER_INTERVAL.into())
            .ok_or_else(|| Error::internal("calls per interval is zero"))?;
        let quota = Quota::with_period(Self::RATE_LIMIT_INTERVAL / calls.get())
            .ok_or_else(|| Error::internal("quota time interval is zero"))?
            .allow_burst(calls);

        Ok(Self {
            base_url: node.base_url()?,
            node,
            http,
            rate_limiter: governor::RateLimiter::direct(quota),
        })
    }

    async fn load(&self, identifier: &str) -> Result<LoadResult> {
        let mut url = self.base_url.join("v4/loadtracks")?;
        url.query_pairs_mut().append_pair("identifier", identifier);

        self.rate_limiter.until_ready().await;
        let response = self.http.get(url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(match status.as_u16() {
                401 | 403 => Error::permission_denied(format!("{} rejected the password", self.node)),
                _ => Error::unavailable(format!("{} answered {status}", self.node)),
            });
        }

        Ok(response.json().await?)
    }
}

#[async_trait]
impl Search for Client {
    async fn search(&self, query: &str) -> Result<Vec<Track>> {
        let identifier = identifier(query);
        trace!("loading {identifier} from {}", self.node);

        let tracks = self.load(&identifier).await?.into_tracks()?;
        debug!("{} returned {} tracks for {query:?}", self.node, tracks.len());
        Ok(tracks)
    }
}

/// Search backend used when no Lavalink node is configured.
#[derive(Copy, Clone, Debug, Default)]
pub struct Disabled;

#[async_trait]
impl Search for Disabled {
    async fn search(&self, _query: &str) -> Result<Vec<Track>> {
        Err(Error::unavailable("search backend not configured"))
    }
}
