//! Resolution of the dashboard websocket endpoint.
//!
//! The dashboard may only be reached through one of a fixed set of known
//! sources. The configured identifier is checked against that allow-list
//! once at startup and the resulting [`Endpoint`] is immutable afterwards.

use std::{fmt, net::IpAddr};

use url::Url;

use crate::error::Result;

/// Known dashboard sources, in order of preference.
///
/// The first entry is the fallback for missing or unknown identifiers.
pub const ALLOWED_SOURCES: [&str; 4] = [
    "100.20.92.101",
    "44.225.181.72",
    "44.227.217.144",
    "cloudflare-website.onrender.com",
];

/// Path of the dashboard websocket route.
pub const DEFAULT_PATH: &str = "/ws/nowplaying";

/// Port the dashboard listens on when addressed by IP.
const PLAIN_PORT: u16 = 8000;

/// Websocket scheme of an endpoint.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Scheme {
    /// Plain `ws`, used for numeric IP sources.
    Plain,
    /// TLS `wss`, used for hostname sources.
    Secure,
}

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Plain => write!(f, "ws"),
            Self::Secure => write!(f, "wss"),
        }
    }
}

/// Resolved target of the dashboard link.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Endpoint {
    scheme: Scheme,
    host: &'static str,
    port: Option<u16>,
    path: String,
}

impl Endpoint {
    /// Resolves `identifier` against [`ALLOWED_SOURCES`].
    ///
    /// Unknown, empty or missing identifiers fall back to the first
    /// allow-listed source.
    #[must_use]
    pub fn resolve(identifier: Option<&str>, path: &str) -> Self {
        let requested = identifier.map(str::trim).unwrap_or_default();
        let host = ALLOWED_SOURCES
            .iter()
            .copied()
            .find(|source| source.eq_ignore_ascii_case(requested))
            .unwrap_or_else(|| {
                if requested.is_empty() {
                    info!("no dashboard source configured, using {}", ALLOWED_SOURCES[0]);
                } else {
                    warn!(
                        "dashboard source {requested} is not allowed, using {}",
                        ALLOWED_SOURCES[0]
                    );
                }
                ALLOWED_SOURCES[0]
            });

        let (scheme, port) = if host.parse::<IpAddr>().is_ok() {
            (Scheme::Plain, Some(PLAIN_PORT))
        } else {
            (Scheme::Secure, None)
        };

        let path = if path.starts_with('/') {
            path.to_owned()
        } else {
            format!("/{path}")
        };

        Self {
            scheme,
            host,
            port,
            path,
        }
    }

    #[must_use]
    pub fn scheme(&self) -> Scheme {
        self.scheme
    }

    #[must_use]
    pub fn host(&self) -> &str {
        self.host
    }

    /// Builds the websocket URL for this endpoint.
    ///
    /// # Errors
    ///
    /// Returns an error if the configured path does not form a valid URL.
    pub fn url(&self) -> Result<Url> {
        let url = match self.port {
            Some(port) => format!("{}://{}:{port}{}", self.scheme, self.host, self.path),
            None => format!("{}://{}{}", self.scheme, self.host, self.path),
        };
        Ok(Url::parse(&url)?)
    }
}

impl Default for Endpoint {
    fn default() -> Self {
        Self::resolve(None, DEFAULT_PATH)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.port {
            Some(port) => write!(f, "{}://{}:{port}{}", self.scheme, self.host, self.path),
            None => write!(f, "{}://{}{}", self.scheme, self.host, self.path),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ip_sources_use_plain_scheme() {
        let endpoint = Endpoint::resolve(Some("44.225.181.72"), DEFAULT_PATH);
        assert_eq!(endpoint.scheme(), Scheme::Plain);
        assert_eq!(
            endpoint.url().unwrap().as_str(),
            "ws://44.225.181.72:8000/ws/nowplaying"
        );
    }

    #[test]
    fn hostname_sources_use_secure_scheme() {
        let endpoint = Endpoint::resolve(Some("cloudflare-website.onrender.com"), DEFAULT_PATH);
        assert_eq!(endpoint.scheme(), Scheme::Secure);
        assert_eq!(
            endpoint.url().unwrap().as_str(),
            "wss://cloudflare-website.onrender.com/ws/nowplaying"
        );
    }

    #[test]
    fn unknown_and_missing_fall_back_to_first_source() {
        for identifier in [None, Some(""), Some("evil.example.com"), Some("127.0.0.1")] {
            let endpoint = Endpoint::resolve(identifier, DEFAULT_PATH);
            assert_eq!(endpoint.host(), ALLOWED_SOURCES[0]);
            assert!(ALLOWED_SOURCES.contains(&endpoint.host()));
        }
    }

    #[test]
    fn path_is_rooted() {
        let endpoint = Endpoint::resolve(Some("100.20.92.101"), "ws/other");
        assert_eq!(endpoint.to_string(), "ws://100.20.92.101:8000/ws/other");
    }
}
