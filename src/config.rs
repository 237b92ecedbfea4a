use std::{num::NonZeroU32, time::Duration};

use crate::{endpoint::Endpoint, token::ApiToken};

/// Bounds on connection attempts made by the link supervisor.
///
/// `max_attempts` bounds the consecutive failed attempts of one
/// reconnection episode; the counter resets after every successful connect.
/// `lifetime_cap` additionally bounds the failed attempts over the whole
/// lifetime of the link, so a flapping dashboard can't keep the supervisor
/// retrying forever. Reaching either bound is terminal until an explicit
/// restart.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct RetryPolicy {
    pub max_attempts: NonZeroU32,
    pub backoff: Duration,
    pub lifetime_cap: Option<NonZeroU32>,
}

impl RetryPolicy {
    pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;
    pub const DEFAULT_BACKOFF: Duration = Duration::from_secs(5);
    pub const DEFAULT_LIFETIME_CAP: u32 = 100;
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: NonZeroU32::new(Self::DEFAULT_MAX_ATTEMPTS).unwrap_or(NonZeroU32::MIN),
            backoff: Self::DEFAULT_BACKOFF,
            lifetime_cap: NonZeroU32::new(Self::DEFAULT_LIFETIME_CAP),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Config {
    pub app_name: String,
    pub app_version: String,

    pub endpoint: Endpoint,
    pub api_token: ApiToken,

    pub retry: RetryPolicy,
    pub heartbeat_interval: Duration,

    /// Maximum number of upcoming tracks sent in a queue snapshot.
    pub queue_preview_len: usize,

    /// Upper bound on a single remote track lookup.
    pub search_timeout: Duration,

    /// Delay before reporting "nothing playing" after the last track ended,
    /// giving the agent a chance to start something else.
    pub idle_grace: Duration,

    pub user_agent: String,
}

impl Config {
    pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
    pub const DEFAULT_QUEUE_PREVIEW_LEN: usize = 10;
    pub const DEFAULT_SEARCH_TIMEOUT: Duration = Duration::from_secs(15);
    pub const DEFAULT_IDLE_GRACE: Duration = Duration::from_secs(1);

    #[must_use]
    pub fn new(endpoint: Endpoint, api_token: ApiToken) -> Self {
        let app_name = env!("CARGO_PKG_NAME").to_owned();
        let app_version = env!("CARGO_PKG_VERSION").to_owned();

        let user_agent = format!("{app_name}/{app_version}");
        trace!("user agent: {user_agent}");

        Self {
            app_name,
            app_version,

            endpoint,
            api_token,

            retry: RetryPolicy::default(),
            heartbeat_interval: Self::DEFAULT_HEARTBEAT_INTERVAL,

            queue_preview_len: Self::DEFAULT_QUEUE_PREVIEW_LEN,
            search_timeout: Self::DEFAULT_SEARCH_TIMEOUT,
            idle_grace: Self::DEFAULT_IDLE_GRACE,

            user_agent,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = Config::new(Endpoint::default(), "secret".parse().unwrap());
        assert_eq!(config.retry.max_attempts.get(), 5);
        assert_eq!(config.retry.backoff, Duration::from_secs(5));
        assert_eq!(config.heartbeat_interval, Duration::from_secs(30));
        assert_eq!(config.queue_preview_len, 10);
        assert!(config.user_agent.starts_with("dashlink/"));
    }
}
