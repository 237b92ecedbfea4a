use std::{error::Error, num::NonZeroU32, process, sync::Arc, time::Duration};

use clap::{command, Parser, ValueHint};
use log::{debug, error, info, warn, LevelFilter};
use tokio::sync::mpsc;
use veil::Redact;

use dashlink::{
    config::{Config, RetryPolicy},
    dispatcher::Dispatcher,
    endpoint::{self, Endpoint},
    error::ErrorKind,
    events,
    lavalink::{self, Node},
    link::{Link, LinkState},
    local::LocalAgent,
    player::{Context, Search, VoiceChannel},
    publisher::Publisher,
    signal,
    token::ApiToken,
    transport::WebsocketConnector,
};

#[cfg(debug_assertions)]
const BUILD_PROFILE: &str = "debug";
#[cfg(not(debug_assertions))]
const BUILD_PROFILE: &str = "release";

/// `-q` and `-v` are mutually exclusive.
const ARGS_GROUP_LOGGING: &str = "logging";

#[derive(Clone, Redact, Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Dashboard source to connect to
    ///
    /// Must be one of the known dashboard sources. Unknown values fall back
    /// to the first known source.
    #[arg(long, env = "WS_IP", value_hint = ValueHint::Hostname)]
    ws_ip: Option<String>,

    /// Websocket path on the dashboard
    #[arg(long, default_value_t = String::from(endpoint::DEFAULT_PATH))]
    ws_path: String,

    /// Secrets file
    ///
    /// TOML file with the `api_secret` shared with the dashboard. Keep it
    /// private: anyone holding the secret can impersonate this agent.
    #[arg(short, long, value_name = "FILE", value_hint = ValueHint::FilePath, default_value_t = String::from("secrets.toml"))]
    secrets_file: String,

    /// Shared secret, taking precedence over the secrets file
    #[arg(long, env = "API_SECRET", hide_env_values = true)]
    api_secret: Option<ApiToken>,

    /// Lavalink host for track search
    ///
    /// Search is disabled when not set.
    #[arg(long, env = "LAVALINK_HOST", value_hint = ValueHint::Hostname)]
    lavalink_host: Option<String>,

    /// Lavalink port
    #[arg(long, env = "LAVALINK_PORT", default_value_t = Node::DEFAULT_PORT)]
    lavalink_port: u16,

    /// Lavalink password
    #[arg(long, env = "LAVALINK_PASSWORD", hide_env_values = true, default_value_t = String::new())]
    #[redact]
    lavalink_password: String,

    /// Use HTTPS to reach Lavalink
    #[arg(long, env = "LAVALINK_SECURE", default_value_t = false)]
    lavalink_secure: bool,

    /// Consecutive failed connection attempts before giving up
    #[arg(long, default_value_t = NonZeroU32::new(RetryPolicy::DEFAULT_MAX_ATTEMPTS).unwrap_or(NonZeroU32::MIN))]
    max_attempts: NonZeroU32,

    /// Failed connection attempts over the whole run before giving up
    ///
    /// 0 removes the limit.
    #[arg(long, default_value_t = RetryPolicy::DEFAULT_LIFETIME_CAP)]
    lifetime_attempts: u32,

    /// Seconds between heartbeats
    #[arg(long, value_name = "SECS", default_value_t = Config::DEFAULT_HEARTBEAT_INTERVAL.as_secs(), value_parser = clap::value_parser!(u64).range(1..))]
    heartbeat_interval: u64,

    /// Voice channels of the local playback agent
    #[arg(long = "voice-channel", value_name = "NAME", default_values_t = [String::from("General")])]
    voice_channels: Vec<String>,

    /// Suppresses all output except warnings and errors.
    #[arg(short, long, default_value_t = false, group = ARGS_GROUP_LOGGING)]
    quiet: bool,

    /// Enable verbose logging
    ///
    /// Specify twice for trace logging.
    #[arg(short, long, action = clap::ArgAction::Count, group = ARGS_GROUP_LOGGING)]
    verbose: u8,
}

/// Sets up `env_logger`.
///
/// `-q` and `-v` override `RUST_LOG` for this crate only, which in turn
/// overrides the `info` default.
///
/// # Panics
///
/// Panics when a logger is already installed.
fn init_logger(args: &Args) {
    let mut logger = env_logger::Builder::from_env(
        env_logger::Env::default().filter_or(env_logger::DEFAULT_FILTER_ENV, "info"),
    );

    let level = match (args.quiet, args.verbose) {
        (true, _) => Some(LevelFilter::Warn),
        (false, 0) => None,
        (false, 1) => Some(LevelFilter::Debug),
        (false, _) => Some(LevelFilter::Trace),
    };
    if let Some(level) = level {
        logger.filter_module(module_path!(), level);
    }

    logger.init();
}

/// Loads the shared secret from a file.
fn load_token(secrets_file: &str) -> dashlink::error::Result<ApiToken> {
    let token = ApiToken::from_file(secrets_file);

    if let Err(ref e) = token {
        if e.kind == ErrorKind::NotFound {
            info!("set api_secret in {secrets_file} or API_SECRET in the environment");
        }
    }

    token
}

/// Search backend from the Lavalink arguments.
fn search_backend(args: &Args, config: &Config) -> dashlink::error::Result<Arc<dyn Search>> {
    let Some(host) = args.lavalink_host.clone() else {
        warn!("no Lavalink host configured, search is disabled");
        return Ok(Arc::new(lavalink::Disabled));
    };

    let node = Node {
        host,
        port: args.lavalink_port,
        password: args.lavalink_password.clone(),
        secure: args.lavalink_secure,
    };
    info!("searching with Lavalink node {node}");

    Ok(Arc::new(lavalink::Client::new(config, node)?))
}

/// Main application loop.
///
/// Runs the link until a shutdown signal arrives. SIGHUP restarts the link,
/// also after it has given up.
async fn run(args: Args) -> Result<(), Box<dyn Error>> {
    let token = match args.api_secret.clone() {
        Some(token) => token,
        None => load_token(&args.secrets_file)?,
    };

    let endpoint = Endpoint::resolve(args.ws_ip.as_deref(), &args.ws_path);
    let mut config = Config::new(endpoint, token);
    config.retry.max_attempts = args.max_attempts;
    config.retry.lifetime_cap = NonZeroU32::new(args.lifetime_attempts);
    config.heartbeat_interval = Duration::from_secs(args.heartbeat_interval);
    debug!("{config:#?}");

    let search = search_backend(&args, &config)?;
    let connector = Arc::new(WebsocketConnector::new(&config));
    let link = Link::new(&config, connector);
    let publisher = Publisher::new(link.handle(), config.queue_preview_len);
    let context = Arc::new(Context::new());
    let dispatcher = Arc::new(Dispatcher::new(
        Arc::clone(&context),
        search,
        publisher.clone(),
        config.search_timeout,
    ));

    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let mut agent = LocalAgent::new(event_tx);
    let channels = (1..)
        .zip(&args.voice_channels)
        .map(|(id, name)| VoiceChannel {
            id,
            name: name.clone(),
            listeners: 0,
        })
        .collect();
    agent.add_guild(1, channels);
    context.install(Arc::new(agent));

    let listener = tokio::spawn(events::Listener::new(publisher, config.idle_grace).run(event_rx));

    let mut signals = signal::Handler::new()?;
    let mut states = link.handle().subscribe();
    link.start(dispatcher.clone()).await;

    loop {
        tokio::select! {
            signal = signals.recv() => {
                if signal.is_shutdown() {
                    info!("received {signal}, shutting down gracefully");
                    break;
                }

                info!("received {signal}, restarting link");
                link.close().await;
                link.start(dispatcher.clone()).await;
            }

            Ok(()) = states.changed() => {
                if *states.borrow_and_update() == LinkState::GivenUp {
                    error!("link to {} given up; send SIGHUP to retry", config.endpoint);
                }
            }
        }
    }

    link.close().await;
    listener.abort();
    Ok(())
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    init_logger(&args);

    // Secrets are redacted.
    debug!("command {args:#?}");

    let cmd = command!();
    let name = cmd.get_name();
    let version = cmd.get_version().unwrap_or("UNKNOWN");
    info!("starting {name}/{version}; {BUILD_PROFILE}");

    if let Err(e) = run(args).await {
        error!("{e}");
        process::exit(1);
    }
}
