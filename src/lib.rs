//! Bridge between a voice playback agent and a web dashboard.
//!
//! A single [`link::Link`] keeps an authenticated websocket to the dashboard
//! alive, mirrors playback state through the [`publisher`] and relays
//! dashboard commands to the playback agent through the [`dispatcher`].
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]

#[macro_use]
extern crate log;

pub mod config;
pub mod dispatcher;
pub mod endpoint;
pub mod error;
pub mod events;
pub mod heartbeat;
pub mod lavalink;
pub mod link;
pub mod local;
pub mod player;
pub mod protocol;
pub mod publisher;
pub mod signal;
pub mod token;
pub mod track;
pub mod transport;
