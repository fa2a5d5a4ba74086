//! Client for the Burrow messaging hub.
//!
//! A [`HubClient`] owns a background connection task that holds the
//! WebSocket stream, authenticates on connect, correlates `response` frames
//! to pending requests by id, answers heartbeats, runs local handlers for
//! inbound peer RPCs, and drives the reconnect state machine after dirty
//! closes. Inbound `event` frames dispatch to the client's
//! [`burrow_events::EventBus`].

#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions)]

mod callbacks;
mod client;
mod config;
mod connection;

pub use burrow_events::{EventBus, Listener, SubscriptionId};
pub use burrow_protocol::{Frame, HubError};
pub use client::{ClientHandler, ConnectionState, HubClient};
pub use config::{ClientConfig, LogLevel};
