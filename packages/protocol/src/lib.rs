//! Wire protocol for the Burrow messaging hub.
//!
//! Every message exchanged between the hub server and its clients is a single
//! JSON object with a `type` discriminator, carried as a UTF-8 text frame over
//! the WebSocket. This crate defines the [`Frame`] enum modelling every
//! recognized tag, the [`HubError`] taxonomy shared by both sides, and the
//! [`close`] codes the hub uses when tearing down a transport.
//!
//! Payloads (`data`) are deliberately opaque [`serde_json::Value`]s; shape
//! checking belongs to application code on either end.

#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions)]

mod error;
mod frames;

pub use error::HubError;
pub use frames::Frame;

/// WebSocket close codes used by the hub.
pub mod close {
    /// Clean client disconnect, heartbeat eviction, or name displacement.
    pub const NORMAL: u16 = 1000;
    /// Server shutdown hard close.
    pub const GOING_AWAY: u16 = 1001;
    /// Protocol violation detected by the server.
    pub const PROTOCOL_ERROR: u16 = 1002;
    /// Authentication required or invalid credentials.
    pub const POLICY_VIOLATION: u16 = 1008;
    /// Server at capacity or shutting down.
    pub const TRY_AGAIN_LATER: u16 = 1013;
}
