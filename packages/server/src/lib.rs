//! The Burrow hub server.
//!
//! One [`ws::server::HubServer`] actor owns the session registry and routes
//! every frame kind between authenticated clients; per-connection WebSocket
//! loops live in [`ws::handler`] and the actix endpoints in [`api`] and
//! [`ws::api`]. Credentials are an injectable name-to-secret mapping
//! ([`credentials::CredentialStore`]).

#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions)]

pub mod api;
pub mod config;
pub mod credentials;
pub mod ws;

pub use config::{LogLevel, ServerConfig};
pub use credentials::CredentialStore;
pub use ws::server::{HubHandle, HubServer};
