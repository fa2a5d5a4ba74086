pub mod api;
pub mod handler;
pub mod server;

/// Connection ID.
pub type ConnId = usize;

/// Outbound message pushed to a connection's handler loop, which owns the
/// transport write half.
#[derive(Debug, Clone)]
pub enum SessionMessage {
    /// Encoded frame to write as a text message.
    Text(String),
    /// Close the transport with the given code and reason.
    Close { code: u16, reason: String },
}
