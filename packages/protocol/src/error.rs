use thiserror::Error;

/// Error taxonomy shared by the hub server and client.
///
/// Each variant carries a human-readable message; [`HubError::code`] exposes a
/// stable machine-readable code for callers that need to branch on the kind
/// without string matching.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HubError {
    /// Missing or mismatched credentials.
    #[error("Authentication failed: {0}")]
    Authentication(String),
    /// Transport not open, or the target peer became unavailable.
    #[error("Connection error: {0}")]
    Connection(String),
    /// Deadline elapsed for a pending request.
    #[error("Request timeout: {0}")]
    Timeout(String),
    /// Named function is not registered on the callee.
    #[error("Handler not found: {0}")]
    HandlerNotFound(String),
    /// A remote handler ran and failed; carries the stringified failure from
    /// the `response` frame.
    #[error("Remote handler failed: {0}")]
    Handler(String),
    /// Peer RPC target is not registered on the server.
    #[error("Target client not found: {0}")]
    ClientNotFound(String),
    /// Malformed or unknown wire frame.
    #[error("Protocol error: {0}")]
    Protocol(String),
    /// Failure in the underlying transport.
    #[error("Network error: {0}")]
    Network(String),
}

impl HubError {
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::Authentication(_) => "AUTHENTICATION_ERROR",
            Self::Connection(_) => "CONNECTION_ERROR",
            Self::Timeout(_) => "TIMEOUT_ERROR",
            Self::HandlerNotFound(_) => "HANDLER_NOT_FOUND",
            Self::Handler(_) => "HANDLER_ERROR",
            Self::ClientNotFound(_) => "CLIENT_NOT_FOUND",
            Self::Protocol(_) => "PROTOCOL_ERROR",
            Self::Network(_) => "NETWORK_ERROR",
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn codes_are_stable_per_kind() {
        assert_eq!(
            HubError::Authentication("bad token".into()).code(),
            "AUTHENTICATION_ERROR"
        );
        assert_eq!(HubError::Timeout("slow".into()).code(), "TIMEOUT_ERROR");
        assert_eq!(
            HubError::ClientNotFound("nobody".into()).code(),
            "CLIENT_NOT_FOUND"
        );
    }

    #[test]
    fn messages_carry_the_detail() {
        let err = HubError::HandlerNotFound("add".into());
        assert_eq!(err.to_string(), "Handler not found: add");
    }
}
