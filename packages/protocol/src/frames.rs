use serde::{Deserialize, Serialize};
use serde_json::Value;
use strum_macros::AsRefStr;

use crate::HubError;

/// A single wire frame.
///
/// Serialized as an internally tagged JSON object: the variant name becomes
/// the snake_case `type` field and struct fields are camelCase on the wire.
/// Optional fields are omitted entirely when absent so that
/// `decode(encode(frame)) == frame` holds for every variant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, AsRefStr)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
#[strum(serialize_all = "snake_case")]
pub enum Frame {
    /// First frame a client must send after the transport opens.
    Auth {
        token: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        name: Option<String>,
    },
    /// Server acknowledgement carrying the canonical client name.
    AuthSuccess { name: String },
    /// Server RPC invocation.
    Request {
        id: String,
        function_name: String,
        data: Value,
    },
    /// Peer RPC invocation, routed through the server. The server stamps
    /// `from_client` with the caller's registered name when forwarding.
    ClientRequest {
        id: String,
        function_name: String,
        data: Value,
        target_client: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from_client: Option<String>,
    },
    /// Reply to a `Request` or `ClientRequest`, correlated by `id`.
    Response {
        id: String,
        success: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        data: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        original_from_client: Option<String>,
    },
    /// Fire-and-forget event, fanned out to every other connected client.
    Event {
        event_name: String,
        data: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from_client: Option<String>,
    },
    /// Server liveness probe.
    Heartbeat,
    /// Client liveness answer; the only frame that refreshes the server's
    /// last-heartbeat stamp.
    HeartbeatResponse,
    /// Broadcast ahead of a graceful server shutdown.
    Shutdown {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        grace_period: Option<u64>,
    },
}

impl std::fmt::Display for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_ref())
    }
}

impl Frame {
    /// Serializes the frame to its wire representation.
    ///
    /// # Errors
    ///
    /// * If the `data` payload cannot be represented as JSON
    pub fn encode(&self) -> Result<String, HubError> {
        serde_json::to_string(self).map_err(|e| HubError::Protocol(e.to_string()))
    }

    /// Parses a wire frame, validating the discriminator and required fields.
    ///
    /// # Errors
    ///
    /// * If the text is not valid JSON
    /// * If the `type` discriminator is missing or unknown
    /// * If a required field for the tag is missing
    pub fn decode(text: &str) -> Result<Self, HubError> {
        serde_json::from_str(text).map_err(|e| HubError::Protocol(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;

    fn round_trip(frame: Frame) {
        let encoded = frame.encode().unwrap();
        assert_eq!(Frame::decode(&encoded).unwrap(), frame);
    }

    #[test]
    fn every_tag_round_trips() {
        round_trip(Frame::Auth {
            token: "T".into(),
            name: Some("alice".into()),
        });
        round_trip(Frame::Auth {
            token: "T".into(),
            name: None,
        });
        round_trip(Frame::AuthSuccess {
            name: "alice".into(),
        });
        round_trip(Frame::Request {
            id: "1".into(),
            function_name: "add".into(),
            data: json!({"a": 2, "b": 3}),
        });
        round_trip(Frame::ClientRequest {
            id: "7".into(),
            function_name: "ping".into(),
            data: json!({"x": 1}),
            target_client: "bob".into(),
            from_client: Some("alice".into()),
        });
        round_trip(Frame::Response {
            id: "7".into(),
            success: true,
            data: Some(json!({"pong": true})),
            error: None,
            original_from_client: Some("alice".into()),
        });
        round_trip(Frame::Event {
            event_name: "hi".into(),
            data: json!({"n": 1}),
            from_client: None,
        });
        round_trip(Frame::Heartbeat);
        round_trip(Frame::HeartbeatResponse);
        round_trip(Frame::Shutdown {
            reason: Some("maint".into()),
            grace_period: Some(5000),
        });
    }

    #[test]
    fn decodes_token_only_auth() {
        let frame = Frame::decode(r#"{"type":"auth","token":"T"}"#).unwrap();
        assert_eq!(
            frame,
            Frame::Auth {
                token: "T".into(),
                name: None,
            }
        );
    }

    #[test]
    fn field_names_are_camel_case_on_the_wire() {
        let encoded = Frame::ClientRequest {
            id: "7".into(),
            function_name: "ping".into(),
            data: json!({}),
            target_client: "bob".into(),
            from_client: Some("alice".into()),
        }
        .encode()
        .unwrap();
        let value: Value = serde_json::from_str(&encoded).unwrap();
        assert_eq!(value["type"], "client_request");
        assert_eq!(value["functionName"], "ping");
        assert_eq!(value["targetClient"], "bob");
        assert_eq!(value["fromClient"], "alice");
    }

    #[test]
    fn heartbeat_frames_carry_only_the_tag() {
        assert_eq!(Frame::Heartbeat.encode().unwrap(), r#"{"type":"heartbeat"}"#);
        assert_eq!(
            Frame::HeartbeatResponse.encode().unwrap(),
            r#"{"type":"heartbeat_response"}"#
        );
    }

    #[test]
    fn missing_required_field_is_a_protocol_error() {
        let err = Frame::decode(r#"{"type":"request","id":"1","data":{}}"#).unwrap_err();
        assert!(matches!(err, HubError::Protocol(_)));
    }

    #[test]
    fn unknown_discriminator_is_a_protocol_error() {
        let err = Frame::decode(r#"{"type":"telepathy"}"#).unwrap_err();
        assert!(matches!(err, HubError::Protocol(_)));
    }

    #[test]
    fn missing_discriminator_is_a_protocol_error() {
        let err = Frame::decode(r#"{"token":"T"}"#).unwrap_err();
        assert!(matches!(err, HubError::Protocol(_)));
    }

    #[test]
    fn absent_optionals_are_omitted_from_the_wire() {
        let encoded = Frame::Response {
            id: "1".into(),
            success: false,
            data: None,
            error: Some("Handler not found".into()),
            original_from_client: None,
        }
        .encode()
        .unwrap();
        assert!(!encoded.contains("data"));
        assert!(!encoded.contains("originalFromClient"));
    }
}
