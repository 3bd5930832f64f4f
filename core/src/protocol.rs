//! Gateway wire protocol
//!
//! Frames are JSON text messages tagged by `type`: requests (`req`),
//! responses (`res`) and server-initiated events (`event`).

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use uuid::Uuid;

use crate::error::{GatewayError, Result};

/// Protocol version spoken by this client
pub const PROTOCOL_VERSION: u32 = 3;

/// Event the server emits right after the socket opens
pub const CHALLENGE_EVENT: &str = "connect.challenge";

/// Method used to authenticate the connection
pub const CONNECT_METHOD: &str = "connect";

/// Payload type of a successful connect response
pub const HELLO_OK: &str = "hello-ok";

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(tag = "type")]
pub enum Frame {
    #[serde(rename = "req", alias = "request")]
    Request {
        id: String,
        method: String,
        #[serde(default)]
        params: Value,
    },
    #[serde(rename = "res", alias = "response")]
    Response {
        id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        ok: Option<bool>,
        #[serde(default, skip_serializing_if = "Value::is_null")]
        payload: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<ErrorShape>,
    },
    #[serde(rename = "event")]
    Event {
        event: String,
        #[serde(default)]
        payload: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        seq: Option<u64>,
    },
}

impl Frame {
    /// Build a request with a fresh correlation id
    pub fn request(method: impl Into<String>, params: Value) -> (String, Frame) {
        let id = Uuid::new_v4().to_string();
        let frame = Frame::Request {
            id: id.clone(),
            method: method.into(),
            params,
        };
        (id, frame)
    }

    pub fn ok(id: impl Into<String>, payload: Value) -> Frame {
        Frame::Response {
            id: id.into(),
            ok: Some(true),
            payload,
            error: None,
        }
    }

    pub fn err(id: impl Into<String>, error: ErrorShape) -> Frame {
        Frame::Response {
            id: id.into(),
            ok: Some(false),
            payload: Value::Null,
            error: Some(error),
        }
    }

    pub fn event(event: impl Into<String>, payload: Value) -> Frame {
        Frame::Event {
            event: event.into(),
            payload,
            seq: None,
        }
    }

    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn decode(text: &str) -> Result<Frame> {
        serde_json::from_str(text).map_err(|e| GatewayError::malformed(e.to_string()))
    }
}

/// Split a response into its payload or error body
///
/// `ok` is optional on the wire: a response fails only when `ok` is false
/// or an error body is present.
pub fn response_result(
    ok: Option<bool>,
    payload: Value,
    error: Option<ErrorShape>,
) -> std::result::Result<Value, ErrorShape> {
    match (ok, error) {
        (_, Some(shape)) => Err(shape),
        (Some(false), None) => Err(ErrorShape::new("UNKNOWN", "request failed")),
        (_, None) => Ok(payload),
    }
}

/// Error body carried by a failed response
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ErrorShape {
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retryable: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_after_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

impl ErrorShape {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            retryable: None,
            retry_after_ms: None,
            details: None,
        }
    }

    /// Map the gateway's error body onto the client error taxonomy
    pub fn into_error(self, method: &str) -> GatewayError {
        let retry_after = self.retry_after_ms.map(Duration::from_millis);
        match self.code.to_ascii_uppercase().as_str() {
            "UNAUTHORIZED" | "FORBIDDEN" | "AUTH_FAILED" | "INVALID_TOKEN" => {
                GatewayError::Unauthorized {
                    message: self.message,
                }
            }
            "RATE_LIMITED" | "TOO_MANY_REQUESTS" => GatewayError::RateLimited { retry_after },
            "UNKNOWN_METHOD" | "METHOD_NOT_FOUND" => GatewayError::UnknownMethod {
                method: method.to_string(),
            },
            _ => GatewayError::Remote {
                code: self.code,
                message: self.message,
                retryable: self.retryable,
                retry_after,
            },
        }
    }
}

/// Server challenge signed during the handshake
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Challenge {
    pub nonce: String,
    #[serde(alias = "timestamp")]
    pub ts: i64,
}

/// Identity of this client, sent with the connect request
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ClientInfo {
    pub name: String,
    pub version: String,
    pub platform: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
}

impl Default for ClientInfo {
    fn default() -> Self {
        Self {
            name: "gatelink".to_string(),
            version: format!(
                "{}+{}",
                env!("CARGO_PKG_VERSION"),
                env!("GATELINK_GIT_HASH")
            ),
            platform: std::env::consts::OS.to_string(),
            host: hostname::get()
                .ok()
                .and_then(|h| h.into_string().ok()),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Default)]
pub struct AuthInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

/// Device proof of possession over the challenge
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DeviceAuth {
    pub id: String,
    pub public_key: String,
    pub signature: String,
    pub signed_at: i64,
    pub nonce: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ConnectParams {
    pub min_protocol: u32,
    pub max_protocol: u32,
    pub client: ClientInfo,
    pub auth: AuthInfo,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device: Option<DeviceAuth>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct ServerInfo {
    #[serde(default)]
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conn_id: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Default)]
pub struct Features {
    #[serde(default)]
    pub methods: Vec<String>,
    #[serde(default)]
    pub events: Vec<String>,
}

/// Acknowledgment that completes the handshake
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct HelloOk {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(alias = "protocolVersion")]
    pub protocol: u32,
    #[serde(default, alias = "serverInfo")]
    pub server: ServerInfo,
    #[serde(default)]
    pub features: Features,
}

impl HelloOk {
    /// Parse and validate a connect response payload
    pub fn from_payload(payload: Value, min: u32, max: u32) -> Result<Self> {
        let hello: HelloOk = serde_json::from_value(payload).map_err(|e| GatewayError::Handshake {
            reason: format!("malformed hello-ok: {}", e),
        })?;
        if hello.kind != HELLO_OK {
            return Err(GatewayError::Handshake {
                reason: format!("expected {}, got {}", HELLO_OK, hello.kind),
            });
        }
        if hello.protocol < min || hello.protocol > max {
            return Err(GatewayError::ProtocolMismatch {
                server: hello.protocol,
                min,
                max,
            });
        }
        Ok(hello)
    }
}

/// Server-initiated event delivered to subscribers
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct PushEvent {
    pub kind: String,
    pub run_id: Option<String>,
    pub payload: Value,
    pub seq: Option<u64>,
}

impl PushEvent {
    pub fn new(kind: impl Into<String>, payload: Value, seq: Option<u64>) -> Self {
        let run_id = payload
            .get("runId")
            .or_else(|| payload.get("run_id"))
            .and_then(Value::as_str)
            .map(str::to_string);
        Self {
            kind: kind.into(),
            run_id,
            payload,
            seq,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_frame_shape() {
        let (id, frame) = Frame::request("chat.send", json!({"message": "hi"}));
        let value: Value = serde_json::from_str(&frame.encode().unwrap()).unwrap();
        assert_eq!(value["type"], "req");
        assert_eq!(value["id"], id);
        assert_eq!(value["method"], "chat.send");
        assert_eq!(value["params"]["message"], "hi");
    }

    #[test]
    fn test_decode_accepts_long_type_names() {
        let frame = Frame::decode(r#"{"type":"response","id":"1","ok":true,"payload":{"a":1}}"#).unwrap();
        assert_eq!(frame, Frame::ok("1", json!({"a": 1})));

        let frame = Frame::decode(r#"{"type":"request","id":"2","method":"health"}"#).unwrap();
        assert!(matches!(frame, Frame::Request { ref method, ref params, .. } if method == "health" && params.is_null()));
    }

    #[test]
    fn test_decode_rejects_garbage() {
        let err = Frame::decode(r#"{"type":"bogus"}"#).unwrap_err();
        assert!(matches!(err, GatewayError::MalformedFrame { .. }));
    }

    #[test]
    fn test_response_without_ok_flag() {
        let frame = Frame::decode(r#"{"type":"res","id":"7","payload":{"a":1}}"#).unwrap();
        let Frame::Response { ok, payload, error, .. } = frame else {
            panic!("expected a response");
        };
        assert_eq!(ok, None);
        assert_eq!(response_result(ok, payload, error).unwrap(), json!({"a": 1}));

        let frame = Frame::decode(r#"{"type":"res","id":"8","error":{"code":"BUSY","message":"later"}}"#).unwrap();
        let Frame::Response { ok, payload, error, .. } = frame else {
            panic!("expected a response");
        };
        assert_eq!(response_result(ok, payload, error).unwrap_err().code, "BUSY");

        let shape = response_result(Some(false), Value::Null, None).unwrap_err();
        assert_eq!(shape.code, "UNKNOWN");
    }

    #[test]
    fn test_error_shape_mapping() {
        let shape = ErrorShape {
            retryable: Some(true),
            retry_after_ms: Some(1500),
            ..ErrorShape::new("UNAVAILABLE", "try later")
        };
        match shape.into_error("chat.send") {
            GatewayError::Remote { retryable, retry_after, .. } => {
                assert_eq!(retryable, Some(true));
                assert_eq!(retry_after, Some(Duration::from_millis(1500)));
            }
            other => panic!("unexpected {other:?}"),
        }

        let err = ErrorShape::new("unauthorized", "bad token").into_error("connect");
        assert!(matches!(err, GatewayError::Unauthorized { .. }));

        let err = ErrorShape::new("METHOD_NOT_FOUND", "nope").into_error("x.y");
        assert!(matches!(err, GatewayError::UnknownMethod { ref method } if method == "x.y"));
    }

    #[test]
    fn test_hello_ok_validation() {
        let hello = HelloOk::from_payload(
            json!({"type": "hello-ok", "protocolVersion": 3, "serverInfo": {"version": "1.2.0"}}),
            PROTOCOL_VERSION,
            PROTOCOL_VERSION,
        )
        .unwrap();
        assert_eq!(hello.server.version, "1.2.0");

        let err = HelloOk::from_payload(json!({"type": "hello-ok", "protocol": 2}), 3, 3).unwrap_err();
        assert!(matches!(err, GatewayError::ProtocolMismatch { server: 2, .. }));

        let err = HelloOk::from_payload(json!({"protocol": 3}), 3, 3).unwrap_err();
        assert!(matches!(err, GatewayError::Handshake { .. }));
    }

    #[test]
    fn test_push_event_extracts_run_id() {
        let event = PushEvent::new("chat", json!({"runId": "r1", "state": "delta"}), Some(4));
        assert_eq!(event.run_id.as_deref(), Some("r1"));
        assert_eq!(event.seq, Some(4));

        let event = PushEvent::new("tick", json!({"ts": 1}), None);
        assert!(event.run_id.is_none());
    }

    #[test]
    fn test_connect_params_camel_case() {
        let params = ConnectParams {
            min_protocol: 3,
            max_protocol: 3,
            client: ClientInfo::default(),
            auth: AuthInfo { token: Some("t".into()) },
            device: Some(DeviceAuth {
                id: "dev".into(),
                public_key: "pk".into(),
                signature: "sig".into(),
                signed_at: 10,
                nonce: "n".into(),
            }),
        };
        let value = serde_json::to_value(&params).unwrap();
        assert_eq!(value["minProtocol"], 3);
        assert_eq!(value["device"]["publicKey"], "pk");
        assert_eq!(value["auth"]["token"], "t");
    }
}
