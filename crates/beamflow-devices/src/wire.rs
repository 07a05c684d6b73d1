/*!
 * Wire codec for the beamflow protocol.
 *
 * Frames are JSON objects carried one per transport message. A request
 * carries a call id, a command name, and opaque structured arguments; the
 * matching reply echoes the id with an ok/error status and a payload.
 * Servers whose session supports it may also emit unsolicited push frames.
 *
 * The codec is pure and stateless: encoding then decoding reconstructs
 * the original frame, and anything unrecognizable decodes to
 * [`CallError::Malformed`] rather than panicking.
 */
use std::fmt;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use beamflow_core::types::Value;

use crate::error::CallError;

/// Identifier correlating a request with its reply
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CallId(Uuid);

impl CallId {
    /// Create a fresh call id
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for CallId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for CallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A request frame
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    /// Call id echoed by the matching reply
    pub id: CallId,
    /// Command name
    pub command: String,
    /// Opaque structured arguments
    #[serde(default)]
    pub arguments: Value,
}

impl Request {
    /// Create a new request with a fresh call id
    pub fn new<S: Into<String>>(command: S, arguments: Value) -> Self {
        Self {
            id: CallId::new(),
            command: command.into(),
            arguments,
        }
    }
}

/// Reply status reported by the server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplyStatus {
    /// The command succeeded
    Ok,
    /// The command failed server-side
    Error,
}

/// A reply frame
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reply {
    /// Echo of the request's call id
    pub id: CallId,
    /// Outcome of the command
    pub status: ReplyStatus,
    /// Opaque structured payload
    #[serde(default)]
    pub payload: Value,
    /// Error description when status is `error`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Reply {
    /// Create a successful reply for a request id
    pub fn ok(id: CallId, payload: Value) -> Self {
        Self {
            id,
            status: ReplyStatus::Ok,
            payload,
            error: None,
        }
    }

    /// Create an error reply for a request id
    pub fn error<S: Into<String>>(id: CallId, message: S) -> Self {
        Self {
            id,
            status: ReplyStatus::Error,
            payload: Value::Null,
            error: Some(message.into()),
        }
    }
}

/// An unsolicited push frame
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PushEvent {
    /// Event name
    pub event: String,
    /// Opaque structured payload
    #[serde(default)]
    pub payload: Value,
}

/// Any inbound frame
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    /// A reply to an outstanding request
    Reply(Reply),
    /// An unsolicited status push
    Push(PushEvent),
}

/// Encode a request frame
pub fn encode_request(request: &Request) -> Result<Bytes, CallError> {
    serde_json::to_vec(request)
        .map(Bytes::from)
        .map_err(|e| CallError::Malformed(e.to_string()))
}

/// Encode a reply frame
pub fn encode_reply(reply: &Reply) -> Result<Bytes, CallError> {
    serde_json::to_vec(reply)
        .map(Bytes::from)
        .map_err(|e| CallError::Malformed(e.to_string()))
}

/// Encode a push frame
pub fn encode_push(push: &PushEvent) -> Result<Bytes, CallError> {
    serde_json::to_vec(push)
        .map(Bytes::from)
        .map_err(|e| CallError::Malformed(e.to_string()))
}

/// Decode a request frame (server side of the contract)
pub fn decode_request(frame: &[u8]) -> Result<Request, CallError> {
    serde_json::from_slice(frame).map_err(|e| CallError::Malformed(e.to_string()))
}

/// Decode an inbound frame into a reply or a push
pub fn decode_frame(frame: &[u8]) -> Result<Frame, CallError> {
    // Replies carry a call id and status; pushes carry an event name.
    #[derive(Deserialize)]
    struct RawFrame {
        id: Option<CallId>,
        status: Option<ReplyStatus>,
        #[serde(default)]
        payload: Value,
        #[serde(default)]
        error: Option<String>,
        event: Option<String>,
    }

    let raw: RawFrame =
        serde_json::from_slice(frame).map_err(|e| CallError::Malformed(e.to_string()))?;

    match (raw.id, raw.status, raw.event) {
        (Some(id), Some(status), None) => Ok(Frame::Reply(Reply {
            id,
            status,
            payload: raw.payload,
            error: raw.error,
        })),
        (None, None, Some(event)) => Ok(Frame::Push(PushEvent {
            event,
            payload: raw.payload,
        })),
        _ => Err(CallError::Malformed(
            "frame is neither a reply nor a push".to_string(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use beamflow_core::object;

    #[test]
    fn test_request_round_trip() {
        let request = Request::new(
            "move_motor",
            object! {
                "names" => Value::Array(vec!["Motor 2".into()]),
                "goals" => Value::Array(vec![Value::Float(10.0)]),
            },
        );

        let frame = encode_request(&request).unwrap();
        let back = decode_request(&frame).unwrap();
        assert_eq!(back, request);
    }

    #[test]
    fn test_reply_round_trip() {
        let id = CallId::new();
        let reply = Reply::ok(id, object! { "position" => 12.5 });

        let frame = encode_reply(&reply).unwrap();
        match decode_frame(&frame).unwrap() {
            Frame::Reply(back) => assert_eq!(back, reply),
            other => panic!("expected reply, got {:?}", other),
        }
    }

    #[test]
    fn test_error_reply_decodes() {
        let id = CallId::new();
        let reply = Reply::error(id, "no such motor");

        let frame = encode_reply(&reply).unwrap();
        match decode_frame(&frame).unwrap() {
            Frame::Reply(back) => {
                assert_eq!(back.status, ReplyStatus::Error);
                assert_eq!(back.error.as_deref(), Some("no such motor"));
            }
            other => panic!("expected reply, got {:?}", other),
        }
    }

    #[test]
    fn test_push_round_trip() {
        let push = PushEvent {
            event: "motor_status".to_string(),
            payload: object! { "name" => "Motor 2", "position" => 3.0, "moving" => true },
        };

        let frame = encode_push(&push).unwrap();
        match decode_frame(&frame).unwrap() {
            Frame::Push(back) => assert_eq!(back, push),
            other => panic!("expected push, got {:?}", other),
        }
    }

    #[test]
    fn test_malformed_frames() {
        assert!(matches!(
            decode_frame(b"not json at all"),
            Err(CallError::Malformed(_))
        ));

        // Valid JSON but neither a reply nor a push
        assert!(matches!(
            decode_frame(b"{\"foo\": 1}"),
            Err(CallError::Malformed(_))
        ));

        // A frame that mixes reply and push markers is ambiguous
        let mixed = format!(
            "{{\"id\": \"{}\", \"status\": \"ok\", \"event\": \"motor_status\"}}",
            Uuid::new_v4()
        );
        assert!(matches!(
            decode_frame(mixed.as_bytes()),
            Err(CallError::Malformed(_))
        ));
    }
}
