//! Inbound message classification.
//!
//! Every text frame off the wire is one JSON object and is exactly one
//! of two things:
//!
//! | Shape | Meaning |
//! |-------|---------|
//! | has `method` | Event notification `{method, params}` |
//! | has `id`, no `method` | Response to a previously sent command |
//!
//! Nested targets add one more layer: a `Target.receivedMessageFromTarget`
//! event whose `message` param is a JSON *string* holding another complete
//! inbound message from that target. [`InboundMessage::unwrap_nested`]
//! peels that layer.

// ============================================================================
// Imports
// ============================================================================

use serde::Deserialize;
use serde_json::Value;

use crate::error::{Error, Result};
use crate::identifiers::{CommandId, TargetId};

// ============================================================================
// InboundMessage
// ============================================================================

/// One decoded inbound frame.
#[derive(Debug, Clone)]
pub enum InboundMessage {
    /// Response to a command we sent.
    Response(CommandResponse),
    /// Event notification.
    Event(EventMessage),
}

/// Response to a command, successful or not.
#[derive(Debug, Clone)]
pub struct CommandResponse {
    /// Id of the command this responds to.
    pub id: CommandId,
    /// Result payload, present on success.
    pub result: Option<Value>,
    /// Error payload, present on failure.
    pub error: Option<ProtocolError>,
}

/// Event notification with its raw parameters.
#[derive(Debug, Clone)]
pub struct EventMessage {
    /// Method in `Domain.event` format.
    pub method: String,
    /// Event parameters (may be `Value::Null` when absent).
    pub params: Value,
}

/// Error payload inside a failed command response.
#[derive(Debug, Clone, Deserialize)]
pub struct ProtocolError {
    /// Numeric protocol error code.
    pub code: i64,
    /// Human-readable description.
    pub message: String,
}

#[derive(Debug, Deserialize)]
struct RawMessage {
    id: Option<u64>,
    method: Option<String>,
    #[serde(default)]
    params: Value,
    result: Option<Value>,
    error: Option<ProtocolError>,
}

impl InboundMessage {
    /// Decodes one wire frame.
    pub fn from_wire(text: &str) -> Result<Self> {
        let raw: RawMessage = serde_json::from_str(text)?;
        Self::from_raw(raw)
    }

    /// Decodes an already-parsed JSON object.
    pub fn from_value(value: Value) -> Result<Self> {
        let raw: RawMessage = serde_json::from_value(value)?;
        Self::from_raw(raw)
    }

    fn from_raw(raw: RawMessage) -> Result<Self> {
        if let Some(method) = raw.method {
            return Ok(Self::Event(EventMessage {
                method,
                params: raw.params,
            }));
        }
        match raw.id {
            Some(id) => Ok(Self::Response(CommandResponse {
                id: CommandId(id),
                result: raw.result,
                error: raw.error,
            })),
            None => Err(Error::protocol("message has neither method nor id")),
        }
    }

    /// Returns the event method, if this is an event.
    #[inline]
    #[must_use]
    pub fn method(&self) -> Option<&str> {
        match self {
            Self::Event(event) => Some(&event.method),
            Self::Response(_) => None,
        }
    }
}

impl EventMessage {
    /// Splits the method into `(domain, event)` at the first dot.
    ///
    /// An undotted method yields an empty event name.
    #[must_use]
    pub fn split_method(&self) -> (&str, &str) {
        match self.method.split_once('.') {
            Some((domain, event)) => (domain, event),
            None => (self.method.as_str(), ""),
        }
    }

    /// Unwraps a `Target.receivedMessageFromTarget` envelope into the
    /// sending target's id and the nested message.
    ///
    /// Returns `Ok(None)` when this event is not such an envelope.
    pub fn unwrap_nested(&self) -> Result<Option<(TargetId, InboundMessage)>> {
        if self.method != "Target.receivedMessageFromTarget" {
            return Ok(None);
        }
        let target_id = self
            .params
            .get("targetId")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::protocol("receivedMessageFromTarget without targetId"))?;
        let inner = self
            .params
            .get("message")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::protocol("receivedMessageFromTarget without message"))?;
        let message = InboundMessage::from_wire(inner)?;
        Ok(Some((TargetId::new(target_id), message)))
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_response_classification() {
        let msg = InboundMessage::from_wire(r#"{"id": 5, "result": {"frameId": "F1"}}"#)
            .expect("decode");
        match msg {
            InboundMessage::Response(resp) => {
                assert_eq!(resp.id, CommandId(5));
                assert_eq!(resp.result.expect("result")["frameId"], "F1");
                assert!(resp.error.is_none());
            }
            InboundMessage::Event(_) => panic!("classified as event"),
        }
    }

    #[test]
    fn test_error_response() {
        let msg = InboundMessage::from_wire(
            r#"{"id": 9, "error": {"code": -32000, "message": "No resource"}}"#,
        )
        .expect("decode");
        match msg {
            InboundMessage::Response(resp) => {
                let err = resp.error.expect("error");
                assert_eq!(err.code, -32000);
                assert_eq!(err.message, "No resource");
            }
            InboundMessage::Event(_) => panic!("classified as event"),
        }
    }

    #[test]
    fn test_event_classification_and_split() {
        let msg = InboundMessage::from_wire(
            r#"{"method": "Network.loadingFinished", "params": {"requestId": "1.1"}}"#,
        )
        .expect("decode");
        match msg {
            InboundMessage::Event(event) => {
                assert_eq!(event.split_method(), ("Network", "loadingFinished"));
            }
            InboundMessage::Response(_) => panic!("classified as response"),
        }
    }

    #[test]
    fn test_empty_object_rejected() {
        assert!(InboundMessage::from_wire("{}").is_err());
    }

    #[test]
    fn test_unwrap_nested() {
        let inner = r#"{\"method\": \"Runtime.consoleAPICalled\", \"params\": {}}"#;
        let frame = format!(
            r#"{{"method": "Target.receivedMessageFromTarget",
                "params": {{"targetId": "W1", "message": "{inner}"}}}}"#,
        );
        let msg = InboundMessage::from_wire(&frame).expect("decode");
        let InboundMessage::Event(event) = msg else {
            panic!("classified as response");
        };
        let (target, nested) = event.unwrap_nested().expect("unwrap").expect("envelope");
        assert_eq!(target.as_str(), "W1");
        assert_eq!(nested.method(), Some("Runtime.consoleAPICalled"));
    }

    #[test]
    fn test_unwrap_nested_ignores_other_events() {
        let msg = InboundMessage::from_wire(r#"{"method": "Page.loadEventFired", "params": {}}"#)
            .expect("decode");
        let InboundMessage::Event(event) = msg else {
            panic!("classified as response");
        };
        assert!(event.unwrap_nested().expect("unwrap").is_none());
    }
}
