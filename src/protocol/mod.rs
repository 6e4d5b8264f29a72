//! Wire protocol types.
//!
//! The debugging protocol is JSON over one WebSocket. Everything we send
//! is a [`Command`]; everything we receive is an [`InboundMessage`] that
//! is either a response (correlated by id) or an event notification.
//!
//! # Message Flow
//!
//! | Message | Direction | Purpose |
//! |---------|-----------|---------|
//! | [`Command`] | local → browser | `{id, method, params}` request |
//! | [`CommandResponse`] | browser → local | `{id, result?\|error?}` |
//! | [`EventMessage`] | browser → local | `{method, params}` notification |
//!
//! Nested targets (workers, out-of-process frames) speak the same
//! protocol tunneled through `Target.sendMessageToTarget` /
//! `Target.receivedMessageFromTarget` envelopes whose `message` field is
//! a JSON string.
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | `command` | Outbound command envelope and target wrapping |
//! | `message` | Inbound frame classification |
//! | `event` | Typed payloads for events the session acts on |

// ============================================================================
// Submodules
// ============================================================================

/// Outbound command envelope.
pub mod command;

/// Typed event payloads.
pub mod event;

/// Inbound message classification.
pub mod message;

// ============================================================================
// Re-exports
// ============================================================================

pub use command::Command;
pub use event::{
    DataReceived, FrameNavigated, Headers, LoadingFailed, LoadingFinished, ParsedEvent,
    RequestExtraInfo, RequestInfo, RequestWillBeSent, ResourceChangedPriority, ResponseExtraInfo,
    ResponseInfo, ResponseReceived, ResponseTiming, ServedFromCache, TargetInfo,
};
pub use message::{CommandResponse, EventMessage, InboundMessage, ProtocolError};
