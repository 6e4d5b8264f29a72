//! Typed event payloads.
//!
//! Inbound events arrive as `{method, params}` with loosely-shaped JSON
//! params. [`ParsedEvent::parse`] maps the methods the session acts on
//! into typed variants; everything else is carried through as
//! [`ParsedEvent::Other`] with the raw params so the raw protocol log
//! and the activity clock still see it.
//!
//! # Covered Domains
//!
//! | Domain | Events |
//! |--------|--------|
//! | `Network` | requestWillBeSent, requestWillBeSentExtraInfo, responseReceived, responseReceivedExtraInfo, requestServedFromCache, dataReceived, loadingFinished, loadingFailed, resourceChangedPriority |
//! | `Page` | loadEventFired, domContentEventFired, frameStartedLoading, frameStoppedLoading, frameNavigated, javascriptDialogOpening, interstitialShown |
//! | `CSS` | styleSheetAdded |
//! | `Target` | targetCreated, attachedToTarget |
//! | `Inspector` | detached, targetCrashed |
//! | `Debugger` | paused |
//!
//! A malformed payload for a known method is reported as a decode error
//! by the caller and dropped; it never aborts the pump.

// ============================================================================
// Imports
// ============================================================================

use rustc_hash::FxHashMap;
use serde::Deserialize;
use serde_json::Value;

use crate::error::Result;
use crate::identifiers::{FrameId, RequestId, TargetId};
use crate::protocol::message::EventMessage;

// ============================================================================
// ParsedEvent
// ============================================================================

/// One event decoded into the shape the router consumes.
#[derive(Debug, Clone)]
pub enum ParsedEvent {
    /// `Network.requestWillBeSent`
    RequestWillBeSent(RequestWillBeSent),
    /// `Network.requestWillBeSentExtraInfo`
    RequestExtraInfo(RequestExtraInfo),
    /// `Network.responseReceived`
    ResponseReceived(ResponseReceived),
    /// `Network.responseReceivedExtraInfo`
    ResponseExtraInfo(ResponseExtraInfo),
    /// `Network.requestServedFromCache`
    ServedFromCache(ServedFromCache),
    /// `Network.dataReceived`
    DataReceived(DataReceived),
    /// `Network.loadingFinished`
    LoadingFinished(LoadingFinished),
    /// `Network.loadingFailed`
    LoadingFailed(LoadingFailed),
    /// `Network.resourceChangedPriority`
    ResourceChangedPriority(ResourceChangedPriority),
    /// `Page.loadEventFired`
    LoadEventFired { timestamp: f64 },
    /// `Page.domContentEventFired`
    DomContentEventFired { timestamp: f64 },
    /// `Page.frameStartedLoading`
    FrameStartedLoading { frame_id: FrameId },
    /// `Page.frameStoppedLoading`
    FrameStoppedLoading { frame_id: FrameId },
    /// `Page.frameNavigated`
    FrameNavigated(FrameNavigated),
    /// `Page.javascriptDialogOpening`
    JavascriptDialogOpening { message: String },
    /// `Page.interstitialShown`
    InterstitialShown,
    /// `CSS.styleSheetAdded`
    StyleSheetAdded(StyleSheetHeader),
    /// `Target.targetCreated`
    TargetCreated(TargetInfo),
    /// `Target.attachedToTarget`
    AttachedToTarget(TargetInfo),
    /// `Inspector.detached`
    InspectorDetached { reason: String },
    /// `Inspector.targetCrashed`
    TargetCrashed,
    /// `Debugger.paused`
    DebuggerPaused,
    /// Any event the session does not act on structurally.
    Other {
        /// Full `Domain.event` method.
        method: String,
        /// Raw params.
        params: Value,
    },
}

impl ParsedEvent {
    /// Decodes an event message into a typed variant.
    pub fn parse(event: &EventMessage) -> Result<Self> {
        let params = event.params.clone();
        let parsed = match event.method.as_str() {
            "Network.requestWillBeSent" => {
                Self::RequestWillBeSent(serde_json::from_value(params)?)
            }
            "Network.requestWillBeSentExtraInfo" => {
                Self::RequestExtraInfo(serde_json::from_value(params)?)
            }
            "Network.responseReceived" => Self::ResponseReceived(serde_json::from_value(params)?),
            "Network.responseReceivedExtraInfo" => {
                Self::ResponseExtraInfo(serde_json::from_value(params)?)
            }
            "Network.requestServedFromCache" => {
                Self::ServedFromCache(serde_json::from_value(params)?)
            }
            "Network.dataReceived" => Self::DataReceived(serde_json::from_value(params)?),
            "Network.loadingFinished" => Self::LoadingFinished(serde_json::from_value(params)?),
            "Network.loadingFailed" => Self::LoadingFailed(serde_json::from_value(params)?),
            "Network.resourceChangedPriority" => {
                Self::ResourceChangedPriority(serde_json::from_value(params)?)
            }
            "Page.loadEventFired" => {
                let payload: TimestampOnly = serde_json::from_value(params)?;
                Self::LoadEventFired {
                    timestamp: payload.timestamp,
                }
            }
            "Page.domContentEventFired" => {
                let payload: TimestampOnly = serde_json::from_value(params)?;
                Self::DomContentEventFired {
                    timestamp: payload.timestamp,
                }
            }
            "Page.frameStartedLoading" => {
                let payload: FrameOnly = serde_json::from_value(params)?;
                Self::FrameStartedLoading {
                    frame_id: payload.frame_id,
                }
            }
            "Page.frameStoppedLoading" => {
                let payload: FrameOnly = serde_json::from_value(params)?;
                Self::FrameStoppedLoading {
                    frame_id: payload.frame_id,
                }
            }
            "Page.frameNavigated" => Self::FrameNavigated(serde_json::from_value(params)?),
            "Page.javascriptDialogOpening" => {
                let payload: DialogOpening = serde_json::from_value(params)?;
                Self::JavascriptDialogOpening {
                    message: payload.message,
                }
            }
            "Page.interstitialShown" => Self::InterstitialShown,
            "CSS.styleSheetAdded" => {
                let payload: StyleSheetEnvelope = serde_json::from_value(params)?;
                Self::StyleSheetAdded(payload.header)
            }
            "Target.targetCreated" => {
                let payload: TargetEnvelope = serde_json::from_value(params)?;
                Self::TargetCreated(payload.target_info)
            }
            "Target.attachedToTarget" => {
                let payload: TargetEnvelope = serde_json::from_value(params)?;
                Self::AttachedToTarget(payload.target_info)
            }
            "Inspector.detached" => {
                let payload: DetachReason = serde_json::from_value(params)?;
                Self::InspectorDetached {
                    reason: payload.reason,
                }
            }
            "Inspector.targetCrashed" => Self::TargetCrashed,
            "Debugger.paused" => Self::DebuggerPaused,
            _ => Self::Other {
                method: event.method.clone(),
                params,
            },
        };
        Ok(parsed)
    }
}

// ============================================================================
// Network Payloads
// ============================================================================

/// HTTP header map as sent on the wire.
pub type Headers = FxHashMap<String, String>;

/// `Network.requestWillBeSent` payload.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestWillBeSent {
    pub request_id: RequestId,
    #[serde(default)]
    pub frame_id: Option<FrameId>,
    /// Monotonic seconds.
    pub timestamp: f64,
    #[serde(default)]
    pub wall_time: Option<f64>,
    pub request: RequestInfo,
    /// Present when this send is the next hop of a redirect.
    #[serde(default)]
    pub redirect_response: Option<ResponseInfo>,
    /// Resource type (`Document`, `Script`, ...).
    #[serde(rename = "type", default)]
    pub resource_type: Option<String>,
    #[serde(default)]
    pub initiator: Option<Value>,
    #[serde(default)]
    pub document_url: Option<String>,
}

/// Request description nested inside `requestWillBeSent`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestInfo {
    pub url: String,
    pub method: String,
    #[serde(default)]
    pub headers: Headers,
    #[serde(default)]
    pub initial_priority: Option<String>,
}

/// `Network.requestWillBeSentExtraInfo` payload.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestExtraInfo {
    pub request_id: RequestId,
    #[serde(default)]
    pub headers: Headers,
}

/// `Network.responseReceived` payload.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseReceived {
    pub request_id: RequestId,
    pub timestamp: f64,
    pub response: ResponseInfo,
    #[serde(default)]
    pub frame_id: Option<FrameId>,
}

/// Response description shared by `responseReceived` and
/// `redirectResponse`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseInfo {
    #[serde(default)]
    pub url: Option<String>,
    pub status: i64,
    #[serde(default)]
    pub status_text: Option<String>,
    #[serde(default)]
    pub headers: Headers,
    #[serde(default)]
    pub mime_type: Option<String>,
    #[serde(default)]
    pub protocol: Option<String>,
    #[serde(default)]
    pub from_disk_cache: Option<bool>,
    #[serde(default)]
    pub from_service_worker: Option<bool>,
    #[serde(default)]
    pub remote_ip_address: Option<String>,
    #[serde(default)]
    pub remote_port: Option<u16>,
    #[serde(default)]
    pub timing: Option<ResponseTiming>,
}

/// Wire-level timing block inside a response, seconds/milliseconds mix
/// as delivered by the browser (`request_time` in monotonic seconds,
/// the rest in milliseconds relative to it; `-1` means not applicable).
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseTiming {
    pub request_time: f64,
    #[serde(default = "minus_one")]
    pub dns_start: f64,
    #[serde(default = "minus_one")]
    pub dns_end: f64,
    #[serde(default = "minus_one")]
    pub connect_start: f64,
    #[serde(default = "minus_one")]
    pub connect_end: f64,
    #[serde(default = "minus_one")]
    pub ssl_start: f64,
    #[serde(default = "minus_one")]
    pub ssl_end: f64,
    #[serde(default = "minus_one")]
    pub send_start: f64,
    #[serde(default = "minus_one")]
    pub send_end: f64,
    #[serde(default = "minus_one")]
    pub receive_headers_end: f64,
}

fn minus_one() -> f64 {
    -1.0
}

/// `Network.responseReceivedExtraInfo` payload.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseExtraInfo {
    pub request_id: RequestId,
    #[serde(default)]
    pub headers: Headers,
    #[serde(default)]
    pub status_code: Option<i64>,
}

/// `Network.requestServedFromCache` payload.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServedFromCache {
    pub request_id: RequestId,
}

/// `Network.dataReceived` payload.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataReceived {
    pub request_id: RequestId,
    pub timestamp: f64,
    /// Decoded (post-content-decoding) byte count.
    pub data_length: u64,
    /// On-the-wire byte count; 0 when the data came from cache.
    #[serde(default)]
    pub encoded_data_length: u64,
}

/// `Network.loadingFinished` payload.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadingFinished {
    pub request_id: RequestId,
    pub timestamp: f64,
    #[serde(default)]
    pub encoded_data_length: Option<f64>,
}

/// `Network.loadingFailed` payload.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadingFailed {
    pub request_id: RequestId,
    pub timestamp: f64,
    #[serde(default)]
    pub error_text: Option<String>,
    #[serde(default)]
    pub canceled: Option<bool>,
    #[serde(default)]
    pub blocked_reason: Option<String>,
}

/// `Network.resourceChangedPriority` payload.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceChangedPriority {
    pub request_id: RequestId,
    pub timestamp: f64,
    pub new_priority: String,
}

// ============================================================================
// Page Payloads
// ============================================================================

#[derive(Debug, Deserialize)]
struct TimestampOnly {
    timestamp: f64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FrameOnly {
    frame_id: FrameId,
}

#[derive(Debug, Deserialize)]
struct DialogOpening {
    #[serde(default)]
    message: String,
}

/// `Page.frameNavigated` payload.
#[derive(Debug, Clone, Deserialize)]
pub struct FrameNavigated {
    pub frame: FrameDescriptor,
}

/// Frame description within a navigation event.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FrameDescriptor {
    pub id: FrameId,
    #[serde(default)]
    pub parent_id: Option<FrameId>,
    #[serde(default)]
    pub url: Option<String>,
}

// ============================================================================
// CSS Payloads
// ============================================================================

#[derive(Debug, Deserialize)]
struct StyleSheetEnvelope {
    header: StyleSheetHeader,
}

/// Stylesheet description inside `CSS.styleSheetAdded`, trimmed to the
/// fields coverage reporting joins on.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StyleSheetHeader {
    pub style_sheet_id: String,
    /// Origin URL; empty for inline and constructed sheets.
    #[serde(rename = "sourceURL", default)]
    pub source_url: String,
}

// ============================================================================
// Target / Inspector Payloads
// ============================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TargetEnvelope {
    target_info: TargetInfo,
}

/// Target description inside `targetCreated` / `attachedToTarget`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetInfo {
    pub target_id: TargetId,
    /// `page`, `iframe`, `worker`, `service_worker`, ...
    #[serde(rename = "type")]
    pub target_type: String,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
}

impl TargetInfo {
    /// Returns `true` for targets that get the reduced enable sequence
    /// while recording.
    #[inline]
    #[must_use]
    pub fn is_worker(&self) -> bool {
        matches!(self.target_type.as_str(), "worker" | "service_worker")
    }
}

#[derive(Debug, Deserialize)]
struct DetachReason {
    #[serde(default)]
    reason: String,
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use serde_json::json;

    fn event(method: &str, params: Value) -> EventMessage {
        EventMessage {
            method: method.to_string(),
            params,
        }
    }

    #[test]
    fn test_request_will_be_sent() {
        let parsed = ParsedEvent::parse(&event(
            "Network.requestWillBeSent",
            json!({
                "requestId": "88.1",
                "frameId": "F1",
                "timestamp": 1000.25,
                "request": {
                    "url": "https://example.com/",
                    "method": "GET",
                    "headers": {"Accept": "*/*"},
                    "initialPriority": "VeryHigh"
                },
                "type": "Document"
            }),
        ))
        .expect("parse");

        let ParsedEvent::RequestWillBeSent(payload) = parsed else {
            panic!("wrong variant");
        };
        assert_eq!(payload.request_id.as_str(), "88.1");
        assert_eq!(payload.request.url, "https://example.com/");
        assert_eq!(payload.resource_type.as_deref(), Some("Document"));
        assert!(payload.redirect_response.is_none());
    }

    #[test]
    fn test_redirect_response_carried() {
        let parsed = ParsedEvent::parse(&event(
            "Network.requestWillBeSent",
            json!({
                "requestId": "88.1",
                "timestamp": 1001.0,
                "request": {"url": "https://example.com/next", "method": "GET"},
                "redirectResponse": {"status": 302, "headers": {"Location": "/next"}}
            }),
        ))
        .expect("parse");

        let ParsedEvent::RequestWillBeSent(payload) = parsed else {
            panic!("wrong variant");
        };
        assert_eq!(payload.redirect_response.expect("redirect").status, 302);
    }

    #[test]
    fn test_loading_finished() {
        let parsed = ParsedEvent::parse(&event(
            "Network.loadingFinished",
            json!({"requestId": "88.1", "timestamp": 1002.5, "encodedDataLength": 512.0}),
        ))
        .expect("parse");
        assert!(matches!(parsed, ParsedEvent::LoadingFinished(p)
            if p.encoded_data_length == Some(512.0)));
    }

    #[test]
    fn test_attached_to_target_worker() {
        let parsed = ParsedEvent::parse(&event(
            "Target.attachedToTarget",
            json!({"targetInfo": {"targetId": "W1", "type": "service_worker"}}),
        ))
        .expect("parse");
        let ParsedEvent::AttachedToTarget(info) = parsed else {
            panic!("wrong variant");
        };
        assert!(info.is_worker());
    }

    #[test]
    fn test_style_sheet_added() {
        let parsed = ParsedEvent::parse(&event(
            "CSS.styleSheetAdded",
            json!({"header": {
                "styleSheetId": "S9",
                "sourceURL": "https://example.com/app.css",
                "frameId": "F1",
            }}),
        ))
        .expect("parse");
        let ParsedEvent::StyleSheetAdded(header) = parsed else {
            panic!("wrong variant");
        };
        assert_eq!(header.style_sheet_id, "S9");
        assert_eq!(header.source_url, "https://example.com/app.css");
    }

    #[test]
    fn test_inline_style_sheet_has_empty_source_url() {
        let parsed = ParsedEvent::parse(&event(
            "CSS.styleSheetAdded",
            json!({"header": {"styleSheetId": "S10"}}),
        ))
        .expect("parse");
        assert!(matches!(parsed, ParsedEvent::StyleSheetAdded(h)
            if h.source_url.is_empty()));
    }

    #[test]
    fn test_unknown_event_passes_through() {
        let parsed = ParsedEvent::parse(&event("Animation.animationStarted", json!({"x": 1})))
            .expect("parse");
        assert!(matches!(parsed, ParsedEvent::Other { method, .. }
            if method == "Animation.animationStarted"));
    }

    #[test]
    fn test_malformed_known_event_is_error() {
        let result = ParsedEvent::parse(&event("Network.loadingFinished", json!({"bogus": true})));
        assert!(result.is_err());
    }
}
