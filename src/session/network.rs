//! Network request state machine.
//!
//! Tracks every network request announced over the protocol from
//! `requestWillBeSent` to a terminal `loadingFinished` / `loadingFailed`
//! / `requestServedFromCache`, including redirect hop chaining, header
//! merging from the extra-info event pair, byte accounting, and the
//! page-level navigation state derived from the main request.
//!
//! # Redirect Identity
//!
//! The browser reuses one protocol request id across every hop of a
//! redirect chain. Each hop is a distinct logical request here: when a
//! `requestWillBeSent` arrives carrying a `redirectResponse`, the open
//! record is closed with that response, re-keyed to `<id>-<hop>`, and a
//! fresh record (same `original_id`) opens for the next hop. The final
//! hop keeps the bare id.
//!
//! All methods take `&mut self` and run in the session's pump context;
//! there is no locking here.

// ============================================================================
// Imports
// ============================================================================

use rustc_hash::FxHashMap;
use serde::Serialize;
use tracing::{debug, warn};

use crate::identifiers::{FrameId, RequestId, TargetId};
use crate::protocol::event::{
    DataReceived, Headers, LoadingFailed, LoadingFinished, RequestExtraInfo, RequestWillBeSent,
    ResourceChangedPriority, ResponseExtraInfo, ResponseInfo, ResponseReceived, ServedFromCache,
};
use crate::trace::netlog::NetlogRequest;

// ============================================================================
// Constants
// ============================================================================

/// Navigation error code for a failed main-request load.
pub const NAV_ERROR_GENERIC: u32 = 12999;

/// Navigation error code for a page-load timeout.
pub const NAV_ERROR_TIMEOUT: u32 = 99997;

/// Navigation error code when the page is replaced by an interstitial.
pub const NAV_ERROR_INTERSTITIAL: u32 = 405;

/// Navigation error code when no navigation was observed at all.
pub const NAV_ERROR_NO_NAVIGATION: u32 = 404;

/// Video bodies above this size are never fetched.
const VIDEO_BODY_LIMIT: u64 = 10_000_000;

// ============================================================================
// RequestRecord
// ============================================================================

/// One logical network request (a single redirect hop).
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestRecord {
    /// Logical id; `<protocol-id>` or `<protocol-id>-<hop>`.
    pub id: RequestId,
    /// Protocol id shared by every hop of the chain.
    pub original_id: RequestId,
    /// Insertion-ordered sequence number.
    pub sequence: u64,
    pub url: String,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub frame_id: Option<FrameId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub document_url: Option<String>,
    /// Nested target (worker, service worker) the request came from;
    /// `None` for the page itself.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_id: Option<TargetId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resource_type: Option<String>,
    /// Last observed priority.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub priority: Option<String>,
    /// `(timestamp, priority)` history of priority changes.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub priority_changes: Vec<(f64, String)>,
    pub request_headers: Headers,
    pub response_headers: Headers,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub protocol: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remote_ip: Option<String>,

    /// Monotonic seconds of `requestWillBeSent`.
    pub start: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub wall_time: Option<f64>,
    /// Monotonic seconds of the first response byte (headers or data).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub first_byte: Option<f64>,
    /// Monotonic seconds of the terminal event.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end: Option<f64>,

    /// On-the-wire bytes (encoded).
    pub bytes_in: u64,
    /// Decoded body bytes.
    pub object_size: u64,
    /// `(timestamp, encoded, decoded)` per data chunk.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub chunks: Vec<(f64, u64, u64)>,
    /// Final transfer size; `loadingFinished.encodedDataLength` when
    /// present, accumulated chunk bytes otherwise.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transfer_size: Option<u64>,

    pub from_net: bool,
    pub from_cache: bool,
    /// This hop ended in a redirect to the next one.
    pub is_redirect: bool,
    pub is_video: bool,
    pub finished: bool,
    pub failed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub canceled: Option<bool>,

    /// Fetched response body; serialized separately, never inline.
    #[serde(skip)]
    pub body: Option<Vec<u8>>,
    /// A body fetch already ran for this record (even if it failed).
    #[serde(skip)]
    pub body_requested: bool,

    // Netlog-derived timings, milliseconds relative to capture start.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dns_start_ms: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dns_end_ms: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connect_start_ms: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connect_end_ms: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ssl_start_ms: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ssl_end_ms: Option<f64>,
}

impl RequestRecord {
    fn new(sequence: u64, payload: &RequestWillBeSent, target: Option<&TargetId>) -> Self {
        Self {
            id: payload.request_id.clone(),
            original_id: payload.request_id.clone(),
            sequence,
            url: payload.request.url.clone(),
            method: payload.request.method.clone(),
            frame_id: payload.frame_id.clone(),
            document_url: payload.document_url.clone(),
            target_id: target.cloned(),
            resource_type: payload.resource_type.clone(),
            priority: payload.request.initial_priority.clone(),
            priority_changes: Vec::new(),
            request_headers: payload.request.headers.clone(),
            response_headers: Headers::default(),
            status: None,
            status_text: None,
            mime_type: None,
            protocol: None,
            remote_ip: None,
            start: payload.timestamp,
            wall_time: payload.wall_time,
            first_byte: None,
            end: None,
            bytes_in: 0,
            object_size: 0,
            chunks: Vec::new(),
            transfer_size: None,
            from_net: false,
            from_cache: false,
            is_redirect: false,
            is_video: is_video_url(&payload.request.url),
            finished: false,
            failed: false,
            error_text: None,
            canceled: None,
            body: None,
            body_requested: false,
            dns_start_ms: None,
            dns_end_ms: None,
            connect_start_ms: None,
            connect_end_ms: None,
            ssl_start_ms: None,
            ssl_end_ms: None,
        }
    }

    fn absorb_response(&mut self, response: &ResponseInfo) {
        self.status = Some(response.status);
        if let Some(text) = &response.status_text {
            self.status_text = Some(text.clone());
        }
        if let Some(mime) = &response.mime_type {
            if mime.starts_with("video/") {
                self.is_video = true;
            }
            self.mime_type = Some(mime.clone());
        }
        if let Some(protocol) = &response.protocol {
            self.protocol = Some(protocol.clone());
        }
        if let Some(ip) = &response.remote_ip_address {
            self.remote_ip = Some(ip.clone());
        }
        if response.from_disk_cache == Some(true) {
            self.from_cache = true;
        }
        merge_headers(&mut self.response_headers, &response.headers);
    }

    /// Time to first byte in milliseconds, when both ends are known.
    #[must_use]
    pub fn ttfb_ms(&self) -> Option<f64> {
        self.first_byte.map(|fb| (fb - self.start) * 1000.0)
    }

    /// Milliseconds from `epoch` (the main request start) to the
    /// terminal event.
    #[must_use]
    pub fn load_ms(&self, epoch: f64) -> Option<f64> {
        self.end.map(|end| (end - epoch) * 1000.0)
    }

    /// Returns `true` when the response body looks textual.
    #[must_use]
    pub fn is_text(&self) -> bool {
        let Some(mime) = &self.mime_type else {
            return false;
        };
        let mime = mime.to_ascii_lowercase();
        mime.starts_with("text/")
            || mime.contains("json")
            || mime.contains("javascript")
            || mime.contains("xml")
            || mime.contains("svg")
            || mime.contains("css")
            || mime.contains("html")
    }

    /// Body-fetch policy for a terminal record.
    ///
    /// `archive_all` fetches every text body; `archive_html` only the
    /// main document. Oversized video payloads are never fetched.
    #[must_use]
    pub fn wants_body(&self, archive_all: bool, archive_html: bool, is_main: bool) -> bool {
        if self.body_requested || self.failed || !self.finished {
            return false;
        }
        if self.is_video && self.object_size > VIDEO_BODY_LIMIT {
            return false;
        }
        if !self.is_text() {
            return false;
        }
        archive_all || (archive_html && is_main)
    }
}

fn is_video_url(url: &str) -> bool {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    path.to_ascii_lowercase().ends_with(".mp4")
}

/// Merges `incoming` into `headers`, case-folded, last observation wins.
pub fn merge_headers(headers: &mut Headers, incoming: &Headers) {
    for (name, value) in incoming {
        let existing = headers
            .keys()
            .find(|k| k.eq_ignore_ascii_case(name))
            .cloned();
        if let Some(old_name) = existing {
            headers.remove(&old_name);
        }
        headers.insert(name.clone(), value.clone());
    }
}

// ============================================================================
// PageState
// ============================================================================

/// Page-level navigation state derived from Page and main-request events.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PageState {
    /// Monotonic seconds of `Page.loadEventFired`.
    pub load_event: Option<f64>,
    /// Monotonic seconds of `Page.domContentEventFired`.
    pub dom_content: Option<f64>,
    /// Main frame id once known.
    pub main_frame: Option<FrameId>,
    /// Frames currently loading.
    pub loading_frames: Vec<FrameId>,
    /// `(code, message)` navigation error, sticky once set.
    pub nav_error: Option<(u32, String)>,
}

impl PageState {
    /// Records a navigation error unless one is already set.
    pub fn set_nav_error(&mut self, code: u32, message: impl Into<String>) {
        if self.nav_error.is_none() {
            let message = message.into();
            warn!(code, message = %message, "navigation error");
            self.nav_error = Some((code, message));
        }
    }
}

// ============================================================================
// RequestStore
// ============================================================================

/// All request state for one recording.
#[derive(Debug, Default)]
pub struct RequestStore {
    /// Open records keyed by protocol id (current hop only).
    active: FxHashMap<RequestId, RequestRecord>,
    /// Closed records in terminal order.
    completed: Vec<RequestRecord>,
    /// Redirect hop counter per protocol id.
    hops: FxHashMap<RequestId, u32>,
    /// Protocol id of the main (first document) request.
    main_request: Option<RequestId>,
    /// Monotonic seconds of the main request start; the zero point for
    /// reported load times.
    epoch: Option<f64>,
    /// Any response-bearing event has been seen this session. A failure
    /// before this flips is a full navigation failure, whichever
    /// request failed.
    response_started: bool,
    /// Count of requests that actually hit the network.
    from_net_count: u64,
    next_sequence: u64,
    /// Page-level navigation state.
    pub page: PageState,
}

impl RequestStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Zero point for load-time reporting.
    #[inline]
    #[must_use]
    pub fn epoch(&self) -> Option<f64> {
        self.epoch
    }

    /// Protocol id of the main request.
    #[inline]
    #[must_use]
    pub fn main_request(&self) -> Option<&RequestId> {
        self.main_request.as_ref()
    }

    /// Number of requests that went to the network.
    #[inline]
    #[must_use]
    pub fn from_net_count(&self) -> u64 {
        self.from_net_count
    }

    /// Handles `Network.requestWillBeSent`, opening a record and closing
    /// the previous hop when this send is a redirect continuation.
    ///
    /// `target` marks requests tunneled out of a nested target (worker,
    /// service worker) so records stay attributable after the merge.
    pub fn on_request_will_be_sent(
        &mut self,
        payload: &RequestWillBeSent,
        target: Option<&TargetId>,
    ) {
        if let Some(redirect) = &payload.redirect_response
            && let Some(mut open) = self.active.remove(&payload.request_id)
        {
            open.absorb_response(redirect);
            open.is_redirect = true;
            open.finished = true;
            if open.first_byte.is_none() {
                open.first_byte = Some(payload.timestamp);
            }
            open.end = Some(payload.timestamp);
            if !open.from_cache {
                open.from_net = true;
                self.from_net_count += 1;
            }
            let hop = self.hops.entry(payload.request_id.clone()).or_insert(0);
            *hop += 1;
            open.id = payload.request_id.redirect_hop(*hop);
            debug!(id = %open.id, url = %open.url, "redirect hop closed");
            self.completed.push(open);
        }

        let mut record = RequestRecord::new(self.next_sequence, payload, target);
        self.next_sequence += 1;

        // The first document request on the main frame anchors the
        // page's zero time.
        if self.main_request.is_none()
            && payload.redirect_response.is_none()
            && payload.resource_type.as_deref() == Some("Document")
        {
            self.main_request = Some(payload.request_id.clone());
            self.epoch = Some(payload.timestamp);
            if self.page.main_frame.is_none() {
                self.page.main_frame = payload.frame_id.clone();
            }
            debug!(id = %payload.request_id, url = %record.url, "main request");
        }

        if let Some(previous) = self.active.insert(payload.request_id.clone(), record) {
            // Id reuse without a redirectResponse; keep the old record.
            warn!(id = %previous.id, "request id reused without redirect");
            self.completed.push(previous);
        }
    }

    /// Handles `Network.requestWillBeSentExtraInfo`.
    pub fn on_request_extra_info(&mut self, payload: &RequestExtraInfo) {
        if let Some(record) = self.active.get_mut(&payload.request_id) {
            merge_headers(&mut record.request_headers, &payload.headers);
        }
    }

    /// Handles `Network.responseReceived`.
    pub fn on_response_received(&mut self, payload: &ResponseReceived) {
        self.response_started = true;
        let is_main = self.main_request.as_ref() == Some(&payload.request_id);
        if let Some(record) = self.active.get_mut(&payload.request_id) {
            record.absorb_response(&payload.response);
            if record.first_byte.is_none() {
                record.first_byte = Some(payload.timestamp);
            }
            if is_main && payload.response.status >= 400 {
                self.page.set_nav_error(
                    payload.response.status as u32,
                    format!("main request failed with status {}", payload.response.status),
                );
            }
        }
    }

    /// Handles `Network.responseReceivedExtraInfo`.
    pub fn on_response_extra_info(&mut self, payload: &ResponseExtraInfo) {
        if let Some(record) = self.active.get_mut(&payload.request_id) {
            merge_headers(&mut record.response_headers, &payload.headers);
            if let Some(status) = payload.status_code {
                record.status = Some(status);
            }
        }
    }

    /// Handles `Network.dataReceived`. Returns `true` when the chunk
    /// belongs to a video request (callers skip the activity clock for
    /// those).
    pub fn on_data_received(&mut self, payload: &DataReceived) -> bool {
        self.response_started = true;
        let Some(record) = self.active.get_mut(&payload.request_id) else {
            return false;
        };
        if record.first_byte.is_none() {
            record.first_byte = Some(payload.timestamp);
        }
        record.bytes_in += payload.encoded_data_length;
        record.object_size += payload.data_length;
        record.chunks.push((
            payload.timestamp,
            payload.encoded_data_length,
            payload.data_length,
        ));
        record.is_video
    }

    /// Handles `Network.resourceChangedPriority`.
    pub fn on_priority_changed(&mut self, payload: &ResourceChangedPriority) {
        if let Some(record) = self.active.get_mut(&payload.request_id) {
            record.priority = Some(payload.new_priority.clone());
            record
                .priority_changes
                .push((payload.timestamp, payload.new_priority.clone()));
        }
    }

    /// Handles `Network.requestServedFromCache`.
    pub fn on_served_from_cache(&mut self, payload: &ServedFromCache) {
        self.response_started = true;
        if let Some(record) = self.active.get_mut(&payload.request_id) {
            record.from_cache = true;
        }
    }

    /// Handles `Network.loadingFinished`, closing the record.
    pub fn on_loading_finished(&mut self, payload: &LoadingFinished) {
        self.response_started = true;
        let Some(record) = self.active.get_mut(&payload.request_id) else {
            return;
        };
        record.finished = true;
        record.end = Some(payload.timestamp);
        if record.first_byte.is_none() {
            record.first_byte = Some(payload.timestamp);
        }
        record.transfer_size = match payload.encoded_data_length {
            Some(encoded) if encoded >= 0.0 => Some(encoded as u64),
            _ => Some(record.bytes_in),
        };
        if !record.from_cache {
            record.from_net = true;
            self.from_net_count += 1;
        }
    }

    /// Handles `Network.loadingFailed`, closing the record.
    pub fn on_loading_failed(&mut self, payload: &LoadingFailed) {
        let is_main = self.main_request.as_ref() == Some(&payload.request_id);
        if let Some(record) = self.active.get_mut(&payload.request_id) {
            record.failed = true;
            record.finished = true;
            record.end = Some(payload.timestamp);
            record.error_text = payload.error_text.clone();
            record.canceled = payload.canceled;
        }
        // A failure before any response this session means the
        // navigation itself never got off the ground, whichever request
        // failed.
        if !self.response_started {
            self.page.set_nav_error(
                NAV_ERROR_NO_NAVIGATION,
                payload
                    .error_text
                    .clone()
                    .unwrap_or_else(|| "unknown navigation error".to_string()),
            );
        } else if is_main && payload.canceled != Some(true) {
            self.page.set_nav_error(
                NAV_ERROR_GENERIC,
                payload
                    .error_text
                    .clone()
                    .unwrap_or_else(|| "main request failed".to_string()),
            );
        }
    }

    /// Looks up an open record.
    #[must_use]
    pub fn get_active(&self, id: &RequestId) -> Option<&RequestRecord> {
        self.active.get(id)
    }

    /// Stores a fetched body on an open or completed record.
    pub fn set_body(&mut self, id: &RequestId, body: Vec<u8>) {
        if let Some(record) = self.active.get_mut(id) {
            record.body = Some(body);
            record.body_requested = true;
        } else if let Some(record) = self.completed.iter_mut().find(|r| &r.id == id) {
            record.body = Some(body);
            record.body_requested = true;
        }
    }

    /// Marks a body fetch as attempted without a body.
    pub fn mark_body_requested(&mut self, id: &RequestId) {
        if let Some(record) = self.active.get_mut(id) {
            record.body_requested = true;
        }
    }

    /// Open records that still want a body under the given policy.
    #[must_use]
    pub fn body_candidates(&self, archive_all: bool, archive_html: bool) -> Vec<RequestId> {
        let mut ids: Vec<(u64, RequestId)> = self
            .active
            .values()
            .filter(|r| {
                let is_main = self.main_request.as_ref() == Some(&r.original_id);
                r.wants_body(archive_all, archive_html, is_main)
            })
            .map(|r| (r.sequence, r.id.clone()))
            .collect();
        ids.sort_by_key(|(seq, _)| *seq);
        ids.into_iter().map(|(_, id)| id).collect()
    }

    /// Drains the store into the final record list, insertion-ordered.
    #[must_use]
    pub fn finalize(&mut self) -> Vec<RequestRecord> {
        let mut records: Vec<RequestRecord> = self.completed.drain(..).collect();
        records.extend(self.active.drain().map(|(_, r)| r));
        records.sort_by_key(|r| r.sequence);
        records
    }

    /// Merges netlog-derived connection timings into a finalized record
    /// list.
    ///
    /// Matching is by URL, first unclaimed netlog request wins, in
    /// arrival order on both sides. Duplicate URLs therefore pair up in
    /// order; the pairing is intentionally order-dependent.
    pub fn merge_netlog(records: &mut [RequestRecord], netlog: &[NetlogRequest]) {
        let mut claimed = vec![false; netlog.len()];
        for record in records.iter_mut() {
            let Some(idx) = netlog
                .iter()
                .enumerate()
                .position(|(i, n)| !claimed[i] && n.url.as_deref() == Some(record.url.as_str()))
            else {
                continue;
            };
            claimed[idx] = true;
            let n = &netlog[idx];
            record.dns_start_ms = n.dns_start;
            record.dns_end_ms = n.dns_end;
            record.connect_start_ms = n.connect_start;
            record.connect_end_ms = n.connect_end;
            record.ssl_start_ms = n.ssl_start;
            record.ssl_end_ms = n.ssl_end;
            if record.protocol.is_none() {
                record.protocol = n.protocol.clone();
            }
            if record.remote_ip.is_none() {
                record.remote_ip = n.server_address.clone();
            }
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use serde_json::json;

    fn will_be_sent(id: &str, url: &str, ts: f64, doc: bool) -> RequestWillBeSent {
        serde_json::from_value(json!({
            "requestId": id,
            "frameId": "F1",
            "timestamp": ts,
            "request": {"url": url, "method": "GET", "headers": {}},
            "type": if doc { "Document" } else { "Script" },
        }))
        .expect("payload")
    }

    fn redirect_hop(id: &str, url: &str, ts: f64, status: i64) -> RequestWillBeSent {
        serde_json::from_value(json!({
            "requestId": id,
            "timestamp": ts,
            "request": {"url": url, "method": "GET", "headers": {}},
            "redirectResponse": {"status": status, "headers": {"Location": url}},
            "type": "Document",
        }))
        .expect("payload")
    }

    fn response(id: &str, ts: f64, status: i64) -> ResponseReceived {
        serde_json::from_value(json!({
            "requestId": id,
            "timestamp": ts,
            "response": {"status": status, "headers": {"Content-Type": "text/html"},
                         "mimeType": "text/html"},
        }))
        .expect("payload")
    }

    fn finished(id: &str, ts: f64, encoded: f64) -> LoadingFinished {
        serde_json::from_value(json!({
            "requestId": id, "timestamp": ts, "encodedDataLength": encoded,
        }))
        .expect("payload")
    }

    #[test]
    fn test_three_event_lifecycle() {
        let mut store = RequestStore::new();
        store.on_request_will_be_sent(
            &will_be_sent("1.1", "https://example.com/", 1000.0, true),
            None,
        );
        store.on_response_received(&response("1.1", 1000.1, 200));
        store.on_loading_finished(&finished("1.1", 1000.2, 10.0));

        let epoch = store.epoch().expect("epoch");
        assert_eq!(epoch, 1000.0);
        assert_eq!(store.from_net_count(), 1);

        let records = store.finalize();
        assert_eq!(records.len(), 1);
        let r = &records[0];
        assert_eq!(r.status, Some(200));
        assert_eq!(r.transfer_size, Some(10));
        assert!(r.from_net);
        assert!((r.ttfb_ms().expect("ttfb") - 100.0).abs() < 1e-6);
        assert!((r.load_ms(epoch).expect("load") - 200.0).abs() < 1e-6);
    }

    #[test]
    fn test_redirect_chain_integrity() {
        let mut store = RequestStore::new();
        store.on_request_will_be_sent(&will_be_sent("9.1", "http://a.test/", 1.0, true), None);
        store.on_request_will_be_sent(&redirect_hop("9.1", "http://b.test/", 1.1, 301), None);
        store.on_request_will_be_sent(&redirect_hop("9.1", "http://c.test/", 1.2, 302), None);
        store.on_response_received(&response("9.1", 1.3, 200));
        store.on_loading_finished(&finished("9.1", 1.4, 100.0));

        let records = store.finalize();
        assert_eq!(records.len(), 3);

        assert_eq!(records[0].id.as_str(), "9.1-1");
        assert_eq!(records[0].url, "http://a.test/");
        assert!(records[0].is_redirect);
        assert_eq!(records[0].status, Some(301));

        assert_eq!(records[1].id.as_str(), "9.1-2");
        assert!(records[1].is_redirect);

        assert_eq!(records[2].id.as_str(), "9.1");
        assert_eq!(records[2].url, "http://c.test/");
        assert!(!records[2].is_redirect);
        assert_eq!(records[2].status, Some(200));

        for r in &records {
            assert!(r.original_id.as_str() == "9.1");
            assert!(r.end.expect("end") >= r.start);
        }
    }

    #[test]
    fn test_cache_hit_does_not_count_toward_network() {
        let mut store = RequestStore::new();
        store.on_request_will_be_sent(
            &will_be_sent("2.1", "https://example.com/a.js", 5.0, false),
            None,
        );
        store.on_served_from_cache(
            &serde_json::from_value(json!({"requestId": "2.1"})).expect("payload"),
        );
        store.on_loading_finished(&finished("2.1", 5.2, 0.0));
        assert_eq!(store.from_net_count(), 0);
        let records = store.finalize();
        assert!(records[0].from_cache);
        assert!(!records[0].from_net);
    }

    #[test]
    fn test_extra_info_header_merge_case_folded_last_wins() {
        let mut headers = Headers::default();
        headers.insert("Content-Type".to_string(), "text/plain".to_string());
        let mut incoming = Headers::default();
        incoming.insert("content-type".to_string(), "text/html".to_string());
        merge_headers(&mut headers, &incoming);
        assert_eq!(headers.len(), 1);
        assert_eq!(headers.get("content-type").map(String::as_str), Some("text/html"));
    }

    #[test]
    fn test_main_request_failure_sets_nav_error() {
        let mut store = RequestStore::new();
        store.on_request_will_be_sent(&will_be_sent("3.1", "https://down.test/", 1.0, true), None);
        store.on_response_received(&response("3.1", 1.2, 200));
        store.on_loading_failed(
            &serde_json::from_value(json!({
                "requestId": "3.1", "timestamp": 1.5,
                "errorText": "net::ERR_CONNECTION_REFUSED",
            }))
            .expect("payload"),
        );
        let (code, _) = store.page.nav_error.clone().expect("nav error");
        assert_eq!(code, NAV_ERROR_GENERIC);
    }

    #[test]
    fn test_failure_before_any_response_is_a_nav_error() {
        // The main document is still pending; a subresource failing
        // before any response this session means the navigation itself
        // never got going.
        let mut store = RequestStore::new();
        store.on_request_will_be_sent(&will_be_sent("3.1", "https://down.test/", 1.0, true), None);
        store.on_request_will_be_sent(
            &will_be_sent("3.2", "https://down.test/app.js", 1.1, false),
            None,
        );
        store.on_loading_failed(
            &serde_json::from_value(json!({
                "requestId": "3.2", "timestamp": 1.5,
                "errorText": "net::ERR_NAME_NOT_RESOLVED",
            }))
            .expect("payload"),
        );
        let (code, message) = store.page.nav_error.clone().expect("nav error");
        assert_eq!(code, NAV_ERROR_NO_NAVIGATION);
        assert_eq!(message, "net::ERR_NAME_NOT_RESOLVED");
    }

    #[test]
    fn test_canceled_main_request_is_not_a_nav_error() {
        let mut store = RequestStore::new();
        store.on_request_will_be_sent(&will_be_sent("4.1", "https://x.test/", 1.0, true), None);
        store.on_response_received(&response("4.1", 1.2, 200));
        store.on_loading_failed(
            &serde_json::from_value(json!({
                "requestId": "4.1", "timestamp": 1.5, "canceled": true,
            }))
            .expect("payload"),
        );
        assert!(store.page.nav_error.is_none());
    }

    #[test]
    fn test_body_policy() {
        let mut store = RequestStore::new();
        store.on_request_will_be_sent(&will_be_sent("5.1", "https://x.test/", 1.0, true), None);
        store.on_response_received(&response("5.1", 1.1, 200));
        store.on_loading_finished(&finished("5.1", 1.2, 10.0));

        // html-only policy sees the main document
        assert_eq!(store.body_candidates(false, true).len(), 1);
        // no-archive policy sees nothing
        assert!(store.body_candidates(false, false).is_empty());

        store.mark_body_requested(&RequestId::new("5.1"));
        // idempotent: once requested, never offered again
        assert!(store.body_candidates(true, true).is_empty());
    }

    #[test]
    fn test_video_detection() {
        let mut store = RequestStore::new();
        store.on_request_will_be_sent(
            &will_be_sent("6.1", "https://cdn.test/clip.mp4?cache=1", 1.0, false),
            None,
        );
        let chunk: DataReceived = serde_json::from_value(json!({
            "requestId": "6.1", "timestamp": 1.1,
            "dataLength": 4096, "encodedDataLength": 4096,
        }))
        .expect("payload");
        assert!(store.on_data_received(&chunk));
    }

    #[test]
    fn test_worker_request_keeps_target_attribution() {
        let mut store = RequestStore::new();
        store.on_request_will_be_sent(
            &will_be_sent("1.1", "https://x.test/", 1.0, true),
            None,
        );
        let worker = TargetId::new("W1");
        store.on_request_will_be_sent(
            &will_be_sent("8.1", "https://x.test/sw.js", 1.1, false),
            Some(&worker),
        );

        let records = store.finalize();
        let page = records.iter().find(|r| r.id.as_str() == "1.1").expect("page record");
        let from_worker = records.iter().find(|r| r.id.as_str() == "8.1").expect("worker record");
        assert!(page.target_id.is_none());
        assert_eq!(from_worker.target_id.as_ref().map(TargetId::as_str), Some("W1"));

        let json = serde_json::to_value(from_worker).expect("serialize");
        assert_eq!(json["targetId"], "W1");
        let json = serde_json::to_value(page).expect("serialize");
        assert!(json.get("targetId").is_none());
    }

    #[test]
    fn test_netlog_merge_first_unclaimed() {
        let netlog = vec![
            NetlogRequest {
                url: Some("https://x.test/".to_string()),
                dns_start: Some(1.0),
                dns_end: Some(2.0),
                ..NetlogRequest::default()
            },
            NetlogRequest {
                url: Some("https://x.test/".to_string()),
                dns_start: Some(10.0),
                ..NetlogRequest::default()
            },
        ];
        let mut store = RequestStore::new();
        store.on_request_will_be_sent(&will_be_sent("7.1", "https://x.test/", 1.0, true), None);
        store.on_request_will_be_sent(&will_be_sent("7.2", "https://x.test/", 2.0, false), None);
        let mut records = store.finalize();
        RequestStore::merge_netlog(&mut records, &netlog);
        assert_eq!(records[0].dns_start_ms, Some(1.0));
        assert_eq!(records[1].dns_start_ms, Some(10.0));
    }
}
