//! Netlog correlator.
//!
//! Netlog trace events describe the browser's network stack as dozens
//! of per-source event streams (DNS jobs, connect jobs, sockets, HTTP/2
//! sessions, URL requests) tied together by `source_dependency`
//! back-references. This module runs one small state machine per source
//! type and joins them into request-level connection timings at the
//! end.
//!
//! All maps sit behind one coarse [`Mutex`]: netlog chunks can be fed
//! from a streaming context while the rest of the reduction runs on the
//! pump, and a single lock around the whole state is cheaper than
//! anything finer at this event rate.
//!
//! Times are kept as raw trace microseconds internally and rebased to
//! milliseconds relative to the earliest observed timestamp when
//! [`NetlogCorrelator::requests`] builds the output.

// ============================================================================
// Imports
// ============================================================================

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use serde::Serialize;
use tracing::debug;
use url::Url;

use crate::trace::event::TraceEvent;

// ============================================================================
// Constants
// ============================================================================

/// Synthetic request ids (push promises) start here so they can never
/// collide with real netlog source ids.
const FIRST_SYNTHETIC_ID: u64 = 1_000_000;

/// Status code reported for pseudo-requests to hosts whose connection
/// never completed.
const STATUS_CONNECT_FAILED: u32 = 12029;

/// Hosts the browser talks to on its own; never reported as failed.
const KNOWN_HOSTS: [&str; 3] = [
    "cache.pack.google.com",
    "clients1.google.com",
    "redirector.gvt1.com",
];

// ============================================================================
// Output Type
// ============================================================================

/// One request-level view assembled from the netlog, all times in
/// milliseconds relative to the start of the capture.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NetlogRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub protocol: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub priority: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub initial_priority: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub first_byte: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dns_start: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dns_end: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connect_start: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connect_end: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ssl_start: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ssl_end: Option<f64>,
    pub bytes_in: u64,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub chunks: Vec<Chunk>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub request_headers: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub response_headers: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_address: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_address: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub socket_group: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream_id: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub weight: Option<i64>,
    pub pushed: bool,
    pub from_net: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tls_version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tls_resumed: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tls_next_proto: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tls_cipher_suite: Option<i64>,
    #[serde(skip_serializing_if = "FxHashMap::is_empty")]
    pub http2_server_settings: FxHashMap<String, i64>,
}

/// One received data chunk, `ts` in milliseconds.
#[derive(Debug, Clone, Serialize)]
pub struct Chunk {
    pub ts: f64,
    pub bytes: u64,
}

// ============================================================================
// Internal State
// ============================================================================

#[derive(Debug, Default)]
struct DnsJob {
    start: Option<i64>,
    end: Option<i64>,
    host: Option<String>,
}

#[derive(Debug, Default)]
struct ConnectJob {
    group: Option<String>,
    dns: Option<u64>,
    connect_start: Option<i64>,
    connect_end: Option<i64>,
}

#[derive(Debug, Default)]
struct StreamJob {
    group: Option<String>,
    socket_start: Option<i64>,
    socket_end: Option<i64>,
    socket: Option<u64>,
    url_request: Option<u64>,
    h2_session: Option<u64>,
}

#[derive(Debug, Default)]
struct H2Stream {
    url: Option<String>,
    request_headers: Vec<String>,
    response_headers: Vec<String>,
    weight: Option<i64>,
    start: Option<i64>,
    first_byte: Option<i64>,
    end: Option<i64>,
    bytes_in: u64,
    chunks: Vec<(i64, u64)>,
    pushed: bool,
    url_request: Option<u64>,
}

#[derive(Debug, Default)]
struct H2Session {
    socket: Option<u64>,
    host: Option<String>,
    protocol: Option<String>,
    streams: FxHashMap<u64, H2Stream>,
    server_settings: FxHashMap<String, i64>,
}

#[derive(Debug, Default)]
struct QuicSession {
    host: Option<String>,
    connect_start: Option<i64>,
    connect_end: Option<i64>,
    streams: FxHashMap<u64, H2Stream>,
}

#[derive(Debug, Default)]
struct SocketState {
    address: Option<String>,
    source_address: Option<String>,
    group: Option<String>,
    connect_start: Option<i64>,
    connect_end: Option<i64>,
    ssl_start: Option<i64>,
    ssl_end: Option<i64>,
    tls_version: Option<String>,
    tls_resumed: Option<bool>,
    tls_next_proto: Option<String>,
    tls_cipher_suite: Option<i64>,
    claimed: bool,
}

#[derive(Debug, Default)]
struct UrlRequest {
    created: i64,
    start: Option<i64>,
    first_byte: Option<i64>,
    end: Option<i64>,
    url: Option<String>,
    method: Option<String>,
    line: Option<String>,
    group: Option<String>,
    protocol: Option<String>,
    priority: Option<String>,
    initial_priority: Option<String>,
    socket: Option<u64>,
    h2_session: Option<u64>,
    stream_id: Option<u64>,
    bytes_in: u64,
    has_raw_bytes: bool,
    chunks: Vec<(i64, u64)>,
    request_headers: Vec<String>,
    response_headers: Vec<String>,
    pushed: bool,
    weight: Option<i64>,
}

#[derive(Debug)]
struct NetlogState {
    dns: FxHashMap<u64, DnsJob>,
    connect_jobs: FxHashMap<u64, ConnectJob>,
    stream_jobs: FxHashMap<u64, StreamJob>,
    h2_sessions: FxHashMap<u64, H2Session>,
    quic_sessions: FxHashMap<u64, QuicSession>,
    sockets: FxHashMap<u64, SocketState>,
    url_requests: FxHashMap<u64, UrlRequest>,
    /// Disk-cache URL roster; used to name failed-host pseudo-requests.
    urls: FxHashMap<String, i64>,
    /// Event-name to source-type memo; only the first event for a
    /// source carries `source_type`.
    event_types: FxHashMap<String, String>,
    next_synthetic_id: u64,
}

impl Default for NetlogState {
    fn default() -> Self {
        Self {
            dns: FxHashMap::default(),
            connect_jobs: FxHashMap::default(),
            stream_jobs: FxHashMap::default(),
            h2_sessions: FxHashMap::default(),
            quic_sessions: FxHashMap::default(),
            sockets: FxHashMap::default(),
            url_requests: FxHashMap::default(),
            urls: FxHashMap::default(),
            event_types: FxHashMap::default(),
            next_synthetic_id: FIRST_SYNTHETIC_ID,
        }
    }
}

// ============================================================================
// Helpers
// ============================================================================

fn map_priority(priority: &str) -> String {
    match priority {
        "VeryHigh" | "HIGHEST" => "Highest",
        "MEDIUM" => "High",
        "LOW" => "Medium",
        "LOWEST" => "Low",
        "IDLE" | "VeryLow" => "Lowest",
        other => other,
    }
    .to_string()
}

fn weight_to_priority(weight: i64) -> &'static str {
    if weight >= 256 {
        "HIGHEST"
    } else if weight >= 220 {
        "MEDIUM"
    } else if weight >= 183 {
        "LOW"
    } else if weight >= 147 {
        "LOWEST"
    } else {
        "IDLE"
    }
}

fn hostname(url: &str) -> Option<String> {
    Url::parse(url).ok()?.host_str().map(str::to_string)
}

fn strip_fragment(url: &str) -> String {
    url.split('#').next().unwrap_or(url).to_string()
}

/// Finds a `name: value` (or `:name: value`) header in a flat list.
fn find_header<'a>(headers: &'a [String], name: &str) -> Option<&'a str> {
    let prefix_len = name.len();
    headers.iter().find_map(|h| {
        if h.len() > prefix_len
            && h[..prefix_len].eq_ignore_ascii_case(name)
            && h[prefix_len..].starts_with(':')
        {
            Some(h[prefix_len + 1..].trim())
        } else {
            None
        }
    })
}

fn headers_from_params(params: &serde_json::Value) -> Vec<String> {
    match params.get("headers") {
        Some(serde_json::Value::Array(items)) => items
            .iter()
            .filter_map(|v| v.as_str().map(str::to_string))
            .collect(),
        Some(serde_json::Value::Object(map)) => map
            .iter()
            .map(|(k, v)| match v {
                serde_json::Value::String(s) => format!("{k}: {s}"),
                other => format!("{k}: {other}"),
            })
            .collect(),
        _ => Vec::new(),
    }
}

fn usecs_to_ms(start: i64, value: Option<i64>) -> Option<f64> {
    value.map(|v| (v - start) as f64 / 1000.0)
}

// ============================================================================
// NetlogCorrelator
// ============================================================================

/// Correlates netlog trace events into request-level timings.
#[derive(Debug, Default)]
pub struct NetlogCorrelator {
    state: Mutex<NetlogState>,
}

impl NetlogCorrelator {
    /// Creates an empty correlator.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds one netlog trace event into the per-source state machines.
    pub fn process(&self, event: &TraceEvent) {
        let Some(id) = event.numeric_id() else {
            return;
        };
        let mut state = self.state.lock();

        let source_type = match event
            .args
            .get("source_type")
            .and_then(serde_json::Value::as_str)
        {
            Some(st) => {
                state
                    .event_types
                    .entry(event.name.clone())
                    .or_insert_with(|| st.to_string());
                st.to_string()
            }
            None => match state.event_types.get(&event.name) {
                Some(st) => st.clone(),
                None => return,
            },
        };

        match source_type.as_str() {
            _ if event.name.starts_with("HOST_RESOLVER") => state.on_dns(id, event),
            "HOST_RESOLVER_IMPL_JOB" => state.on_dns(id, event),
            "CONNECT_JOB" | "SSL_CONNECT_JOB" | "TRANSPORT_CONNECT_JOB" => {
                state.on_connect_job(id, event);
            }
            "HTTP_STREAM_JOB" => state.on_stream_job(id, event),
            "HTTP2_SESSION" => state.on_h2_session(id, event),
            "QUIC_SESSION" => state.on_quic_session(id, event),
            "SOCKET" => state.on_socket(id, event),
            "UDP_SOCKET" => state.on_udp_socket(id, event),
            "URL_REQUEST" => state.on_url_request(id, event),
            "DISK_CACHE_ENTRY" => state.on_disk_cache(event),
            _ => {}
        }
    }

    /// Joins everything observed into the final request list.
    pub fn requests(&self) -> Vec<NetlogRequest> {
        self.state.lock().build_requests()
    }
}

// ============================================================================
// Source-Type State Machines
// ============================================================================

impl NetlogState {
    fn on_dns(&mut self, id: u64, event: &TraceEvent) {
        let params = event.params().clone();
        if let Some(parent) = params
            .get("source_dependency")
            .and_then(|d| d.get("id"))
            .and_then(serde_json::Value::as_u64)
            && let Some(job) = self.connect_jobs.get_mut(&parent)
        {
            job.dns = Some(id);
        }
        let entry = self.dns.entry(id).or_default();
        match (event.name.as_str(), event.ph.as_str()) {
            ("HOST_RESOLVER_IMPL_REQUEST", "b") => {
                if entry.start.is_none_or(|s| event.ts < s) {
                    entry.start = Some(event.ts);
                }
            }
            ("HOST_RESOLVER_IMPL_REQUEST", "e") | ("HOST_RESOLVER_IMPL_CACHE_HIT", _) => {
                if entry.end.is_none_or(|e| event.ts > e) {
                    entry.end = Some(event.ts);
                }
            }
            ("HOST_RESOLVER_IMPL_ATTEMPT_STARTED", _) => {
                if entry.start.is_none() {
                    entry.start = Some(event.ts);
                }
            }
            ("HOST_RESOLVER_IMPL_ATTEMPT_FINISHED", _) => entry.end = Some(event.ts),
            _ => {}
        }
        if entry.host.is_none()
            && let Some(host) = params.get("host").and_then(serde_json::Value::as_str)
        {
            entry.host = Some(host.to_string());
        }
    }

    fn on_connect_job(&mut self, id: u64, event: &TraceEvent) {
        let params = event.params().clone();
        let entry = self.connect_jobs.entry(id).or_default();
        match (event.name.as_str(), event.ph.as_str()) {
            ("TRANSPORT_CONNECT_JOB_CONNECT", "b") => entry.connect_start = Some(event.ts),
            ("TRANSPORT_CONNECT_JOB_CONNECT", "e") => entry.connect_end = Some(event.ts),
            _ => {}
        }
        if let Some(group) = params
            .get("group_name")
            .or_else(|| params.get("group_id"))
            .and_then(serde_json::Value::as_str)
        {
            entry.group = Some(group.to_string());
        }
        if event.name == "CONNECT_JOB_SET_SOCKET"
            && let Some(socket_id) = params
                .get("source_dependency")
                .and_then(|d| d.get("id"))
                .and_then(serde_json::Value::as_u64)
        {
            let group = entry.group.clone();
            if let Some(socket) = self.sockets.get_mut(&socket_id)
                && socket.group.is_none()
            {
                socket.group = group;
            }
        }
    }

    fn on_stream_job(&mut self, id: u64, event: &TraceEvent) {
        let params = event.params().clone();
        let entry = self.stream_jobs.entry(id).or_default();
        if let Some(group) = params
            .get("group_name")
            .or_else(|| params.get("group_id"))
            .and_then(serde_json::Value::as_str)
        {
            entry.group = Some(group.to_string());
        }
        if event.name == "TCP_CLIENT_SOCKET_POOL_REQUESTED_SOCKET" {
            entry.socket_start = Some(event.ts);
        }
        let Some(dep_id) = params
            .get("source_dependency")
            .and_then(|d| d.get("id"))
            .and_then(serde_json::Value::as_u64)
        else {
            return;
        };
        match event.name.as_str() {
            "SOCKET_POOL_BOUND_TO_SOCKET" => {
                entry.socket = Some(dep_id);
                entry.socket_end = Some(event.ts);
            }
            "HTTP_STREAM_JOB_BOUND_TO_REQUEST" => {
                entry.url_request = Some(dep_id);
                if entry.socket_end.is_none() {
                    entry.socket_end = Some(event.ts);
                }
                let (group, socket, h2_session) =
                    (entry.group.clone(), entry.socket, entry.h2_session);
                if let Some(request) = self.url_requests.get_mut(&dep_id) {
                    if request.group.is_none() {
                        request.group = group;
                    }
                    if request.socket.is_none() {
                        request.socket = socket;
                    }
                    if request.h2_session.is_none() {
                        request.h2_session = h2_session;
                    }
                }
            }
            "HTTP2_SESSION_POOL_IMPORTED_SESSION_FROM_SOCKET"
            | "HTTP2_SESSION_POOL_FOUND_EXISTING_SESSION"
            | "HTTP2_SESSION_POOL_FOUND_EXISTING_SESSION_FROM_IP_POOL" => {
                entry.h2_session = Some(dep_id);
                if entry.socket_end.is_none() {
                    entry.socket_end = Some(event.ts);
                }
                let session_socket = self.h2_sessions.get(&dep_id).and_then(|s| s.socket);
                if let Some(entry) = self.stream_jobs.get_mut(&id)
                    && entry.socket.is_none()
                {
                    entry.socket = session_socket;
                }
            }
            _ => {}
        }
    }

    fn on_h2_session(&mut self, id: u64, event: &TraceEvent) {
        let params = event.params().clone();
        {
            let entry = self.h2_sessions.entry(id).or_default();
            if event.name == "HTTP2_SESSION_INITIALIZED"
                && let Some(socket_id) = params
                    .get("source_dependency")
                    .and_then(|d| d.get("id"))
                    .and_then(serde_json::Value::as_u64)
            {
                entry.socket = Some(socket_id);
            }
            if entry.host.is_none()
                && let Some(host) = params.get("host").and_then(serde_json::Value::as_str)
            {
                entry.host = Some(host.to_string());
            }
            if entry.protocol.is_none()
                && let Some(protocol) = params.get("protocol").and_then(serde_json::Value::as_str)
            {
                entry.protocol = Some(protocol.to_string());
            }
            if event.name == "HTTP2_SESSION_RECV_SETTING"
                && let Some(setting) = params.get("id").and_then(serde_json::Value::as_str)
                && let Some(value) = params.get("value").and_then(serde_json::Value::as_i64)
            {
                // "4 (SETTINGS_INITIAL_WINDOW_SIZE)" -> the name inside
                // the parentheses.
                if let Some(name) = setting
                    .split_once('(')
                    .and_then(|(_, rest)| rest.strip_suffix(')'))
                {
                    entry.server_settings.insert(name.to_string(), value);
                }
            }
        }

        if let Some(stream_id) = params.get("stream_id").and_then(serde_json::Value::as_u64) {
            self.on_h2_stream(id, stream_id, event, &params);
        }

        if event.name == "HTTP2_SESSION_RECV_PUSH_PROMISE"
            && let Some(promised) = params
                .get("promised_stream_id")
                .and_then(serde_json::Value::as_u64)
        {
            self.on_h2_push_promise(id, promised, event, &params);
        }
    }

    fn on_h2_stream(
        &mut self,
        session_id: u64,
        stream_id: u64,
        event: &TraceEvent,
        params: &serde_json::Value,
    ) {
        let mut adopt: Option<(Option<u64>, String)> = None;
        {
            let session = self.h2_sessions.entry(session_id).or_default();
            let stream = session.streams.entry(stream_id).or_default();
            if let Some(weight) = params.get("weight").and_then(serde_json::Value::as_i64) {
                stream.weight = Some(weight);
            }
            if let Some(url) = params.get("url").and_then(serde_json::Value::as_str) {
                stream.url = Some(strip_fragment(url));
            }
            match event.name.as_str() {
                "HTTP2_SESSION_RECV_DATA" => {
                    if let Some(size) = params.get("size").and_then(serde_json::Value::as_u64) {
                        stream.end = Some(event.ts);
                        if stream.first_byte.is_none() {
                            stream.first_byte = Some(event.ts);
                        }
                        stream.bytes_in += size;
                        stream.chunks.push((event.ts, size));
                    }
                }
                "HTTP2_SESSION_SEND_HEADERS" => {
                    if stream.start.is_none() {
                        stream.start = Some(event.ts);
                    }
                    let headers = headers_from_params(params);
                    if !headers.is_empty() {
                        stream.request_headers = headers;
                    }
                }
                "HTTP2_SESSION_RECV_HEADERS" => {
                    if stream.first_byte.is_none() {
                        stream.first_byte = Some(event.ts);
                    }
                    stream.end = Some(event.ts);
                    let headers = headers_from_params(params);
                    if !headers.is_empty() {
                        stream.response_headers = headers;
                    }
                }
                "HTTP2_STREAM_ADOPTED_PUSH_STREAM" => {
                    if let Some(url) = params.get("url").and_then(serde_json::Value::as_str) {
                        adopt = Some((stream.url_request, strip_fragment(url)));
                    }
                }
                _ => {}
            }
        }

        // An adopted push stream replaces the synthetic request entry
        // with the real one the browser created for it.
        if let Some((old_id, url)) = adopt {
            let new_id = self
                .url_requests
                .iter()
                .find(|(_, r)| r.url.as_deref() == Some(url.as_str()) && r.start.is_none())
                .map(|(id, _)| *id);
            if let (Some(old_id), Some(new_id)) = (old_id, new_id)
                && old_id != new_id
                && let Some(old) = self.url_requests.remove(&old_id)
            {
                self.url_requests.insert(new_id, old);
                if let Some(session) = self.h2_sessions.get_mut(&session_id)
                    && let Some(stream) = session.streams.get_mut(&stream_id)
                {
                    stream.url_request = Some(new_id);
                }
            }
        }
    }

    fn on_h2_push_promise(
        &mut self,
        session_id: u64,
        stream_id: u64,
        event: &TraceEvent,
        params: &serde_json::Value,
    ) {
        let request_id = self.next_synthetic_id;
        self.next_synthetic_id += 1;

        let headers = headers_from_params(params);
        let mut url = None;
        if let (Some(scheme), Some(authority), Some(path)) = (
            find_header(&headers, ":scheme"),
            find_header(&headers, ":authority"),
            find_header(&headers, ":path"),
        ) {
            url = Some(strip_fragment(&format!("{scheme}://{authority}{path}")));
        }

        let socket = self.h2_sessions.get(&session_id).and_then(|s| s.socket);
        let session = self.h2_sessions.entry(session_id).or_default();
        let stream = session.streams.entry(stream_id).or_default();
        stream.pushed = true;
        stream.url_request = Some(request_id);
        if !headers.is_empty() {
            stream.request_headers = headers.clone();
        }
        if let Some(url) = &url {
            stream.url = Some(url.clone());
        }

        debug!(session_id, stream_id, "synthesizing pushed request");
        self.url_requests.insert(
            request_id,
            UrlRequest {
                created: event.ts,
                start: Some(event.ts),
                url,
                protocol: Some("HTTP/2".to_string()),
                h2_session: Some(session_id),
                stream_id: Some(stream_id),
                socket,
                pushed: true,
                request_headers: headers,
                ..UrlRequest::default()
            },
        );
    }

    fn on_quic_session(&mut self, id: u64, event: &TraceEvent) {
        let params = event.params().clone();
        let entry = self.quic_sessions.entry(id).or_default();
        if entry.host.is_none()
            && let Some(host) = params.get("host").and_then(serde_json::Value::as_str)
        {
            entry.host = Some(host.to_string());
        }
        match event.name.as_str() {
            "QUIC_SESSION_PACKET_SENT" => {
                if entry.connect_start.is_none() {
                    entry.connect_start = Some(event.ts);
                }
            }
            "QUIC_SESSION_VERSION_NEGOTIATED" => {
                if entry.connect_end.is_none() {
                    entry.connect_end = Some(event.ts);
                }
            }
            _ => {}
        }
        if let Some(stream_id) = params
            .get("quic_stream_id")
            .and_then(serde_json::Value::as_u64)
        {
            let stream = entry.streams.entry(stream_id).or_default();
            match event.name.as_str() {
                "QUIC_CHROMIUM_CLIENT_STREAM_SEND_REQUEST_HEADERS" => {
                    if stream.start.is_none() {
                        stream.start = Some(event.ts);
                    }
                    let headers = headers_from_params(&params);
                    if !headers.is_empty() {
                        stream.request_headers = headers;
                    }
                }
                "QUIC_CHROMIUM_CLIENT_STREAM_READ_RESPONSE_HEADERS" => {
                    if stream.first_byte.is_none() {
                        stream.first_byte = Some(event.ts);
                    }
                    stream.end = Some(event.ts);
                    let headers = headers_from_params(&params);
                    if !headers.is_empty() {
                        stream.response_headers = headers;
                    }
                }
                _ => {}
            }
        }
    }

    fn on_socket(&mut self, id: u64, event: &TraceEvent) {
        let params = event.params().clone();
        let entry = self.sockets.entry(id).or_default();
        if let Some(address) = params.get("address").and_then(serde_json::Value::as_str) {
            entry.address = Some(address.to_string());
        }
        if let Some(address) = params
            .get("source_address")
            .and_then(serde_json::Value::as_str)
        {
            entry.source_address = Some(address.to_string());
        }
        match (event.name.as_str(), event.ph.as_str()) {
            ("TCP_CONNECT_ATTEMPT", "b") => {
                if entry.connect_start.is_none() {
                    entry.connect_start = Some(event.ts);
                }
            }
            ("TCP_CONNECT_ATTEMPT", "e") => entry.connect_end = Some(event.ts),
            ("SSL_CONNECT", ph) => {
                if entry.connect_end.is_none() {
                    entry.connect_end = Some(event.ts);
                }
                if ph == "b" && entry.ssl_start.is_none() {
                    entry.ssl_start = Some(event.ts);
                }
                if ph == "e" {
                    entry.ssl_end = Some(event.ts);
                }
                if let Some(version) = params.get("version").and_then(serde_json::Value::as_str) {
                    entry.tls_version = Some(version.to_string());
                }
                if let Some(resumed) = params
                    .get("is_resumed")
                    .and_then(serde_json::Value::as_bool)
                {
                    entry.tls_resumed = Some(resumed);
                }
                if let Some(proto) = params
                    .get("next_proto")
                    .and_then(serde_json::Value::as_str)
                {
                    entry.tls_next_proto = Some(proto.to_string());
                }
                if let Some(suite) = params
                    .get("cipher_suite")
                    .and_then(serde_json::Value::as_i64)
                {
                    entry.tls_cipher_suite = Some(suite);
                }
            }
            ("SOCKET_BYTES_SENT", _) => {
                if entry.connect_end.is_none() {
                    entry.connect_end = Some(event.ts);
                }
            }
            _ => {}
        }
    }

    fn on_udp_socket(&mut self, id: u64, event: &TraceEvent) {
        let params = event.params().clone();
        let entry = self.sockets.entry(id).or_default();
        match (event.name.as_str(), event.ph.as_str()) {
            ("UDP_CONNECT", ph) => {
                if let Some(address) = params.get("address").and_then(serde_json::Value::as_str) {
                    entry.address = Some(address.to_string());
                }
                if ph == "b" && entry.connect_start.is_none() {
                    entry.connect_start = Some(event.ts);
                }
                if ph == "e" {
                    entry.connect_end = Some(event.ts);
                }
            }
            ("UDP_LOCAL_ADDRESS", _) => {
                if let Some(address) = params.get("address").and_then(serde_json::Value::as_str) {
                    entry.source_address = Some(address.to_string());
                }
            }
            _ => {}
        }
    }

    fn on_url_request(&mut self, id: u64, event: &TraceEvent) {
        let params = event.params().clone();
        let entry = self.url_requests.entry(id).or_insert_with(|| UrlRequest {
            created: event.ts,
            ..UrlRequest::default()
        });
        if let Some(priority) = params.get("priority").and_then(serde_json::Value::as_str) {
            let mapped = map_priority(priority);
            if entry.initial_priority.is_none() {
                entry.initial_priority = Some(mapped.clone());
            }
            entry.priority = Some(mapped);
        }
        if let Some(method) = params.get("method").and_then(serde_json::Value::as_str) {
            entry.method = Some(method.to_string());
        }
        if let Some(url) = params.get("url").and_then(serde_json::Value::as_str) {
            entry.url = Some(strip_fragment(url));
        }
        if let Some(stream_id) = params.get("stream_id").and_then(serde_json::Value::as_u64) {
            entry.stream_id = Some(stream_id);
        }
        match event.name.as_str() {
            "HTTP_TRANSACTION_SEND_REQUEST" => {
                if entry.start.is_none() {
                    entry.start = Some(event.ts);
                }
            }
            "HTTP_TRANSACTION_SEND_REQUEST_HEADERS"
            | "HTTP_TRANSACTION_HTTP2_SEND_REQUEST_HEADERS"
            | "HTTP_TRANSACTION_QUIC_SEND_REQUEST_HEADERS" => {
                let headers = headers_from_params(&params);
                if !headers.is_empty() {
                    entry.request_headers = headers;
                }
                if let Some(line) = params.get("line").and_then(serde_json::Value::as_str) {
                    entry.line = Some(line.to_string());
                }
                if entry.start.is_none() {
                    entry.start = Some(event.ts);
                }
                match event.name.as_str() {
                    "HTTP_TRANSACTION_HTTP2_SEND_REQUEST_HEADERS" => {
                        entry.protocol = Some("HTTP/2".to_string());
                    }
                    "HTTP_TRANSACTION_QUIC_SEND_REQUEST_HEADERS" => {
                        entry.protocol = Some("QUIC".to_string());
                    }
                    _ => {}
                }
            }
            "HTTP_TRANSACTION_READ_RESPONSE_HEADERS" => {
                let headers = headers_from_params(&params);
                if !headers.is_empty() {
                    entry.response_headers = headers;
                }
                if entry.first_byte.is_none() {
                    entry.first_byte = Some(event.ts);
                }
                entry.end = Some(event.ts);
            }
            "URL_REQUEST_JOB_BYTES_READ" => {
                if let Some(bytes) = params
                    .get("byte_count")
                    .and_then(serde_json::Value::as_u64)
                {
                    entry.has_raw_bytes = true;
                    entry.end = Some(event.ts);
                    entry.bytes_in += bytes;
                    entry.chunks.push((event.ts, bytes));
                }
            }
            "URL_REQUEST_JOB_FILTERED_BYTES_READ" => {
                if let Some(bytes) = params
                    .get("byte_count")
                    .and_then(serde_json::Value::as_u64)
                {
                    entry.end = Some(event.ts);
                    // Filtered reads only count when no raw reads were
                    // seen; otherwise they double-count decompression.
                    if !entry.has_raw_bytes {
                        entry.bytes_in += bytes;
                        entry.chunks.push((event.ts, bytes));
                    }
                }
            }
            "URL_REQUEST_REDIRECTED" => {
                // The browser reuses the source for the post-redirect
                // request; move the accumulated state to a fresh id so
                // each hop stays distinct.
                let new_id = self.next_synthetic_id;
                self.next_synthetic_id += 1;
                if let Some(entry) = self.url_requests.remove(&id) {
                    self.url_requests.insert(new_id, entry);
                }
            }
            _ => {}
        }
    }

    fn on_disk_cache(&mut self, event: &TraceEvent) {
        if let Some(key) = event
            .params()
            .get("key")
            .and_then(serde_json::Value::as_str)
        {
            // Keys look like "1/0/_dk_https://o https://o https://host/path".
            let url = key.rsplit(' ').next().unwrap_or(key).to_string();
            self.urls.entry(url).or_insert(event.ts);
        }
    }
}

// ============================================================================
// Request Assembly
// ============================================================================

/// Request under assembly, times still in raw trace microseconds.
struct Pending {
    created: i64,
    start: Option<i64>,
    first_byte: Option<i64>,
    end: Option<i64>,
    dns_start: Option<i64>,
    dns_end: Option<i64>,
    connect_start: Option<i64>,
    connect_end: Option<i64>,
    ssl_start: Option<i64>,
    ssl_end: Option<i64>,
    chunks: Vec<(i64, u64)>,
    out: NetlogRequest,
    socket: Option<u64>,
    host: Option<String>,
}

impl NetlogState {
    fn build_requests(&mut self) -> Vec<NetlogRequest> {
        let mut known_hosts: Vec<String> = KNOWN_HOSTS.iter().map(|s| s.to_string()).collect();
        let mut last_time: i64 = 0;
        let mut pending: Vec<Pending> = Vec::new();

        let ids: Vec<u64> = self.url_requests.keys().copied().collect();
        for id in ids {
            // URL synthesis and h2 joins need surrounding state, so
            // work on a clone and write back.
            let mut request = match self.url_requests.remove(&id) {
                Some(r) => r,
                None => continue,
            };
            let from_net = request.start.is_some();
            if let Some(start) = request.start {
                last_time = last_time.max(start);
            }
            if let Some(end) = request.end {
                last_time = last_time.max(end);
            }

            if request.url.is_none() && !request.request_headers.is_empty() {
                request.url = self.synthesize_url(&request);
            }

            let Some(url) = request.url.clone() else {
                continue;
            };
            if url.starts_with("http://127.0.0.1") || url.starts_with("http://192.168.10.") {
                continue;
            }
            let host = hostname(&url);
            if let Some(host) = &host
                && !known_hosts.contains(host)
            {
                known_hosts.push(host.clone());
            }

            if request.h2_session.is_none()
                && request.stream_id.is_some()
                && let Some(host) = &host
            {
                request.h2_session =
                    self.match_orphan_stream(&request, host, request.stream_id.unwrap_or(0));
            }
            self.merge_h2_stream(&mut request);

            if request.request_headers.is_empty() {
                continue;
            }

            let out = NetlogRequest {
                url: Some(url),
                method: request.method.clone(),
                protocol: request.protocol.clone(),
                priority: request.priority.clone(),
                initial_priority: request.initial_priority.clone(),
                bytes_in: request.bytes_in,
                request_headers: request.request_headers.clone(),
                response_headers: request.response_headers.clone(),
                stream_id: request.stream_id,
                weight: request.weight,
                pushed: request.pushed,
                from_net,
                http2_server_settings: request
                    .h2_session
                    .and_then(|s| self.h2_sessions.get(&s))
                    .map(|s| s.server_settings.clone())
                    .unwrap_or_default(),
                ..NetlogRequest::default()
            };
            pending.push(Pending {
                created: request.created,
                start: request.start,
                first_byte: request.first_byte,
                end: request.end,
                dns_start: None,
                dns_end: None,
                connect_start: None,
                connect_end: None,
                ssl_start: None,
                ssl_end: None,
                chunks: request.chunks.clone(),
                out,
                socket: request.socket,
                host,
            });
        }

        // Hosts whose connection attempt never produced a socket show
        // up as pseudo-requests so the failure is visible at all.
        for (host, (start, end)) in self.failed_hosts(&known_hosts, last_time) {
            for (url, _) in self.urls.iter() {
                if hostname(url).as_deref() == Some(host.as_str()) {
                    pending.push(Pending {
                        created: start,
                        start: Some(start),
                        first_byte: None,
                        end: Some(end),
                        dns_start: None,
                        dns_end: None,
                        connect_start: Some(start),
                        connect_end: Some(end),
                        ssl_start: None,
                        ssl_end: None,
                        chunks: Vec::new(),
                        out: NetlogRequest {
                            url: Some(url.clone()),
                            status: Some(STATUS_CONNECT_FAILED),
                            from_net: true,
                            ..NetlogRequest::default()
                        },
                        socket: None,
                        host: Some(host.clone()),
                    });
                }
            }
        }

        if pending.is_empty() {
            return Vec::new();
        }

        pending.sort_by_key(|p| p.start.unwrap_or(p.created));

        // First request on each socket gets its connect/ssl times.
        for p in pending.iter_mut() {
            let Some(socket) = p.socket.and_then(|id| self.sockets.get_mut(&id)) else {
                continue;
            };
            p.out.server_address = socket.address.clone();
            p.out.client_address = socket.source_address.clone();
            p.out.socket_group = socket.group.clone();
            if !socket.claimed {
                socket.claimed = true;
                p.connect_start = socket.connect_start;
                p.connect_end = socket.connect_end;
                p.ssl_start = socket.ssl_start;
                p.ssl_end = socket.ssl_end;
                p.out.tls_version = socket.tls_version.clone();
                p.out.tls_resumed = socket.tls_resumed;
                p.out.tls_next_proto = socket.tls_next_proto.clone();
                p.out.tls_cipher_suite = socket.tls_cipher_suite;
            }
        }

        self.assign_dns(&mut pending);

        // Rebase everything to the earliest observed time, in ms.
        let mut start_time = i64::MAX;
        for p in &pending {
            for t in [
                p.dns_start,
                p.dns_end,
                p.connect_start,
                p.connect_end,
                p.ssl_start,
                p.ssl_end,
                p.start,
                Some(p.created),
                p.first_byte,
                p.end,
            ]
            .into_iter()
            .flatten()
            {
                start_time = start_time.min(t);
            }
        }

        pending
            .into_iter()
            .map(|p| {
                let mut out = p.out;
                out.created = usecs_to_ms(start_time, Some(p.created));
                out.start = usecs_to_ms(start_time, p.start);
                out.first_byte = usecs_to_ms(start_time, p.first_byte);
                out.end = usecs_to_ms(start_time, p.end);
                out.dns_start = usecs_to_ms(start_time, p.dns_start);
                out.dns_end = usecs_to_ms(start_time, p.dns_end);
                out.connect_start = usecs_to_ms(start_time, p.connect_start);
                out.connect_end = usecs_to_ms(start_time, p.connect_end);
                out.ssl_start = usecs_to_ms(start_time, p.ssl_start);
                out.ssl_end = usecs_to_ms(start_time, p.ssl_end);
                out.chunks = p
                    .chunks
                    .iter()
                    .map(|(ts, bytes)| Chunk {
                        ts: (ts - start_time) as f64 / 1000.0,
                        bytes: *bytes,
                    })
                    .collect();
                out
            })
            .collect()
    }

    /// Rebuilds a URL from pseudo-headers plus the socket / group
    /// scheme hints when the request never logged one directly.
    fn synthesize_url(&self, request: &UrlRequest) -> Option<String> {
        let mut scheme: Option<String> = None;
        let mut origin: Option<String> = None;
        let mut path: Option<String> = None;
        if let Some(line) = &request.line {
            // "GET /index.html HTTP/1.1" -> "/index.html"
            path = line.split_whitespace().nth(1).map(str::to_string);
        }
        if let Some(group) = &request.group {
            scheme = Some(if group.contains("ssl/") { "https" } else { "http" }.to_string());
        } else if let Some(socket) = request.socket.and_then(|id| self.sockets.get(&id)) {
            scheme = Some(
                if socket.ssl_start.is_some() {
                    "https"
                } else {
                    "http"
                }
                .to_string(),
            );
        }
        let headers = &request.request_headers;
        if let Some(value) = find_header(headers, ":scheme") {
            scheme = Some(value.to_string());
        }
        if let Some(value) =
            find_header(headers, ":host").or_else(|| find_header(headers, ":authority"))
        {
            origin = Some(value.to_string());
        }
        if let Some(value) = find_header(headers, ":path") {
            path = Some(value.to_string());
        }
        match (scheme, origin, path) {
            (Some(s), Some(o), Some(p)) => Some(format!("{s}://{o}{p}")),
            _ => None,
        }
    }

    /// Matches a request that knows its stream id but not its session
    /// against an HTTP/2 session on the same host with the same `:path`.
    fn match_orphan_stream(
        &self,
        request: &UrlRequest,
        request_host: &str,
        stream_id: u64,
    ) -> Option<u64> {
        let request_path = find_header(&request.request_headers, ":path")?;
        for (session_id, session) in &self.h2_sessions {
            let Some(session_host) = session.host.as_deref() else {
                continue;
            };
            if session_host.split(':').next() != Some(request_host) {
                continue;
            }
            let Some(stream) = session.streams.get(&stream_id) else {
                continue;
            };
            if find_header(&stream.request_headers, ":path") == Some(request_path) {
                return Some(*session_id);
            }
        }
        None
    }

    /// Copies stream-level data from the owning HTTP/2 session.
    fn merge_h2_stream(&self, request: &mut UrlRequest) {
        let Some(session) = request.h2_session.and_then(|id| self.h2_sessions.get(&id)) else {
            return;
        };
        if request.socket.is_none() {
            request.socket = session.socket;
        }
        let Some(stream) = request.stream_id.and_then(|id| session.streams.get(&id)) else {
            return;
        };
        if !stream.request_headers.is_empty() {
            request.request_headers = stream.request_headers.clone();
        }
        if !stream.response_headers.is_empty() {
            request.response_headers = stream.response_headers.clone();
        }
        if let Some(weight) = stream.weight {
            request.weight = Some(weight);
            if request.priority.is_none() {
                request.priority = Some(map_priority(weight_to_priority(weight)));
            }
        }
        if request.first_byte.is_none() {
            request.first_byte = stream.first_byte;
        }
        if request.end.is_none() {
            request.end = stream.end;
        }
        if stream.bytes_in > request.bytes_in {
            request.bytes_in = stream.bytes_in;
            request.chunks = stream.chunks.clone();
        }
    }

    /// Stream jobs that requested a socket but never got one, grouped
    /// by the host parsed out of the pool group name.
    fn failed_hosts(&self, known_hosts: &[String], last_time: i64) -> Vec<(String, (i64, i64))> {
        let mut failed: Vec<(String, (i64, i64))> = Vec::new();
        for job in self.stream_jobs.values() {
            let (Some(group), Some(socket_start)) = (&job.group, job.socket_start) else {
                continue;
            };
            if job.socket.is_some() {
                continue;
            }
            // Group names look like "pm/ssl/host:443".
            let Some(host) = group
                .rsplit('/')
                .next()
                .and_then(|hp| hp.split(':').next())
            else {
                continue;
            };
            if known_hosts.iter().any(|h| h == host) || failed.iter().any(|(h, _)| h == host) {
                continue;
            }
            let end = job.socket_end.unwrap_or(socket_start.max(last_time));
            failed.push((host.to_string(), (socket_start, end)));
        }
        failed
    }

    /// Claims DNS lookups for requests: per host, the longest lookup
    /// whose span precedes the anchor time, end clamped to the anchor.
    /// Requests that connected anchor on `connect_start`; coalesced
    /// requests fall back to their send time in a second pass.
    fn assign_dns(&self, pending: &mut [Pending]) {
        struct HostLookups {
            claimed: bool,
            times: Vec<(i64, i64)>,
        }
        let mut lookups: FxHashMap<String, HostLookups> = FxHashMap::default();
        for job in self.dns.values() {
            let (Some(host), Some(start), Some(end)) = (&job.host, job.start, job.end) else {
                continue;
            };
            lookups
                .entry(host.clone())
                .or_insert_with(|| HostLookups {
                    claimed: false,
                    times: Vec::new(),
                })
                .times
                .push((start, end));
        }

        for anchor_on_connect in [true, false] {
            for p in pending.iter_mut() {
                if p.dns_start.is_some() {
                    continue;
                }
                let anchor = if anchor_on_connect {
                    p.connect_start
                } else {
                    p.start
                };
                let (Some(anchor), Some(host)) = (anchor, &p.host) else {
                    continue;
                };
                let Some(entry) = lookups.get_mut(host) else {
                    continue;
                };
                if entry.claimed {
                    continue;
                }
                let mut best: Option<(i64, i64)> = None;
                for &(start, end) in &entry.times {
                    if start >= anchor {
                        continue;
                    }
                    let end = end.min(anchor);
                    if end <= start {
                        continue;
                    }
                    if best.is_none_or(|(bs, be)| end - start > be - bs) {
                        best = Some((start, end));
                    }
                }
                if let Some((start, end)) = best {
                    entry.claimed = true;
                    p.dns_start = Some(start);
                    p.dns_end = Some(end);
                }
            }
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
