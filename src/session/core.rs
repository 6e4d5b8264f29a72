//! Session: command multiplexer and message pump.
//!
//! One [`Session`] owns the WebSocket connection and is the only place
//! inbound messages are interpreted. Waiting for a command response is
//! cooperative: the waiter keeps pumping the transport queue and
//! dispatching everything it pops (events included, side effects and
//! all) until its own response id shows up or the deadline passes.
//! Command timeouts are therefore not errors; `send_wait` resolves to
//! `Ok(None)` and the response, if it ever arrives, is consumed by a
//! later pump.
//!
//! Messages tunneled out of nested targets are unwrapped onto an
//! explicit work queue and drained iteratively by the same pump, so a
//! deeply nested envelope can never recurse.

// ============================================================================
// Imports
// ============================================================================

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use rustc_hash::FxHashMap;
use serde_json::{Map, Value, json};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::{JobConfig, TaskPaths};
use crate::error::Result;
use crate::identifiers::{CommandId, CommandIdGenerator, RequestId, TargetId};
use crate::protocol::message::{CommandResponse, InboundMessage};
use crate::protocol::Command;
use crate::report::ProtocolLog;
use crate::session::coverage::CoverageBuilder;
use crate::session::network::{NAV_ERROR_NO_NAVIGATION, NAV_ERROR_TIMEOUT, PageState, RequestRecord, RequestStore};
use crate::session::router::{Reaction, Router};
use crate::trace::{TraceReducer, TraceReductions};
use crate::transport::{Connection, discover};

// ============================================================================
// Constants
// ============================================================================

/// Longest single pump slice while waiting for a response.
const COMMAND_POLL: Duration = Duration::from_secs(1);

/// Pending command entries older than this are swept at each send.
const PENDING_MAX_AGE: Duration = Duration::from_secs(60);

/// Consecutive body-fetch failures before giving up on bodies.
const BODY_FAILURE_LIMIT: u32 = 3;

/// Per-command wait for a response body.
const BODY_WAIT: Duration = Duration::from_secs(10);

/// Wait for `Tracing.tracingComplete` after `Tracing.end`.
const TRACE_FLUSH_WAIT: Duration = Duration::from_secs(120);

/// Per-command wait for the coverage dumps at stop time.
const COVERAGE_WAIT: Duration = Duration::from_secs(30);

/// Sampling interval for the coverage profiler, microseconds.
const COVERAGE_SAMPLING_USECS: u32 = 100;

// ============================================================================
// Types
// ============================================================================

#[derive(Debug)]
struct PendingCommand {
    method: String,
    issued_at: Instant,
}

/// Everything a finished recording produced.
#[derive(Debug)]
pub struct RecordingOutput {
    /// Final request records, insertion-ordered, netlog-merged.
    pub requests: Vec<RequestRecord>,
    /// Page-level navigation outcome.
    pub page: PageState,
    /// Trace reductions (user timing, CPU, long tasks, ...).
    pub trace: TraceReductions,
    /// Per-URL JS/CSS usage coverage; empty unless coverage was on.
    pub coverage: Map<String, Value>,
}

// ============================================================================
// Session
// ============================================================================

/// A debugging-protocol session against one browser tab.
pub struct Session {
    connection: Connection,
    http: reqwest::Client,
    ids: CommandIdGenerator,
    pending: FxHashMap<CommandId, PendingCommand>,
    /// Body fetches issued without a blocking wait; responses landing
    /// here are stored even when the original waiter already timed out.
    pending_bodies: FxHashMap<CommandId, RequestId>,
    router: Router,
    /// Unwrapped nested-target messages awaiting dispatch.
    work: VecDeque<(Option<TargetId>, InboundMessage)>,
    config: JobConfig,
    paths: TaskPaths,
    port: u16,
    tab_id: String,
    protocol_log: Option<ProtocolLog>,
    body_failures: u32,
    must_exit: Arc<AtomicBool>,
}

impl Session {
    /// Discovers the debug endpoint on `port` and connects.
    ///
    /// Discovery and the WebSocket handshake each retry internally; the
    /// whole attempt is bounded by `timeout`.
    pub async fn connect(
        config: JobConfig,
        paths: TaskPaths,
        port: u16,
        timeout: Duration,
    ) -> Result<Self> {
        let http = reqwest::Client::new();
        let target = discover(&http, port, timeout).await?;
        let connection = Connection::connect(&target.ws_url, timeout).await?;
        let must_exit = connection.must_exit_flag();

        info!(tab_id = %target.tab_id, "session connected");

        Ok(Self {
            connection,
            http,
            ids: CommandIdGenerator::new(),
            pending: FxHashMap::default(),
            pending_bodies: FxHashMap::default(),
            router: Router::new(TraceReducer::default()),
            work: VecDeque::new(),
            config,
            paths,
            port,
            tab_id: target.tab_id,
            protocol_log: None,
            body_failures: 0,
            must_exit,
        })
    }

    /// Shared cancellation flag; set it to abort any in-progress wait.
    #[inline]
    #[must_use]
    pub fn must_exit_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.must_exit)
    }

    /// Browser tab id this session is attached to.
    #[inline]
    #[must_use]
    pub fn tab_id(&self) -> &str {
        &self.tab_id
    }

    /// Page navigation state observed so far.
    #[inline]
    #[must_use]
    pub fn page(&self) -> &PageState {
        &self.router.requests.page
    }

    // ========================================================================
    // Command Sending
    // ========================================================================

    /// Sends a command without waiting for its response.
    pub async fn send(&mut self, method: &str, params: Value) -> Result<CommandId> {
        self.sweep_pending();
        let id = self.ids.next_id();
        let command = Command::new(id, method, params);
        self.register_pending(id, method);
        self.connection.send_text(command.to_wire()?).await?;
        Ok(id)
    }

    /// Sends a command and pumps until its response arrives.
    ///
    /// Returns `Ok(None)` on deadline or cancellation, and on an error
    /// response (logged). Events popped while waiting are fully
    /// dispatched.
    pub async fn send_wait(
        &mut self,
        method: &str,
        params: Value,
        wait: Duration,
    ) -> Result<Option<Value>> {
        let id = self.send(method, params).await?;
        self.wait_for_response(id, wait).await
    }

    /// Sends a command into a nested target.
    ///
    /// Control-plane methods (`Target.*`, `Tracing.*`) are never
    /// wrapped; they go out on the main connection unchanged.
    pub async fn send_to_target(
        &mut self,
        method: &str,
        params: Value,
        target: &TargetId,
    ) -> Result<CommandId> {
        if Command::is_control_plane(method) {
            return self.send(method, params).await;
        }
        self.sweep_pending();
        let inner_id = self.ids.next_id();
        let envelope_id = self.ids.next_id();
        let inner = Command::new(inner_id, method, params);
        let envelope = inner.wrap_for_target(envelope_id, target)?;
        // The inner id is what the target's response will carry.
        self.register_pending(inner_id, method);
        self.register_pending(envelope_id, "Target.sendMessageToTarget");
        self.connection.send_text(envelope.to_wire()?).await?;
        Ok(inner_id)
    }

    fn register_pending(&mut self, id: CommandId, method: &str) {
        self.pending.insert(
            id,
            PendingCommand {
                method: method.to_string(),
                issued_at: Instant::now(),
            },
        );
    }

    /// Drops pending entries nothing will ever claim. Without this the
    /// map grows for the life of the session on fire-and-forget traffic.
    fn sweep_pending(&mut self) {
        let now = Instant::now();
        self.pending
            .retain(|_, cmd| now.duration_since(cmd.issued_at) < PENDING_MAX_AGE);
        self.pending_bodies
            .retain(|id, _| self.pending.contains_key(id));
    }

    async fn wait_for_response(&mut self, id: CommandId, wait: Duration) -> Result<Option<Value>> {
        let deadline = Instant::now() + wait;
        loop {
            if self.must_exit.load(Ordering::Relaxed) {
                return Ok(None);
            }
            let now = Instant::now();
            if now >= deadline {
                debug!(id = %id, "command response wait timed out");
                return Ok(None);
            }
            let slice = (deadline - now).min(COMMAND_POLL);
            if let Some(response) = self.pump(slice).await?
                && response.id == id
            {
                if let Some(error) = &response.error {
                    warn!(id = %id, code = error.code, message = %error.message,
                        "command failed");
                    return Ok(None);
                }
                return Ok(Some(response.result.unwrap_or(Value::Null)));
            }
        }
    }

    // ========================================================================
    // Message Pump
    // ========================================================================

    /// Pops and dispatches at most one transport message (plus any work
    /// it unwraps), waiting up to `wait`. Returns the response it saw,
    /// if the message was one.
    pub async fn pump(&mut self, wait: Duration) -> Result<Option<CommandResponse>> {
        let Some(message) = self.connection.recv(wait).await else {
            return Ok(None);
        };
        let response = self.dispatch(message, None).await?;
        self.drain_work().await?;
        Ok(response)
    }

    /// Dispatches every message already queued without waiting.
    pub async fn pump_pending(&mut self) -> Result<()> {
        while let Some(message) = self.connection.try_recv() {
            self.dispatch(message, None).await?;
            self.drain_work().await?;
        }
        Ok(())
    }

    async fn drain_work(&mut self) -> Result<()> {
        while let Some((target, message)) = self.work.pop_front() {
            self.dispatch(message, target).await?;
        }
        Ok(())
    }

    async fn dispatch(
        &mut self,
        message: InboundMessage,
        from_target: Option<TargetId>,
    ) -> Result<Option<CommandResponse>> {
        self.log_inbound(&message);

        match message {
            InboundMessage::Response(response) => {
                if let Some(pending) = self.pending.remove(&response.id) {
                    debug!(id = %response.id, method = %pending.method, "response");
                } else {
                    debug!(id = %response.id, "response for unknown or swept command");
                }
                if let Some(request_id) = self.pending_bodies.remove(&response.id) {
                    self.store_body_response(&request_id, &response);
                }
                Ok(Some(response))
            }
            InboundMessage::Event(event) => {
                if let Some((target, inner)) = event.unwrap_nested()? {
                    self.work.push_back((Some(target), inner));
                    return Ok(None);
                }
                let mut reactions = Vec::new();
                self.router
                    .dispatch(&event, from_target.as_ref(), &mut reactions);
                for reaction in reactions {
                    self.issue(reaction).await?;
                }
                Ok(None)
            }
        }
    }

    async fn issue(&mut self, reaction: Reaction) -> Result<()> {
        match reaction {
            Reaction::Send { method, params } => {
                self.send(&method, params).await?;
            }
            Reaction::SendToTarget {
                target,
                method,
                params,
            } => {
                self.send_to_target(&method, params, &target).await?;
            }
        }
        Ok(())
    }

    fn log_inbound(&mut self, message: &InboundMessage) {
        let Some(log) = &mut self.protocol_log else {
            return;
        };
        let value = match message {
            InboundMessage::Response(r) => json!({
                "id": r.id, "result": r.result,
                "error": r.error.as_ref().map(|e| json!({"code": e.code, "message": e.message})),
            }),
            InboundMessage::Event(e) => json!({"method": e.method, "params": e.params}),
        };
        if let Err(e) = log.append(&value) {
            warn!(error = %e, "protocol log write failed");
        }
    }

    // ========================================================================
    // Recording Lifecycle
    // ========================================================================

    /// Enables the capture domains and starts tracing.
    pub async fn start_recording(&mut self) -> Result<()> {
        if self.config.protocol_log {
            match ProtocolLog::create(&self.paths.artifact("_devtools.json.gz")) {
                Ok(log) => self.protocol_log = Some(log),
                Err(e) => warn!(error = %e, "could not open protocol log"),
            }
        }

        self.router.set_recording(true);

        for method in ["Page.enable", "Inspector.enable", "Network.enable", "Console.enable"] {
            self.send_wait(method, json!({}), COMMAND_POLL).await?;
        }
        self.send_wait(
            "Target.setAutoAttach",
            json!({"autoAttach": true, "waitForDebuggerOnStart": true}),
            COMMAND_POLL,
        )
        .await?;

        if !self.config.headers.is_empty() {
            let headers: Value = self
                .config
                .headers
                .iter()
                .map(|(k, v)| (k.clone(), Value::String(v.clone())))
                .collect::<serde_json::Map<_, _>>()
                .into();
            self.send_wait(
                "Network.setExtraHTTPHeaders",
                json!({"headers": headers}),
                COMMAND_POLL,
            )
            .await?;
        }
        if let Some(user_agent) = self.config.user_agent.clone() {
            self.send_wait(
                "Network.setUserAgentOverride",
                json!({"userAgent": user_agent}),
                COMMAND_POLL,
            )
            .await?;
        }
        if !self.config.block.is_empty() {
            self.send_wait(
                "Network.setBlockedURLs",
                json!({"urls": self.config.block}),
                COMMAND_POLL,
            )
            .await?;
        }

        if self.config.coverage {
            for (method, params) in [
                ("DOM.enable", json!({})),
                ("CSS.enable", json!({})),
                ("CSS.startRuleUsageTracking", json!({})),
                ("Profiler.enable", json!({})),
                (
                    "Profiler.setSamplingInterval",
                    json!({"interval": COVERAGE_SAMPLING_USECS}),
                ),
                ("Profiler.start", json!({})),
            ] {
                self.send_wait(method, params, COMMAND_POLL).await?;
            }
        }

        let categories = self.config.trace_category_string();
        info!(categories = %categories, "starting trace");
        self.send_wait(
            "Tracing.start",
            json!({
                "categories": categories,
                "options": "record-as-much-as-possible",
                "transferMode": "ReportEvents",
            }),
            COMMAND_POLL,
        )
        .await?;

        Ok(())
    }

    /// Stops tracing, drains the trace stream, fetches bodies, and
    /// finalizes all accumulated state.
    pub async fn stop_recording(&mut self) -> Result<RecordingOutput> {
        // Paint metrics in the trace lack element and URL detail; the
        // page's Performance timeline fills them in.
        if let Some(result) = self
            .send_wait(
                "Runtime.evaluate",
                json!({
                    "expression": "JSON.stringify(performance.getEntries())",
                    "returnByValue": true,
                }),
                BODY_WAIT,
            )
            .await?
            && let Some(raw) = result
                .get("result")
                .and_then(|r| r.get("value"))
                .and_then(Value::as_str)
            && let Ok(entries) = serde_json::from_str::<Value>(raw)
        {
            self.router.trace.set_performance_entries(entries);
        }

        let coverage = if self.config.coverage {
            self.collect_coverage().await?
        } else {
            Map::new()
        };

        self.send_wait("Tracing.end", json!({}), COMMAND_POLL).await?;

        // Trace data keeps streaming until tracingComplete.
        let deadline = Instant::now() + TRACE_FLUSH_WAIT;
        while !self.router.tracing_complete()
            && Instant::now() < deadline
            && !self.must_exit.load(Ordering::Relaxed)
        {
            self.pump(COMMAND_POLL).await?;
        }
        if !self.router.tracing_complete() {
            warn!("trace stream did not complete before deadline");
        }

        self.fetch_response_bodies().await?;

        for method in ["Network.disable", "Page.disable", "Inspector.disable"] {
            self.send_wait(method, json!({}), COMMAND_POLL).await?;
        }

        self.router.set_recording(false);
        self.protocol_log = None;

        if self.router.requests.main_request().is_none() {
            self.router
                .requests
                .page
                .set_nav_error(NAV_ERROR_NO_NAVIGATION, "no navigation observed");
        }

        let trace = self.router.trace.finalize();
        let mut requests = self.router.requests.finalize();
        RequestStore::merge_netlog(&mut requests, &trace.netlog_requests);
        let page = self.router.requests.page.clone();

        Ok(RecordingOutput {
            requests,
            page,
            trace,
            coverage,
        })
    }

    /// Pulls the JS and CSS coverage dumps and summarizes them per URL.
    ///
    /// Both dumps can be large; they get the long wait. A missing or
    /// failed dump leaves its category out of the summary.
    async fn collect_coverage(&mut self) -> Result<Map<String, Value>> {
        let mut builder = CoverageBuilder::new();

        self.send_wait("Profiler.stop", json!({}), COMMAND_POLL).await?;
        if let Some(result) = self
            .send_wait("Profiler.getBestEffortCoverage", json!({}), COVERAGE_WAIT)
            .await?
            && let Some(scripts) = result.get("result")
        {
            builder.add_js_scripts(scripts);
        }
        self.send_wait("Profiler.disable", json!({}), COMMAND_POLL).await?;

        if let Some(result) = self
            .send_wait("CSS.stopRuleUsageTracking", json!({}), COVERAGE_WAIT)
            .await?
            && let Some(rules) = result.get("ruleUsage")
        {
            builder.add_css_rules(rules, &self.router.stylesheets);
        }
        for method in ["CSS.disable", "DOM.disable"] {
            self.send_wait(method, json!({}), COMMAND_POLL).await?;
        }

        let summary = builder.summarize();
        debug!(urls = summary.len(), "coverage summarized");
        Ok(summary)
    }

    // ========================================================================
    // Navigation Waits
    // ========================================================================

    /// Navigates the tab.
    pub async fn navigate(&mut self, url: &str) -> Result<()> {
        info!(url, "navigating");
        self.send_wait("Page.navigate", json!({"url": url}), COMMAND_POLL)
            .await?;
        Ok(())
    }

    /// Pumps until the load event has fired and the page has gone
    /// quiet, or the time limit passes (recorded as a nav error).
    pub async fn wait_for_page_load(&mut self) -> Result<()> {
        let deadline = Instant::now() + Duration::from_secs_f64(self.config.time_limit_secs);
        let activity_timeout = Duration::from_secs_f64(self.config.activity_timeout_secs);
        let max_requests = self.config.max_requests;

        loop {
            if self.must_exit.load(Ordering::Relaxed) {
                return Ok(());
            }
            if self.page().nav_error.is_some() {
                return Ok(());
            }
            if max_requests > 0 && self.router.requests.from_net_count() > max_requests {
                warn!(max_requests, "request limit exceeded, aborting load");
                return Ok(());
            }
            if self.page().load_event.is_some() && self.router.idle_for() >= activity_timeout {
                debug!("page load complete");
                return Ok(());
            }
            if Instant::now() >= deadline {
                self.router
                    .requests
                    .page
                    .set_nav_error(NAV_ERROR_TIMEOUT, "page load timed out");
                return Ok(());
            }
            self.pump(COMMAND_POLL).await?;
        }
    }

    /// Pumps until nothing activity-relevant has arrived for the
    /// configured quiet period, or `wait` passes.
    pub async fn wait_for_idle(&mut self, wait: Duration) -> Result<()> {
        let deadline = Instant::now() + wait;
        let activity_timeout = Duration::from_secs_f64(self.config.activity_timeout_secs);
        while Instant::now() < deadline
            && self.router.idle_for() < activity_timeout
            && !self.must_exit.load(Ordering::Relaxed)
        {
            self.pump(COMMAND_POLL).await?;
        }
        Ok(())
    }

    // ========================================================================
    // Response Bodies
    // ========================================================================

    /// Fetches response bodies for every record the archive policy
    /// wants, stopping after [`BODY_FAILURE_LIMIT`] consecutive
    /// failures.
    async fn fetch_response_bodies(&mut self) -> Result<()> {
        // With noopt set and nothing archiving bodies there is no
        // consumer; skip the fetch entirely.
        if self.config.noopt && !self.config.archives_bodies() {
            return Ok(());
        }
        let candidates = self
            .router
            .requests
            .body_candidates(self.config.bodies, self.config.html_body);
        debug!(count = candidates.len(), "fetching response bodies");

        for request_id in candidates {
            if self.body_failures >= BODY_FAILURE_LIMIT {
                warn!("too many body fetch failures, giving up");
                break;
            }
            self.router.requests.mark_body_requested(&request_id);
            let id = self
                .send(
                    "Network.getResponseBody",
                    json!({"requestId": request_id.as_str()}),
                )
                .await?;
            self.pending_bodies.insert(id, request_id.clone());
            match self.wait_for_response(id, BODY_WAIT).await? {
                Some(_) => {
                    // Stored by the pending-body hook during dispatch.
                    self.body_failures = 0;
                }
                None => {
                    self.body_failures += 1;
                }
            }
        }
        Ok(())
    }

    fn store_body_response(&mut self, request_id: &RequestId, response: &CommandResponse) {
        let Some(result) = &response.result else {
            return;
        };
        let Some(body) = result.get("body").and_then(Value::as_str) else {
            return;
        };
        let bytes = if result.get("base64Encoded").and_then(Value::as_bool) == Some(true) {
            match BASE64.decode(body) {
                Ok(bytes) => bytes,
                Err(e) => {
                    warn!(request_id = %request_id, error = %e, "body base64 decode failed");
                    return;
                }
            }
        } else {
            body.as_bytes().to_vec()
        };
        debug!(request_id = %request_id, len = bytes.len(), "body stored");
        self.router.requests.set_body(request_id, bytes);
    }

    // ========================================================================
    // Shutdown
    // ========================================================================

    /// Closes the tab and the connection.
    pub async fn close(&mut self) {
        let close_url = format!("http://localhost:{}/json/close/{}", self.port, self.tab_id);
        // Best effort; the browser may already be gone.
        let _ = self.http.get(&close_url).send().await;
        self.connection.close().await;
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use futures_util::{SinkExt, StreamExt};
    use tokio::net::TcpListener;
    use tokio_tungstenite::tungstenite::Message;

    #[test]
    fn test_pending_sweep_constants() {
        assert_eq!(PENDING_MAX_AGE, Duration::from_secs(60));
        assert!(COMMAND_POLL <= Duration::from_secs(1));
        assert_eq!(BODY_FAILURE_LIMIT, 3);
    }

    fn session_over(connection: Connection) -> Session {
        let must_exit = connection.must_exit_flag();
        Session {
            connection,
            http: reqwest::Client::new(),
            ids: CommandIdGenerator::new(),
            pending: FxHashMap::default(),
            pending_bodies: FxHashMap::default(),
            router: Router::new(TraceReducer::default()),
            work: VecDeque::new(),
            config: JobConfig::default(),
            paths: TaskPaths::new("/tmp", "t_"),
            port: 0,
            tab_id: "TAB".to_string(),
            protocol_log: None,
            body_failures: 0,
            must_exit,
        }
    }

    #[tokio::test]
    async fn test_send_wait_correlates_response_and_dispatches_events() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.expect("accept");
            let mut ws = tokio_tungstenite::accept_async(stream)
                .await
                .expect("handshake");

            let frame = ws.next().await.expect("frame").expect("message");
            let command: Value =
                serde_json::from_str(frame.to_text().expect("text")).expect("command json");
            assert_eq!(command["method"], "Page.navigate");
            let id = command["id"].as_u64().expect("command id");

            // An event lands ahead of the response; the waiter must
            // dispatch it and keep waiting for its own id.
            ws.send(Message::text(
                json!({"method": "Page.loadEventFired", "params": {"timestamp": 99.5}})
                    .to_string(),
            ))
            .await
            .expect("send event");
            ws.send(Message::text(
                json!({"id": id, "result": {"frameId": "F1"}}).to_string(),
            ))
            .await
            .expect("send response");
        });

        let connection = Connection::connect(&format!("ws://{addr}"), Duration::from_secs(5))
            .await
            .expect("connect");
        let mut session = session_over(connection);
        session.router.set_recording(true);

        let result = session
            .send_wait(
                "Page.navigate",
                json!({"url": "https://x.test/"}),
                Duration::from_secs(5),
            )
            .await
            .expect("send_wait")
            .expect("response");
        assert_eq!(result["frameId"], "F1");
        assert_eq!(session.page().load_event, Some(99.5));
        assert!(session.pending.is_empty());

        server.await.expect("server");
        session.connection.close().await;
    }
}
