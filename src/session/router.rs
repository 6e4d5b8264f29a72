//! Event router.
//!
//! Every inbound event funnels through [`Router::dispatch`], which runs
//! in the session's pump context. The router owns all per-recording
//! state (request store, page state, trace reducer, attached targets)
//! and never performs I/O itself: anything that requires sending a
//! command back is returned as a [`Reaction`] for the session to issue.
//!
//! # Category Table
//!
//! | Category | Recording-gated | Handling |
//! |----------|-----------------|----------|
//! | Network | yes | request state machine |
//! | Page | yes | navigation state, dialogs |
//! | Console, Log, Audits | yes | activity clock only |
//! | CSS | yes | stylesheet registry |
//! | Tracing | yes | trace reducer ingest |
//! | Target | no | target registry, worker enable |
//! | Inspector | no | crash / detach nav errors |
//! | Debugger | no | auto-resume |
//! | Runtime | no | activity clock only |
//!
//! Recording-gated categories are dropped while not recording so warmup
//! traffic cannot leak into the measurement.

// ============================================================================
// Imports
// ============================================================================

use rustc_hash::FxHashMap;
use serde_json::{Value, json};
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::identifiers::TargetId;
use crate::protocol::event::ParsedEvent;
use crate::protocol::message::EventMessage;
use crate::session::network::{
    NAV_ERROR_GENERIC, NAV_ERROR_INTERSTITIAL, RequestStore,
};
use crate::trace::TraceReducer;

// ============================================================================
// EventCategory
// ============================================================================

/// Coarse event classification by protocol domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventCategory {
    Page,
    Network,
    Console,
    Log,
    Audits,
    Inspector,
    Css,
    Debugger,
    Runtime,
    Target,
    Tracing,
    Other,
}

impl EventCategory {
    /// Maps a protocol domain to its category.
    #[must_use]
    pub fn of(domain: &str) -> Self {
        match domain {
            "Page" => Self::Page,
            "Network" => Self::Network,
            "Console" => Self::Console,
            "Log" => Self::Log,
            "Audits" => Self::Audits,
            "Inspector" => Self::Inspector,
            "CSS" => Self::Css,
            "Debugger" => Self::Debugger,
            "Runtime" => Self::Runtime,
            "Target" => Self::Target,
            "Tracing" | "Timeline" => Self::Tracing,
            _ => Self::Other,
        }
    }

    /// Categories that only matter while a recording is active.
    #[inline]
    #[must_use]
    pub fn is_recording_gated(self) -> bool {
        matches!(
            self,
            Self::Page
                | Self::Network
                | Self::Console
                | Self::Log
                | Self::Audits
                | Self::Css
                | Self::Tracing
        )
    }
}

// ============================================================================
// Reaction
// ============================================================================

/// A command the session must send in response to an event.
#[derive(Debug, Clone)]
pub enum Reaction {
    /// Send on the main connection.
    Send {
        method: String,
        params: Value,
    },
    /// Send into a nested target.
    SendToTarget {
        target: TargetId,
        method: String,
        params: Value,
    },
}

// ============================================================================
// Router
// ============================================================================

/// Per-recording event state and dispatch.
pub struct Router {
    /// Network request state machine.
    pub requests: RequestStore,
    /// Trace event reducer fed from `Tracing.dataCollected`.
    pub trace: TraceReducer,
    /// Targets we have attached to.
    pub targets: Vec<TargetId>,
    /// Stylesheet id to source URL, from `CSS.styleSheetAdded`. Joined
    /// against rule-usage coverage at stop time.
    pub stylesheets: FxHashMap<String, String>,
    recording: bool,
    tracing_complete: bool,
    last_activity: Instant,
}

impl Router {
    /// Creates a router with a fresh request store and reducer.
    #[must_use]
    pub fn new(trace: TraceReducer) -> Self {
        Self {
            requests: RequestStore::new(),
            trace,
            targets: Vec::new(),
            stylesheets: FxHashMap::default(),
            recording: false,
            tracing_complete: false,
            last_activity: Instant::now(),
        }
    }

    /// Turns data-event accumulation on or off.
    pub fn set_recording(&mut self, recording: bool) {
        self.recording = recording;
        if recording {
            self.tracing_complete = false;
            self.last_activity = Instant::now();
        }
    }

    /// Returns `true` while data events are being accumulated.
    #[inline]
    #[must_use]
    pub fn is_recording(&self) -> bool {
        self.recording
    }

    /// Returns `true` once `Tracing.tracingComplete` arrived.
    #[inline]
    #[must_use]
    pub fn tracing_complete(&self) -> bool {
        self.tracing_complete
    }

    /// Time since the last activity-relevant event.
    #[must_use]
    pub fn idle_for(&self) -> std::time::Duration {
        self.last_activity.elapsed()
    }

    /// Routes one event, mutating recording state and appending any
    /// required reactions.
    ///
    /// `from_target` marks events that arrived tunneled out of a nested
    /// target. Decode failures for known events are logged and dropped;
    /// they never propagate.
    pub fn dispatch(
        &mut self,
        event: &EventMessage,
        from_target: Option<&TargetId>,
        reactions: &mut Vec<Reaction>,
    ) {
        let (domain, _) = event.split_method();
        let category = EventCategory::of(domain);

        if category.is_recording_gated() && !self.recording {
            trace!(method = %event.method, "dropping pre-recording event");
            return;
        }

        let parsed = match ParsedEvent::parse(event) {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!(method = %event.method, error = %e, "dropping malformed event");
                return;
            }
        };

        // Target envelopes and video data chunks do not count as page
        // activity; everything else resets the idle clock.
        let mut counts_as_activity = category != EventCategory::Target;

        match parsed {
            ParsedEvent::RequestWillBeSent(p) => {
                self.requests.on_request_will_be_sent(&p, from_target);
            }
            ParsedEvent::RequestExtraInfo(p) => self.requests.on_request_extra_info(&p),
            ParsedEvent::ResponseReceived(p) => self.requests.on_response_received(&p),
            ParsedEvent::ResponseExtraInfo(p) => self.requests.on_response_extra_info(&p),
            ParsedEvent::ServedFromCache(p) => self.requests.on_served_from_cache(&p),
            ParsedEvent::DataReceived(p) => {
                let is_video = self.requests.on_data_received(&p);
                if is_video {
                    counts_as_activity = false;
                }
            }
            ParsedEvent::LoadingFinished(p) => self.requests.on_loading_finished(&p),
            ParsedEvent::LoadingFailed(p) => self.requests.on_loading_failed(&p),
            ParsedEvent::ResourceChangedPriority(p) => self.requests.on_priority_changed(&p),

            ParsedEvent::LoadEventFired { timestamp } => {
                debug!(timestamp, "load event fired");
                self.requests.page.load_event = Some(timestamp);
            }
            ParsedEvent::DomContentEventFired { timestamp } => {
                self.requests.page.dom_content = Some(timestamp);
            }
            ParsedEvent::FrameStartedLoading { frame_id } => {
                if self.requests.page.main_frame.is_none() {
                    self.requests.page.main_frame = Some(frame_id.clone());
                }
                if !self.requests.page.loading_frames.contains(&frame_id) {
                    self.requests.page.loading_frames.push(frame_id);
                }
            }
            ParsedEvent::FrameStoppedLoading { frame_id } => {
                self.requests.page.loading_frames.retain(|f| f != &frame_id);
            }
            ParsedEvent::FrameNavigated(p) => {
                if p.frame.parent_id.is_none() && self.requests.page.main_frame.is_none() {
                    self.requests.page.main_frame = Some(p.frame.id);
                }
            }
            ParsedEvent::JavascriptDialogOpening { message } => {
                debug!(message = %message, "dismissing javascript dialog");
                reactions.push(Reaction::Send {
                    method: "Page.handleJavaScriptDialog".to_string(),
                    params: json!({"accept": true}),
                });
            }
            ParsedEvent::InterstitialShown => {
                self.requests
                    .page
                    .set_nav_error(NAV_ERROR_INTERSTITIAL, "interstitial shown");
            }

            ParsedEvent::StyleSheetAdded(header) => {
                // First registration wins; inline sheets carry no URL.
                if !header.source_url.is_empty() {
                    self.stylesheets
                        .entry(header.style_sheet_id)
                        .or_insert(header.source_url);
                }
            }

            ParsedEvent::TargetCreated(_) => {}
            ParsedEvent::AttachedToTarget(info) => {
                debug!(target = %info.target_id, kind = %info.target_type, "target attached");
                if !self.targets.contains(&info.target_id) {
                    self.targets.push(info.target_id.clone());
                }
                // Targets attach paused; always release them.
                reactions.push(Reaction::SendToTarget {
                    target: info.target_id.clone(),
                    method: "Runtime.runIfWaitingForDebugger".to_string(),
                    params: json!({}),
                });
                if self.recording && info.is_worker() {
                    for method in ["Network.enable", "Console.enable", "Runtime.enable"] {
                        reactions.push(Reaction::SendToTarget {
                            target: info.target_id.clone(),
                            method: method.to_string(),
                            params: json!({}),
                        });
                    }
                }
            }

            ParsedEvent::InspectorDetached { reason } => {
                self.requests
                    .page
                    .set_nav_error(NAV_ERROR_GENERIC, format!("inspector detached: {reason}"));
            }
            ParsedEvent::TargetCrashed => {
                self.requests
                    .page
                    .set_nav_error(NAV_ERROR_GENERIC, "browser target crashed");
            }

            ParsedEvent::DebuggerPaused => {
                let reaction = match from_target {
                    Some(target) => Reaction::SendToTarget {
                        target: target.clone(),
                        method: "Debugger.resume".to_string(),
                        params: json!({}),
                    },
                    None => Reaction::Send {
                        method: "Debugger.resume".to_string(),
                        params: json!({}),
                    },
                };
                reactions.push(reaction);
            }

            ParsedEvent::Other { method, params } => {
                match method.as_str() {
                    "Tracing.dataCollected" => {
                        if let Some(chunk) = params.get("value").and_then(Value::as_array) {
                            self.trace.ingest(chunk);
                        }
                    }
                    "Tracing.tracingComplete" => {
                        debug!("tracing complete");
                        self.tracing_complete = true;
                    }
                    _ => {
                        trace!(method = %method, "unhandled event");
                    }
                }
            }
        }

        if counts_as_activity {
            self.last_activity = Instant::now();
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
