//! Trace reduction pipeline.
//!
//! Trace events arrive in `Tracing.dataCollected` chunks during a
//! recording and are reduced incrementally; nothing buffers the full
//! trace. [`TraceReducer`] fans each filtered event out to the
//! reduction that consumes its category and assembles the final
//! [`TraceReductions`] once the trace stream completes.
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | `event` | Event decoding and category filter |
//! | `reducer` | Span stacks, CPU slices, long tasks, V8 stats |
//! | `user_timing` | Paint-metric candidate consolidation |
//! | `netlog` | Network-stack event correlation |

// ============================================================================
// Submodules
// ============================================================================

/// Trace event decoding and category filtering.
pub mod event;

/// Netlog correlation.
pub mod netlog;

/// Timeline and CPU reductions.
pub mod reducer;

/// User-timing consolidation.
pub mod user_timing;

// ============================================================================
// Imports
// ============================================================================

use serde_json::Value;
use tracing::debug;

use crate::trace::event::{TraceEvent, is_user_timing_category, keep_category};
use crate::trace::netlog::NetlogCorrelator;
use crate::trace::reducer::TimelineReducer;

// ============================================================================
// Re-exports
// ============================================================================

pub use event::TraceEvent as RawTraceEvent;
pub use netlog::NetlogRequest;
pub use reducer::{CpuSlices, FeatureNames, FeatureUsage, ScriptTiming, V8Stats};

// ============================================================================
// TraceReductions
// ============================================================================

/// Everything reduced from one trace stream.
#[derive(Debug, Default)]
pub struct TraceReductions {
    /// Consolidated user-timing events, raw trace-event JSON plus a
    /// trailing `startTime` marker. Empty when nothing was captured.
    pub user_timing: Vec<Value>,
    pub cpu: CpuSlices,
    /// Merged `[start_ms, end_ms]` long-task periods.
    pub long_tasks: Vec<(i64, i64)>,
    /// `[start_ms, end_ms]` interactive windows.
    pub interactive: Vec<(i64, i64)>,
    pub script_timing: ScriptTiming,
    pub feature_usage: FeatureUsage,
    pub v8_stats: V8Stats,
    pub netlog_requests: Vec<NetlogRequest>,
}

// ============================================================================
// TraceReducer
// ============================================================================

/// User-timing events worth keeping even without frame attribution.
const GLOBAL_TIMING_NAMES: [&str; 4] = [
    "navigationStart",
    "unloadEventStart",
    "redirectStart",
    "domLoading",
];

/// Streaming facade over the individual reductions.
#[derive(Debug, Default)]
pub struct TraceReducer {
    timeline: TimelineReducer,
    user_timing: Vec<Value>,
    performance_entries: Option<Value>,
    netlog: NetlogCorrelator,
    event_count: u64,
}

impl TraceReducer {
    /// Creates a reducer carrying use-counter name tables for the
    /// feature-usage reduction. Ids missing from the tables keep their
    /// numbered fallback names.
    #[must_use]
    pub fn with_feature_names(feature_names: reducer::FeatureNames) -> Self {
        Self {
            timeline: TimelineReducer::with_feature_names(feature_names),
            ..Self::default()
        }
    }

    /// Feeds one `Tracing.dataCollected` chunk into the reductions.
    ///
    /// Each chunk is the sort buffer: events from different processes
    /// can arrive out of order within one chunk, and span pairing needs
    /// them by timestamp. The sort is stable, so events with identical
    /// timestamps keep their arrival order.
    pub fn ingest(&mut self, events: &[Value]) {
        let mut batch: Vec<(TraceEvent, &Value)> = events
            .iter()
            .filter_map(|raw| {
                let event: TraceEvent = serde_json::from_value(raw.clone()).ok()?;
                keep_category(&event.cat).then_some((event, raw))
            })
            .collect();
        batch.sort_by_key(|(event, _)| event.ts);

        for (event, raw) in batch {
            self.event_count += 1;
            if event.cat == "__metadata" {
                self.timeline.observe_metadata(&event);
            } else if event.cat.contains("devtools.timeline")
                || event.cat.contains("blink.resource")
            {
                self.timeline.observe_timeline(&event);
            } else if is_user_timing_category(&event.cat) {
                if Self::keep_user_timing(&event) {
                    self.timeline.observe_user_timing(&event);
                    self.user_timing.push(raw.clone());
                }
            } else if event.cat.contains("blink.feature_usage") {
                self.timeline.observe_feature(&event);
            } else if event.cat.contains("netlog") {
                self.netlog.process(&event);
            } else if event.cat.contains("v8") {
                self.timeline.observe_v8(&event);
            }
        }
    }

    /// Supplies the page's `performance.getEntries()` dump, used to
    /// enrich paint metrics during consolidation.
    pub fn set_performance_entries(&mut self, entries: Value) {
        self.performance_entries = Some(entries);
    }

    /// Events accepted so far, all categories.
    #[inline]
    #[must_use]
    pub fn event_count(&self) -> u64 {
        self.event_count
    }

    /// Runs the final reductions. Consumes the accumulated state; a
    /// reducer finalizes once per recording.
    pub fn finalize(&mut self) -> TraceReductions {
        let cpu = self.timeline.reduce_cpu();
        let user_timing = if self.user_timing.is_empty() {
            Vec::new()
        } else {
            user_timing::consolidate(
                &std::mem::take(&mut self.user_timing),
                self.timeline.start_time().unwrap_or(0),
                self.performance_entries.as_ref(),
            )
        };
        let reductions = TraceReductions {
            user_timing,
            long_tasks: self.timeline.reduce_long_tasks(),
            interactive: self.timeline.reduce_interactive(),
            script_timing: self.timeline.reduce_script_timing(),
            feature_usage: self.timeline.reduce_feature_usage(),
            v8_stats: self.timeline.reduce_v8(),
            netlog_requests: self.netlog.requests(),
            cpu,
        };
        debug!(
            events = self.event_count,
            netlog_requests = reductions.netlog_requests.len(),
            "trace reduction complete"
        );
        reductions
    }

    /// User-timing events are frame-scoped unless they are one of the
    /// global navigation markers.
    fn keep_user_timing(event: &TraceEvent) -> bool {
        if GLOBAL_TIMING_NAMES.contains(&event.name.as_str()) {
            return true;
        }
        if event.args.get("frame").is_some() {
            return true;
        }
        event
            .data()
            .get("inMainFrame")
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use serde_json::json;

    #[test]
    fn test_ingest_dispatch() {
        let mut reducer = TraceReducer::default();
        reducer.ingest(&[
            // Dropped by the category filter.
            json!({ "cat": "toplevel", "name": "MessageLoop", "ph": "X",
                    "ts": 0, "pid": 1, "tid": 1, "dur": 10 }),
            json!({ "cat": "blink.user_timing", "name": "navigationStart", "ph": "I",
                    "ts": 1000, "pid": 1, "tid": 1, "args": { "frame": "F1" } }),
            json!({ "cat": "devtools.timeline", "name": "Task", "ph": "X",
                    "ts": 2000, "pid": 1, "tid": 1, "dur": 60_000 }),
        ]);
        assert_eq!(reducer.event_count(), 2);

        let reductions = reducer.finalize();
        assert_eq!(reductions.cpu.main_thread.as_deref(), Some("1:1"));
        assert_eq!(reductions.long_tasks, vec![(1, 61)]);
        // navigationStart plus the startTime marker.
        assert_eq!(reductions.user_timing.len(), 2);
    }

    #[test]
    fn test_frame_scoped_user_timing_filter() {
        let mut reducer = TraceReducer::default();
        reducer.ingest(&[
            json!({ "cat": "blink.user_timing", "name": "mark_custom", "ph": "I",
                    "ts": 1000, "pid": 1, "tid": 1, "args": {} }),
            json!({ "cat": "blink.user_timing", "name": "mark_framed", "ph": "I",
                    "ts": 1100, "pid": 1, "tid": 1, "args": { "frame": "F1" } }),
        ]);
        let reductions = reducer.finalize();
        let names: Vec<&str> = reductions
            .user_timing
            .iter()
            .filter_map(|e| e.get("name").and_then(Value::as_str))
            .collect();
        assert!(names.contains(&"mark_framed"));
        assert!(!names.contains(&"mark_custom"));
    }

    #[test]
    fn test_chunk_sorted_before_span_pairing() {
        let mut reducer = TraceReducer::default();
        reducer.ingest(&[
            json!({ "cat": "blink.user_timing", "name": "navigationStart", "ph": "I",
                    "ts": 0, "pid": 1, "tid": 1, "args": { "frame": "F1" } }),
            // Child arrives before its parent within the same chunk.
            json!({ "cat": "devtools.timeline", "name": "Layout", "ph": "X",
                    "ts": 1500, "pid": 1, "tid": 1, "dur": 100 }),
            json!({ "cat": "devtools.timeline", "name": "Task", "ph": "B",
                    "ts": 1000, "pid": 1, "tid": 1 }),
            json!({ "cat": "devtools.timeline", "name": "Task", "ph": "E",
                    "ts": 2000, "pid": 1, "tid": 1 }),
        ]);
        let reductions = reducer.finalize();
        let thread = reductions.cpu.slices.get("1:1").expect("thread row");
        let task: u64 = thread.get("Task").expect("task row").iter().sum();
        let layout: u64 = thread.get("Layout").expect("layout row").iter().sum();
        assert_eq!(task, 900);
        assert_eq!(layout, 100);
    }

    #[test]
    fn test_identical_timestamps_nest_in_arrival_order() {
        let mut reducer = TraceReducer::default();
        reducer.ingest(&[
            json!({ "cat": "blink.user_timing", "name": "navigationStart", "ph": "I",
                    "ts": 0, "pid": 1, "tid": 1, "args": { "frame": "F1" } }),
            json!({ "cat": "devtools.timeline", "name": "Outer", "ph": "B",
                    "ts": 1000, "pid": 1, "tid": 1 }),
            json!({ "cat": "devtools.timeline", "name": "Inner", "ph": "B",
                    "ts": 1000, "pid": 1, "tid": 1 }),
            json!({ "cat": "devtools.timeline", "name": "Inner", "ph": "E",
                    "ts": 2000, "pid": 1, "tid": 1 }),
            json!({ "cat": "devtools.timeline", "name": "Outer", "ph": "E",
                    "ts": 3000, "pid": 1, "tid": 1 }),
        ]);
        // A swap of the equal-timestamp begins would break the E pairing
        // and drop both spans.
        let reductions = reducer.finalize();
        let thread = reductions.cpu.slices.get("1:1").expect("thread row");
        let outer: u64 = thread.get("Outer").expect("outer row").iter().sum();
        let inner: u64 = thread.get("Inner").expect("inner row").iter().sum();
        assert_eq!(outer, 1000);
        assert_eq!(inner, 1000);
    }

    #[test]
    fn test_empty_trace_produces_empty_reductions() {
        let mut reducer = TraceReducer::default();
        let reductions = reducer.finalize();
        assert!(reductions.user_timing.is_empty());
        assert!(reductions.long_tasks.is_empty());
        assert!(reductions.netlog_requests.is_empty());
        assert!(reductions.cpu.slices.is_empty());
    }
}
