//! Timeline and CPU reductions.
//!
//! Consumes filtered trace events and maintains per-thread span stacks,
//! then reduces the completed span tree into the derived outputs:
//!
//! | Reduction | Derived from |
//! |-----------|--------------|
//! | CPU slice table | span tree, bucketed into uniform time slices |
//! | Long tasks | top-level main-thread spans over 50ms |
//! | Interactive windows | gaps between long tasks over 500ms |
//! | Script timing | spans attributable to a script URL |
//! | Feature usage | `FeatureFirstUsed` / `CSSFirstUsed` instants |
//! | V8 stats | `v8` category spans and runtime call stats |
//!
//! All reduced times are milliseconds relative to the navigation start
//! (the earliest `navigationStart` instant seen on any thread).

// ============================================================================
// Imports
// ============================================================================

use rustc_hash::FxHashMap;
use serde::Serialize;
use serde_json::Value;
use tracing::debug;

use crate::trace::event::TraceEvent;

// ============================================================================
// Constants
// ============================================================================

/// Spans longer than this (microseconds) count as long tasks and break
/// interactive windows.
const LONG_TASK_USECS: i64 = 50_000;

/// Minimum length (microseconds) of a reported interactive window.
const INTERACTIVE_MIN_USECS: i64 = 500_000;

/// Upper bound on the number of CPU slices; the slice width is the
/// smallest power of ten that stays under it.
const MAX_SLICES: i64 = 2_000;

/// Ceiling division for `i64` with a positive divisor; `i64::div_ceil`
/// is still unstable (`int_roundings`) on stable Rust.
fn div_ceil_i64(lhs: i64, rhs: i64) -> i64 {
    lhs.div_euclid(rhs) + i64::from(lhs.rem_euclid(rhs) != 0)
}

// ============================================================================
// Timeline Spans
// ============================================================================

/// One completed span in the per-thread span tree.
#[derive(Debug, Clone, Serialize)]
pub struct TimelineSpan {
    #[serde(rename = "n")]
    pub name: String,
    /// Start, trace microseconds.
    #[serde(rename = "s")]
    pub start: i64,
    /// End, trace microseconds.
    #[serde(rename = "e")]
    pub end: i64,
    /// Script URL, for spans attributable to one.
    #[serde(rename = "js", skip_serializing_if = "Option::is_none")]
    pub script: Option<String>,
    #[serde(rename = "c", skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<TimelineSpan>,
}

/// Span still open on a thread's stack.
#[derive(Debug)]
struct OpenSpan {
    name: String,
    start: i64,
    script: Option<String>,
    children: Vec<TimelineSpan>,
}

// ============================================================================
// Reduction Outputs
// ============================================================================

/// CPU time per thread, per span name, bucketed into uniform slices of
/// `slice_usecs` microseconds. Values are busy microseconds per slice.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CpuSlices {
    pub main_thread: Option<String>,
    pub slice_usecs: i64,
    pub slices: FxHashMap<String, FxHashMap<String, Vec<u64>>>,
}

/// Per-script span periods: thread -> script URL -> span name -> list
/// of `[start_ms, end_ms]` periods.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ScriptTiming {
    pub main_thread: Option<String>,
    pub threads: FxHashMap<String, FxHashMap<String, FxHashMap<String, Vec<(i64, i64)>>>>,
}

/// First-use times (ms) for Blink web platform features.
#[derive(Debug, Clone, Default, Serialize)]
pub struct FeatureUsage {
    #[serde(rename = "Features")]
    pub features: FxHashMap<String, f64>,
    #[serde(rename = "CSSFeatures")]
    pub css_features: FxHashMap<String, f64>,
}

/// Use-counter id→name lookup tables, injected per run.
///
/// Ids missing from the tables fall back to a numbered
/// `Feature_<id>` / `CSSFeature_<id>` form that stays joinable against
/// the Chromium use-counter tables downstream.
#[derive(Debug, Clone, Default)]
pub struct FeatureNames {
    pub features: FxHashMap<u64, String>,
    pub css_features: FxHashMap<u64, String>,
}

impl FeatureNames {
    /// Display name for one use-counter id.
    fn resolve(&self, feature: &Value, css: bool) -> String {
        let table = if css {
            &self.css_features
        } else {
            &self.features
        };
        if let Some(id) = feature.as_u64()
            && let Some(name) = table.get(&id)
        {
            return name.clone();
        }
        let prefix = if css { "CSSFeature" } else { "Feature" };
        match feature {
            Value::String(s) => format!("{prefix}_{s}"),
            Value::Number(n) => format!("{prefix}_{n}"),
            other => format!("{prefix}_{other}"),
        }
    }
}

/// Aggregated V8 span durations and runtime call stats per thread.
#[derive(Debug, Clone, Default, Serialize)]
pub struct V8Stats {
    pub main_thread: Option<String>,
    pub threads: FxHashMap<String, FxHashMap<String, V8Entry>>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct V8Entry {
    /// Total duration in milliseconds.
    pub dur: f64,
    pub count: u64,
    #[serde(skip_serializing_if = "FxHashMap::is_empty")]
    pub breakdown: FxHashMap<String, V8Breakdown>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct V8Breakdown {
    pub count: u64,
    /// Milliseconds.
    pub dur: f64,
}

// ============================================================================
// TimelineReducer
// ============================================================================

/// Streaming timeline reducer; feed spans in, reduce once at the end.
#[derive(Debug, Default)]
pub struct TimelineReducer {
    /// Open-span stacks, keyed by `pid:tid`.
    stacks: FxHashMap<String, Vec<OpenSpan>>,
    /// Completed top-level spans with their thread, in completion order.
    spans: Vec<(String, TimelineSpan)>,
    /// Earliest `navigationStart`, trace microseconds.
    start_time: Option<i64>,
    end_time: i64,
    /// Thread that emitted `navigationStart` / `fetchStart`.
    main_thread: Option<String>,
    /// Threads known to do main-frame work.
    main_threads: Vec<String>,
    /// `CrRendererMain` threads from metadata, pending subframe filter.
    renderer_threads: Vec<(i64, String)>,
    /// Processes labelled as subframe renderers.
    subframe_pids: Vec<i64>,
    /// Feature-first-used instants: (css, feature id, ts).
    features: Vec<(bool, Value, i64)>,
    /// Injected use-counter name tables.
    feature_names: FeatureNames,
    /// V8 open-span stacks, keyed by thread.
    v8_stacks: FxHashMap<String, Vec<(String, i64)>>,
    v8_threads: FxHashMap<String, FxHashMap<String, V8Entry>>,
}

impl TimelineReducer {
    /// Creates a reducer with use-counter name tables.
    #[must_use]
    pub fn with_feature_names(feature_names: FeatureNames) -> Self {
        Self {
            feature_names,
            ..Self::default()
        }
    }

    /// Trace microseconds of the navigation start, once seen.
    #[inline]
    #[must_use]
    pub fn start_time(&self) -> Option<i64> {
        self.start_time
    }

    /// Records navigation markers from a user-timing event.
    pub fn observe_user_timing(&mut self, event: &TraceEvent) {
        if event.name == "navigationStart" {
            let ts = event.ts;
            if self.start_time.is_none_or(|t| ts < t) {
                self.start_time = Some(ts);
            }
        }
        if event.name == "navigationStart" || event.name == "fetchStart" {
            let thread = event.thread_key();
            if self.main_thread.is_none() {
                debug!(thread = %thread, "main thread identified");
                self.main_thread = Some(thread.clone());
            }
            self.mark_main_thread(thread);
        }
        if event
            .data()
            .get("inMainFrame")
            .and_then(Value::as_bool)
            .unwrap_or(false)
        {
            self.mark_main_thread(event.thread_key());
        }
    }

    /// Handles `__metadata` events (thread names, process labels).
    pub fn observe_metadata(&mut self, event: &TraceEvent) {
        match event.name.as_str() {
            "thread_name" => {
                if event.args.get("name").and_then(Value::as_str) == Some("CrRendererMain") {
                    self.renderer_threads.push((event.pid, event.thread_key()));
                }
            }
            "process_labels" => {
                if event
                    .args
                    .get("labels")
                    .and_then(Value::as_str)
                    .is_some_and(|l| l.starts_with("Subframe"))
                {
                    self.subframe_pids.push(event.pid);
                }
            }
            _ => {}
        }
    }

    /// Feeds one timeline span event (`B`/`E`/`X`) into the thread
    /// stacks.
    pub fn observe_timeline(&mut self, event: &TraceEvent) {
        if event
            .data()
            .get("inMainFrame")
            .and_then(Value::as_bool)
            .unwrap_or(false)
        {
            self.mark_main_thread(event.thread_key());
        }
        let thread = event.thread_key();
        match event.ph.as_str() {
            "B" => {
                let script = Self::script_url(event);
                self.stacks.entry(thread).or_default().push(OpenSpan {
                    name: event.name.clone(),
                    start: event.ts,
                    script,
                    children: Vec::new(),
                });
            }
            "E" => {
                let Some(stack) = self.stacks.get_mut(&thread) else {
                    return;
                };
                if stack.last().is_some_and(|open| open.name == event.name)
                    && let Some(open) = stack.pop()
                {
                    let span = TimelineSpan {
                        name: open.name,
                        start: open.start,
                        end: event.ts,
                        script: open.script,
                        children: open.children,
                    };
                    self.complete_span(thread, span);
                }
            }
            "X" => {
                let Some(dur) = event.dur else {
                    return;
                };
                let span = TimelineSpan {
                    name: event.name.clone(),
                    start: event.ts,
                    end: event.ts + dur,
                    script: Self::script_url(event),
                    children: Vec::new(),
                };
                self.complete_span(thread, span);
            }
            _ => {}
        }
    }

    /// Records a feature-first-used instant for later resolution.
    pub fn observe_feature(&mut self, event: &TraceEvent) {
        let css = match event.name.as_str() {
            "FeatureFirstUsed" => false,
            "CSSFirstUsed" => true,
            _ => return,
        };
        if let Some(feature) = event.args.get("feature") {
            self.features.push((css, feature.clone(), event.ts));
        }
    }

    /// Feeds one `v8` category event into the per-thread V8 stacks.
    pub fn observe_v8(&mut self, event: &TraceEvent) {
        let Some(start_time) = self.start_time else {
            return;
        };
        if self.main_thread.is_none() || event.ts < start_time {
            return;
        }
        let thread = event.thread_key();
        let duration = match event.ph.as_str() {
            "B" => {
                self.v8_stacks
                    .entry(thread)
                    .or_default()
                    .push((event.name.clone(), event.ts));
                return;
            }
            "E" => {
                let Some(stack) = self.v8_stacks.get_mut(&thread) else {
                    return;
                };
                if stack.last().is_some_and(|(name, _)| *name == event.name) {
                    match stack.pop() {
                        Some((_, start)) => event.ts - start,
                        None => return,
                    }
                } else {
                    return;
                }
            }
            "X" => event.dur.unwrap_or(0),
            _ => return,
        };

        let entry = self
            .v8_threads
            .entry(thread)
            .or_default()
            .entry(event.name.clone())
            .or_default();
        entry.dur += duration as f64 / 1000.0;
        entry.count += 1;
        if let Some(stats) = event
            .args
            .get("runtime-call-stats")
            .and_then(Value::as_object)
        {
            for (stat, value) in stats {
                let Some(pair) = value.as_array().filter(|a| a.len() == 2) else {
                    continue;
                };
                let breakdown = entry.breakdown.entry(stat.clone()).or_default();
                breakdown.count += pair[0].as_u64().unwrap_or(0);
                breakdown.dur += pair[1].as_f64().unwrap_or(0.0) / 1000.0;
            }
        }
    }

    fn mark_main_thread(&mut self, thread: String) {
        if !self.main_threads.contains(&thread) {
            self.main_threads.push(thread);
        }
    }

    /// Script URL for spans that evaluate or call into one.
    fn script_url(event: &TraceEvent) -> Option<String> {
        let data = event.data();
        let url = match event.name.as_str() {
            "EvaluateScript" | "v8.compile" | "v8.parseOnBackground" => {
                data.get("url").and_then(Value::as_str)
            }
            "FunctionCall" => data
                .get("scriptName")
                .and_then(Value::as_str)
                .or_else(|| data.get("url").and_then(Value::as_str)),
            _ => None,
        }?;
        if !url.starts_with("http") {
            return None;
        }
        Some(url.split('#').next().unwrap_or(url).to_string())
    }

    fn complete_span(&mut self, thread: String, span: TimelineSpan) {
        let Some(start_time) = self.start_time else {
            return;
        };
        if span.end < span.start || span.start < start_time {
            return;
        }
        self.end_time = self.end_time.max(span.end);
        if let Some(parent) = self.stacks.get_mut(&thread).and_then(|s| s.last_mut()) {
            parent.children.push(span);
        } else {
            self.spans.push((thread, span));
        }
    }

    // ------------------------------------------------------------------------
    // Reduction
    // ------------------------------------------------------------------------

    /// Candidate main threads after the subframe filter.
    fn main_thread_candidates(&self) -> Vec<String> {
        let mut candidates = self.main_threads.clone();
        for (pid, thread) in &self.renderer_threads {
            if !self.subframe_pids.contains(pid) && !candidates.contains(thread) {
                candidates.push(thread.clone());
            }
        }
        candidates
    }

    /// Reduces the span tree into the CPU slice table.
    pub fn reduce_cpu(&mut self) -> CpuSlices {
        let Some(start_time) = self.start_time else {
            return CpuSlices::default();
        };
        let elapsed = self.end_time - start_time;
        if elapsed <= 0 || self.spans.is_empty() {
            return CpuSlices {
                main_thread: self.main_thread.clone(),
                ..CpuSlices::default()
            };
        }

        let mut slice_usecs: i64 = 1;
        while div_ceil_i64(elapsed, slice_usecs) > MAX_SLICES {
            slice_usecs *= 10;
        }
        let slice_count = div_ceil_i64(elapsed, slice_usecs) as usize;

        let mut table: FxHashMap<String, FxHashMap<String, Vec<f64>>> = FxHashMap::default();
        for (thread, span) in &self.spans {
            Self::accumulate_span(
                table.entry(thread.clone()).or_default(),
                span,
                None,
                start_time,
                slice_usecs,
                slice_count,
            );
        }

        // Convert busy fractions to integer microseconds and drop the
        // bookkeeping row.
        let mut slices: FxHashMap<String, FxHashMap<String, Vec<u64>>> = FxHashMap::default();
        for (thread, names) in table {
            let converted = names
                .into_iter()
                .filter(|(name, _)| name != "total")
                .map(|(name, fractions)| {
                    let usecs = fractions
                        .into_iter()
                        .map(|f| (f * slice_usecs as f64) as u64)
                        .collect();
                    (name, usecs)
                })
                .collect();
            slices.insert(thread, converted);
        }

        // Fall back to the busiest candidate thread when navigation
        // never identified one.
        if self.main_thread.is_none() {
            let candidates = self.main_thread_candidates();
            let mut busiest: Option<(String, u64)> = None;
            for (thread, names) in &slices {
                if !candidates.is_empty() && !candidates.contains(thread) {
                    continue;
                }
                let busy: u64 = names.values().flatten().sum();
                if busiest.as_ref().is_none_or(|(_, best)| busy > *best) {
                    busiest = Some((thread.clone(), busy));
                }
            }
            self.main_thread = busiest.map(|(thread, _)| thread);
        }

        CpuSlices {
            main_thread: self.main_thread.clone(),
            slice_usecs,
            slices,
        }
    }

    fn accumulate_span(
        thread_table: &mut FxHashMap<String, Vec<f64>>,
        span: &TimelineSpan,
        parent: Option<&str>,
        start_time: i64,
        slice_usecs: i64,
        slice_count: usize,
    ) {
        let first = ((span.start - start_time) / slice_usecs).max(0) as usize;
        let last = (((span.end - start_time) / slice_usecs) as usize).min(slice_count - 1);
        for index in first..=last {
            let slice_start = start_time + index as i64 * slice_usecs;
            let slice_end = slice_start + slice_usecs;
            let busy = span.end.min(slice_end) - span.start.max(slice_start);
            if busy > 0 {
                Self::adjust_slice(
                    thread_table,
                    index,
                    &span.name,
                    parent,
                    busy,
                    slice_usecs,
                    slice_count,
                );
            }
        }
        for child in &span.children {
            Self::accumulate_span(
                thread_table,
                child,
                Some(&span.name),
                start_time,
                slice_usecs,
                slice_count,
            );
        }
    }

    /// Adds a span's busy time to one slice, moving the time out of the
    /// parent's row so nested spans never double-count, and clamping the
    /// slice total at 100%.
    fn adjust_slice(
        thread_table: &mut FxHashMap<String, Vec<f64>>,
        index: usize,
        name: &str,
        parent: Option<&str>,
        busy: i64,
        slice_usecs: i64,
        slice_count: usize,
    ) {
        let fraction = (busy as f64 / slice_usecs as f64).min(1.0);
        let row = |table: &mut FxHashMap<String, Vec<f64>>, key: &str| {
            table
                .entry(key.to_string())
                .or_insert_with(|| vec![0.0; slice_count]);
        };
        row(thread_table, name);
        row(thread_table, "total");
        if let Some(values) = thread_table.get_mut(name) {
            values[index] += fraction;
        }
        if let Some(values) = thread_table.get_mut("total") {
            values[index] += fraction;
        }
        if let Some(parent) = parent {
            let parent_has_room = thread_table
                .get(parent)
                .is_some_and(|values| values[index] >= fraction);
            if parent_has_room {
                if let Some(values) = thread_table.get_mut(parent) {
                    values[index] -= fraction;
                }
                if let Some(values) = thread_table.get_mut("total") {
                    values[index] -= fraction;
                }
            }
        }
        if let Some(values) = thread_table.get_mut(name) {
            values[index] = values[index].min(1.0);
        }
        let total = thread_table
            .get("total")
            .map(|values| values[index])
            .unwrap_or(0.0);
        if total > 1.0 {
            // Budget against the name row's current value, not just the
            // increment: repeated spans of one name in one slice would
            // otherwise leave the rows summing past 100%.
            let name_value = thread_table
                .get(name)
                .map(|values| values[index])
                .unwrap_or(0.0);
            let mut available = (1.0 - name_value).max(0.0);
            let others: Vec<String> = thread_table
                .keys()
                .filter(|key| *key != name && *key != "total")
                .cloned()
                .collect();
            for other in others {
                if let Some(values) = thread_table.get_mut(&other) {
                    values[index] = values[index].min(available);
                    available = (available - values[index]).max(0.0);
                }
            }
            if let Some(values) = thread_table.get_mut("total") {
                values[index] = (1.0 - available).clamp(0.0, 1.0);
            }
        }
    }

    /// Top-level main-thread spans longer than 50ms, as merged
    /// `[start_ms, end_ms]` periods.
    pub fn reduce_long_tasks(&self) -> Vec<(i64, i64)> {
        let Some(start_time) = self.start_time else {
            return Vec::new();
        };
        let candidates = self.main_thread_candidates();
        let mut tasks: Vec<(i64, i64)> = Vec::new();
        let mut spans: Vec<&TimelineSpan> = self
            .spans
            .iter()
            .filter(|(thread, span)| {
                candidates.contains(thread) && span.end - span.start > LONG_TASK_USECS
            })
            .map(|(_, span)| span)
            .collect();
        spans.sort_by_key(|span| span.start);
        for span in spans {
            let ms_start = (span.start - start_time).div_euclid(1000);
            let ms_end = div_ceil_i64(span.end - start_time, 1000);
            match tasks.last_mut() {
                Some((last_start, last_end)) if ms_start < *last_end => {
                    if ms_end > *last_end {
                        *last_start = (*last_start).min(ms_start);
                        *last_end = ms_end;
                    }
                }
                _ => tasks.push((ms_start, ms_end)),
            }
        }
        tasks
    }

    /// Periods of at least 500ms without a main-thread long task.
    pub fn reduce_interactive(&self) -> Vec<(i64, i64)> {
        let (Some(start_time), Some(main_thread)) = (self.start_time, &self.main_thread) else {
            return Vec::new();
        };
        let mut spans: Vec<&TimelineSpan> = self
            .spans
            .iter()
            .filter(|(thread, _)| thread == main_thread)
            .map(|(_, span)| span)
            .collect();
        spans.sort_by_key(|span| span.start);

        let mut windows: Vec<(i64, i64)> = Vec::new();
        let mut window_start: i64 = 0;
        let mut window_end: Option<i64> = None;
        for span in spans {
            let start = span.start - start_time;
            let end = span.end - start_time;
            if end - start > LONG_TASK_USECS {
                if start - window_start > INTERACTIVE_MIN_USECS {
                    windows.push((div_ceil_i64(window_start, 1000), start.div_euclid(1000)));
                }
                window_start = end;
                window_end = None;
            } else {
                window_end = Some(end);
            }
        }
        if let Some(end) = window_end
            && end - window_start > INTERACTIVE_MIN_USECS
        {
            windows.push((div_ceil_i64(window_start, 1000), end.div_euclid(1000)));
        }
        windows
    }

    /// Per-script span periods across all threads.
    pub fn reduce_script_timing(&self) -> ScriptTiming {
        let Some(start_time) = self.start_time else {
            return ScriptTiming::default();
        };
        let mut timing = ScriptTiming {
            main_thread: self.main_thread.clone(),
            threads: FxHashMap::default(),
        };
        for (thread, span) in &self.spans {
            let scripts = timing.threads.entry(thread.clone()).or_default();
            Self::collect_script_spans(scripts, span, start_time);
        }
        timing.threads.retain(|_, scripts| !scripts.is_empty());
        timing
    }

    fn collect_script_spans(
        scripts: &mut FxHashMap<String, FxHashMap<String, Vec<(i64, i64)>>>,
        span: &TimelineSpan,
        start_time: i64,
    ) {
        if let Some(script) = &span.script {
            let periods = scripts
                .entry(script.clone())
                .or_default()
                .entry(span.name.clone())
                .or_default();
            let start = (span.start - start_time).div_euclid(1000);
            let end = div_ceil_i64(span.end - start_time, 1000);
            // An ancestor span with the same script and name already
            // accounts for any period that covers this one.
            let covered = periods.iter().any(|(s, e)| *s <= start && *e >= end);
            if !covered {
                periods.push((start, end));
            }
        }
        for child in &span.children {
            Self::collect_script_spans(scripts, child, start_time);
        }
    }

    /// Resolves feature-first-used instants into names and ms offsets.
    pub fn reduce_feature_usage(&self) -> FeatureUsage {
        let Some(start_time) = self.start_time else {
            return FeatureUsage::default();
        };
        let mut usage = FeatureUsage::default();
        for (css, feature, ts) in &self.features {
            let offset_ms = (*ts - start_time) as f64 / 1000.0;
            if offset_ms <= 0.0 {
                continue;
            }
            let offset_ms = (offset_ms * 1000.0).round() / 1000.0;
            let name = self.feature_names.resolve(feature, *css);
            let table = if *css {
                &mut usage.css_features
            } else {
                &mut usage.features
            };
            table
                .entry(name)
                .and_modify(|first| {
                    if offset_ms < *first {
                        *first = offset_ms;
                    }
                })
                .or_insert(offset_ms);
        }
        usage
    }

    /// V8 span aggregates.
    pub fn reduce_v8(&self) -> V8Stats {
        V8Stats {
            main_thread: self.main_thread.clone(),
            threads: self.v8_threads.clone(),
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

    fn event(cat: &str, name: &str, ph: &str, ts: i64, dur: Option<i64>, tid: i64) -> TraceEvent {
        let mut v = json!({
            "cat": cat, "name": name, "ph": ph, "ts": ts, "pid": 1, "tid": tid,
        });
        if let Some(dur) = dur {
            v["dur"] = json!(dur);
        }
        serde_json::from_value(v).expect("test event")
    }

    fn nav_start(reducer: &mut TimelineReducer, ts: i64, tid: i64) {
        reducer.observe_user_timing(&event("blink.user_timing", "navigationStart", "I", ts, None, tid));
    }

    #[test]
    fn test_span_nesting() {
        let mut reducer = TimelineReducer::default();
        nav_start(&mut reducer, 1000, 1);
        reducer.observe_timeline(&event("devtools.timeline", "Task", "B", 2000, None, 1));
        reducer.observe_timeline(&event("devtools.timeline", "Layout", "X", 2500, Some(200), 1));
        reducer.observe_timeline(&event("devtools.timeline", "Task", "E", 4000, None, 1));

        assert_eq!(reducer.spans.len(), 1);
        let (thread, span) = &reducer.spans[0];
        assert_eq!(thread, "1:1");
        assert_eq!(span.name, "Task");
        assert_eq!(span.children.len(), 1);
        assert_eq!(span.children[0].name, "Layout");
        assert_eq!(reducer.end_time, 4000);
    }

    #[test]
    fn test_spans_before_navigation_dropped() {
        let mut reducer = TimelineReducer::default();
        reducer.observe_timeline(&event("devtools.timeline", "Task", "X", 100, Some(50), 1));
        nav_start(&mut reducer, 1000, 1);
        reducer.observe_timeline(&event("devtools.timeline", "Task", "X", 500, Some(50), 1));
        assert!(reducer.spans.is_empty());
    }

    #[test]
    fn test_mismatched_end_ignored() {
        let mut reducer = TimelineReducer::default();
        nav_start(&mut reducer, 0, 1);
        reducer.observe_timeline(&event("devtools.timeline", "Task", "B", 100, None, 1));
        reducer.observe_timeline(&event("devtools.timeline", "Other", "E", 200, None, 1));
        assert!(reducer.spans.is_empty());
        reducer.observe_timeline(&event("devtools.timeline", "Task", "E", 300, None, 1));
        assert_eq!(reducer.spans.len(), 1);
    }

    #[test]
    fn test_cpu_slices_nested_spans_do_not_double_count() {
        let mut reducer = TimelineReducer::default();
        nav_start(&mut reducer, 0, 1);
        reducer.observe_timeline(&event("devtools.timeline", "Task", "B", 0, None, 1));
        reducer.observe_timeline(&event("devtools.timeline", "Layout", "X", 100, Some(400), 1));
        reducer.observe_timeline(&event("devtools.timeline", "Task", "E", 1000, None, 1));

        let cpu = reducer.reduce_cpu();
        assert_eq!(cpu.slice_usecs, 1);
        let thread = cpu.slices.get("1:1").expect("thread row");
        let task: u64 = thread.get("Task").expect("task row").iter().sum();
        let layout: u64 = thread.get("Layout").expect("layout row").iter().sum();
        assert_eq!(layout, 400);
        assert_eq!(task, 600);
        assert!(!thread.contains_key("total"));
    }

    #[test]
    fn test_cpu_slice_width_grows_with_duration() {
        let mut reducer = TimelineReducer::default();
        nav_start(&mut reducer, 0, 1);
        reducer.observe_timeline(&event(
            "devtools.timeline",
            "Task",
            "X",
            0,
            Some(5_000_000),
            1,
        ));
        let cpu = reducer.reduce_cpu();
        // 5s at <=2000 slices needs 10ms slices.
        assert_eq!(cpu.slice_usecs, 10_000);
    }

    #[test]
    fn test_main_thread_fallback_picks_busiest() {
        let mut reducer = TimelineReducer::default();
        // No navigationStart thread attribution; two renderer threads.
        reducer.start_time = Some(0);
        reducer.observe_metadata(&serde_json::from_value(json!({
            "cat": "__metadata", "name": "thread_name", "ph": "M",
            "ts": 0, "pid": 1, "tid": 1, "args": { "name": "CrRendererMain" },
        })).expect("metadata"));
        reducer.observe_metadata(&serde_json::from_value(json!({
            "cat": "__metadata", "name": "thread_name", "ph": "M",
            "ts": 0, "pid": 1, "tid": 2, "args": { "name": "CrRendererMain" },
        })).expect("metadata"));
        reducer.observe_timeline(&event("devtools.timeline", "Task", "X", 0, Some(500), 1));
        reducer.observe_timeline(&event("devtools.timeline", "Task", "X", 0, Some(1500), 2));

        let cpu = reducer.reduce_cpu();
        assert_eq!(cpu.main_thread.as_deref(), Some("1:2"));
    }

    #[test]
    fn test_long_task_merge() {
        let mut reducer = TimelineReducer::default();
        nav_start(&mut reducer, 0, 1);
        reducer.observe_timeline(&event("devtools.timeline", "Task", "X", 0, Some(60_000), 1));
        reducer.observe_timeline(&event(
            "devtools.timeline",
            "Task",
            "X",
            55_000,
            Some(65_000),
            1,
        ));
        let tasks = reducer.reduce_long_tasks();
        assert_eq!(tasks, vec![(0, 120)]);
    }

    #[test]
    fn test_interactive_window_between_long_tasks() {
        let mut reducer = TimelineReducer::default();
        nav_start(&mut reducer, 0, 1);
        // Long task at 600ms breaks the window that started at 0.
        reducer.observe_timeline(&event(
            "devtools.timeline",
            "Task",
            "X",
            600_000,
            Some(100_000),
            1,
        ));
        // Short task at 1.5s extends the second window past the minimum.
        reducer.observe_timeline(&event(
            "devtools.timeline",
            "Task",
            "X",
            1_500_000,
            Some(10_000),
            1,
        ));
        let windows = reducer.reduce_interactive();
        assert_eq!(windows, vec![(0, 600), (700, 1510)]);
    }

    #[test]
    fn test_script_timing_attribution() {
        let mut reducer = TimelineReducer::default();
        nav_start(&mut reducer, 0, 1);
        let mut e = event("devtools.timeline", "EvaluateScript", "X", 1000, Some(5000), 1);
        e.args = json!({ "data": { "url": "https://example.com/app.js" } });
        reducer.observe_timeline(&e);

        let timing = reducer.reduce_script_timing();
        let periods = timing
            .threads
            .get("1:1")
            .and_then(|t| t.get("https://example.com/app.js"))
            .and_then(|s| s.get("EvaluateScript"))
            .expect("script periods");
        assert_eq!(periods, &vec![(1, 6)]);
    }

    #[test]
    fn test_feature_usage_first_use_wins() {
        let mut reducer = TimelineReducer::default();
        nav_start(&mut reducer, 0, 1);
        let mut first = event("blink.feature_usage", "FeatureFirstUsed", "I", 5000, None, 1);
        first.args = json!({ "feature": 123 });
        let mut second = event("blink.feature_usage", "FeatureFirstUsed", "I", 2000, None, 1);
        second.args = json!({ "feature": 123 });
        reducer.observe_feature(&first);
        reducer.observe_feature(&second);

        let usage = reducer.reduce_feature_usage();
        assert_eq!(usage.features.get("Feature_123"), Some(&2.0));
    }

    #[test]
    fn test_feature_usage_resolves_injected_names() {
        let mut names = FeatureNames::default();
        names.features.insert(123, "FetchAPI".to_string());
        let mut reducer = TimelineReducer::with_feature_names(names);
        nav_start(&mut reducer, 0, 1);

        let mut known = event("blink.feature_usage", "FeatureFirstUsed", "I", 2000, None, 1);
        known.args = json!({ "feature": 123 });
        let mut unknown = event("blink.feature_usage", "CSSFirstUsed", "I", 3000, None, 1);
        unknown.args = json!({ "feature": 45 });
        reducer.observe_feature(&known);
        reducer.observe_feature(&unknown);

        let usage = reducer.reduce_feature_usage();
        assert_eq!(usage.features.get("FetchAPI"), Some(&2.0));
        assert_eq!(usage.css_features.get("CSSFeature_45"), Some(&3.0));
    }

    #[test]
    fn test_repeated_name_in_slice_keeps_rows_within_width() {
        let mut reducer = TimelineReducer::default();
        nav_start(&mut reducer, 0, 1);
        // Two Task spans and a Layout span land in the same 100us slice,
        // overbooking it; the second Task add must not undo the clamp.
        reducer.observe_timeline(&event("devtools.timeline", "Task", "X", 1000, Some(60), 1));
        reducer.observe_timeline(&event("devtools.timeline", "Layout", "X", 1000, Some(50), 1));
        reducer.observe_timeline(&event("devtools.timeline", "Task", "X", 1060, Some(30), 1));
        // Stretch the recording so slices end up 100us wide.
        reducer.observe_timeline(&event(
            "devtools.timeline", "Task", "X", 149_900, Some(100), 1,
        ));

        let cpu = reducer.reduce_cpu();
        assert_eq!(cpu.slice_usecs, 100);
        let names = cpu.slices.get("1:1").expect("thread row");
        let task = names.get("Task").expect("task row")[10];
        let layout = names.get("Layout").expect("layout row")[10];
        assert!(layout < 50);
        assert!(task + layout <= 100);
    }

    mod properties {
        use super::*;

        use proptest::prelude::*;

        proptest! {
            // A slice holds slice_usecs of wall time; the rows for one
            // thread may never account for more than that combined, no
            // matter how spans overlap.
            #[test]
            fn prop_slice_rows_sum_within_slice_width(
                intervals in proptest::collection::vec(
                    (0i64..100_000, 1i64..50_000), 1..20,
                )
            ) {
                let mut reducer = TimelineReducer::default();
                nav_start(&mut reducer, 0, 1);
                for (index, (start, dur)) in intervals.iter().enumerate() {
                    let name = if index % 2 == 0 { "Task" } else { "Layout" };
                    reducer.observe_timeline(&event(
                        "devtools.timeline", name, "X", *start, Some(*dur), 1,
                    ));
                }
                let cpu = reducer.reduce_cpu();
                for names in cpu.slices.values() {
                    let slice_count = names.values().map(Vec::len).max().unwrap_or(0);
                    for index in 0..slice_count {
                        let combined: u64 = names
                            .values()
                            .filter_map(|values| values.get(index))
                            .sum();
                        prop_assert!(combined <= cpu.slice_usecs as u64);
                    }
                }
            }
        }
    }

    #[test]
    fn test_v8_stats_accumulate() {
        let mut reducer = TimelineReducer::default();
        nav_start(&mut reducer, 0, 1);
        let mut x = event("v8", "V8.Execute", "X", 1000, Some(3000), 1);
        x.args = json!({ "runtime-call-stats": { "ParseLazy": [2, 500] } });
        reducer.observe_v8(&x);
        reducer.observe_v8(&event("v8", "V8.Execute", "X", 5000, Some(1000), 1));

        let stats = reducer.reduce_v8();
        let entry = stats
            .threads
            .get("1:1")
            .and_then(|t| t.get("V8.Execute"))
            .expect("v8 entry");
        assert_eq!(entry.count, 2);
        assert!((entry.dur - 4.0).abs() < 1e-9);
        let breakdown = entry.breakdown.get("ParseLazy").expect("breakdown");
        assert_eq!(breakdown.count, 2);
        assert!((breakdown.dur - 0.5).abs() < 1e-9);
    }
}
