//! Job and task configuration.
//!
//! A [`JobConfig`] describes what a measurement run should capture and
//! a [`TaskPaths`] describes where its artifacts land. Both are built
//! by the orchestration layer and injected into the session; nothing in
//! this crate reads process-wide state.

// ============================================================================
// Imports
// ============================================================================

use std::path::{Path, PathBuf};

// ============================================================================
// JobConfig
// ============================================================================

/// Options controlling capture and processing for one run.
#[derive(Debug, Clone)]
pub struct JobConfig {
    /// Archive all text response bodies into the bodies zip.
    pub bodies: bool,
    /// Archive the main document body even when `bodies` is off.
    pub html_body: bool,
    /// Skip optimization-check processing (suppresses body fetches when
    /// nothing would archive them).
    pub noopt: bool,
    /// Abort condition: maximum number of from-network requests
    /// (0 disables the limit).
    pub max_requests: u64,
    /// Explicit trace category list; the required categories are
    /// appended if missing.
    pub trace_categories: Option<String>,
    /// Capture devtools.timeline categories.
    pub timeline: bool,
    /// Also capture the frame-timing timeline categories.
    pub timeline_fps: bool,
    /// Capture the V8 sampling-profiler trace categories.
    pub profiler: bool,
    /// Capture V8 runtime call stats.
    pub v8rcs: bool,
    /// Collect JS/CSS usage coverage (`*_coverage.json.gz`).
    pub coverage: bool,
    /// Capture netlog events inside the trace stream.
    pub netlog: bool,
    /// Discard the raw timeline after processing (summaries only).
    pub discard_timeline: bool,
    /// Write the raw protocol event log (`*_devtools.json.gz`).
    pub protocol_log: bool,
    /// Extra HTTP headers applied to every outbound request.
    pub headers: Vec<(String, String)>,
    /// User-agent override, if any.
    pub user_agent: Option<String>,
    /// URL patterns to block.
    pub block: Vec<String>,
    /// Seconds of network/CPU inactivity that complete a test step.
    pub activity_timeout_secs: f64,
    /// Hard per-step time limit in seconds.
    pub time_limit_secs: f64,
}

impl Default for JobConfig {
    fn default() -> Self {
        Self {
            bodies: false,
            html_body: false,
            noopt: false,
            max_requests: 0,
            trace_categories: None,
            timeline: false,
            timeline_fps: false,
            profiler: false,
            v8rcs: false,
            coverage: false,
            netlog: true,
            discard_timeline: false,
            protocol_log: false,
            headers: Vec::new(),
            user_agent: None,
            block: Vec::new(),
            activity_timeout_secs: 2.0,
            time_limit_secs: 120.0,
        }
    }
}

impl JobConfig {
    /// Builds the `Tracing.start` category string for this job.
    ///
    /// Starts from the explicit category list (or the default set) and
    /// appends the categories the processing pipeline depends on.
    #[must_use]
    pub fn trace_category_string(&self) -> String {
        let mut trace = match &self.trace_categories {
            Some(categories) => {
                if categories.starts_with("-*,") {
                    categories.clone()
                } else {
                    format!("-*,{categories}")
                }
            }
            None => {
                let mut cats = String::from("-*,toplevel,blink,v8,cc,gpu,blink.net");
                if self.v8rcs {
                    cats.push_str(",disabled-by-default-v8.runtime_stats");
                }
                if self.profiler {
                    cats.push_str(",disabled-by-default-v8.cpu_profiler");
                }
                cats
            }
        };
        if self.timeline {
            trace.push_str(",blink.console,devtools.timeline");
            if self.timeline_fps {
                trace.push_str(
                    ",disabled-by-default-devtools.timeline,\
                     disabled-by-default-devtools.timeline.frame",
                );
            }
        }
        for required in [
            "rail",
            "blink.user_timing",
            "netlog",
            "disabled-by-default-blink.feature_usage",
        ] {
            if !trace.split(',').any(|cat| cat == required) {
                trace.push(',');
                trace.push_str(required);
            }
        }
        trace
    }

    /// Returns `true` if response bodies should be archived at all.
    #[inline]
    #[must_use]
    pub fn archives_bodies(&self) -> bool {
        self.bodies || self.html_body
    }
}

// ============================================================================
// TaskPaths
// ============================================================================

/// Filesystem layout for one run's artifacts.
#[derive(Debug, Clone)]
pub struct TaskPaths {
    /// Run directory.
    pub dir: PathBuf,
    /// Artifact filename prefix within `dir`.
    pub prefix: String,
}

impl TaskPaths {
    /// Creates a task path set.
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>, prefix: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            prefix: prefix.into(),
        }
    }

    /// Returns `<dir>/<prefix><suffix>` for an artifact file.
    #[must_use]
    pub fn artifact(&self, suffix: &str) -> PathBuf {
        self.dir.join(format!("{}{}", self.prefix, suffix))
    }

    /// Returns the run directory.
    #[inline]
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_categories_include_required() {
        let job = JobConfig::default();
        let cats = job.trace_category_string();
        assert!(cats.starts_with("-*,"));
        for required in ["rail", "blink.user_timing", "netlog"] {
            assert!(cats.split(',').any(|c| c == required), "missing {required}");
        }
    }

    #[test]
    fn test_explicit_categories_get_exclusion_prefix() {
        let job = JobConfig {
            trace_categories: Some("blink,v8".to_string()),
            ..JobConfig::default()
        };
        assert!(job.trace_category_string().starts_with("-*,blink,v8"));
    }

    #[test]
    fn test_timeline_categories_appended() {
        let job = JobConfig {
            timeline: true,
            ..JobConfig::default()
        };
        assert!(job.trace_category_string().contains("devtools.timeline"));
    }

    #[test]
    fn test_profiler_categories_appended() {
        let job = JobConfig {
            profiler: true,
            ..JobConfig::default()
        };
        assert!(
            job.trace_category_string()
                .contains("disabled-by-default-v8.cpu_profiler")
        );
        assert!(
            !JobConfig::default()
                .trace_category_string()
                .contains("cpu_profiler")
        );
    }

    #[test]
    fn test_artifact_paths() {
        let paths = TaskPaths::new("/tmp/run", "1_");
        assert_eq!(
            paths.artifact("_timeline_cpu.json.gz"),
            PathBuf::from("/tmp/run/1__timeline_cpu.json.gz")
        );
        assert_eq!(paths.dir(), Path::new("/tmp/run"));
    }
}
