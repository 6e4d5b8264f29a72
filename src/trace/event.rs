//! Trace event decoding and category filtering.
//!
//! Trace events stream in as loosely-shaped JSON objects inside
//! `Tracing.dataCollected` chunks. Only a handful of categories feed the
//! reductions; everything else (notably the very high-volume `toplevel`
//! category) is dropped at ingest before it can accumulate.

// ============================================================================
// Imports
// ============================================================================

use serde::Deserialize;
use serde_json::Value;

// ============================================================================
// TraceEvent
// ============================================================================

/// One trace event in Chrome's trace-event format.
#[derive(Debug, Clone, Deserialize)]
pub struct TraceEvent {
    /// Comma-separated category list.
    pub cat: String,
    pub name: String,
    /// Phase: `B`/`E` span pairs, `X` complete spans, `b`/`e` async,
    /// `I` instants, `M` metadata.
    pub ph: String,
    /// Microseconds, monotonic.
    #[serde(default)]
    pub ts: i64,
    #[serde(default)]
    pub pid: i64,
    #[serde(default)]
    pub tid: i64,
    /// Duration in microseconds, `X` events only.
    #[serde(default)]
    pub dur: Option<i64>,
    /// Event id; netlog events carry their source id here, sometimes as
    /// a hex string.
    #[serde(default)]
    pub id: Option<Value>,
    #[serde(default)]
    pub args: Value,
}

impl TraceEvent {
    /// `pid:tid` key identifying the emitting thread.
    #[must_use]
    pub fn thread_key(&self) -> String {
        format!("{}:{}", self.pid, self.tid)
    }

    /// Numeric event id, decoding `"0x..."` hex strings when needed.
    #[must_use]
    pub fn numeric_id(&self) -> Option<u64> {
        match self.id.as_ref()? {
            Value::Number(n) => n.as_u64(),
            Value::String(s) => {
                let hex = s.strip_prefix("0x").unwrap_or(s);
                u64::from_str_radix(hex, 16).ok()
            }
            _ => None,
        }
    }

    /// Navigates `args.params`, the payload position for netlog events.
    #[inline]
    #[must_use]
    pub fn params(&self) -> &Value {
        self.args.get("params").unwrap_or(&Value::Null)
    }

    /// Navigates `args.data`, the payload position for timeline events.
    #[inline]
    #[must_use]
    pub fn data(&self) -> &Value {
        self.args.get("data").unwrap_or(&Value::Null)
    }
}

// ============================================================================
// Category Filter
// ============================================================================

/// Returns `true` if events in this category feed any reduction.
#[must_use]
pub fn keep_category(cat: &str) -> bool {
    if cat == "toplevel" || cat == "ipc,toplevel" {
        return false;
    }
    cat == "__metadata"
        || cat.contains("devtools.timeline")
        || cat.contains("blink.feature_usage")
        || cat.contains("blink.user_timing")
        || cat.contains("blink.resource")
        || cat.contains("loading")
        || cat.contains("navigation")
        || cat.contains("rail")
        || cat.contains("netlog")
        || cat.contains("v8")
}

/// Categories whose events land in the user-timing output.
#[inline]
#[must_use]
pub fn is_user_timing_category(cat: &str) -> bool {
    cat.contains("blink.user_timing")
        || cat.contains("rail")
        || cat.contains("loading")
        || cat.contains("navigation")
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use serde_json::json;

    #[test]
    fn test_category_filter() {
        assert!(!keep_category("toplevel"));
        assert!(!keep_category("ipc,toplevel"));
        assert!(keep_category("devtools.timeline"));
        assert!(keep_category("disabled-by-default-devtools.timeline"));
        assert!(keep_category("blink.user_timing"));
        assert!(keep_category("netlog"));
        assert!(keep_category("__metadata"));
        assert!(!keep_category("cc"));
    }

    #[test]
    fn test_numeric_id_hex_string() {
        let event: TraceEvent = serde_json::from_value(json!({
            "cat": "netlog", "name": "TCP_CONNECT_ATTEMPT", "ph": "b",
            "ts": 100, "pid": 1, "tid": 2, "id": "0x3f",
        }))
        .expect("parse");
        assert_eq!(event.numeric_id(), Some(0x3f));

        let event: TraceEvent = serde_json::from_value(json!({
            "cat": "netlog", "name": "X", "ph": "e", "ts": 1, "pid": 1, "tid": 1, "id": 42,
        }))
        .expect("parse");
        assert_eq!(event.numeric_id(), Some(42));
    }

    #[test]
    fn test_thread_key() {
        let event: TraceEvent = serde_json::from_value(json!({
            "cat": "v8", "name": "V8.Execute", "ph": "X",
            "ts": 5, "pid": 10, "tid": 20, "dur": 3,
        }))
        .expect("parse");
        assert_eq!(event.thread_key(), "10:20");
    }
}
