//! User-timing consolidation.
//!
//! User-timing events are kept verbatim at ingest; this module sorts
//! them and collapses the candidate/invalidate churn the renderer emits
//! for revisable paint metrics (notably Largest Contentful Paint and
//! layout shifts) into one final event per metric, keyed by frame and
//! candidate index. Matching entries from the page's Performance
//! timeline fill in fields the trace events lack (element, url,
//! shift sources).

// ============================================================================
// Imports
// ============================================================================

use serde_json::{json, Value};

// ============================================================================
// Consolidation
// ============================================================================

/// Sorts and consolidates raw user-timing events.
///
/// `start_time` is the navigation start in trace microseconds and is
/// appended as a `startTime` element so consumers can rebase the raw
/// timestamps. `performance_entries` is the optional
/// `performance.getEntries()` dump collected from the page.
#[must_use]
pub fn consolidate(
    events: &[Value],
    start_time: i64,
    performance_entries: Option<&Value>,
) -> Vec<Value> {
    let mut sorted: Vec<Value> = events.to_vec();
    sorted.sort_by_key(|e| e.get("ts").and_then(Value::as_i64).unwrap_or(0));

    let mut output: Vec<Value> = Vec::new();
    let mut candidates: Vec<(String, Value)> = Vec::new();
    let mut lcp_fallback: Option<Value> = None;

    for event in sorted {
        let Some(name) = event.get("name").and_then(Value::as_str).map(str::to_string) else {
            continue;
        };
        if name == "GlobalFirstContentfulPaint" {
            let mut renamed = event.clone();
            renamed["name"] = json!("FirstContentfulPaint");
            output.push(renamed);
        } else if name.starts_with("NavStartToLargestContentfulPaint") {
            // Never reported directly; kept as a fallback in case no
            // regular candidate survives.
            if name.ends_with("::Candidate") {
                let mut renamed = event.clone();
                renamed["name"] = json!("LargestContentfulPaint");
                lcp_fallback = Some(renamed);
            } else if name.ends_with("::Invalidate") {
                lcp_fallback = None;
            }
        } else if let Some((base, trigger)) = name.split_once("::") {
            let base = capitalize(base);
            let key = candidate_key(&base, &event);
            match trigger {
                "Candidate" => {
                    let mut renamed = event.clone();
                    renamed["name"] = json!(base);
                    match candidates.iter_mut().find(|(k, _)| *k == key) {
                        Some((_, slot)) => *slot = renamed,
                        None => candidates.push((key, renamed)),
                    }
                }
                "Invalidate" => candidates.retain(|(k, _)| *k != key),
                _ => {}
            }
        } else {
            output.push(event);
        }
    }

    let has_lcp_candidate = candidates
        .iter()
        .any(|(k, _)| k.starts_with("LargestContentfulPaint"));
    if let Some(fallback) = lcp_fallback
        && !has_lcp_candidate
    {
        output.push(fallback);
    }
    output.extend(candidates.into_iter().map(|(_, event)| event));

    if let Some(entries) = performance_entries.and_then(Value::as_array) {
        cross_reference(&mut output, entries);
    }

    output.push(json!({ "startTime": start_time }));
    output
}

/// Consolidation key: metric name, frame, and candidate index.
fn candidate_key(base: &str, event: &Value) -> String {
    let frame = event
        .get("args")
        .and_then(|a| a.get("frame"))
        .and_then(Value::as_str)
        .unwrap_or_default();
    let index = event
        .get("args")
        .and_then(|a| a.get("data"))
        .and_then(|d| d.get("candidateIndex"))
        .and_then(Value::as_i64)
        .unwrap_or(0);
    format!("{base}:{frame}.{index}")
}

fn capitalize(name: &str) -> String {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

/// Fills in fields from the Performance timeline: LCP entries matched
/// by paint size contribute `url` and `element`, layout-shift entries
/// matched by score contribute `sources`. Each entry is consumed at
/// most once.
fn cross_reference(output: &mut [Value], entries: &[Value]) {
    let mut consumed = vec![false; entries.len()];
    for event in output.iter_mut() {
        let Some(name) = event.get("name").and_then(Value::as_str) else {
            continue;
        };
        if name.starts_with("LargestContentfulPaint") {
            let Some(size) = event
                .get("args")
                .and_then(|a| a.get("data"))
                .and_then(|d| d.get("size"))
                .cloned()
            else {
                continue;
            };
            for (index, entry) in entries.iter().enumerate() {
                if consumed[index]
                    || entry.get("entryType").and_then(Value::as_str)
                        != Some("largest-contentful-paint")
                    || entry.get("size") != Some(&size)
                {
                    continue;
                }
                consumed[index] = true;
                if let Some(data) = event
                    .get_mut("args")
                    .and_then(|a| a.get_mut("data"))
                    .and_then(Value::as_object_mut)
                {
                    if let Some(url) = entry.get("url") {
                        data.insert("url".to_string(), url.clone());
                    }
                    if let Some(element) = entry.get("element") {
                        data.insert("element".to_string(), element.clone());
                    }
                }
                break;
            }
        } else if name == "LayoutShift" {
            let Some(score) = event
                .get("args")
                .and_then(|a| a.get("data"))
                .and_then(|d| d.get("score"))
                .cloned()
            else {
                continue;
            };
            for (index, entry) in entries.iter().enumerate() {
                if consumed[index]
                    || entry.get("entryType").and_then(Value::as_str) != Some("layout-shift")
                    || entry.get("value") != Some(&score)
                {
                    continue;
                }
                consumed[index] = true;
                if let (Some(data), Some(sources)) = (
                    event
                        .get_mut("args")
                        .and_then(|a| a.get_mut("data"))
                        .and_then(Value::as_object_mut),
                    entry.get("sources"),
                ) {
                    data.insert("sources".to_string(), sources.clone());
                }
                break;
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

    fn timing(name: &str, ts: i64, args: Value) -> Value {
        json!({ "name": name, "ts": ts, "ph": "I", "cat": "loading", "args": args })
    }

    fn names(events: &[Value]) -> Vec<String> {
        events
            .iter()
            .filter_map(|e| e.get("name").and_then(Value::as_str).map(str::to_string))
            .collect()
    }

    #[test]
    fn test_candidate_superseded_then_reported_once() {
        let events = vec![
            timing(
                "largestContentfulPaint::Candidate",
                100,
                json!({ "frame": "F1", "data": { "candidateIndex": 1, "size": 10 } }),
            ),
            timing(
                "largestContentfulPaint::Candidate",
                200,
                json!({ "frame": "F1", "data": { "candidateIndex": 1, "size": 20 } }),
            ),
        ];
        let output = consolidate(&events, 0, None);
        let lcp: Vec<&Value> = output
            .iter()
            .filter(|e| e.get("name").and_then(Value::as_str) == Some("LargestContentfulPaint"))
            .collect();
        assert_eq!(lcp.len(), 1);
        assert_eq!(lcp[0]["args"]["data"]["size"], json!(20));
    }

    #[test]
    fn test_invalidate_removes_candidate() {
        let events = vec![
            timing(
                "layoutShift::Candidate",
                100,
                json!({ "frame": "F1", "data": { "candidateIndex": 3 } }),
            ),
            timing(
                "layoutShift::Invalidate",
                200,
                json!({ "frame": "F1", "data": { "candidateIndex": 3 } }),
            ),
        ];
        let output = consolidate(&events, 0, None);
        assert!(!names(&output).iter().any(|n| n == "LayoutShift"));
    }

    #[test]
    fn test_nav_start_lcp_fallback() {
        let events = vec![timing(
            "NavStartToLargestContentfulPaint::Candidate",
            100,
            json!({ "frame": "F1", "data": { "size": 5 } }),
        )];
        let output = consolidate(&events, 0, None);
        assert!(names(&output).iter().any(|n| n == "LargestContentfulPaint"));

        // With a real candidate present the fallback is dropped.
        let events = vec![
            timing(
                "NavStartToLargestContentfulPaint::Candidate",
                100,
                json!({ "frame": "F1", "data": { "size": 5 } }),
            ),
            timing(
                "largestContentfulPaint::Candidate",
                200,
                json!({ "frame": "F1", "data": { "candidateIndex": 1, "size": 9 } }),
            ),
        ];
        let output = consolidate(&events, 0, None);
        let lcp_count = names(&output)
            .iter()
            .filter(|n| n.as_str() == "LargestContentfulPaint")
            .count();
        assert_eq!(lcp_count, 1);
    }

    #[test]
    fn test_first_contentful_paint_rename() {
        let events = vec![timing("GlobalFirstContentfulPaint", 50, json!({}))];
        let output = consolidate(&events, 0, None);
        assert!(names(&output).iter().any(|n| n == "FirstContentfulPaint"));
        assert!(
            !names(&output)
                .iter()
                .any(|n| n == "GlobalFirstContentfulPaint")
        );
    }

    #[test]
    fn test_performance_entry_cross_reference() {
        let events = vec![timing(
            "largestContentfulPaint::Candidate",
            100,
            json!({ "frame": "F1", "data": { "candidateIndex": 1, "size": 42 } }),
        )];
        let entries = json!([
            {
                "entryType": "largest-contentful-paint",
                "size": 42,
                "url": "https://example.com/hero.jpg",
                "element": "IMG",
            },
        ]);
        let output = consolidate(&events, 0, Some(&entries));
        let lcp = output
            .iter()
            .find(|e| e.get("name").and_then(Value::as_str) == Some("LargestContentfulPaint"))
            .expect("lcp event");
        assert_eq!(
            lcp["args"]["data"]["url"],
            json!("https://example.com/hero.jpg")
        );
        assert_eq!(lcp["args"]["data"]["element"], json!("IMG"));
    }

    #[test]
    fn test_start_time_marker_appended() {
        let output = consolidate(&[], 123_456, None);
        assert_eq!(output.last(), Some(&json!({ "startTime": 123_456 })));
    }
}
