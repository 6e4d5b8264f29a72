//! JS/CSS usage coverage.
//!
//! Coverage is collected at stop time from two protocol dumps:
//! `Profiler.getBestEffortCoverage` (script functions with per-range
//! execution counts) and `CSS.stopRuleUsageTracking` (rule usage keyed
//! by stylesheet id). [`CoverageBuilder`] accumulates byte ranges per
//! resource URL and summarizes them into used/total byte counts and a
//! percentage per category.
//!
//! CSS rules carry a stylesheet id, not a URL; the caller supplies the
//! id-to-URL map built from `CSS.styleSheetAdded` events.

// ============================================================================
// Imports
// ============================================================================

use rustc_hash::FxHashMap;
use serde_json::{Map, Value, json};

// ============================================================================
// CoverageBuilder
// ============================================================================

/// One byte range of a resource, used or not.
#[derive(Debug, Clone, Copy)]
struct Range {
    start: i64,
    end: i64,
    used: bool,
}

impl Range {
    fn len(self) -> i64 {
        (self.end - self.start).max(0)
    }
}

/// Ranges collected for one URL, by category.
#[derive(Debug, Default)]
struct UrlCoverage {
    js: Vec<Range>,
    css: Vec<Range>,
}

/// Accumulates coverage ranges and produces the per-URL summary.
#[derive(Debug, Default)]
pub struct CoverageBuilder {
    per_url: FxHashMap<String, UrlCoverage>,
}

impl CoverageBuilder {
    /// Creates an empty builder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds the `result` array of `Profiler.getBestEffortCoverage`.
    ///
    /// Scripts without a URL (eval, inline snippets) are skipped; a
    /// range counts as used when its execution count is non-zero.
    pub fn add_js_scripts(&mut self, scripts: &Value) {
        let Some(scripts) = scripts.as_array() else {
            return;
        };
        for script in scripts {
            let Some(url) = script.get("url").and_then(Value::as_str) else {
                continue;
            };
            if url.is_empty() {
                continue;
            }
            let entry = self.per_url.entry(url.to_string()).or_default();
            let functions = script
                .get("functions")
                .and_then(Value::as_array)
                .map(Vec::as_slice)
                .unwrap_or_default();
            for function in functions {
                let ranges = function
                    .get("ranges")
                    .and_then(Value::as_array)
                    .map(Vec::as_slice)
                    .unwrap_or_default();
                for range in ranges {
                    entry.js.push(Range {
                        start: int_field(range, "startOffset"),
                        end: int_field(range, "endOffset"),
                        used: int_field(range, "count") != 0,
                    });
                }
            }
        }
    }

    /// Feeds the `ruleUsage` array of `CSS.stopRuleUsageTracking`,
    /// resolving stylesheet ids through `stylesheets`. Rules from
    /// unregistered sheets (inline styles) are skipped.
    pub fn add_css_rules(&mut self, rules: &Value, stylesheets: &FxHashMap<String, String>) {
        let Some(rules) = rules.as_array() else {
            return;
        };
        for rule in rules {
            let Some(url) = rule
                .get("styleSheetId")
                .and_then(Value::as_str)
                .and_then(|id| stylesheets.get(id))
            else {
                continue;
            };
            self.per_url.entry(url.clone()).or_default().css.push(Range {
                start: int_field(rule, "startOffset"),
                end: int_field(rule, "endOffset"),
                used: rule.get("used").and_then(Value::as_bool).unwrap_or(false),
            });
        }
    }

    /// Returns `true` when nothing was collected.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.per_url.is_empty()
    }

    /// Produces the per-URL summary object.
    ///
    /// Each URL gets `{JS,CSS}_bytes`, `{JS,CSS}_bytes_used`, and
    /// `{JS,CSS}_percent_used` for the categories it has ranges in.
    /// The percentage is truncated to two decimal places.
    #[must_use]
    pub fn summarize(&self) -> Map<String, Value> {
        let mut summary = Map::new();
        let mut urls: Vec<&String> = self.per_url.keys().collect();
        urls.sort();
        for url in urls {
            let coverage = &self.per_url[url];
            let mut entry = Map::new();
            summarize_category(&mut entry, "JS", &coverage.js);
            summarize_category(&mut entry, "CSS", &coverage.css);
            if !entry.is_empty() {
                summary.insert(url.clone(), Value::Object(entry));
            }
        }
        summary
    }
}

fn summarize_category(entry: &mut Map<String, Value>, category: &str, ranges: &[Range]) {
    let total: i64 = ranges.iter().map(|r| r.len()).sum();
    if total <= 0 {
        return;
    }
    let used: i64 = ranges.iter().filter(|r| r.used).map(|r| r.len()).sum();
    let percent = ((used * 10_000) / total) as f64 / 100.0;
    entry.insert(format!("{category}_bytes"), json!(total));
    entry.insert(format!("{category}_bytes_used"), json!(used));
    entry.insert(format!("{category}_percent_used"), json!(percent));
}

fn int_field(value: &Value, key: &str) -> i64 {
    value.get(key).and_then(Value::as_i64).unwrap_or(0)
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use serde_json::json;

    #[test]
    fn test_js_summary_counts_used_ranges() {
        let mut builder = CoverageBuilder::new();
        builder.add_js_scripts(&json!([{
            "url": "https://x.test/app.js",
            "functions": [
                {"ranges": [{"startOffset": 0, "endOffset": 100, "count": 3}]},
                {"ranges": [{"startOffset": 100, "endOffset": 200, "count": 0}]},
            ],
        }]));

        let summary = builder.summarize();
        let entry = &summary["https://x.test/app.js"];
        assert_eq!(entry["JS_bytes"], 200);
        assert_eq!(entry["JS_bytes_used"], 100);
        assert_eq!(entry["JS_percent_used"], 50.0);
        assert!(entry.get("CSS_bytes").is_none());
    }

    #[test]
    fn test_percent_truncates_to_two_decimals() {
        let mut builder = CoverageBuilder::new();
        builder.add_js_scripts(&json!([{
            "url": "https://x.test/a.js",
            "functions": [
                {"ranges": [{"startOffset": 0, "endOffset": 1, "count": 1}]},
                {"ranges": [{"startOffset": 1, "endOffset": 3, "count": 0}]},
            ],
        }]));
        // 1 of 3 bytes: 33.333... truncated, not rounded.
        let summary = builder.summarize();
        assert_eq!(summary["https://x.test/a.js"]["JS_percent_used"], 33.33);
    }

    #[test]
    fn test_css_rules_resolve_through_sheet_map() {
        let mut stylesheets = FxHashMap::default();
        stylesheets.insert("S1".to_string(), "https://x.test/a.css".to_string());

        let mut builder = CoverageBuilder::new();
        builder.add_css_rules(
            &json!([
                {"styleSheetId": "S1", "startOffset": 0, "endOffset": 40, "used": true},
                {"styleSheetId": "S1", "startOffset": 40, "endOffset": 100, "used": false},
                // Unregistered sheet: dropped.
                {"styleSheetId": "S9", "startOffset": 0, "endOffset": 500, "used": true},
            ]),
            &stylesheets,
        );

        let summary = builder.summarize();
        assert_eq!(summary.len(), 1);
        let entry = &summary["https://x.test/a.css"];
        assert_eq!(entry["CSS_bytes"], 100);
        assert_eq!(entry["CSS_bytes_used"], 40);
        assert_eq!(entry["CSS_percent_used"], 40.0);
    }

    #[test]
    fn test_urlless_scripts_skipped() {
        let mut builder = CoverageBuilder::new();
        builder.add_js_scripts(&json!([{
            "url": "",
            "functions": [{"ranges": [{"startOffset": 0, "endOffset": 10, "count": 1}]}],
        }]));
        assert!(builder.is_empty());
        assert!(builder.summarize().is_empty());
    }
}
