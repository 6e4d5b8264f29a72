//! Debug endpoint discovery.
//!
//! The browser exposes an HTTP endpoint at `http://localhost:<port>/json`
//! listing attachable targets. Discovery polls that list until a usable
//! page target shows up (the browser may still be starting), picks it,
//! and closes any extra tabs so the session owns exactly one page.

// ============================================================================
// Imports
// ============================================================================

use std::time::Duration;

use serde::Deserialize;
use tokio::time::{Instant, sleep};
use tracing::{debug, warn};

use crate::error::{Error, Result};

// ============================================================================
// Constants
// ============================================================================

/// Delay between `/json` polls while the browser starts up.
const DISCOVERY_RETRY_DELAY: Duration = Duration::from_millis(500);

// ============================================================================
// DebugTarget
// ============================================================================

/// The attachable page target chosen from the `/json` listing.
#[derive(Debug, Clone)]
pub struct DebugTarget {
    /// WebSocket debugger URL to connect to.
    pub ws_url: String,
    /// Browser-assigned tab id.
    pub tab_id: String,
}

#[derive(Debug, Deserialize)]
struct TabEntry {
    #[serde(default)]
    id: Option<String>,
    #[serde(rename = "type", default)]
    tab_type: Option<String>,
    #[serde(default)]
    title: Option<String>,
    #[serde(rename = "webSocketDebuggerUrl", default)]
    ws_url: Option<String>,
}

impl TabEntry {
    /// A tab we can attach to: a page (or webview on embedded builds),
    /// with the blank-profile "Orange" placeholder accepted as fallback.
    fn is_page(&self) -> bool {
        matches!(self.tab_type.as_deref(), Some("page") | Some("webview"))
            || self.title.as_deref() == Some("Orange")
    }
}

// ============================================================================
// Discovery
// ============================================================================

/// Polls the debug endpoint until a page target is listed.
///
/// Extra page tabs beyond the chosen one are closed via
/// `/json/close/<id>` so background pages cannot pollute the capture.
///
/// # Errors
///
/// [`Error::ConnectionTimeout`] when no usable target appears before
/// `timeout` elapses.
pub async fn discover(client: &reqwest::Client, port: u16, timeout: Duration) -> Result<DebugTarget> {
    let list_url = format!("http://localhost:{port}/json");
    let deadline = Instant::now() + timeout;

    loop {
        match fetch_tabs(client, &list_url).await {
            Ok(tabs) => {
                if let Some(target) = select_target(client, port, &tabs).await {
                    debug!(ws_url = %target.ws_url, tab_id = %target.tab_id, "debug target selected");
                    return Ok(target);
                }
            }
            Err(e) => {
                debug!(error = %e, "debug endpoint not ready");
            }
        }

        if Instant::now() + DISCOVERY_RETRY_DELAY >= deadline {
            return Err(Error::connection_timeout(timeout.as_millis() as u64));
        }
        sleep(DISCOVERY_RETRY_DELAY).await;
    }
}

async fn fetch_tabs(client: &reqwest::Client, url: &str) -> Result<Vec<TabEntry>> {
    let tabs = client.get(url).send().await?.json::<Vec<TabEntry>>().await?;
    Ok(tabs)
}

/// Picks the first attachable page tab and closes the rest.
async fn select_target(
    client: &reqwest::Client,
    port: u16,
    tabs: &[TabEntry],
) -> Option<DebugTarget> {
    let mut chosen: Option<DebugTarget> = None;
    for tab in tabs {
        if !tab.is_page() {
            continue;
        }
        match (&chosen, &tab.ws_url, &tab.id) {
            (None, Some(ws_url), Some(id)) => {
                chosen = Some(DebugTarget {
                    ws_url: ws_url.clone(),
                    tab_id: id.clone(),
                });
            }
            (Some(_), _, Some(id)) => {
                // Leftover tab from a previous run; close it.
                let close_url = format!("http://localhost:{port}/json/close/{id}");
                if let Err(e) = client.get(&close_url).send().await {
                    warn!(tab_id = %id, error = %e, "failed to close extra tab");
                }
            }
            _ => {}
        }
    }
    chosen
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tab_entry_page_detection() {
        let page: TabEntry = serde_json::from_str(
            r#"{"id": "T1", "type": "page", "webSocketDebuggerUrl": "ws://localhost:9222/devtools/page/T1"}"#,
        )
        .expect("parse");
        assert!(page.is_page());

        let worker: TabEntry =
            serde_json::from_str(r#"{"id": "T2", "type": "service_worker"}"#).expect("parse");
        assert!(!worker.is_page());

        let orange: TabEntry =
            serde_json::from_str(r#"{"id": "T3", "title": "Orange"}"#).expect("parse");
        assert!(orange.is_page());
    }

    #[test]
    fn test_tab_entry_tolerates_missing_fields() {
        let entry: TabEntry = serde_json::from_str("{}").expect("parse");
        assert!(!entry.is_page());
        assert!(entry.ws_url.is_none());
    }
}
