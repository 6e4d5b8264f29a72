//! Outbound command envelope.
//!
//! Every command sent over the wire is a JSON object
//! `{"id": <n>, "method": "<Domain.method>", "params": {...}}`. Commands
//! addressed to a nested target (worker, service worker, out-of-process
//! iframe) are wrapped into a `Target.sendMessageToTarget` envelope whose
//! `message` parameter carries the inner command as a JSON *string*.
//!
//! Control-plane domains (`Target.*`, `Tracing.*`) are never wrapped;
//! they always travel on the main connection.

// ============================================================================
// Imports
// ============================================================================

use serde::Serialize;
use serde_json::{Value, json};

use crate::error::Result;
use crate::identifiers::{CommandId, TargetId};

// ============================================================================
// Command
// ============================================================================

/// One protocol command ready for serialization.
#[derive(Debug, Clone, Serialize)]
pub struct Command {
    /// Correlation id echoed back in the response.
    pub id: CommandId,

    /// Method in `Domain.method` format (e.g. `Network.enable`).
    pub method: String,

    /// Method parameters; `{}` when the method takes none.
    pub params: Value,
}

impl Command {
    /// Creates a command.
    #[must_use]
    pub fn new(id: CommandId, method: impl Into<String>, params: Value) -> Self {
        Self {
            id,
            method: method.into(),
            params,
        }
    }

    /// Returns the domain portion of the method (`Network` from
    /// `Network.enable`). The whole method is returned when there is no
    /// dot, which does not occur for well-formed methods.
    #[inline]
    #[must_use]
    pub fn domain(&self) -> &str {
        self.method.split('.').next().unwrap_or(&self.method)
    }

    /// Returns `true` if this method must stay on the main connection
    /// rather than be forwarded into a nested target.
    #[inline]
    #[must_use]
    pub fn is_control_plane(method: &str) -> bool {
        method.starts_with("Target.") || method.starts_with("Tracing.")
    }

    /// Wraps this command into a `Target.sendMessageToTarget` envelope
    /// addressed to `target_id`.
    ///
    /// The inner command keeps its own id; the envelope gets a fresh
    /// `envelope_id` so both layers can be correlated independently.
    pub fn wrap_for_target(&self, envelope_id: CommandId, target_id: &TargetId) -> Result<Command> {
        let inner = serde_json::to_string(self)?;
        Ok(Command::new(
            envelope_id,
            "Target.sendMessageToTarget",
            json!({
                "message": inner,
                "targetId": target_id.as_str(),
            }),
        ))
    }

    /// Serializes the command to its wire form.
    pub fn to_wire(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_wire_shape() {
        let cmd = Command::new(CommandId(7), "Network.enable", json!({}));
        let wire = cmd.to_wire().expect("serialize");
        let value: Value = serde_json::from_str(&wire).expect("parse");
        assert_eq!(value["id"], 7);
        assert_eq!(value["method"], "Network.enable");
        assert!(value["params"].is_object());
    }

    #[test]
    fn test_domain() {
        let cmd = Command::new(CommandId(1), "Page.navigate", json!({"url": "about:blank"}));
        assert_eq!(cmd.domain(), "Page");
    }

    #[test]
    fn test_control_plane_methods() {
        assert!(Command::is_control_plane("Target.setAutoAttach"));
        assert!(Command::is_control_plane("Tracing.start"));
        assert!(!Command::is_control_plane("Network.enable"));
    }

    #[test]
    fn test_wrap_for_target_nests_inner_as_string() {
        let inner = Command::new(CommandId(12), "Runtime.enable", json!({}));
        let target = TargetId::new("worker-1");
        let wrapped = inner
            .wrap_for_target(CommandId(13), &target)
            .expect("wrap");

        assert_eq!(wrapped.method, "Target.sendMessageToTarget");
        assert_eq!(wrapped.id, CommandId(13));
        assert_eq!(wrapped.params["targetId"], "worker-1");

        let nested: Value =
            serde_json::from_str(wrapped.params["message"].as_str().expect("string"))
                .expect("inner parse");
        assert_eq!(nested["id"], 12);
        assert_eq!(nested["method"], "Runtime.enable");
    }
}
