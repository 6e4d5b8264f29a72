//! Type-safe identifiers for protocol entities.
//!
//! Newtype wrappers prevent mixing incompatible IDs at compile time:
//! a netlog source id is never a protocol command id, a target id is
//! never a request id.
//!
//! | Type | Wire representation |
//! |------|---------------------|
//! | [`CommandId`] | monotonically increasing integer |
//! | [`TargetId`] | opaque string assigned by the browser |
//! | [`RequestId`] | opaque string, re-mapped on redirect hops |
//! | [`FrameId`] | opaque string |
//! | [`SourceId`] | numeric netlog event source id |

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

// ============================================================================
// CommandId
// ============================================================================

/// Protocol command identifier used for request/response correlation.
///
/// Command ids are process-local, monotonically increasing integers and
/// are never reused while a response might still be outstanding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CommandId(pub u64);

impl CommandId {
    /// Returns the raw integer value.
    #[inline]
    #[must_use]
    pub fn value(self) -> u64 {
        self.0
    }
}

impl fmt::Display for CommandId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Monotonic generator for [`CommandId`]s.
///
/// One generator is shared per session; ids are unique across the main
/// connection and all nested-target envelopes.
#[derive(Debug, Default)]
pub struct CommandIdGenerator {
    next: AtomicU64,
}

impl CommandIdGenerator {
    /// Creates a generator starting at 1.
    #[must_use]
    pub fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
        }
    }

    /// Returns the next command id.
    #[inline]
    pub fn next_id(&self) -> CommandId {
        CommandId(self.next.fetch_add(1, Ordering::Relaxed))
    }
}

// ============================================================================
// TargetId
// ============================================================================

/// Identifier for a browsing context (page, iframe session, worker).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TargetId(pub String);

impl TargetId {
    /// Creates a target id from a string.
    #[inline]
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the id as a string slice.
    #[inline]
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TargetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ============================================================================
// RequestId
// ============================================================================

/// Identifier for one logical network request.
///
/// The protocol-assigned id is stable only within one redirect hop; a
/// redirect produces a new logical request id suffixed with a hop
/// counter (see [`RequestId::redirect_hop`]).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(pub String);

impl RequestId {
    /// Creates a request id from a string.
    #[inline]
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the id as a string slice.
    #[inline]
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Derives the id for a completed redirect hop.
    ///
    /// Hop 1 of request `"12.3"` becomes `"12.3-1"`.
    #[must_use]
    pub fn redirect_hop(&self, hop: u32) -> RequestId {
        RequestId(format!("{}-{}", self.0, hop))
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ============================================================================
// FrameId
// ============================================================================

/// Identifier for a frame within a page.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FrameId(pub String);

impl FrameId {
    /// Creates a frame id from a string.
    #[inline]
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the id as a string slice.
    #[inline]
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for FrameId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ============================================================================
// SourceId
// ============================================================================

/// Numeric netlog event source id.
///
/// Netlog events reference each other by these ids via
/// `source_dependency` back-references.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SourceId(pub u64);

impl fmt::Display for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_id_generator_monotonic() {
        let generator = CommandIdGenerator::new();
        let first = generator.next_id();
        let second = generator.next_id();
        assert_eq!(first.value(), 1);
        assert_eq!(second.value(), 2);
        assert!(second > first);
    }

    #[test]
    fn test_redirect_hop() {
        let id = RequestId::new("1000.7");
        assert_eq!(id.redirect_hop(1).as_str(), "1000.7-1");
        assert_eq!(id.redirect_hop(2).as_str(), "1000.7-2");
    }

    #[test]
    fn test_serde_transparent() {
        let id: RequestId = serde_json::from_str("\"42.1\"").expect("parse");
        assert_eq!(id.as_str(), "42.1");
        let json = serde_json::to_string(&CommandId(9)).expect("serialize");
        assert_eq!(json, "9");
    }
}
