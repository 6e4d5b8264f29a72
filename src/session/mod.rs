//! Session layer: command multiplexing, event routing, request state.
//!
//! # Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────┐
//! │ Session (single pump context)                          │
//! │                                                        │
//! │  send / send_wait / send_to_target                     │
//! │        │                                               │
//! │        ▼                                               │
//! │  pump ── transport queue ──► dispatch                  │
//! │                │                 │                     │
//! │     work queue (nested targets)  ▼                     │
//! │                └──────────► Router ──► RequestStore    │
//! │                                  │          │          │
//! │                                  ▼          ▼          │
//! │                            TraceReducer  PageState     │
//! └────────────────────────────────────────────────────────┘
//! ```
//!
//! Everything inbound is interpreted in arrival order inside one async
//! context. Waiters pump; nothing dispatches concurrently.
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | `core` | Session, pump, recording lifecycle |
//! | `router` | Event dispatch and reactions |
//! | `network` | Network request state machine |
//! | `coverage` | JS/CSS usage coverage summaries |

// ============================================================================
// Submodules
// ============================================================================

/// Session, pump, and recording lifecycle.
pub mod core;

/// JS/CSS usage coverage summaries.
pub mod coverage;

/// Network request state machine.
pub mod network;

/// Event router.
pub mod router;

// ============================================================================
// Re-exports
// ============================================================================

pub use core::{RecordingOutput, Session};
pub use coverage::CoverageBuilder;
pub use network::{PageState, RequestRecord, RequestStore};
pub use router::{EventCategory, Reaction, Router};
