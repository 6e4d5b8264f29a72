//! Chrome debugging-protocol measurement agent.
//!
//! This library drives one browser tab over the Chrome DevTools
//! Protocol, records everything the page does (network requests, trace
//! events, navigation outcome), and reduces it into compact result
//! artifacts.
//!
//! # Architecture
//!
//! One [`Session`] owns the WebSocket connection and is the only place
//! inbound messages are interpreted:
//!
//! - A background reader task only deserializes frames into a queue
//! - Waiting on a command response pumps and dispatches that queue
//! - Trace events are reduced incrementally as they stream in
//!
//! # Quick Start
//!
//! ```no_run
//! use std::time::Duration;
//!
//! use cdp_agent::{JobConfig, Result, Session, TaskPaths};
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let config = JobConfig::default();
//!     let paths = TaskPaths::new("/tmp/run", "1_");
//!     let mut session =
//!         Session::connect(config.clone(), paths.clone(), 9222, Duration::from_secs(30))
//!             .await?;
//!
//!     session.start_recording().await?;
//!     session.navigate("https://example.com").await?;
//!     session.wait_for_page_load().await?;
//!     let output = session.stop_recording().await?;
//!     session.close().await;
//!
//!     cdp_agent::report::write_all(&paths, &config, &output)?;
//!     Ok(())
//! }
//! ```
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`config`] | Job options and artifact paths |
//! | [`error`] | Error types and [`Result`] alias |
//! | [`identifiers`] | Type-safe id wrappers |
//! | [`protocol`] | Protocol message types |
//! | [`report`] | Result artifact writing |
//! | [`session`] | Command multiplexing and event routing |
//! | [`trace`] | Trace-event reduction pipeline |
//! | [`transport`] | Endpoint discovery and WebSocket transport |

// ============================================================================
// Modules
// ============================================================================

/// Job options and artifact paths.
pub mod config;

/// Error types and result aliases.
///
/// All fallible operations return [`Result<T>`] which uses [`Error`].
pub mod error;

/// Type-safe identifiers for protocol entities.
///
/// Newtype wrappers prevent mixing incompatible ids at compile time.
pub mod identifiers;

/// Protocol message types.
///
/// Commands, responses, events, and the typed event payloads the
/// session consumes.
pub mod protocol;

/// Result artifact writing.
pub mod report;

/// Session layer: command multiplexing, event routing, request state.
pub mod session;

/// Trace-event reduction pipeline.
pub mod trace;

/// Endpoint discovery and WebSocket transport.
pub mod transport;

// ============================================================================
// Re-exports
// ============================================================================

// Configuration
pub use config::{JobConfig, TaskPaths};

// Error types
pub use error::{Error, Result};

// Identifier types
pub use identifiers::{CommandId, FrameId, RequestId, TargetId};

// Session types
pub use session::{PageState, RecordingOutput, RequestRecord, Session};

// Trace outputs
pub use trace::{FeatureNames, NetlogRequest, TraceReductions};
