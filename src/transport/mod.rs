//! Transport layer: endpoint discovery and the WebSocket link.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────┐   GET /json      ┌──────────────────┐
//! │  Session (Rust)  │─────────────────►│  Browser         │
//! │                  │                  │  debug endpoint  │
//! │  endpoint::      │◄─── target list ─│  localhost:PORT  │
//! │  discover        │                  │                  │
//! │        │         │    WebSocket     │                  │
//! │  Connection      │◄════════════════►│  DevTools        │
//! └──────────────────┘                  └──────────────────┘
//! ```
//!
//! # Connection Lifecycle
//!
//! 1. `endpoint::discover` - poll `/json` for an attachable page target
//! 2. `Connection::connect` - WebSocket handshake on the debugger URL
//! 3. `Connection::send_text` / `Connection::recv` - frame exchange
//! 4. `Connection::close` - shutdown, reader task stops
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | `endpoint` | HTTP `/json` target discovery |
//! | `connection` | WebSocket connection and reader task |

// ============================================================================
// Submodules
// ============================================================================

/// WebSocket connection and reader task.
pub mod connection;

/// Debug endpoint discovery.
pub mod endpoint;

// ============================================================================
// Re-exports
// ============================================================================

pub use connection::Connection;
pub use endpoint::{DebugTarget, discover};
