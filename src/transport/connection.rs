//! WebSocket connection and reader task.
//!
//! The connection owns the write half of the socket and spawns one
//! background task that does exactly one job: decode inbound text frames
//! into [`InboundMessage`]s and push them onto an unbounded queue. All
//! interpretation (response correlation, event routing) happens in the
//! session's pump context, in arrival order, never here.
//!
//! A shared `must_exit` flag lets an external controller preempt anyone
//! blocked in [`Connection::recv`] within one poll slice.

// ============================================================================
// Imports
// ============================================================================

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, timeout};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, error, trace, warn};

use crate::error::{Error, Result};
use crate::protocol::InboundMessage;

// ============================================================================
// Constants
// ============================================================================

/// Longest single poll slice inside [`Connection::recv`]; bounds how
/// long a waiter can ignore `must_exit`.
const POLL_SLICE: Duration = Duration::from_secs(1);

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;

// ============================================================================
// Connection
// ============================================================================

/// One WebSocket connection to the browser's debugger endpoint.
///
/// Not `Clone`: the session owns it exclusively, which is what keeps
/// message dispatch single-threaded.
pub struct Connection {
    writer: WsSink,
    queue: mpsc::UnboundedReceiver<InboundMessage>,
    must_exit: Arc<AtomicBool>,
    reader: JoinHandle<()>,
}

impl Connection {
    /// Connects to a WebSocket debugger URL.
    ///
    /// # Errors
    ///
    /// - [`Error::ConnectionTimeout`] if the handshake does not finish
    ///   within `connect_timeout`
    /// - [`Error::WebSocket`] on handshake failure
    pub async fn connect(ws_url: &str, connect_timeout: Duration) -> Result<Self> {
        let (stream, _response) = timeout(connect_timeout, connect_async(ws_url))
            .await
            .map_err(|_| Error::connection_timeout(connect_timeout.as_millis() as u64))??;

        debug!(ws_url, "websocket connected");

        let (writer, reader_half) = stream.split();
        let (tx, queue) = mpsc::unbounded_channel();
        let must_exit = Arc::new(AtomicBool::new(false));
        let reader = tokio::spawn(Self::run_reader(reader_half, tx));

        Ok(Self {
            writer,
            queue,
            must_exit,
            reader,
        })
    }

    /// Returns the shared cancellation flag.
    ///
    /// Setting it to `true` makes every in-flight and future
    /// [`Connection::recv`] return `None` within one poll slice.
    #[inline]
    #[must_use]
    pub fn must_exit_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.must_exit)
    }

    /// Sends one already-serialized frame.
    pub async fn send_text(&mut self, text: String) -> Result<()> {
        trace!(len = text.len(), "sending frame");
        self.writer.send(Message::Text(text.into())).await?;
        Ok(())
    }

    /// Pops the next inbound message, waiting up to `wait`.
    ///
    /// Returns `None` on timeout, on cancellation via `must_exit`, and
    /// once the reader task has ended and the queue drained.
    pub async fn recv(&mut self, wait: Duration) -> Option<InboundMessage> {
        let deadline = Instant::now() + wait;
        loop {
            if self.must_exit.load(Ordering::Relaxed) {
                return None;
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            let slice = (deadline - now).min(POLL_SLICE);
            match timeout(slice, self.queue.recv()).await {
                Ok(Some(message)) => return Some(message),
                Ok(None) => return None,
                Err(_) => {}
            }
        }
    }

    /// Pops an already-queued message without waiting.
    #[inline]
    pub fn try_recv(&mut self) -> Option<InboundMessage> {
        self.queue.try_recv().ok()
    }

    /// Closes the socket and stops the reader task.
    pub async fn close(&mut self) {
        self.must_exit.store(true, Ordering::Relaxed);
        if let Err(e) = self.writer.close().await {
            debug!(error = %e, "error closing websocket");
        }
        self.reader.abort();
    }

    /// Reader task: decode frames, enqueue, nothing else.
    async fn run_reader(
        mut reader: futures_util::stream::SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>,
        tx: mpsc::UnboundedSender<InboundMessage>,
    ) {
        while let Some(frame) = reader.next().await {
            match frame {
                Ok(Message::Text(text)) => match InboundMessage::from_wire(&text) {
                    Ok(message) => {
                        if tx.send(message).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        warn!(error = %e, "dropping undecodable frame");
                    }
                },
                Ok(Message::Close(_)) => {
                    debug!("websocket closed by remote");
                    break;
                }
                Ok(_) => {}
                Err(e) => {
                    error!(error = %e, "websocket read error");
                    break;
                }
            }
        }
        debug!("reader task ended");
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.must_exit.store(true, Ordering::Relaxed);
        self.reader.abort();
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_connect_refused() {
        // Nothing listens on this port; handshake must fail, not hang.
        let result = Connection::connect("ws://127.0.0.1:1/devtools", Duration::from_secs(2)).await;
        assert!(result.is_err());
    }

    #[test]
    fn test_poll_slice_bounds_cancellation_latency() {
        assert!(POLL_SLICE <= Duration::from_secs(1));
    }
}
