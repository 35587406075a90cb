//! Connection status events.
//!
//! Every state transition of the connection manager is published on a
//! broadcast stream. This stream is the only externally visible side
//! channel besides message delivery; higher layers subscribe to react to
//! disconnects, gossip updates, and lame-duck notices.

use tokio::sync::broadcast;

/// Observable connection lifecycle states.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnState {
    /// No connection has been attempted yet.
    Idle,
    /// A dial/handshake attempt is in flight.
    Connecting,
    /// The connection is established and traffic flows.
    Connected,
    /// The transport was lost; the reconnect loop is running.
    Reconnecting,
    /// The client is flushing subscriptions before closing.
    Draining,
    /// The client is closed; all pending state has been rejected.
    Closed,
}

/// Status events published on the client's event stream.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Event {
    /// A connection was established (first connect or reconnect).
    Connected,
    /// The transport was lost.
    Disconnected,
    /// A reconnect attempt is about to dial `server`.
    Reconnecting {
        /// Endpoint being dialed.
        server: String,
    },
    /// Gossip changed the server pool.
    ServersChanged {
        /// Endpoints appended to the pool.
        added: Vec<String>,
        /// Endpoints removed from the pool.
        removed: Vec<String>,
    },
    /// The heartbeat monitor declared the connection stale.
    StaleConnection,
    /// The current server is shutting down gracefully.
    LameDuckMode,
    /// The server reported a non-fatal error.
    ServerError(String),
    /// The client closed permanently.
    Closed,
}

/// Receiving half of the status stream.
///
/// A slow reader may miss events; the stream skips over the gap rather than
/// failing, since status events are advisory.
#[derive(Debug)]
pub struct Events(pub(crate) broadcast::Receiver<Event>);

impl Events {
    /// Wait for the next status event.
    ///
    /// Returns `None` once the client is gone and all buffered events have
    /// been observed.
    pub async fn next(&mut self) -> Option<Event> {
        loop {
            match self.0.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::debug!(skipped, "status stream lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}
