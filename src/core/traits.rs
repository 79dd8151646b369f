//! Notification interface between connections and their owner.

use bytes::Bytes;

use super::types::{ConnectionId, DisconnectReason, SequenceId};

/// Callbacks the owning network interface receives from its connections.
///
/// All methods have empty default bodies so implementors only override what
/// they care about.
///
/// # Example
///
/// ```
/// use bytes::Bytes;
/// use rudp_link::core::{ConnectionHandler, ConnectionId};
///
/// #[derive(Default)]
/// struct Echo {
///     received: Vec<Bytes>,
/// }
///
/// impl ConnectionHandler for Echo {
///     fn on_packet(&mut self, _id: ConnectionId, payload: Bytes, _reliable: bool) {
///         self.received.push(payload);
///     }
/// }
/// ```
pub trait ConnectionHandler: Send {
    /// The connection reached `Connected`.
    fn on_connected(&mut self, id: ConnectionId) {
        let _ = id;
    }

    /// The connection reached `Disconnected`.
    fn on_disconnected(&mut self, id: ConnectionId, reason: DisconnectReason) {
        let _ = (id, reason);
    }

    /// A reliable message exhausted its retransmit budget.
    fn on_packet_lost(&mut self, id: ConnectionId, sequence: SequenceId) {
        let _ = (id, sequence);
    }

    /// An application payload arrived.
    fn on_packet(&mut self, id: ConnectionId, payload: Bytes, reliable: bool) {
        let _ = (id, payload, reliable);
    }
}
