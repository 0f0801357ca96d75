//! Transport seam
//!
//! The engine never talks to sockets directly. Each participant hands over
//! a [`Tunnel`] when joining; the session pushes frames through it and
//! closes it when the participant is replaced or the session is torn down.

use crate::{OutgoingMessage, session::SyncMessage, session::UpdateMessage};

/// Trait for sending messages through a communication tunnel
///
/// Implementations might use WebSockets, Server-Sent Events, or an
/// in-process channel. Sends are fire-and-forget: a slow or broken tunnel
/// must never block the session that owns it.
pub trait Tunnel: Send + 'static {
    /// Sends an incremental update to the client
    fn send_message(&self, message: &OutgoingMessage<UpdateMessage>);

    /// Sends a full state synchronization, typically on (re)join
    fn send_state(&self, state: &OutgoingMessage<SyncMessage>);

    /// Closes the communication tunnel
    fn close(self);
}
