//! Transport seam
//!
//! The sync layer never opens sockets. It sends opaque payloads through a
//! `Transport` and is fed inbound traffic and membership changes by the
//! embedding application, either by calling the `SyncMatch::handle_*`
//! methods directly or by forwarding `TransportEvent`s to [`drive`].

use bytes::Bytes;
use matchsync_core::{Presence, SyncResult, UserId};
use tokio::sync::mpsc;
use tracing::debug;

use crate::SyncMatch;

/// Outbound side of a match channel
///
/// `send` is fire-and-forget and must not call back into the sending
/// session; inbound traffic arrives through `SyncMatch::handle_event`.
pub trait Transport: Send + Sync {
    /// Send `payload` on `opcode`; `None` targets every other presence
    fn send(&self, opcode: i64, payload: Bytes, targets: Option<&[UserId]>) -> SyncResult<()>;
}

/// Match membership at create or join time
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MatchInfo {
    pub match_id: String,
    pub self_presence: Presence,
    /// Everyone connected, self may or may not be included
    pub presences: Vec<Presence>,
    pub host: Presence,
}

impl MatchInfo {
    pub fn new(match_id: impl Into<String>, self_presence: Presence, host: Presence) -> Self {
        MatchInfo {
            match_id: match_id.into(),
            self_presence,
            presences: Vec::new(),
            host,
        }
    }

    pub fn with_presences(mut self, presences: Vec<Presence>) -> Self {
        self.presences = presences;
        self
    }

    pub fn is_self_host(&self) -> bool {
        self.self_presence.user_id == self.host.user_id
    }
}

/// Inbound notification from the transport
#[derive(Clone, Debug, PartialEq)]
pub enum TransportEvent {
    MatchState {
        sender: UserId,
        opcode: i64,
        payload: Bytes,
    },
    PresenceJoined(Presence),
    PresenceLeft(UserId),
    HostChanged(Presence),
}

/// Feed transport events into a session until the channel closes
pub async fn drive(session: SyncMatch, mut events: mpsc::Receiver<TransportEvent>) {
    while let Some(event) = events.recv().await {
        session.handle_event(event);
    }
    debug!(match_id = %session.match_id(), "transport channel closed");
}
