//! Handshake, snapshot and RPC messages

use matchsync_core::{UserId, VarClass, VarId};

use crate::Envelope;

/// Message kind tag (first byte of every payload)
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageKind {
    Envelope = 0x01,
    HandshakeRequest = 0x02,
    HandshakeResponse = 0x03,
    Rpc = 0x04,
}

impl MessageKind {
    /// Parse from wire byte
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            0x01 => Some(MessageKind::Envelope),
            0x02 => Some(MessageKind::HandshakeRequest),
            0x03 => Some(MessageKind::HandshakeResponse),
            0x04 => Some(MessageKind::Rpc),
            _ => None,
        }
    }

    /// Convert to wire byte
    #[inline]
    pub fn to_byte(self) -> u8 {
        self as u8
    }
}

/// One declared variable as seen by the handshake
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SchemaEntry {
    pub id: VarId,
    /// Slot count for presence collections, 0 otherwise
    pub slots: u16,
}

impl SchemaEntry {
    pub fn new(id: VarId) -> Self {
        SchemaEntry { id, slots: 0 }
    }

    pub fn with_slots(id: VarId, slots: u16) -> Self {
        SchemaEntry { id, slots }
    }

    #[inline]
    pub fn is_collection(&self) -> bool {
        self.id.class == VarClass::Presence
    }
}

/// Guest -> host: the guest's declared variables
#[derive(Clone, Debug, Default, PartialEq)]
pub struct HandshakeRequest {
    pub schema: Vec<SchemaEntry>,
}

/// Rotator binding of a presence slot
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SlotAssignment {
    pub id: VarId,
    pub slot: u16,
    pub user_id: UserId,
}

/// Full host state pushed to a joining guest
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Snapshot {
    pub values: Envelope,
    pub assignments: Vec<SlotAssignment>,
}

/// Host -> guest: handshake verdict
#[derive(Clone, Debug, PartialEq)]
pub enum HandshakeResponse {
    Accepted(Snapshot),
    Rejected {
        missing: Vec<VarId>,
        unexpected: Vec<VarId>,
    },
}

impl HandshakeResponse {
    #[inline]
    pub fn is_accepted(&self) -> bool {
        matches!(self, HandshakeResponse::Accepted(_))
    }
}

/// Out-of-band named procedure call
#[derive(Clone, Debug, PartialEq)]
pub struct RpcCall {
    pub name: String,
    pub target_object_id: String,
    pub args: Vec<serde_json::Value>,
}

/// Any message travelling over the match channel
#[derive(Clone, Debug, PartialEq)]
pub enum SyncMessage {
    Envelope(Envelope),
    HandshakeRequest(HandshakeRequest),
    HandshakeResponse(HandshakeResponse),
    Rpc(RpcCall),
}

impl SyncMessage {
    pub fn kind(&self) -> MessageKind {
        match self {
            SyncMessage::Envelope(_) => MessageKind::Envelope,
            SyncMessage::HandshakeRequest(_) => MessageKind::HandshakeRequest,
            SyncMessage::HandshakeResponse(_) => MessageKind::HandshakeResponse,
            SyncMessage::Rpc(_) => MessageKind::Rpc,
        }
    }
}
