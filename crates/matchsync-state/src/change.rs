//! Change events emitted by the engine

use matchsync_core::{UserId, ValidationStatus, VarId, VarValue};

/// What caused a change
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ChangeSource {
    /// Written through a local handle
    Local,
    /// Applied from an envelope sent by this peer
    Remote(UserId),
    /// Restored from the handshake snapshot
    Snapshot,
    /// Presence slot released by its owner leaving
    Reset,
}

/// A value, version or status change of one entry
#[derive(Clone, Debug, PartialEq)]
pub struct VarChange {
    pub id: VarId,
    /// Scoping user for user and presence variables
    pub user_id: Option<UserId>,
    pub old: VarValue,
    pub new: VarValue,
    pub lock_version: u64,
    pub old_status: ValidationStatus,
    pub status: ValidationStatus,
    pub source: ChangeSource,
}

impl VarChange {
    pub fn value_changed(&self) -> bool {
        self.old != self.new
    }

    pub fn status_changed(&self) -> bool {
        self.old_status != self.status
    }
}

/// Owner change of a presence slot
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PresenceChange {
    pub id: VarId,
    pub slot: usize,
    pub old_owner: Option<UserId>,
    pub new_owner: Option<UserId>,
}

#[derive(Clone, Debug, PartialEq)]
pub enum SyncEvent {
    Value(VarChange),
    Presence(PresenceChange),
}

impl SyncEvent {
    pub fn id(&self) -> &VarId {
        match self {
            SyncEvent::Value(c) => &c.id,
            SyncEvent::Presence(c) => &c.id,
        }
    }
}
