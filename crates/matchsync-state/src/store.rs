//! Variable store - declared variables and their entries
//!
//! Shared variables hold one entry, user variables one entry per user and
//! presence collections a fixed number of slots. Ownership of presence
//! slots lives in the rotator; the store only knows slot indices.

use std::collections::BTreeMap;

use matchsync_core::{SyncError, SyncResult, UserId, ValidationStatus, VarClass, VarId, VarKind, VarValue};
use matchsync_wire::SchemaEntry;

/// One stored value with its version and validation state
#[derive(Clone, Debug, PartialEq)]
pub struct VarEntry {
    pub value: VarValue,
    pub lock_version: u64,
    pub status: ValidationStatus,
}

impl VarEntry {
    /// Fresh entry holding the kind default
    pub fn new(kind: VarKind) -> Self {
        VarEntry {
            value: kind.default_value(),
            lock_version: 0,
            status: ValidationStatus::None,
        }
    }

    pub fn with_value(value: VarValue, lock_version: u64, status: ValidationStatus) -> Self {
        VarEntry {
            value,
            lock_version,
            status,
        }
    }

    /// Back to the kind default at version 0
    pub fn reset(&mut self, kind: VarKind) {
        *self = VarEntry::new(kind);
    }
}

/// Storage for one declared variable
#[derive(Clone, Debug)]
pub enum VarSlot {
    Shared(VarEntry),
    User(BTreeMap<UserId, VarEntry>),
    Presence(Vec<VarEntry>),
}

impl VarSlot {
    fn declare(id: &VarId, slots: u16) -> SyncResult<Self> {
        match id.class {
            VarClass::Shared => Ok(VarSlot::Shared(VarEntry::new(id.kind))),
            VarClass::User => Ok(VarSlot::User(BTreeMap::new())),
            VarClass::Presence => {
                if slots == 0 {
                    return Err(SyncError::InvalidDeclaration(format!(
                        "presence collection {} needs at least one slot",
                        id.key
                    )));
                }
                Ok(VarSlot::Presence(
                    (0..slots).map(|_| VarEntry::new(id.kind)).collect(),
                ))
            }
        }
    }

    /// Slot count for presence collections, 0 otherwise
    pub fn slot_count(&self) -> u16 {
        match self {
            VarSlot::Presence(slots) => slots.len() as u16,
            _ => 0,
        }
    }
}

/// Where inside a variable an entry lives
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Scope {
    Shared,
    User(UserId),
    Slot(usize),
}

/// Logical address of an entry as it travels on the wire
///
/// Presence entries are addressed by their owner; the rotator maps the
/// owner to a slot index on each peer.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntryKey {
    pub id: VarId,
    pub user: Option<UserId>,
}

impl EntryKey {
    pub fn shared(id: VarId) -> Self {
        EntryKey { id, user: None }
    }

    pub fn scoped(id: VarId, user: UserId) -> Self {
        EntryKey { id, user: Some(user) }
    }
}

/// The declared variables of one session
#[derive(Clone, Debug, Default)]
pub struct VarStore {
    vars: BTreeMap<VarId, VarSlot>,
}

impl VarStore {
    pub fn new() -> Self {
        VarStore::default()
    }

    /// Declare a variable; `slots` only matters for presence collections
    pub fn declare(&mut self, id: VarId, slots: u16) -> SyncResult<()> {
        if id.key.is_empty() {
            return Err(SyncError::InvalidDeclaration("empty key".into()));
        }
        if self.vars.contains_key(&id) {
            return Err(SyncError::DuplicateKey(id));
        }
        let slot = VarSlot::declare(&id, slots)?;
        self.vars.insert(id, slot);
        Ok(())
    }

    pub fn contains(&self, id: &VarId) -> bool {
        self.vars.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.vars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }

    pub fn ids(&self) -> impl Iterator<Item = &VarId> {
        self.vars.keys()
    }

    pub fn lookup(&self, id: &VarId) -> SyncResult<&VarSlot> {
        self.vars.get(id).ok_or_else(|| SyncError::NotFound(id.clone()))
    }

    fn lookup_mut(&mut self, id: &VarId) -> SyncResult<&mut VarSlot> {
        self.vars
            .get_mut(id)
            .ok_or_else(|| SyncError::NotFound(id.clone()))
    }

    /// Check an id arriving from a peer
    ///
    /// An id whose key exists under another kind is a type mismatch,
    /// anything else unknown is an unknown key.
    pub fn check_incoming(&self, id: &VarId) -> SyncResult<()> {
        if self.vars.contains_key(id) {
            return Ok(());
        }
        let declared = self
            .vars
            .keys()
            .find(|other| other.class == id.class && other.key == id.key);
        match declared {
            Some(other) => Err(SyncError::TypeMismatch {
                id: id.clone(),
                expected: other.kind,
                actual: id.kind,
            }),
            None => Err(SyncError::UnknownKey(id.clone())),
        }
    }

    /// Read an entry; missing user entries read as the kind default
    pub fn entry(&self, id: &VarId, scope: &Scope) -> SyncResult<VarEntry> {
        match (self.lookup(id)?, scope) {
            (VarSlot::Shared(entry), Scope::Shared) => Ok(entry.clone()),
            (VarSlot::User(entries), Scope::User(user)) => Ok(entries
                .get(user)
                .cloned()
                .unwrap_or_else(|| VarEntry::new(id.kind))),
            (VarSlot::Presence(slots), Scope::Slot(i)) => slots
                .get(*i)
                .cloned()
                .ok_or_else(|| SyncError::NotFound(id.clone())),
            _ => Err(SyncError::NotFound(id.clone())),
        }
    }

    /// Mutable access; user entries are created on first touch
    pub fn entry_mut(&mut self, id: &VarId, scope: &Scope) -> SyncResult<&mut VarEntry> {
        let kind = id.kind;
        match (self.lookup_mut(id)?, scope) {
            (VarSlot::Shared(entry), Scope::Shared) => Ok(entry),
            (VarSlot::User(entries), Scope::User(user)) => Ok(entries
                .entry(user.clone())
                .or_insert_with(|| VarEntry::new(kind))),
            (VarSlot::Presence(slots), Scope::Slot(i)) => slots
                .get_mut(*i)
                .ok_or_else(|| SyncError::NotFound(id.clone())),
            _ => Err(SyncError::NotFound(id.clone())),
        }
    }

    /// Reset a presence slot, returning the previous entry
    pub fn reset_slot(&mut self, id: &VarId, slot: usize) -> SyncResult<VarEntry> {
        let entry = self.entry_mut(id, &Scope::Slot(slot))?;
        let old = entry.clone();
        entry.reset(id.kind);
        Ok(old)
    }

    /// Declared variables in handshake form, sorted by id
    pub fn schema(&self) -> Vec<SchemaEntry> {
        self.vars
            .iter()
            .map(|(id, slot)| SchemaEntry::with_slots(id.clone(), slot.slot_count()))
            .collect()
    }

    /// All entries with their scope
    pub fn entries(&self) -> Vec<(VarId, Scope, VarEntry)> {
        let mut out = Vec::new();
        for (id, slot) in &self.vars {
            match slot {
                VarSlot::Shared(entry) => out.push((id.clone(), Scope::Shared, entry.clone())),
                VarSlot::User(entries) => {
                    for (user, entry) in entries {
                        out.push((id.clone(), Scope::User(user.clone()), entry.clone()));
                    }
                }
                VarSlot::Presence(slots) => {
                    for (i, entry) in slots.iter().enumerate() {
                        out.push((id.clone(), Scope::Slot(i), entry.clone()));
                    }
                }
            }
        }
        out
    }

    /// Reset every entry to its default and drop all user entries
    pub fn clear_values(&mut self) {
        for (id, slot) in self.vars.iter_mut() {
            match slot {
                VarSlot::Shared(entry) => entry.reset(id.kind),
                VarSlot::User(entries) => entries.clear(),
                VarSlot::Presence(slots) => slots.iter_mut().for_each(|e| e.reset(id.kind)),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> VarStore {
        let mut store = VarStore::new();
        store.declare(VarId::shared(VarKind::Int, "score"), 0).unwrap();
        store.declare(VarId::user(VarKind::String, "name"), 0).unwrap();
        store.declare(VarId::presence(VarKind::Float, "pos"), 2).unwrap();
        store
    }

    #[test]
    fn test_declare_duplicate() {
        let mut store = store();
        let id = VarId::shared(VarKind::Int, "score");
        assert_eq!(store.declare(id.clone(), 0), Err(SyncError::DuplicateKey(id)));
    }

    #[test]
    fn test_same_key_different_kind_is_distinct() {
        let mut store = store();
        assert!(store.declare(VarId::shared(VarKind::Bool, "score"), 0).is_ok());
        assert_eq!(store.len(), 4);
    }

    #[test]
    fn test_zero_slot_presence_rejected() {
        let mut store = VarStore::new();
        let result = store.declare(VarId::presence(VarKind::Int, "hp"), 0);
        assert!(matches!(result, Err(SyncError::InvalidDeclaration(_))));
    }

    #[test]
    fn test_lookup_not_found() {
        let store = store();
        let id = VarId::shared(VarKind::Int, "missing");
        assert!(matches!(store.lookup(&id), Err(SyncError::NotFound(_))));
    }

    #[test]
    fn test_user_entry_lazy_default() {
        let mut store = store();
        let id = VarId::user(VarKind::String, "name");
        let alice = Scope::User(UserId::new("alice"));

        assert_eq!(store.entry(&id, &alice).unwrap(), VarEntry::new(VarKind::String));

        store.entry_mut(&id, &alice).unwrap().value = VarValue::String("Al".into());
        assert_eq!(
            store.entry(&id, &alice).unwrap().value,
            VarValue::String("Al".into())
        );
        assert_eq!(
            store.entry(&id, &Scope::User(UserId::new("bob"))).unwrap().value,
            VarValue::String(String::new())
        );
    }

    #[test]
    fn test_slot_out_of_range() {
        let store = store();
        let id = VarId::presence(VarKind::Float, "pos");
        assert!(store.entry(&id, &Scope::Slot(1)).is_ok());
        assert!(store.entry(&id, &Scope::Slot(2)).is_err());
    }

    #[test]
    fn test_check_incoming_type_mismatch() {
        let store = store();
        let wrong = VarId::shared(VarKind::String, "score");
        assert_eq!(
            store.check_incoming(&wrong),
            Err(SyncError::TypeMismatch {
                id: wrong.clone(),
                expected: VarKind::Int,
                actual: VarKind::String,
            })
        );
        let unknown = VarId::shared(VarKind::Int, "nope");
        assert_eq!(store.check_incoming(&unknown), Err(SyncError::UnknownKey(unknown)));
    }

    #[test]
    fn test_reset_slot() {
        let mut store = store();
        let id = VarId::presence(VarKind::Float, "pos");
        {
            let entry = store.entry_mut(&id, &Scope::Slot(0)).unwrap();
            entry.value = VarValue::Float(2.5);
            entry.lock_version = 7;
            entry.status = ValidationStatus::Validated;
        }
        let old = store.reset_slot(&id, 0).unwrap();
        assert_eq!(old.lock_version, 7);
        assert_eq!(store.entry(&id, &Scope::Slot(0)).unwrap(), VarEntry::new(VarKind::Float));
    }

    #[test]
    fn test_schema_sorted_with_slots() {
        let store = store();
        let schema = store.schema();
        assert_eq!(schema.len(), 3);
        let pos = schema.iter().find(|e| e.is_collection()).unwrap();
        assert_eq!(pos.slots, 2);
        let mut sorted = schema.clone();
        sorted.sort();
        assert_eq!(schema, sorted);
    }
}
