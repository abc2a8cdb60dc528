//! Egress - local writes
//!
//! A write bumps the entry's lock version and queues it. Guests send to the
//! host as `Pending`; the host validates its own writes on the spot and
//! broadcasts them with an ack. Writes before the match starts, or while a
//! guest is still handshaking, only touch the local store.

use matchsync_core::{SyncError, SyncResult, ValidationStatus, VarClass, VarId, VarValue};
use tracing::trace;

use crate::{engine::change, ChangeSource, EntryKey, Scope, SyncEngine, Target, VarChange};

impl SyncEngine {
    /// Write a shared variable
    pub fn set_shared(&mut self, id: &VarId, value: VarValue) -> SyncResult<Option<VarChange>> {
        expect_class(id, VarClass::Shared)?;
        self.write_local(EntryKey::shared(id.clone()), Scope::Shared, value)
            .map(Some)
    }

    /// Write this peer's entry of a user variable
    ///
    /// Without a match there is no identity to scope the write to, so the
    /// call is ignored.
    pub fn set_user(&mut self, id: &VarId, value: VarValue) -> SyncResult<Option<VarChange>> {
        expect_class(id, VarClass::User)?;
        let Some(self_id) = self.self_id().cloned() else {
            trace!(id = %id, "user write before match start ignored");
            return Ok(None);
        };
        let scope = Scope::User(self_id.clone());
        self.write_local(EntryKey::scoped(id.clone(), self_id), scope, value)
            .map(Some)
    }

    /// Write the slot this peer owns in a presence collection
    ///
    /// Peers without a slot are silently ignored.
    pub fn set_presence(&mut self, id: &VarId, value: VarValue) -> SyncResult<Option<VarChange>> {
        expect_class(id, VarClass::Presence)?;
        self.store.lookup(id)?;
        let Some(self_id) = self.self_id().cloned() else {
            return Ok(None);
        };
        let Some(slot) = self.rotators.get(id).and_then(|r| r.slot_of(&self_id)) else {
            trace!(id = %id, "presence write without an owned slot ignored");
            return Ok(None);
        };
        self.write_local(EntryKey::scoped(id.clone(), self_id), Scope::Slot(slot), value)
            .map(Some)
    }

    fn write_local(&mut self, key: EntryKey, scope: Scope, value: VarValue) -> SyncResult<VarChange> {
        if value.kind() != key.id.kind {
            return Err(SyncError::TypeMismatch {
                id: key.id.clone(),
                expected: key.id.kind,
                actual: value.kind(),
            });
        }
        let is_host = self.is_host();
        let status = if is_host {
            ValidationStatus::Validated
        } else {
            ValidationStatus::Pending
        };

        let entry = self.store.entry_mut(&key.id, &scope)?;
        let old = entry.clone();
        entry.value = value;
        entry.lock_version += 1;
        entry.status = status;
        let new = entry.clone();

        if self.active {
            if is_host {
                self.builder.queue_value(
                    Target::All,
                    key.clone(),
                    new.value.clone(),
                    new.lock_version,
                    status,
                );
                self.builder.queue_ack(key.clone(), new.lock_version);
            } else {
                self.builder.queue_value(
                    Target::Host,
                    key.clone(),
                    new.value.clone(),
                    new.lock_version,
                    status,
                );
            }
        }
        trace!(id = %key.id, version = new.lock_version, ?status, "local write");

        Ok(change(key.id, key.user, old, new, ChangeSource::Local))
    }
}

fn expect_class(id: &VarId, class: VarClass) -> SyncResult<()> {
    if id.class == class {
        Ok(())
    } else {
        Err(SyncError::ClassMismatch {
            id: id.clone(),
            expected: class,
        })
    }
}
