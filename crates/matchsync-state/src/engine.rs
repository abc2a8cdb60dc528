//! Sync engine - the serialized session state of one peer
//!
//! The engine owns the store, the rotators, both trackers and the envelope
//! builder. Every mutation takes `&mut self`, so local writes and ingress
//! are serialized by whoever holds the engine. Nothing here performs I/O:
//! callers drain outbound envelopes and hand them to a transport.

use std::collections::{BTreeMap, BTreeSet};

use matchsync_core::{Presence, SyncError, SyncResult, UserId, ValidationStatus, VarClass, VarId};
use matchsync_wire::{
    Envelope, HandshakeRequest, HandshakeResponse, PresenceValue, SharedValue, Snapshot, UserValue,
};
use tracing::{debug, info, warn};

use crate::{
    compare_schemas, ChangeSource, EntryKey, EnvelopeBuilder, HostTracker, Outbound,
    PresenceChange, PresenceTracker, PresenceVarRotators, Scope, SyncEvent, Target, VarChange,
    VarEntry, VarStore,
};

/// Who is in the match and who hosts it
#[derive(Clone, Debug)]
pub struct Membership {
    pub(crate) presences: PresenceTracker,
    pub(crate) host: HostTracker,
}

impl Membership {
    pub fn presences(&self) -> &PresenceTracker {
        &self.presences
    }

    pub fn host(&self) -> &HostTracker {
        &self.host
    }
}

#[derive(Debug, Default)]
pub struct SyncEngine {
    pub(crate) store: VarStore,
    pub(crate) rotators: PresenceVarRotators,
    pub(crate) membership: Option<Membership>,
    pub(crate) builder: EnvelopeBuilder,
    /// Guests whose handshake this host accepted
    pub(crate) admitted: BTreeSet<UserId>,
    /// Set once the peer is in sync with the host
    pub(crate) active: bool,
}

impl SyncEngine {
    pub fn new() -> Self {
        SyncEngine::default()
    }

    /// Declare a variable before the match starts
    pub fn declare(&mut self, id: VarId, slots: u16) -> SyncResult<()> {
        if self.membership.is_some() {
            return Err(SyncError::RegistryLocked);
        }
        self.store.declare(id.clone(), slots)?;
        if id.class == VarClass::Presence {
            self.rotators.add(id, slots as usize);
        }
        Ok(())
    }

    pub fn store(&self) -> &VarStore {
        &self.store
    }

    pub fn rotators(&self) -> &PresenceVarRotators {
        &self.rotators
    }

    pub fn membership(&self) -> Option<&Membership> {
        self.membership.as_ref()
    }

    pub fn is_started(&self) -> bool {
        self.membership.is_some()
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn is_host(&self) -> bool {
        self.membership
            .as_ref()
            .map_or(false, |m| m.host.is_self_host())
    }

    pub fn self_id(&self) -> Option<&UserId> {
        self.membership.as_ref().map(|m| m.presences.self_id())
    }

    pub fn host_id(&self) -> Option<&UserId> {
        self.membership.as_ref().map(|m| m.host.host_id())
    }

    pub fn is_admitted(&self, user: &UserId) -> bool {
        self.admitted.contains(user)
    }

    /// Number of queued outbound entries
    pub fn pending_len(&self) -> usize {
        self.builder.len()
    }

    /// Bind the engine to a match
    ///
    /// A host is active immediately and assigns presence slots to everyone
    /// connected in user-id order. A guest waits for the handshake snapshot.
    pub fn start(&mut self, self_presence: Presence, presences: Vec<Presence>, host: Presence) -> Vec<SyncEvent> {
        let self_id = self_presence.user_id.clone();
        let membership = Membership {
            presences: PresenceTracker::new(self_presence, presences),
            host: HostTracker::new(self_id.clone(), host),
        };
        let is_host = membership.host.is_self_host();
        self.membership = Some(membership);
        self.admitted.clear();
        self.builder.clear();

        if is_host {
            info!(user = %self_id, "starting as host");
            let events = self.activate(false);
            // nobody to send to yet; guests get everything from the snapshot
            self.builder.clear();
            events
        } else {
            info!(user = %self_id, "starting as guest, awaiting handshake");
            self.active = false;
            Vec::new()
        }
    }

    /// Leave the match; local values stay readable
    pub fn stop(&mut self) {
        self.builder.clear();
        self.admitted.clear();
        self.active = false;
    }

    fn activate(&mut self, bump: bool) -> Vec<SyncEvent> {
        self.active = true;
        let mut events = self.assign_unassigned();
        events.extend(self.promote_pending(bump));
        events
    }

    /// Give every connected peer without a slot one, in user-id order
    fn assign_unassigned(&mut self) -> Vec<SyncEvent> {
        let users = match &self.membership {
            Some(m) => m.presences.user_ids(),
            None => return Vec::new(),
        };
        let mut events = Vec::new();
        for user in users {
            for change in self.rotators.on_join(&user) {
                events.push(SyncEvent::Presence(PresenceChange {
                    id: change.id,
                    slot: change.slot,
                    old_owner: None,
                    new_owner: Some(change.user),
                }));
            }
        }
        events
    }

    /// Validate our own pending writes
    ///
    /// With `bump` each write also moves one version up, past anything a
    /// previous host validated at the same version.
    fn promote_pending(&mut self, bump: bool) -> Vec<SyncEvent> {
        let mut events = Vec::new();
        for (id, scope, entry) in self.store.entries() {
            if entry.status != ValidationStatus::Pending {
                continue;
            }
            let Some(key) = self.key_for(&id, &scope) else {
                continue;
            };
            let Ok(stored) = self.store.entry_mut(&id, &scope) else {
                continue;
            };
            stored.status = ValidationStatus::Validated;
            if bump {
                stored.lock_version += 1;
            }
            let new = stored.clone();
            events.push(SyncEvent::Value(change(id, key.user, entry, new, ChangeSource::Local)));
        }
        events
    }

    /// Queue every written entry for broadcast; guests keep whichever copy is newer
    fn queue_state_broadcast(&mut self) {
        for (id, scope, entry) in self.store.entries() {
            if entry.lock_version == 0 {
                continue;
            }
            let Some(key) = self.key_for(&id, &scope) else {
                continue;
            };
            self.builder
                .queue_value(Target::All, key, entry.value, entry.lock_version, ValidationStatus::Validated);
        }
    }

    /// Offer a new host everything this peer is allowed to write
    ///
    /// Covers writes the previous host never answered and values it sent
    /// that never reached the new host.
    fn queue_reproposals(&mut self) {
        let Some(me) = self.self_id().cloned() else {
            return;
        };
        for (id, scope, entry) in self.store.entries() {
            if entry.lock_version == 0 {
                continue;
            }
            let writable = match &scope {
                Scope::Shared => true,
                Scope::User(user) => *user == me,
                Scope::Slot(slot) => self.rotators.get(&id).and_then(|r| r.owner(*slot)) == Some(&me),
            };
            if !writable {
                continue;
            }
            let Some(key) = self.key_for(&id, &scope) else {
                continue;
            };
            self.builder
                .queue_value(Target::Host, key, entry.value, entry.lock_version, entry.status);
        }
        debug!(queued = self.builder.len(), "re-proposing to new host");
    }

    pub fn on_presence_joined(&mut self, presence: Presence) -> Vec<SyncEvent> {
        let Some(membership) = self.membership.as_mut() else {
            return Vec::new();
        };
        let user = presence.user_id.clone();
        if !membership.presences.on_join(presence) {
            return Vec::new();
        }
        debug!(%user, "presence joined");
        if !self.active {
            return Vec::new();
        }
        self.rotators
            .on_join(&user)
            .into_iter()
            .map(|c| {
                SyncEvent::Presence(PresenceChange {
                    id: c.id,
                    slot: c.slot,
                    old_owner: None,
                    new_owner: Some(c.user),
                })
            })
            .collect()
    }

    /// Release every slot of a departed peer, resetting its entries
    pub fn on_presence_left(&mut self, user: &UserId) -> Vec<SyncEvent> {
        let Some(membership) = self.membership.as_mut() else {
            return Vec::new();
        };
        if membership.presences.on_leave(user).is_none() {
            return Vec::new();
        }
        debug!(%user, "presence left");
        self.admitted.remove(user);
        self.builder.discard_user(VarClass::Presence, user);

        let mut events = Vec::new();
        for change in self.rotators.on_leave(user) {
            match self.store.reset_slot(&change.id, change.slot) {
                Ok(old) => {
                    let fresh = VarEntry::new(change.id.kind);
                    if old != fresh {
                        events.push(SyncEvent::Value(VarChange {
                            id: change.id.clone(),
                            user_id: Some(user.clone()),
                            old: old.value,
                            new: fresh.value,
                            lock_version: fresh.lock_version,
                            old_status: old.status,
                            status: fresh.status,
                            source: ChangeSource::Reset,
                        }));
                    }
                }
                Err(e) => warn!(id = %change.id, slot = change.slot, error = %e, "slot reset failed"),
            }
            events.push(SyncEvent::Presence(PresenceChange {
                id: change.id,
                slot: change.slot,
                old_owner: Some(change.user),
                new_owner: None,
            }));
        }
        events
    }

    /// Follow a host migration
    ///
    /// A peer promoted to host admits everyone connected, settles its own
    /// pending writes and broadcasts its state. A guest that stays a guest
    /// re-proposes its writable entries to the new host.
    pub fn on_host_changed(&mut self, host: Presence) -> Vec<SyncEvent> {
        let Some(membership) = self.membership.as_mut() else {
            return Vec::new();
        };
        let was_host = membership.host.is_self_host();
        if !membership.host.set_host(host) {
            return Vec::new();
        }
        info!(host = %membership.host.host_id(), "host changed");
        if !membership.host.is_self_host() {
            if self.active {
                self.queue_reproposals();
            }
            return Vec::new();
        }
        if was_host {
            return Vec::new();
        }

        self.admitted = membership
            .presences
            .others()
            .map(|p| p.user_id.clone())
            .collect();
        self.builder.discard_host_batch();
        info!("promoted to host");
        // slot tables only change on membership events, never on promotion
        let events = if self.active {
            self.promote_pending(true)
        } else {
            self.activate(true)
        };
        self.queue_state_broadcast();
        events
    }

    pub fn handshake_request(&self) -> HandshakeRequest {
        HandshakeRequest {
            schema: self.store.schema(),
        }
    }

    /// Host side of the handshake
    pub fn handle_handshake_request(
        &mut self,
        sender: &UserId,
        request: &HandshakeRequest,
    ) -> SyncResult<HandshakeResponse> {
        if !self.is_host() {
            return Err(SyncError::NotHost);
        }
        let diff = compare_schemas(&self.store.schema(), &request.schema);
        if !diff.is_empty() {
            warn!(
                guest = %sender,
                missing = diff.missing.len(),
                unexpected = diff.unexpected.len(),
                "rejecting handshake"
            );
            return Ok(HandshakeResponse::Rejected {
                missing: diff.missing,
                unexpected: diff.unexpected,
            });
        }
        self.admitted.insert(sender.clone());
        info!(guest = %sender, "handshake accepted");
        Ok(HandshakeResponse::Accepted(self.snapshot()))
    }

    /// Full state of this peer in handshake form
    pub fn snapshot(&self) -> Snapshot {
        let mut values = Envelope::new();
        for (id, scope, entry) in self.store.entries() {
            match scope {
                Scope::Shared => values.shared.push(SharedValue {
                    key: id.key,
                    value: entry.value,
                    lock_version: entry.lock_version,
                    status: entry.status,
                }),
                Scope::User(user_id) => values.user.push(UserValue {
                    key: id.key,
                    user_id,
                    value: entry.value,
                    lock_version: entry.lock_version,
                    status: entry.status,
                }),
                Scope::Slot(slot) => {
                    let owner = self.rotators.get(&id).and_then(|r| r.owner(slot)).cloned();
                    // unowned slots are always at their default
                    if let Some(user_id) = owner {
                        values.presence.push(PresenceValue {
                            collection: id.key,
                            user_id,
                            value: entry.value,
                            lock_version: entry.lock_version,
                            status: entry.status,
                        });
                    }
                }
            }
        }
        Snapshot {
            values,
            assignments: self.rotators.assignments(),
        }
    }

    /// Guest side: replace local state with the host snapshot
    pub fn apply_snapshot(&mut self, snapshot: Snapshot) -> SyncResult<Vec<SyncEvent>> {
        if self.membership.is_none() {
            return Err(SyncError::SessionClosed);
        }
        let before = self.store.entries();
        let owners_before = self.owner_table();

        self.rotators.restore(&snapshot.assignments)?;
        self.store.clear_values();

        let mut restored = 0usize;
        for (key, entry) in incoming_entries(snapshot.values) {
            let applied = self
                .resolve(&key)
                .and_then(|scope| self.store.entry_mut(&key.id, &scope).map(|e| *e = entry));
            match applied {
                Ok(()) => restored += 1,
                Err(e) => warn!(id = %key.id, error = %e, "skipping snapshot entry"),
            }
        }

        let mut events = Vec::new();
        let owners_after = self.owner_table();
        let slots: BTreeSet<&(VarId, usize)> = owners_before.keys().chain(owners_after.keys()).collect();
        for slot in slots {
            let old_owner = owners_before.get(slot).cloned();
            let new_owner = owners_after.get(slot).cloned();
            if old_owner != new_owner {
                events.push(SyncEvent::Presence(PresenceChange {
                    id: slot.0.clone(),
                    slot: slot.1,
                    old_owner,
                    new_owner,
                }));
            }
        }
        events.extend(self.diff_entries(before, ChangeSource::Snapshot));
        events.extend(self.assign_unassigned());

        self.builder.clear();
        self.active = true;
        info!(entries = restored, "snapshot applied");
        Ok(events)
    }

    /// Drain queued envelopes
    pub fn drain(&mut self, max_entries: usize) -> Vec<Outbound> {
        if !self.active {
            return Vec::new();
        }
        self.builder.drain(max_entries)
    }

    /// Map a wire address to a local scope
    pub(crate) fn resolve(&self, key: &EntryKey) -> SyncResult<Scope> {
        self.store.check_incoming(&key.id)?;
        match key.id.class {
            VarClass::Shared => Ok(Scope::Shared),
            VarClass::User => key.user.clone().map(Scope::User).ok_or_else(|| {
                SyncError::InvalidWireFormat(format!("user entry {} without user id", key.id))
            }),
            VarClass::Presence => {
                let user = key.user.as_ref().ok_or_else(|| {
                    SyncError::InvalidWireFormat(format!("presence entry {} without user id", key.id))
                })?;
                self.rotators
                    .get(&key.id)
                    .and_then(|r| r.slot_of(user))
                    .map(Scope::Slot)
                    .ok_or_else(|| SyncError::UnrecognizedAssignment {
                        collection: key.id.key.clone(),
                        user: user.clone(),
                    })
            }
        }
    }

    /// Wire address of a stored entry; `None` for unowned slots
    pub(crate) fn key_for(&self, id: &VarId, scope: &Scope) -> Option<EntryKey> {
        match scope {
            Scope::Shared => Some(EntryKey::shared(id.clone())),
            Scope::User(user) => Some(EntryKey::scoped(id.clone(), user.clone())),
            Scope::Slot(slot) => self
                .rotators
                .get(id)
                .and_then(|r| r.owner(*slot))
                .map(|user| EntryKey::scoped(id.clone(), user.clone())),
        }
    }

    fn owner_table(&self) -> BTreeMap<(VarId, usize), UserId> {
        self.rotators
            .iter()
            .flat_map(|r| {
                r.assignments()
                    .map(move |(slot, user)| ((r.id().clone(), slot), user.clone()))
            })
            .collect()
    }

    fn diff_entries(&self, before: Vec<(VarId, Scope, VarEntry)>, source: ChangeSource) -> Vec<SyncEvent> {
        let mut before: BTreeMap<(VarId, Scope), VarEntry> =
            before.into_iter().map(|(id, scope, e)| ((id, scope), e)).collect();
        let mut events = Vec::new();

        for (id, scope, entry) in self.store.entries() {
            let old = before
                .remove(&(id.clone(), scope.clone()))
                .unwrap_or_else(|| VarEntry::new(id.kind));
            if old != entry {
                let user_id = self.key_for(&id, &scope).and_then(|k| k.user);
                events.push(SyncEvent::Value(change(id, user_id, old, entry, source.clone())));
            }
        }
        // user entries dropped by the restore
        for ((id, scope), old) in before {
            let fresh = VarEntry::new(id.kind);
            if old != fresh {
                let user_id = self.key_for(&id, &scope).and_then(|k| k.user);
                events.push(SyncEvent::Value(change(id, user_id, old, fresh, source.clone())));
            }
        }
        events
    }
}

pub(crate) fn change(
    id: VarId,
    user_id: Option<UserId>,
    old: VarEntry,
    new: VarEntry,
    source: ChangeSource,
) -> VarChange {
    VarChange {
        id,
        user_id,
        old: old.value,
        new: new.value,
        lock_version: new.lock_version,
        old_status: old.status,
        status: new.status,
        source,
    }
}

/// Flatten the typed buckets of an envelope into addressed entries
pub(crate) fn incoming_entries(envelope: Envelope) -> Vec<(EntryKey, VarEntry)> {
    let mut out = Vec::with_capacity(envelope.value_count());
    for v in envelope.shared {
        let key = EntryKey::shared(v.var_id());
        out.push((key, VarEntry::with_value(v.value, v.lock_version, v.status)));
    }
    for v in envelope.user {
        let key = EntryKey::scoped(v.var_id(), v.user_id.clone());
        out.push((key, VarEntry::with_value(v.value, v.lock_version, v.status)));
    }
    for v in envelope.presence {
        let key = EntryKey::scoped(v.var_id(), v.user_id.clone());
        out.push((key, VarEntry::with_value(v.value, v.lock_version, v.status)));
    }
    out
}
