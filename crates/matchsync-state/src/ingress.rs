//! Ingress - applying envelopes from peers
//!
//! Entries are applied one by one. An entry that cannot be resolved is
//! dropped and reported while the rest of the envelope still applies.
//! Entries at or below the local lock version are stale and dropped
//! without a report. The one exception is a guest holding its own pending
//! write at the version the host sent: the host accepted another write
//! there, so the guest takes the host copy.
//!
//! On the host every applied entry is re-broadcast as `Validated` together
//! with an ack. A shared proposal that loses to the host's own version is
//! answered with the host value at a version above both, so every peer
//! converges on the host copy. User and presence entries have a single
//! writer, so a losing proposal there is just a retransmission and stale.

use matchsync_core::{SyncError, UserId, ValidationStatus};
use matchsync_wire::{Ack, Envelope};
use tracing::{debug, trace};

use crate::{
    engine::{change, incoming_entries},
    ChangeSource, EntryKey, Scope, SyncEngine, SyncEvent, Target, VarEntry,
};

/// Counters for one applied envelope
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct IngressReport {
    /// Entries written to the store
    pub applied: u32,
    /// Entries at or below the local version
    pub stale: u32,
    /// Entries dropped because they could not be resolved or were not allowed
    pub dropped: u32,
    /// Acks that validated a pending entry
    pub acked: u32,
    /// Guest proposals the host overrode with its own value
    pub rejected: u32,
}

impl IngressReport {
    pub fn merge(&mut self, other: &IngressReport) {
        self.applied += other.applied;
        self.stale += other.stale;
        self.dropped += other.dropped;
        self.acked += other.acked;
        self.rejected += other.rejected;
    }
}

/// Everything produced by applying one envelope
#[derive(Clone, Debug, Default, PartialEq)]
pub struct IngressOutcome {
    pub report: IngressReport,
    pub events: Vec<SyncEvent>,
    /// Reportable failures, one per dropped entry
    pub errors: Vec<SyncError>,
}

impl SyncEngine {
    /// Apply an envelope sent by `sender`
    pub fn apply_envelope(&mut self, sender: &UserId, envelope: Envelope) -> IngressOutcome {
        let mut outcome = IngressOutcome::default();

        if !self.active {
            debug!(%sender, entries = envelope.len(), "envelope before handshake dropped");
            outcome.report.dropped = envelope.value_count() as u32;
            return outcome;
        }

        if self.is_host() {
            if !self.is_admitted(sender) {
                debug!(%sender, "envelope from unadmitted peer dropped");
                outcome.report.dropped = envelope.value_count() as u32;
                return outcome;
            }
            for (key, entry) in incoming_entries(envelope) {
                self.host_apply(sender, key, entry, &mut outcome);
            }
        } else {
            if self.host_id() != Some(sender) {
                debug!(%sender, "envelope from non-host dropped");
                outcome.report.dropped = envelope.value_count() as u32;
                return outcome;
            }
            let acks = envelope.acks.clone();
            for (key, entry) in incoming_entries(envelope) {
                self.guest_apply(sender, key, entry, &mut outcome);
            }
            for ack in acks {
                self.apply_ack(sender, ack, &mut outcome);
            }
        }

        outcome
    }

    fn resolve_or_drop(&self, key: &EntryKey, outcome: &mut IngressOutcome) -> Option<Scope> {
        match self.resolve(key) {
            Ok(scope) => Some(scope),
            Err(e) => {
                debug!(id = %key.id, error = %e, "entry dropped");
                outcome.report.dropped += 1;
                outcome.errors.push(e);
                None
            }
        }
    }

    fn guest_apply(&mut self, sender: &UserId, key: EntryKey, incoming: VarEntry, outcome: &mut IngressOutcome) {
        let Some(scope) = self.resolve_or_drop(&key, outcome) else {
            return;
        };
        let Ok(entry) = self.store.entry_mut(&key.id, &scope) else {
            outcome.report.dropped += 1;
            return;
        };
        let superseded = incoming.lock_version == entry.lock_version
            && entry.status == ValidationStatus::Pending
            && incoming.value != entry.value;
        if incoming.lock_version <= entry.lock_version && !superseded {
            trace!(id = %key.id, local = entry.lock_version, incoming = incoming.lock_version, "stale entry");
            outcome.report.stale += 1;
            return;
        }
        let old = std::mem::replace(entry, incoming);
        let new = entry.clone();
        outcome.report.applied += 1;
        outcome.events.push(SyncEvent::Value(change(
            key.id,
            key.user,
            old,
            new,
            ChangeSource::Remote(sender.clone()),
        )));
    }

    fn host_apply(&mut self, sender: &UserId, key: EntryKey, incoming: VarEntry, outcome: &mut IngressOutcome) {
        let Some(scope) = self.resolve_or_drop(&key, outcome) else {
            return;
        };
        if key.id.class.is_user_scoped() && key.user.as_ref() != Some(sender) {
            outcome.report.dropped += 1;
            outcome.errors.push(SyncError::UnauthorizedWrite {
                id: key.id,
                user: sender.clone(),
            });
            return;
        }
        let Ok(entry) = self.store.entry_mut(&key.id, &scope) else {
            outcome.report.dropped += 1;
            return;
        };

        if incoming.lock_version > entry.lock_version {
            let old = std::mem::replace(
                entry,
                VarEntry::with_value(incoming.value, incoming.lock_version, ValidationStatus::Validated),
            );
            let new = entry.clone();
            self.builder.queue_value(
                Target::All,
                key.clone(),
                new.value.clone(),
                new.lock_version,
                ValidationStatus::Validated,
            );
            self.builder.queue_ack(key.clone(), new.lock_version);
            outcome.report.applied += 1;
            outcome.events.push(SyncEvent::Value(change(
                key.id,
                key.user,
                old,
                new,
                ChangeSource::Remote(sender.clone()),
            )));
        } else if incoming.lock_version == entry.lock_version && incoming.value == entry.value {
            // already accepted; confirm again for a sender still waiting on it
            trace!(id = %key.id, version = entry.lock_version, "repeated proposal");
            outcome.report.stale += 1;
            if incoming.status == ValidationStatus::Pending {
                self.builder.queue_value(
                    Target::All,
                    key.clone(),
                    entry.value.clone(),
                    entry.lock_version,
                    ValidationStatus::Validated,
                );
                self.builder.queue_ack(key, entry.lock_version);
            }
        } else if key.id.class.is_user_scoped() {
            // only the owner writes these, so this is a retransmission
            trace!(id = %key.id, local = entry.lock_version, incoming = incoming.lock_version, "stale proposal");
            outcome.report.stale += 1;
        } else {
            // out-version the proposal so the host copy wins everywhere
            let old = entry.clone();
            entry.lock_version += 1;
            entry.status = ValidationStatus::Validated;
            let new = entry.clone();
            debug!(
                id = %key.id,
                %sender,
                proposed = incoming.lock_version,
                version = new.lock_version,
                "proposal overridden"
            );
            self.builder.queue_value(
                Target::All,
                key.clone(),
                new.value.clone(),
                new.lock_version,
                ValidationStatus::Validated,
            );
            outcome.report.rejected += 1;
            if old.status != new.status {
                outcome.events.push(SyncEvent::Value(change(
                    key.id,
                    key.user,
                    old,
                    new,
                    ChangeSource::Remote(sender.clone()),
                )));
            }
        }
    }

    fn apply_ack(&mut self, sender: &UserId, ack: Ack, outcome: &mut IngressOutcome) {
        let key = EntryKey {
            id: ack.id,
            user: ack.user_id,
        };
        let Ok(scope) = self.resolve(&key) else {
            trace!(id = %key.id, "ack for unknown entry ignored");
            return;
        };
        let Ok(entry) = self.store.entry_mut(&key.id, &scope) else {
            return;
        };
        if entry.status != ValidationStatus::Pending || entry.lock_version != ack.lock_version {
            trace!(id = %key.id, local = entry.lock_version, acked = ack.lock_version, "stale ack");
            return;
        }
        let old = entry.clone();
        entry.status = ValidationStatus::Validated;
        let new = entry.clone();
        outcome.report.acked += 1;
        outcome.events.push(SyncEvent::Value(change(
            key.id,
            key.user,
            old,
            new,
            ChangeSource::Remote(sender.clone()),
        )));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use matchsync_core::{Presence, VarId, VarKind, VarValue};
    use matchsync_wire::{HandshakeResponse, PresenceValue, SharedValue, UserValue};
    use proptest::prelude::*;

    fn score() -> VarId {
        VarId::shared(VarKind::Int, "score")
    }

    fn pos() -> VarId {
        VarId::presence(VarKind::Float, "pos")
    }

    fn declared() -> SyncEngine {
        let mut engine = SyncEngine::new();
        engine.declare(score(), 0).unwrap();
        engine.declare(VarId::user(VarKind::String, "name"), 0).unwrap();
        engine.declare(pos(), 2).unwrap();
        engine
    }

    /// Host "h" with guest "g" admitted, and the matching guest engine
    fn pair() -> (SyncEngine, SyncEngine) {
        let mut host = declared();
        host.start(Presence::from_user("h"), vec![], Presence::from_user("h"));
        host.on_presence_joined(Presence::from_user("g"));

        let mut guest = declared();
        guest.start(
            Presence::from_user("g"),
            vec![Presence::from_user("h")],
            Presence::from_user("h"),
        );
        let request = guest.handshake_request();
        match host.handle_handshake_request(&"g".into(), &request).unwrap() {
            HandshakeResponse::Accepted(snapshot) => {
                guest.apply_snapshot(snapshot).unwrap();
            }
            other => panic!("unexpected {:?}", other),
        }
        (host, guest)
    }

    fn shared_entry(v: i64, version: u64, status: ValidationStatus) -> Envelope {
        let mut env = Envelope::new();
        env.shared.push(SharedValue {
            key: "score".into(),
            value: VarValue::Int(v),
            lock_version: version,
            status,
        });
        env
    }

    /// Deliver everything `from` has queued to `to`
    fn deliver(from: &mut SyncEngine, from_id: &str, to: &mut SyncEngine) -> IngressReport {
        let mut report = IngressReport::default();
        for out in from.drain(64) {
            report.merge(&to.apply_envelope(&from_id.into(), out.envelope).report);
        }
        report
    }

    #[test]
    fn test_stale_entry_dropped_silently() {
        let (_, mut guest) = pair();
        let h: UserId = "h".into();
        let first = guest.apply_envelope(&h, shared_entry(1, 3, ValidationStatus::Validated));
        assert_eq!(first.report.applied, 1);

        let again = guest.apply_envelope(&h, shared_entry(9, 3, ValidationStatus::Validated));
        assert_eq!(again.report.stale, 1);
        assert!(again.errors.is_empty());
        assert!(again.events.is_empty());
        assert_eq!(
            guest.store().entry(&score(), &Scope::Shared).unwrap().value,
            VarValue::Int(1)
        );
    }

    #[test]
    fn test_guest_proposal_validated_by_host() {
        let (mut host, mut guest) = pair();
        guest.set_shared(&score(), VarValue::Int(7)).unwrap();

        let report = deliver(&mut guest, "g", &mut host);
        assert_eq!(report.applied, 1);
        let on_host = host.store().entry(&score(), &Scope::Shared).unwrap();
        assert_eq!(on_host.value, VarValue::Int(7));
        assert_eq!(on_host.status, ValidationStatus::Validated);

        let report = deliver(&mut host, "h", &mut guest);
        // the echoed value is stale, the ack validates
        assert_eq!(report.stale, 1);
        assert_eq!(report.acked, 1);
        let on_guest = guest.store().entry(&score(), &Scope::Shared).unwrap();
        assert_eq!(on_guest.status, ValidationStatus::Validated);
        assert_eq!(on_guest.lock_version, 1);
    }

    #[test]
    fn test_losing_proposal_overridden() {
        let (mut host, mut guest) = pair();
        host.set_shared(&score(), VarValue::Int(100)).unwrap();
        host.set_shared(&score(), VarValue::Int(101)).unwrap();
        host.drain(64);

        // guest has not seen version 2 yet
        guest.set_shared(&score(), VarValue::Int(5)).unwrap();
        let report = deliver(&mut guest, "g", &mut host);
        assert_eq!(report.rejected, 1);
        let on_host = host.store().entry(&score(), &Scope::Shared).unwrap();
        assert_eq!(on_host.value, VarValue::Int(101));
        assert_eq!(on_host.lock_version, 3);

        deliver(&mut host, "h", &mut guest);
        let on_guest = guest.store().entry(&score(), &Scope::Shared).unwrap();
        assert_eq!(on_guest, on_host);
    }

    #[test]
    fn test_retransmitted_user_write_acked_again() {
        let (mut host, mut guest) = pair();
        let name = VarId::user(VarKind::String, "name");
        guest.set_user(&name, VarValue::String("ana".into())).unwrap();
        let sent = guest.drain(64);
        assert_eq!(sent.len(), 1);

        let first = host.apply_envelope(&"g".into(), sent[0].envelope.clone());
        assert_eq!(first.report.applied, 1);
        host.drain(64);

        let again = host.apply_envelope(&"g".into(), sent[0].envelope.clone());
        assert_eq!(again.report.stale, 1);
        assert_eq!(again.report.rejected, 0);
        assert!(again.events.is_empty());
        let out = host.drain(64);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].envelope.user[0].lock_version, 1);
        assert_eq!(out[0].envelope.acks, vec![Ack::new(name.clone(), Some("g".into()), 1)]);
    }

    #[test]
    fn test_ack_does_not_validate_another_write() {
        let mut host = declared();
        host.start(Presence::from_user("a"), vec![], Presence::from_user("a"));
        host.on_presence_joined(Presence::from_user("b"));
        host.on_presence_joined(Presence::from_user("c"));

        let mut guests = Vec::new();
        for id in ["b", "c"] {
            let mut guest = declared();
            guest.start(
                Presence::from_user(id),
                vec![Presence::from_user("a")],
                Presence::from_user("a"),
            );
            let request = guest.handshake_request();
            let HandshakeResponse::Accepted(snapshot) =
                host.handle_handshake_request(&id.into(), &request).unwrap()
            else {
                panic!("handshake rejected");
            };
            guest.apply_snapshot(snapshot).unwrap();
            guests.push(guest);
        }
        let (b, c) = guests.split_at_mut(1);
        let (b, c) = (&mut b[0], &mut c[0]);

        b.set_shared(&score(), VarValue::Int(10)).unwrap();
        c.set_shared(&score(), VarValue::Int(20)).unwrap();
        deliver(b, "b", &mut host);
        let verdict = host.drain(64);

        // c still holds its own pending write at version 1
        let outcome = c.apply_envelope(&"a".into(), verdict[0].envelope.clone());
        assert_eq!(outcome.report.applied, 1);
        assert_eq!(outcome.report.acked, 0);
        let on_c = c.store().entry(&score(), &Scope::Shared).unwrap();
        assert_eq!(on_c, host.store().entry(&score(), &Scope::Shared).unwrap());
        assert_eq!(on_c.value, VarValue::Int(10));
        assert_eq!(on_c.status, ValidationStatus::Validated);

        // c's late proposal loses and leaves everyone on the host value
        deliver(c, "c", &mut host);
        for out in host.drain(64) {
            b.apply_envelope(&"a".into(), out.envelope.clone());
            c.apply_envelope(&"a".into(), out.envelope);
        }
        let on_host = host.store().entry(&score(), &Scope::Shared).unwrap();
        assert_eq!(on_host.value, VarValue::Int(10));
        assert_eq!(b.store().entry(&score(), &Scope::Shared).unwrap(), on_host);
        assert_eq!(c.store().entry(&score(), &Scope::Shared).unwrap(), on_host);
    }

    #[test]
    fn test_migration_after_concurrent_writes_converges() {
        let mut host = declared();
        host.start(Presence::from_user("a"), vec![], Presence::from_user("a"));
        let mut guests = Vec::new();
        for id in ["b", "c"] {
            host.on_presence_joined(Presence::from_user(id));
            let mut guest = declared();
            guest.start(
                Presence::from_user(id),
                vec![Presence::from_user("a")],
                Presence::from_user("a"),
            );
            let HandshakeResponse::Accepted(snapshot) =
                host.handle_handshake_request(&id.into(), &guest.handshake_request()).unwrap()
            else {
                panic!("handshake rejected");
            };
            guest.apply_snapshot(snapshot).unwrap();
            guests.push(guest);
        }
        let (b, c) = guests.split_at_mut(1);
        let (b, c) = (&mut b[0], &mut c[0]);
        b.on_presence_joined(Presence::from_user("c"));
        c.on_presence_joined(Presence::from_user("b"));

        b.set_shared(&score(), VarValue::Int(10)).unwrap();
        c.set_shared(&score(), VarValue::Int(20)).unwrap();
        deliver(b, "b", &mut host);
        let verdict = host.drain(64);
        // only c hears the verdict before the host leaves
        c.apply_envelope(&"a".into(), verdict[0].envelope.clone());
        b.drain(64);
        c.drain(64);

        for guest in [&mut *b, &mut *c] {
            guest.on_presence_left(&"a".into());
            guest.on_host_changed(Presence::from_user("b"));
        }
        assert!(b.is_host());
        for _ in 0..4 {
            deliver(b, "b", c);
            deliver(c, "c", b);
        }

        let on_b = b.store().entry(&score(), &Scope::Shared).unwrap();
        let on_c = c.store().entry(&score(), &Scope::Shared).unwrap();
        assert_eq!(on_b, on_c);
        assert_eq!(on_b.status, ValidationStatus::Validated);
        assert_eq!(on_c.status, ValidationStatus::Validated);
    }

    #[test]
    fn test_stale_ack_ignored() {
        let (_, mut guest) = pair();
        guest.set_shared(&score(), VarValue::Int(1)).unwrap();
        guest.set_shared(&score(), VarValue::Int(2)).unwrap();
        guest.drain(64);

        let mut env = Envelope::new();
        env.acks.push(Ack::new(score(), None, 1));
        let outcome = guest.apply_envelope(&"h".into(), env);
        assert_eq!(outcome.report.acked, 0);
        let entry = guest.store().entry(&score(), &Scope::Shared).unwrap();
        assert_eq!(entry.status, ValidationStatus::Pending);
        assert_eq!(entry.lock_version, 2);
    }

    #[test]
    fn test_unknown_key_drops_only_that_entry() {
        let (_, mut guest) = pair();
        let mut env = shared_entry(4, 1, ValidationStatus::Validated);
        env.shared.push(SharedValue {
            key: "nope".into(),
            value: VarValue::Int(1),
            lock_version: 1,
            status: ValidationStatus::Validated,
        });

        let outcome = guest.apply_envelope(&"h".into(), env);
        assert_eq!(outcome.report.applied, 1);
        assert_eq!(outcome.report.dropped, 1);
        assert_eq!(
            outcome.errors,
            vec![SyncError::UnknownKey(VarId::shared(VarKind::Int, "nope"))]
        );
    }

    #[test]
    fn test_unrecognized_assignment() {
        let (_, mut guest) = pair();
        let mut env = Envelope::new();
        env.presence.push(PresenceValue {
            collection: "pos".into(),
            user_id: "stranger".into(),
            value: VarValue::Float(1.0),
            lock_version: 1,
            status: ValidationStatus::Validated,
        });
        let outcome = guest.apply_envelope(&"h".into(), env);
        assert!(matches!(
            outcome.errors.as_slice(),
            [SyncError::UnrecognizedAssignment { .. }]
        ));
    }

    #[test]
    fn test_host_rejects_foreign_user_write() {
        let (mut host, _) = pair();
        let mut env = Envelope::new();
        env.user.push(UserValue {
            key: "name".into(),
            user_id: "h".into(),
            value: VarValue::String("spoof".into()),
            lock_version: 9,
            status: ValidationStatus::Pending,
        });
        let outcome = host.apply_envelope(&"g".into(), env);
        assert_eq!(outcome.report.dropped, 1);
        assert!(matches!(
            outcome.errors.as_slice(),
            [SyncError::UnauthorizedWrite { .. }]
        ));
    }

    #[test]
    fn test_guest_ignores_non_host_sender() {
        let (_, mut guest) = pair();
        let outcome = guest.apply_envelope(&"mallory".into(), shared_entry(1, 5, ValidationStatus::Validated));
        assert_eq!(outcome.report.dropped, 1);
        assert_eq!(outcome.report.applied, 0);
    }

    #[test]
    fn test_host_ignores_unadmitted_peer() {
        let (mut host, _) = pair();
        host.on_presence_joined(Presence::from_user("late"));
        let outcome = host.apply_envelope(&"late".into(), shared_entry(1, 5, ValidationStatus::Pending));
        assert_eq!(outcome.report.dropped, 1);
    }

    #[test]
    fn test_presence_slots_follow_owner() {
        let (mut host, mut guest) = pair();
        guest.set_presence(&pos(), VarValue::Float(3.5)).unwrap();
        deliver(&mut guest, "g", &mut host);

        let g: UserId = "g".into();
        let slot = host.rotators().get(&pos()).unwrap().slot_of(&g).unwrap();
        assert_eq!(slot, guest.rotators().get(&pos()).unwrap().slot_of(&g).unwrap());
        assert_eq!(
            host.store().entry(&pos(), &Scope::Slot(slot)).unwrap().value,
            VarValue::Float(3.5)
        );
    }

    proptest! {
        #[test]
        fn prop_stale_updates_leave_entry_unchanged(
            updates in proptest::collection::vec((any::<i64>(), 0u64..20), 1..40)
        ) {
            let (_, mut guest) = pair();
            let h: UserId = "h".into();
            for (value, version) in updates {
                let before = guest.store().entry(&score(), &Scope::Shared).unwrap();
                guest.apply_envelope(&h, shared_entry(value, version, ValidationStatus::Validated));
                let after = guest.store().entry(&score(), &Scope::Shared).unwrap();
                if version <= before.lock_version {
                    prop_assert_eq!(after, before);
                } else {
                    prop_assert_eq!(after.lock_version, version);
                    prop_assert_eq!(after.value, VarValue::Int(value));
                }
            }
        }
    }
}
