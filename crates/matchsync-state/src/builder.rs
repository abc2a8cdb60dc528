//! Envelope builder - batches outbound entries per destination
//!
//! Entries queued for the same key within one dispatch cycle collapse to
//! the highest lock version. The host destination is resolved when the
//! batch is drained, never when it is queued.

use std::collections::BTreeMap;

use matchsync_core::{UserId, ValidationStatus, VarClass, VarValue};
use matchsync_wire::{Ack, Envelope, PresenceValue, SharedValue, UserValue};
use tracing::debug;

use crate::EntryKey;

/// Destination of an outbound envelope
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Target {
    /// The current host, whoever that is at drain time
    Host,
    /// Every other peer
    All,
}

/// A drained batch ready for the transport
#[derive(Clone, Debug, PartialEq)]
pub struct Outbound {
    pub target: Target,
    pub envelope: Envelope,
}

#[derive(Clone, Debug)]
struct QueuedValue {
    value: VarValue,
    lock_version: u64,
    status: ValidationStatus,
}

#[derive(Clone, Debug, Default)]
struct Batch {
    values: BTreeMap<EntryKey, QueuedValue>,
    acks: BTreeMap<EntryKey, u64>,
}

impl Batch {
    fn is_empty(&self) -> bool {
        self.values.is_empty() && self.acks.is_empty()
    }

    fn len(&self) -> usize {
        self.values.len() + self.acks.len()
    }

    fn push_value(&mut self, key: EntryKey, queued: QueuedValue) {
        match self.values.get(&key) {
            Some(existing) if existing.lock_version > queued.lock_version => {}
            _ => {
                self.values.insert(key, queued);
            }
        }
    }

    fn push_ack(&mut self, key: EntryKey, lock_version: u64) {
        let slot = self.acks.entry(key).or_insert(lock_version);
        *slot = (*slot).max(lock_version);
    }

    fn discard_user(&mut self, class: VarClass, user: &UserId) {
        let matches = |k: &EntryKey| k.id.class == class && k.user.as_ref() == Some(user);
        self.values.retain(|k, _| !matches(k));
        self.acks.retain(|k, _| !matches(k));
    }

    fn into_envelope(self) -> Envelope {
        let mut env = Envelope::new();
        for (key, q) in self.values {
            match (key.id.class, key.user) {
                (VarClass::Shared, _) => env.shared.push(SharedValue {
                    key: key.id.key,
                    value: q.value,
                    lock_version: q.lock_version,
                    status: q.status,
                }),
                (VarClass::User, Some(user_id)) => env.user.push(UserValue {
                    key: key.id.key,
                    user_id,
                    value: q.value,
                    lock_version: q.lock_version,
                    status: q.status,
                }),
                (VarClass::Presence, Some(user_id)) => env.presence.push(PresenceValue {
                    collection: key.id.key,
                    user_id,
                    value: q.value,
                    lock_version: q.lock_version,
                    status: q.status,
                }),
                (class, None) => {
                    debug!(key = %key.id, %class, "dropping unscoped entry");
                }
            }
        }
        for (key, lock_version) in self.acks {
            env.acks.push(Ack::new(key.id, key.user, lock_version));
        }
        env
    }
}

/// Pending outbound entries of one session
#[derive(Clone, Debug, Default)]
pub struct EnvelopeBuilder {
    to_host: Batch,
    broadcast: Batch,
}

impl EnvelopeBuilder {
    pub fn new() -> Self {
        EnvelopeBuilder::default()
    }

    fn batch(&mut self, target: Target) -> &mut Batch {
        match target {
            Target::Host => &mut self.to_host,
            Target::All => &mut self.broadcast,
        }
    }

    /// Queue a value entry, keeping the highest version per key
    pub fn queue_value(
        &mut self,
        target: Target,
        key: EntryKey,
        value: VarValue,
        lock_version: u64,
        status: ValidationStatus,
    ) {
        self.batch(target).push_value(
            key,
            QueuedValue {
                value,
                lock_version,
                status,
            },
        );
    }

    /// Queue an acknowledgement for broadcast
    pub fn queue_ack(&mut self, key: EntryKey, lock_version: u64) {
        self.broadcast.push_ack(key, lock_version);
    }

    /// Forget queued entries scoped to `user` in the given class
    pub fn discard_user(&mut self, class: VarClass, user: &UserId) {
        self.to_host.discard_user(class, user);
        self.broadcast.discard_user(class, user);
    }

    /// Drop everything queued for the host
    pub fn discard_host_batch(&mut self) {
        self.to_host = Batch::default();
    }

    pub fn is_empty(&self) -> bool {
        self.to_host.is_empty() && self.broadcast.is_empty()
    }

    pub fn len(&self) -> usize {
        self.to_host.len() + self.broadcast.len()
    }

    pub fn clear(&mut self) {
        self.to_host = Batch::default();
        self.broadcast = Batch::default();
    }

    /// Take everything queued, splitting envelopes at `max_entries`
    pub fn drain(&mut self, max_entries: usize) -> Vec<Outbound> {
        let mut out = Vec::new();
        for (target, batch) in [
            (Target::Host, std::mem::take(&mut self.to_host)),
            (Target::All, std::mem::take(&mut self.broadcast)),
        ] {
            if batch.is_empty() {
                continue;
            }
            for envelope in batch.into_envelope().split(max_entries) {
                out.push(Outbound {
                    target: target.clone(),
                    envelope,
                });
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use matchsync_core::{VarId, VarKind};

    fn score() -> EntryKey {
        EntryKey::shared(VarId::shared(VarKind::Int, "score"))
    }

    #[test]
    fn test_highest_version_wins() {
        let mut b = EnvelopeBuilder::new();
        b.queue_value(Target::Host, score(), VarValue::Int(1), 1, ValidationStatus::Pending);
        b.queue_value(Target::Host, score(), VarValue::Int(3), 3, ValidationStatus::Pending);
        b.queue_value(Target::Host, score(), VarValue::Int(2), 2, ValidationStatus::Pending);

        let out = b.drain(64);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].target, Target::Host);
        assert_eq!(out[0].envelope.shared.len(), 1);
        assert_eq!(out[0].envelope.shared[0].value, VarValue::Int(3));
        assert!(b.is_empty());
    }

    #[test]
    fn test_targets_kept_apart() {
        let mut b = EnvelopeBuilder::new();
        b.queue_value(Target::Host, score(), VarValue::Int(1), 1, ValidationStatus::Pending);
        b.queue_value(Target::All, score(), VarValue::Int(1), 1, ValidationStatus::Validated);
        b.queue_ack(score(), 1);

        let out = b.drain(64);
        assert_eq!(out.len(), 2);
        assert_eq!(out[1].target, Target::All);
        assert_eq!(out[1].envelope.acks, vec![Ack::new(score().id, None, 1)]);
    }

    #[test]
    fn test_scoped_entries() {
        let mut b = EnvelopeBuilder::new();
        let alice = UserId::new("alice");
        b.queue_value(
            Target::All,
            EntryKey::scoped(VarId::user(VarKind::Bool, "ready"), alice.clone()),
            VarValue::Bool(true),
            1,
            ValidationStatus::Validated,
        );
        b.queue_value(
            Target::All,
            EntryKey::scoped(VarId::presence(VarKind::Float, "pos"), alice.clone()),
            VarValue::Float(1.0),
            1,
            ValidationStatus::Validated,
        );

        let env = &b.drain(64)[0].envelope;
        assert_eq!(env.user[0].user_id, alice);
        assert_eq!(env.presence[0].collection, "pos");
    }

    #[test]
    fn test_discard_user() {
        let mut b = EnvelopeBuilder::new();
        let bob = UserId::new("bob");
        let key = EntryKey::scoped(VarId::presence(VarKind::Int, "hp"), bob.clone());
        b.queue_value(Target::All, key.clone(), VarValue::Int(5), 2, ValidationStatus::Validated);
        b.queue_ack(key, 2);
        b.queue_value(Target::All, score(), VarValue::Int(1), 1, ValidationStatus::Validated);

        b.discard_user(VarClass::Presence, &bob);
        assert_eq!(b.len(), 1);
    }

    #[test]
    fn test_drain_splits() {
        let mut b = EnvelopeBuilder::new();
        for i in 0..10 {
            let key = EntryKey::shared(VarId::shared(VarKind::Int, format!("k{}", i)));
            b.queue_value(Target::All, key.clone(), VarValue::Int(i), 1, ValidationStatus::Validated);
            b.queue_ack(key, 1);
        }
        let out = b.drain(8);
        assert_eq!(out.len(), 3);
        assert_eq!(out.iter().map(|o| o.envelope.len()).sum::<usize>(), 20);
    }
}
