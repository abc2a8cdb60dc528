//! Envelope - the unit of sync exchange
//!
//! An envelope carries value updates segmented by variable class plus a
//! parallel list of acknowledgements. Order of entries within an envelope
//! carries no meaning.

use matchsync_core::{UserId, ValidationStatus, VarClass, VarId, VarValue};

/// Update of a shared variable
#[derive(Clone, Debug, PartialEq)]
pub struct SharedValue {
    pub key: String,
    pub value: VarValue,
    pub lock_version: u64,
    pub status: ValidationStatus,
}

impl SharedValue {
    pub fn var_id(&self) -> VarId {
        VarId::shared(self.value.kind(), self.key.clone())
    }
}

/// Update of one user's entry of a user variable
#[derive(Clone, Debug, PartialEq)]
pub struct UserValue {
    pub key: String,
    pub user_id: UserId,
    pub value: VarValue,
    pub lock_version: u64,
    pub status: ValidationStatus,
}

impl UserValue {
    pub fn var_id(&self) -> VarId {
        VarId::user(self.value.kind(), self.key.clone())
    }
}

/// Update of the presence slot owned by `user_id` in a collection
#[derive(Clone, Debug, PartialEq)]
pub struct PresenceValue {
    pub collection: String,
    pub user_id: UserId,
    pub value: VarValue,
    pub lock_version: u64,
    pub status: ValidationStatus,
}

impl PresenceValue {
    pub fn var_id(&self) -> VarId {
        VarId::presence(self.value.kind(), self.collection.clone())
    }
}

/// Host acknowledgement of a specific lock version
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Ack {
    pub id: VarId,
    /// Scoping user for user and presence variables
    pub user_id: Option<UserId>,
    pub lock_version: u64,
}

impl Ack {
    pub fn new(id: VarId, user_id: Option<UserId>, lock_version: u64) -> Self {
        Ack {
            id,
            user_id,
            lock_version,
        }
    }

    #[inline]
    pub fn class(&self) -> VarClass {
        self.id.class
    }
}

/// Batched updates and acknowledgements
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Envelope {
    pub shared: Vec<SharedValue>,
    pub user: Vec<UserValue>,
    pub presence: Vec<PresenceValue>,
    pub acks: Vec<Ack>,
}

impl Envelope {
    pub fn new() -> Self {
        Envelope::default()
    }

    /// Number of value entries (acks excluded)
    pub fn value_count(&self) -> usize {
        self.shared.len() + self.user.len() + self.presence.len()
    }

    /// Number of value entries and acks
    pub fn len(&self) -> usize {
        self.value_count() + self.acks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Split into envelopes holding at most `max_entries` entries each
    pub fn split(self, max_entries: usize) -> Vec<Envelope> {
        let max_entries = max_entries.max(1);
        if self.len() <= max_entries {
            return vec![self];
        }

        let mut out = Vec::new();
        let mut current = Envelope::new();

        macro_rules! spill {
            ($list:ident) => {
                for entry in self.$list {
                    if current.len() >= max_entries {
                        out.push(std::mem::take(&mut current));
                    }
                    current.$list.push(entry);
                }
            };
        }

        spill!(shared);
        spill!(user);
        spill!(presence);
        spill!(acks);

        if !current.is_empty() {
            out.push(current);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use matchsync_core::VarKind;

    fn shared(key: &str, v: i64) -> SharedValue {
        SharedValue {
            key: key.into(),
            value: VarValue::Int(v),
            lock_version: 1,
            status: ValidationStatus::Validated,
        }
    }

    #[test]
    fn test_var_id_from_value_kind() {
        let entry = shared("score", 3);
        assert_eq!(entry.var_id(), VarId::shared(VarKind::Int, "score"));
    }

    #[test]
    fn test_split_respects_limit() {
        let mut env = Envelope::new();
        for i in 0..5 {
            env.shared.push(shared(&format!("k{}", i), i));
            env.acks.push(Ack::new(VarId::shared(VarKind::Int, format!("k{}", i)), None, 1));
        }

        let parts = env.split(3);
        assert_eq!(parts.len(), 4);
        assert!(parts.iter().all(|p| p.len() <= 3));
        assert_eq!(parts.iter().map(|p| p.len()).sum::<usize>(), 10);
    }

    #[test]
    fn test_split_small_envelope_untouched() {
        let mut env = Envelope::new();
        env.shared.push(shared("a", 1));
        let parts = env.clone().split(10);
        assert_eq!(parts, vec![env]);
    }
}
