//! Presence-ownership rotator
//!
//! Binds connected peers to the slots of each presence collection. A peer
//! owns at most one slot per collection and a slot has at most one owner.
//! Free slots are handed out lowest index first; peers beyond the slot
//! count stay unassigned until a slot frees up.

use std::collections::{BTreeMap, HashMap};

use matchsync_core::{SyncError, SyncResult, UserId, VarId};
use matchsync_wire::SlotAssignment;

/// Slot ownership for one presence collection
#[derive(Clone, Debug)]
pub struct PresenceVarRotator {
    id: VarId,
    slots: Vec<Option<UserId>>,
    assigned: HashMap<UserId, usize>,
}

impl PresenceVarRotator {
    pub fn new(id: VarId, slot_count: usize) -> Self {
        PresenceVarRotator {
            id,
            slots: vec![None; slot_count],
            assigned: HashMap::new(),
        }
    }

    pub fn id(&self) -> &VarId {
        &self.id
    }

    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    pub fn free_slots(&self) -> usize {
        self.slots.iter().filter(|s| s.is_none()).count()
    }

    /// Give `user` the lowest free slot
    ///
    /// Returns the newly assigned index; `None` when the user already holds
    /// a slot or every slot is taken.
    pub fn assign(&mut self, user: &UserId) -> Option<usize> {
        if self.assigned.contains_key(user) {
            return None;
        }
        let slot = self.slots.iter().position(|s| s.is_none())?;
        self.slots[slot] = Some(user.clone());
        self.assigned.insert(user.clone(), slot);
        Some(slot)
    }

    /// Free the slot held by `user`
    pub fn release(&mut self, user: &UserId) -> Option<usize> {
        let slot = self.assigned.remove(user)?;
        self.slots[slot] = None;
        Some(slot)
    }

    pub fn slot_of(&self, user: &UserId) -> Option<usize> {
        self.assigned.get(user).copied()
    }

    pub fn owner(&self, slot: usize) -> Option<&UserId> {
        self.slots.get(slot).and_then(|s| s.as_ref())
    }

    /// Occupied slots in index order
    pub fn assignments(&self) -> impl Iterator<Item = (usize, &UserId)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(i, s)| s.as_ref().map(|u| (i, u)))
    }

    pub fn clear(&mut self) {
        self.slots.iter_mut().for_each(|s| *s = None);
        self.assigned.clear();
    }

    /// Bind `user` to a specific slot, used when adopting a host table
    fn bind(&mut self, slot: usize, user: UserId) -> SyncResult<()> {
        if slot >= self.slots.len() {
            return Err(SyncError::InvalidWireFormat(format!(
                "slot {} out of range for {}",
                slot, self.id
            )));
        }
        if self.slots[slot].is_some() || self.assigned.contains_key(&user) {
            return Err(SyncError::InvalidWireFormat(format!(
                "conflicting assignment of slot {} in {}",
                slot, self.id
            )));
        }
        self.slots[slot] = Some(user.clone());
        self.assigned.insert(user, slot);
        Ok(())
    }
}

/// Slot change produced by a join or leave
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SlotChange {
    pub id: VarId,
    pub slot: usize,
    pub user: UserId,
}

/// Rotators of every presence collection in a session
#[derive(Clone, Debug, Default)]
pub struct PresenceVarRotators {
    rotators: BTreeMap<VarId, PresenceVarRotator>,
}

impl PresenceVarRotators {
    pub fn new() -> Self {
        PresenceVarRotators::default()
    }

    pub fn add(&mut self, id: VarId, slot_count: usize) {
        self.rotators
            .insert(id.clone(), PresenceVarRotator::new(id, slot_count));
    }

    pub fn get(&self, id: &VarId) -> Option<&PresenceVarRotator> {
        self.rotators.get(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &PresenceVarRotator> {
        self.rotators.values()
    }

    pub fn len(&self) -> usize {
        self.rotators.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rotators.is_empty()
    }

    /// Assign `user` in every collection with a free slot
    pub fn on_join(&mut self, user: &UserId) -> Vec<SlotChange> {
        self.rotators
            .values_mut()
            .filter_map(|r| {
                r.assign(user).map(|slot| SlotChange {
                    id: r.id.clone(),
                    slot,
                    user: user.clone(),
                })
            })
            .collect()
    }

    /// Release `user` everywhere
    pub fn on_leave(&mut self, user: &UserId) -> Vec<SlotChange> {
        self.rotators
            .values_mut()
            .filter_map(|r| {
                r.release(user).map(|slot| SlotChange {
                    id: r.id.clone(),
                    slot,
                    user: user.clone(),
                })
            })
            .collect()
    }

    /// Flattened assignment table, sorted by collection then slot
    pub fn assignments(&self) -> Vec<SlotAssignment> {
        self.rotators
            .values()
            .flat_map(|r| {
                r.assignments().map(move |(slot, user)| SlotAssignment {
                    id: r.id.clone(),
                    slot: slot as u16,
                    user_id: user.clone(),
                })
            })
            .collect()
    }

    /// Replace every table with the given assignments
    ///
    /// On error the previous tables are kept.
    pub fn restore(&mut self, assignments: &[SlotAssignment]) -> SyncResult<()> {
        let mut next = self.rotators.clone();
        next.values_mut().for_each(PresenceVarRotator::clear);
        for a in assignments {
            let rotator = next
                .get_mut(&a.id)
                .ok_or_else(|| SyncError::UnknownKey(a.id.clone()))?;
            rotator.bind(a.slot as usize, a.user_id.clone())?;
        }
        self.rotators = next;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use matchsync_core::VarKind;
    use proptest::prelude::*;

    fn pos() -> VarId {
        VarId::presence(VarKind::Float, "pos")
    }

    fn user(s: &str) -> UserId {
        UserId::new(s)
    }

    #[test]
    fn test_assign_lowest_free() {
        let mut r = PresenceVarRotator::new(pos(), 3);
        assert_eq!(r.assign(&user("a")), Some(0));
        assert_eq!(r.assign(&user("b")), Some(1));
        assert_eq!(r.assign(&user("c")), Some(2));
        assert_eq!(r.release(&user("b")), Some(1));
        assert_eq!(r.assign(&user("d")), Some(1));
        assert_eq!(r.owner(1), Some(&user("d")));
    }

    #[test]
    fn test_oversubscription_is_noop() {
        let mut r = PresenceVarRotator::new(pos(), 1);
        assert_eq!(r.assign(&user("a")), Some(0));
        assert_eq!(r.assign(&user("b")), None);
        assert_eq!(r.slot_of(&user("b")), None);
        assert_eq!(r.free_slots(), 0);
    }

    #[test]
    fn test_double_assign_keeps_slot() {
        let mut r = PresenceVarRotator::new(pos(), 2);
        r.assign(&user("a"));
        assert_eq!(r.assign(&user("a")), None);
        assert_eq!(r.slot_of(&user("a")), Some(0));
        assert_eq!(r.free_slots(), 1);
    }

    #[test]
    fn test_release_unknown() {
        let mut r = PresenceVarRotator::new(pos(), 2);
        assert_eq!(r.release(&user("ghost")), None);
    }

    #[test]
    fn test_fan_out_join_leave() {
        let mut rotators = PresenceVarRotators::new();
        rotators.add(pos(), 2);
        rotators.add(VarId::presence(VarKind::Int, "hp"), 1);

        assert_eq!(rotators.on_join(&user("a")).len(), 2);
        // hp is full
        assert_eq!(rotators.on_join(&user("b")).len(), 1);
        assert_eq!(rotators.on_leave(&user("a")).len(), 2);
        assert_eq!(rotators.on_join(&user("b")).len(), 1);
    }

    #[test]
    fn test_restore_assignments() {
        let mut rotators = PresenceVarRotators::new();
        rotators.add(pos(), 3);
        rotators.on_join(&user("x"));

        let table = vec![
            SlotAssignment { id: pos(), slot: 2, user_id: user("a") },
            SlotAssignment { id: pos(), slot: 0, user_id: user("b") },
        ];
        rotators.restore(&table).unwrap();

        let r = rotators.get(&pos()).unwrap();
        assert_eq!(r.slot_of(&user("x")), None);
        assert_eq!(r.slot_of(&user("a")), Some(2));
        assert_eq!(r.owner(0), Some(&user("b")));
        assert_eq!(r.free_slots(), 1);
    }

    #[test]
    fn test_restore_conflict_keeps_previous() {
        let mut rotators = PresenceVarRotators::new();
        rotators.add(pos(), 2);
        rotators.on_join(&user("x"));

        let table = vec![
            SlotAssignment { id: pos(), slot: 0, user_id: user("a") },
            SlotAssignment { id: pos(), slot: 0, user_id: user("b") },
        ];
        assert!(rotators.restore(&table).is_err());
        assert_eq!(rotators.get(&pos()).unwrap().slot_of(&user("x")), Some(0));

        let unknown = vec![SlotAssignment {
            id: VarId::presence(VarKind::Int, "nope"),
            slot: 0,
            user_id: user("a"),
        }];
        assert!(matches!(rotators.restore(&unknown), Err(SyncError::UnknownKey(_))));
    }

    #[derive(Clone, Debug)]
    enum Op {
        Join(u8),
        Leave(u8),
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![(0u8..8).prop_map(Op::Join), (0u8..8).prop_map(Op::Leave)]
    }

    proptest! {
        #[test]
        fn prop_slots_stay_exclusive(slots in 1usize..5, ops in prop::collection::vec(op(), 0..64)) {
            let mut r = PresenceVarRotator::new(pos(), slots);
            let mut connected = std::collections::BTreeSet::new();

            for op in ops {
                match op {
                    Op::Join(u) => {
                        connected.insert(u);
                        r.assign(&user(&u.to_string()));
                    }
                    Op::Leave(u) => {
                        connected.remove(&u);
                        r.release(&user(&u.to_string()));
                    }
                }

                let owners: Vec<&UserId> = r.assignments().map(|(_, u)| u).collect();
                let mut unique = owners.clone();
                unique.sort();
                unique.dedup();
                prop_assert_eq!(owners.len(), unique.len());

                for (slot, owner) in r.assignments() {
                    prop_assert_eq!(r.slot_of(owner), Some(slot));
                }
                // never more owners than connected peers or slots
                prop_assert!(owners.len() <= connected.len().min(slots));
            }
        }
    }
}
