//! Change listeners
//!
//! Callbacks are collected while the session lock is held and invoked
//! after it is released, so a callback may freely read or write variables.

use std::collections::HashMap;
use std::sync::Arc;

use matchsync_core::VarId;
use matchsync_state::{PresenceChange, SyncEvent, VarChange};

pub type ValueCallback = Arc<dyn Fn(&VarChange) + Send + Sync>;
pub type PresenceCallback = Arc<dyn Fn(&PresenceChange) + Send + Sync>;

/// Returned by every subscription, used to unsubscribe
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle {
    id: u64,
    var: VarId,
}

impl SubscriptionHandle {
    pub fn var(&self) -> &VarId {
        &self.var
    }
}

#[derive(Default)]
pub struct ListenerSet {
    next_id: u64,
    values: HashMap<VarId, Vec<(u64, ValueCallback)>>,
    presences: HashMap<VarId, Vec<(u64, PresenceCallback)>>,
}

impl ListenerSet {
    pub fn new() -> Self {
        ListenerSet::default()
    }

    fn next_handle(&mut self, var: &VarId) -> SubscriptionHandle {
        self.next_id += 1;
        SubscriptionHandle {
            id: self.next_id,
            var: var.clone(),
        }
    }

    pub fn on_value(&mut self, var: &VarId, callback: ValueCallback) -> SubscriptionHandle {
        let handle = self.next_handle(var);
        self.values
            .entry(var.clone())
            .or_default()
            .push((handle.id, callback));
        handle
    }

    pub fn on_presence(&mut self, var: &VarId, callback: PresenceCallback) -> SubscriptionHandle {
        let handle = self.next_handle(var);
        self.presences
            .entry(var.clone())
            .or_default()
            .push((handle.id, callback));
        handle
    }

    /// Returns false when the handle was not subscribed
    pub fn unsubscribe(&mut self, handle: &SubscriptionHandle) -> bool {
        let mut removed = false;
        if let Some(list) = self.values.get_mut(&handle.var) {
            let before = list.len();
            list.retain(|(id, _)| *id != handle.id);
            removed |= list.len() != before;
        }
        if let Some(list) = self.presences.get_mut(&handle.var) {
            let before = list.len();
            list.retain(|(id, _)| *id != handle.id);
            removed |= list.len() != before;
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.values.values().map(Vec::len).sum::<usize>()
            + self.presences.values().map(Vec::len).sum::<usize>()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&mut self) {
        self.values.clear();
        self.presences.clear();
    }

    /// Pair each event with the callbacks subscribed to its variable
    pub fn collect(&self, events: Vec<SyncEvent>) -> Dispatch {
        let mut calls = Vec::new();
        for event in events {
            match event {
                SyncEvent::Value(change) => {
                    if let Some(list) = self.values.get(&change.id) {
                        for (_, cb) in list {
                            calls.push(PendingCall::Value(cb.clone(), change.clone()));
                        }
                    }
                }
                SyncEvent::Presence(change) => {
                    if let Some(list) = self.presences.get(&change.id) {
                        for (_, cb) in list {
                            calls.push(PendingCall::Presence(cb.clone(), change.clone()));
                        }
                    }
                }
            }
        }
        Dispatch { calls }
    }
}

enum PendingCall {
    Value(ValueCallback, VarChange),
    Presence(PresenceCallback, PresenceChange),
}

/// Callbacks ready to run once the lock is gone
#[must_use]
#[derive(Default)]
pub struct Dispatch {
    calls: Vec<PendingCall>,
}

impl Dispatch {
    pub fn len(&self) -> usize {
        self.calls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }

    pub fn run(self) {
        for call in self.calls {
            match call {
                PendingCall::Value(cb, change) => cb(&change),
                PendingCall::Presence(cb, change) => cb(&change),
            }
        }
    }
}
