//! Presence and host tracking
//!
//! Both trackers are written only from transport notifications.

use std::collections::BTreeMap;

use matchsync_core::{Presence, UserId};

/// Connected peers of a match, self included
#[derive(Clone, Debug)]
pub struct PresenceTracker {
    self_presence: Presence,
    others: BTreeMap<UserId, Presence>,
}

impl PresenceTracker {
    pub fn new(self_presence: Presence, presences: impl IntoIterator<Item = Presence>) -> Self {
        let mut tracker = PresenceTracker {
            self_presence,
            others: BTreeMap::new(),
        };
        for p in presences {
            tracker.on_join(p);
        }
        tracker
    }

    pub fn self_presence(&self) -> &Presence {
        &self.self_presence
    }

    pub fn self_id(&self) -> &UserId {
        &self.self_presence.user_id
    }

    /// Everyone connected, sorted by user id
    pub fn presences(&self) -> Vec<&Presence> {
        let mut all: Vec<&Presence> = self.others.values().collect();
        let pos = all
            .binary_search_by(|p| p.user_id.cmp(self.self_id()))
            .unwrap_or_else(|i| i);
        all.insert(pos, &self.self_presence);
        all
    }

    /// User ids of everyone connected, sorted
    pub fn user_ids(&self) -> Vec<UserId> {
        self.presences().into_iter().map(|p| p.user_id.clone()).collect()
    }

    pub fn others(&self) -> impl Iterator<Item = &Presence> {
        self.others.values()
    }

    pub fn contains(&self, user: &UserId) -> bool {
        user == self.self_id() || self.others.contains_key(user)
    }

    pub fn len(&self) -> usize {
        self.others.len() + 1
    }

    pub fn is_empty(&self) -> bool {
        false
    }

    /// Returns false when the user was already known
    pub fn on_join(&mut self, presence: Presence) -> bool {
        if presence.user_id == self.self_presence.user_id {
            return false;
        }
        self.others
            .insert(presence.user_id.clone(), presence)
            .is_none()
    }

    /// Self never leaves through here
    pub fn on_leave(&mut self, user: &UserId) -> Option<Presence> {
        self.others.remove(user)
    }
}

/// Current host of the match
#[derive(Clone, Debug)]
pub struct HostTracker {
    self_id: UserId,
    host: Presence,
}

impl HostTracker {
    pub fn new(self_id: UserId, host: Presence) -> Self {
        HostTracker { self_id, host }
    }

    pub fn host(&self) -> &Presence {
        &self.host
    }

    pub fn host_id(&self) -> &UserId {
        &self.host.user_id
    }

    pub fn is_host(&self, user: &UserId) -> bool {
        &self.host.user_id == user
    }

    pub fn is_self_host(&self) -> bool {
        self.host.user_id == self.self_id
    }

    /// Returns true when the host actually changed
    pub fn set_host(&mut self, host: Presence) -> bool {
        if host.user_id == self.host.user_id {
            return false;
        }
        self.host = host;
        true
    }
}
