//! Multi-peer test environment
//!
//! Builds a match of real `SyncMatch` sessions over a [`MatchNetwork`],
//! playing the part of the match transport: it connects peers, reports
//! joins, leaves and host changes to everyone, and relays traffic.

use std::collections::BTreeMap;
use std::sync::Arc;

use matchsync_core::{Presence, SyncError, SyncResult, UserId};
use matchsync_runtime::{FlushMode, MatchInfo, Phase, SyncConfig, SyncMatch, VarRegistry};
use parking_lot::Mutex;
use tracing::debug;

use crate::network::{MatchNetwork, NetworkConfig};

/// One peer of the test match
pub struct TestPeer<H> {
    pub user_id: UserId,
    pub registry: VarRegistry,
    /// Handles returned by the declare function
    pub vars: H,
    pub session: SyncMatch,
    errors: Arc<Mutex<Vec<SyncError>>>,
}

impl<H> TestPeer<H> {
    /// Errors seen by this peer's error handler
    pub fn errors(&self) -> Vec<SyncError> {
        self.errors.lock().clone()
    }

    pub fn phase(&self) -> Phase {
        self.session.phase()
    }

    pub fn is_ready(&self) -> bool {
        self.session.is_ready()
    }
}

type Declare<H> = Box<dyn Fn(&VarRegistry) -> SyncResult<H>>;

pub struct SyncTestEnvironment<H> {
    network: MatchNetwork,
    declare: Declare<H>,
    peers: BTreeMap<UserId, TestPeer<H>>,
    host: Option<UserId>,
    flush_mode: FlushMode,
    match_id: String,
}

impl<H> SyncTestEnvironment<H> {
    /// `declare` runs against every new peer's registry
    pub fn new(network: NetworkConfig, declare: impl Fn(&VarRegistry) -> SyncResult<H> + 'static) -> Self {
        SyncTestEnvironment {
            network: MatchNetwork::new(network),
            declare: Box::new(declare),
            peers: BTreeMap::new(),
            host: None,
            flush_mode: FlushMode::Immediate,
            match_id: "test-match".to_string(),
        }
    }

    pub fn with_flush_mode(mut self, flush_mode: FlushMode) -> Self {
        self.flush_mode = flush_mode;
        self
    }

    fn config(&self) -> (SyncConfig, Arc<Mutex<Vec<SyncError>>>) {
        let errors = Arc::new(Mutex::new(Vec::new()));
        let sink = errors.clone();
        let config = SyncConfig::default()
            .with_flush_mode(self.flush_mode)
            .with_error_handler(move |e: &SyncError| sink.lock().push(e.clone()));
        (config, errors)
    }

    /// Create the match with `user` as host
    pub fn create(&mut self, user: &str) -> SyncResult<&TestPeer<H>> {
        if self.host.is_some() {
            return Err(SyncError::InvalidDeclaration("match already created".into()));
        }
        let user_id = UserId::new(user);
        let registry = VarRegistry::new();
        let vars = (self.declare)(&registry)?;
        let (config, errors) = self.config();

        let me = Presence::from_user(user_id.clone());
        let transport = self.network.connect(&user_id);
        let info = MatchInfo::new(self.match_id.clone(), me.clone(), me);
        let session = SyncMatch::create(&registry, info, transport, config)?;
        self.network.attach(&user_id, session.clone());
        self.host = Some(user_id.clone());
        debug!(host = %user_id, "test match created");

        Ok(self.insert(TestPeer {
            user_id,
            registry,
            vars,
            session,
            errors,
        }))
    }

    /// Join with the environment's declare function
    pub fn join(&mut self, user: &str) -> SyncResult<&TestPeer<H>> {
        let registry = VarRegistry::new();
        let vars = (self.declare)(&registry)?;
        self.join_with_registry(user, registry, vars)
    }

    /// Join with a different set of declarations
    pub fn join_with(
        &mut self,
        user: &str,
        declare: impl FnOnce(&VarRegistry) -> SyncResult<H>,
    ) -> SyncResult<&TestPeer<H>> {
        let registry = VarRegistry::new();
        let vars = declare(&registry)?;
        self.join_with_registry(user, registry, vars)
    }

    fn join_with_registry(&mut self, user: &str, registry: VarRegistry, vars: H) -> SyncResult<&TestPeer<H>> {
        let host = self.host.clone().ok_or(SyncError::SessionClosed)?;
        let user_id = UserId::new(user);
        let me = Presence::from_user(user_id.clone());

        for peer in self.peers.values() {
            peer.session.handle_presence_joined(me.clone());
        }
        let others: Vec<Presence> = self
            .peers
            .keys()
            .map(|u| Presence::from_user(u.clone()))
            .collect();

        let (config, errors) = self.config();
        let transport = self.network.connect(&user_id);
        let info = MatchInfo::new(self.match_id.clone(), me, Presence::from_user(host)).with_presences(others);
        let session = SyncMatch::join(&registry, info, transport, config)?;
        self.network.attach(&user_id, session.clone());

        Ok(self.insert(TestPeer {
            user_id,
            registry,
            vars,
            session,
            errors,
        }))
    }

    fn insert(&mut self, peer: TestPeer<H>) -> &TestPeer<H> {
        let user_id = peer.user_id.clone();
        self.peers.entry(user_id).or_insert(peer)
    }

    /// Remove a peer; a departing host is replaced by the lowest user id
    pub fn leave(&mut self, user: &str) -> Option<TestPeer<H>> {
        let user_id = UserId::new(user);
        self.network.disconnect(&user_id);
        let peer = self.peers.remove(&user_id)?;
        peer.session.dispose();

        for other in self.peers.values() {
            other.session.handle_presence_left(&user_id);
        }
        if self.host.as_ref() == Some(&user_id) {
            self.host = self.peers.keys().next().cloned();
            if let Some(host) = &self.host {
                debug!(%host, "host migrated");
                let presence = Presence::from_user(host.clone());
                for other in self.peers.values() {
                    other.session.handle_host_changed(presence.clone());
                }
            }
        }
        Some(peer)
    }

    /// Deliver everything in flight
    pub fn settle(&mut self) -> usize {
        self.network.run_until_idle()
    }

    pub fn network(&self) -> &MatchNetwork {
        &self.network
    }

    pub fn network_mut(&mut self) -> &mut MatchNetwork {
        &mut self.network
    }

    pub fn host_id(&self) -> Option<&UserId> {
        self.host.as_ref()
    }

    pub fn peer(&self, user: &str) -> Option<&TestPeer<H>> {
        self.peers.get(&UserId::new(user))
    }

    pub fn peers(&self) -> impl Iterator<Item = &TestPeer<H>> {
        self.peers.values()
    }

    pub fn user_ids(&self) -> Vec<UserId> {
        self.peers.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// True when `f` yields the same value on every peer
    pub fn agree<T: PartialEq>(&self, f: impl Fn(&TestPeer<H>) -> T) -> bool {
        let mut values = self.peers.values().map(f);
        match values.next() {
            Some(first) => values.all(|v| v == first),
            None => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use matchsync_runtime::SharedVar;

    fn env() -> SyncTestEnvironment<SharedVar<i64>> {
        SyncTestEnvironment::new(NetworkConfig::reliable(), |r: &VarRegistry| r.declare_shared::<i64>("score"))
    }

    #[test]
    fn test_guests_become_ready() {
        let mut env = env();
        env.create("h").unwrap();
        env.join("a").unwrap();
        env.join("b").unwrap();
        assert!(!env.peer("a").unwrap().is_ready());

        env.settle();
        assert!(env.peers().all(|p| p.is_ready()));
        assert_eq!(env.host_id(), Some(&UserId::new("h")));
    }

    #[test]
    fn test_join_requires_host() {
        let mut env = env();
        assert!(matches!(env.join("a"), Err(SyncError::SessionClosed)));
    }

    #[test]
    fn test_host_leave_migrates() {
        let mut env = env();
        env.create("h").unwrap();
        env.join("b").unwrap();
        env.join("a").unwrap();
        env.settle();

        env.leave("h").unwrap();
        assert_eq!(env.host_id(), Some(&UserId::new("a")));
        assert!(env.peer("a").unwrap().session.is_host());
        assert!(!env.peer("b").unwrap().session.is_host());
    }
}
