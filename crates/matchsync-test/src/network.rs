//! In-memory match network
//!
//! Every peer gets a `PeerTransport` that queues payloads on a per
//! (sender, receiver) link. Links are FIFO, like a match relay; the
//! network interleaves links at random from a seeded RNG and can
//! retransmit packets to exercise idempotent ingress.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::Arc;

use bytes::Bytes;
use matchsync_core::{SyncError, SyncResult, UserId};
use matchsync_runtime::{SyncMatch, Transport};
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::trace;

/// Network behaviour
#[derive(Clone, Debug)]
pub struct NetworkConfig {
    /// Probability that a delivered packet is queued again (0.0 - 1.0)
    pub duplicate_prob: f64,
    /// Random seed
    pub seed: u64,
    /// Upper bound on deliveries per `run_until_idle`
    pub max_steps: usize,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        NetworkConfig {
            duplicate_prob: 0.0,
            seed: 42,
            max_steps: 100_000,
        }
    }
}

impl NetworkConfig {
    /// Every packet delivered exactly once
    pub fn reliable() -> Self {
        Self::default()
    }

    /// Frequent retransmissions
    pub fn duplicating() -> Self {
        NetworkConfig {
            duplicate_prob: 0.25,
            ..Self::default()
        }
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_duplicate_prob(mut self, prob: f64) -> Self {
        self.duplicate_prob = prob.clamp(0.0, 0.9);
        self
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct NetworkStats {
    /// Packets queued by senders
    pub sent: u64,
    pub delivered: u64,
    pub duplicated: u64,
    /// Packets addressed to a peer that was not connected
    pub undeliverable: u64,
}

#[derive(Clone, Debug)]
struct Packet {
    opcode: i64,
    payload: Bytes,
}

type Link = (UserId, UserId);

#[derive(Default)]
struct Links {
    connected: BTreeSet<UserId>,
    queues: BTreeMap<Link, VecDeque<Packet>>,
    stats: NetworkStats,
}

/// Outbound side handed to one peer's session
pub struct PeerTransport {
    user_id: UserId,
    links: Arc<Mutex<Links>>,
}

impl PeerTransport {
    pub fn user_id(&self) -> &UserId {
        &self.user_id
    }
}

impl Transport for PeerTransport {
    fn send(&self, opcode: i64, payload: Bytes, targets: Option<&[UserId]>) -> SyncResult<()> {
        let mut links = self.links.lock();
        if !links.connected.contains(&self.user_id) {
            return Err(SyncError::Transport(format!("{} is not connected", self.user_id)));
        }
        let recipients: Vec<UserId> = match targets {
            Some(targets) => targets.to_vec(),
            None => links
                .connected
                .iter()
                .filter(|u| **u != self.user_id)
                .cloned()
                .collect(),
        };
        for to in recipients {
            if !links.connected.contains(&to) {
                links.stats.undeliverable += 1;
                continue;
            }
            links.stats.sent += 1;
            links
                .queues
                .entry((self.user_id.clone(), to))
                .or_default()
                .push_back(Packet {
                    opcode,
                    payload: payload.clone(),
                });
        }
        Ok(())
    }
}

/// Relays packets between attached sessions
pub struct MatchNetwork {
    config: NetworkConfig,
    links: Arc<Mutex<Links>>,
    sessions: BTreeMap<UserId, SyncMatch>,
    rng: StdRng,
}

impl MatchNetwork {
    pub fn new(config: NetworkConfig) -> Self {
        let rng = StdRng::seed_from_u64(config.seed);
        MatchNetwork {
            config,
            links: Arc::new(Mutex::new(Links::default())),
            sessions: BTreeMap::new(),
            rng,
        }
    }

    /// Connect a peer and hand out its transport
    ///
    /// Packets addressed to the peer queue up until a session is attached.
    pub fn connect(&mut self, user: &UserId) -> Arc<PeerTransport> {
        self.links.lock().connected.insert(user.clone());
        Arc::new(PeerTransport {
            user_id: user.clone(),
            links: self.links.clone(),
        })
    }

    pub fn attach(&mut self, user: &UserId, session: SyncMatch) {
        self.sessions.insert(user.clone(), session);
    }

    /// Disconnect a peer, dropping everything in flight to or from it
    pub fn disconnect(&mut self, user: &UserId) -> Option<SyncMatch> {
        let mut links = self.links.lock();
        links.connected.remove(user);
        links.queues.retain(|(from, to), _| from != user && to != user);
        drop(links);
        self.sessions.remove(user)
    }

    pub fn is_connected(&self, user: &UserId) -> bool {
        self.links.lock().connected.contains(user)
    }

    /// Packets queued on all links
    pub fn in_flight(&self) -> usize {
        self.links.lock().queues.values().map(VecDeque::len).sum()
    }

    pub fn in_flight_on(&self, from: &UserId, to: &UserId) -> usize {
        self.links
            .lock()
            .queues
            .get(&(from.clone(), to.clone()))
            .map_or(0, VecDeque::len)
    }

    pub fn stats(&self) -> NetworkStats {
        self.links.lock().stats.clone()
    }

    /// Take the next packet from `link`, possibly queueing a retransmission
    fn pop(&mut self, link: &Link) -> Option<Packet> {
        let mut links = self.links.lock();
        let packet = links.queues.get_mut(link)?.pop_front()?;
        links.stats.delivered += 1;
        if self.config.duplicate_prob > 0.0 && self.rng.gen_bool(self.config.duplicate_prob) {
            links.stats.duplicated += 1;
            if let Some(queue) = links.queues.get_mut(link) {
                queue.push_back(packet.clone());
            }
        }
        Some(packet)
    }

    fn deliver(&mut self, link: Link) -> bool {
        let Some(packet) = self.pop(&link) else {
            return false;
        };
        let (from, to) = link;
        trace!(%from, %to, opcode = packet.opcode, "deliver");
        // the session may send while handling, so no network lock is held here
        if let Some(session) = self.sessions.get(&to).cloned() {
            session.handle_match_state(&from, packet.opcode, &packet.payload);
        }
        true
    }

    /// Deliver the oldest packet on one link
    pub fn deliver_one(&mut self, from: &UserId, to: &UserId) -> bool {
        self.deliver((from.clone(), to.clone()))
    }

    /// Deliver one packet from a random non-empty link
    pub fn step(&mut self) -> bool {
        let ready: Vec<Link> = {
            let links = self.links.lock();
            links
                .queues
                .iter()
                .filter(|(link, queue)| !queue.is_empty() && self.sessions.contains_key(&link.1))
                .map(|(link, _)| link.clone())
                .collect()
        };
        if ready.is_empty() {
            return false;
        }
        let pick = self.rng.gen_range(0..ready.len());
        self.deliver(ready[pick].clone())
    }

    /// Deliver until nothing is left, returning the number of deliveries
    pub fn run_until_idle(&mut self) -> usize {
        let mut steps = 0;
        while steps < self.config.max_steps && self.step() {
            steps += 1;
        }
        steps
    }
}
