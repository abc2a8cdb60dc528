//! Convergence fuzzer
//!
//! Drives random local writes from random peers, interleaved with random
//! deliveries over a retransmitting network, then checks that once the
//! network is idle every peer agrees with the host and nothing is left
//! `Pending`. Optionally the host leaves partway through, so the check also
//! covers a host migration with writes still in flight.

use matchsync_core::{SyncResult, UserId, ValidationStatus};
use matchsync_runtime::{PresenceVar, SharedVar, UserVar, VarRegistry};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::environment::{SyncTestEnvironment, TestPeer};
use crate::network::{NetworkConfig, NetworkStats};

/// Fuzzer configuration
#[derive(Clone, Debug)]
pub struct FuzzerConfig {
    /// Number of peers, the first one hosts
    pub peer_count: usize,
    /// Number of local writes
    pub write_count: usize,
    /// Slots in the presence collection
    pub slots: u16,
    /// Probability of delivering packets between two writes
    pub delivery_prob: f64,
    /// Probability of a retransmission per delivery
    pub duplicate_prob: f64,
    /// Write index at which the host leaves the match
    pub host_leaves_at: Option<usize>,
    /// Random seed
    pub seed: u64,
}

impl Default for FuzzerConfig {
    fn default() -> Self {
        FuzzerConfig {
            peer_count: 4,
            write_count: 200,
            slots: 4,
            delivery_prob: 0.5,
            duplicate_prob: 0.1,
            host_leaves_at: None,
            seed: 42,
        }
    }
}

impl FuzzerConfig {
    /// Light fuzzing for quick tests
    pub fn light() -> Self {
        FuzzerConfig {
            peer_count: 3,
            write_count: 50,
            slots: 3,
            delivery_prob: 0.5,
            duplicate_prob: 0.1,
            host_leaves_at: None,
            seed: 42,
        }
    }

    /// Heavy fuzzing, more peers than presence slots and a host migration
    pub fn heavy() -> Self {
        FuzzerConfig {
            peer_count: 6,
            write_count: 2000,
            slots: 4,
            delivery_prob: 0.3,
            duplicate_prob: 0.2,
            host_leaves_at: Some(1000),
            seed: 42,
        }
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Make the host leave before write `at`
    pub fn with_host_migration(mut self, at: usize) -> Self {
        self.host_leaves_at = Some(at);
        self
    }
}

/// Variables every fuzzed peer declares
#[derive(Clone)]
pub struct FuzzVars {
    pub score: SharedVar<i64>,
    pub name: UserVar<String>,
    pub pos: PresenceVar<f64>,
}

impl FuzzVars {
    pub fn declare(registry: &VarRegistry, slots: u16) -> SyncResult<Self> {
        Ok(FuzzVars {
            score: registry.declare_shared("score")?,
            name: registry.declare_user("name")?,
            pos: registry.declare_presence("pos", slots)?,
        })
    }
}

/// Outcome of one fuzz run
#[derive(Clone, Debug, Default)]
pub struct FuzzResult {
    pub writes: u64,
    pub deliveries: u64,
    /// Descriptions of every disagreement found
    pub divergent: Vec<String>,
    /// Entries still `Pending` after the network went idle
    pub pending: usize,
    pub all_ready: bool,
    /// Host that took over after the original one left
    pub new_host: Option<UserId>,
    pub network: NetworkStats,
}

impl FuzzResult {
    pub fn is_converged(&self) -> bool {
        self.all_ready && self.divergent.is_empty() && self.pending == 0
    }
}

pub struct ConvergenceFuzzer {
    config: FuzzerConfig,
    env: SyncTestEnvironment<FuzzVars>,
    rng: StdRng,
}

impl ConvergenceFuzzer {
    pub fn new(config: FuzzerConfig) -> Self {
        let slots = config.slots;
        let network = NetworkConfig::default()
            .with_seed(config.seed)
            .with_duplicate_prob(config.duplicate_prob);
        let env = SyncTestEnvironment::new(network, move |r: &VarRegistry| FuzzVars::declare(r, slots));
        let rng = StdRng::seed_from_u64(config.seed.wrapping_add(1));
        ConvergenceFuzzer { config, env, rng }
    }

    pub fn environment(&self) -> &SyncTestEnvironment<FuzzVars> {
        &self.env
    }

    fn setup(&mut self) -> SyncResult<u64> {
        self.env.create("peer-0")?;
        for i in 1..self.config.peer_count {
            self.env.join(&format!("peer-{}", i))?;
        }
        Ok(self.env.settle() as u64)
    }

    fn random_write(&mut self, users: &[UserId]) {
        let user = &users[self.rng.gen_range(0..users.len())];
        let Some(peer) = self.env.peer(user.as_str()) else {
            return;
        };
        match self.rng.gen_range(0..3) {
            0 => peer.vars.score.set(self.rng.gen_range(-1000..1000)),
            1 => peer.vars.name.set(format!("{}-{}", user, self.rng.gen_range(0..100))),
            _ => peer.vars.pos.set(self.rng.gen_range(0.0..100.0)),
        }
    }

    /// Run the fuzzer
    pub fn run(&mut self) -> SyncResult<FuzzResult> {
        let mut result = FuzzResult {
            deliveries: self.setup()?,
            ..FuzzResult::default()
        };
        let mut users = self.env.user_ids();

        for i in 0..self.config.write_count {
            if self.config.host_leaves_at == Some(i) {
                if let Some(host) = self.env.host_id().cloned() {
                    self.env.leave(host.as_str());
                    users.retain(|u| *u != host);
                    result.new_host = self.env.host_id().cloned();
                }
            }
            self.random_write(&users);
            result.writes += 1;
            if self.rng.gen_bool(self.config.delivery_prob) {
                let burst = self.rng.gen_range(1..=4);
                for _ in 0..burst {
                    if self.env.network_mut().step() {
                        result.deliveries += 1;
                    }
                }
            }
        }
        result.deliveries += self.env.settle() as u64;

        result.all_ready = self.env.peers().all(|p| p.is_ready());
        result.divergent = self.check_convergence(&users);
        result.pending = self.env.peers().map(count_pending).sum();
        result.network = self.env.network().stats();
        Ok(result)
    }

    fn check_convergence(&self, users: &[UserId]) -> Vec<String> {
        let mut divergent = Vec::new();
        let env = &self.env;

        if !env.agree(|p| (p.vars.score.get(), p.vars.score.lock_version(), p.vars.score.status())) {
            divergent.push("score".to_string());
        }
        // entries of a departed peer are left as each peer last saw them
        for user in users {
            if !env.agree(|p| (p.vars.name.get_for(user), p.vars.name.status_for(user))) {
                divergent.push(format!("name[{}]", user));
            }
        }
        let slots = self.config.slots as usize;
        for slot in 0..slots {
            if !env.agree(|p| p.vars.pos.owner(slot)) {
                divergent.push(format!("pos owner {}", slot));
            }
            if !env.agree(|p| {
                (
                    p.vars.pos.get_slot(slot).to_bits(),
                    p.vars.pos.slot_lock_version(slot),
                    p.vars.pos.slot_status(slot),
                )
            }) {
                divergent.push(format!("pos[{}]", slot));
            }
        }
        divergent
    }
}

fn count_pending(peer: &TestPeer<FuzzVars>) -> usize {
    let vars = &peer.vars;
    [vars.score.status(), vars.name.status(), vars.pos.status()]
        .iter()
        .filter(|s| **s == ValidationStatus::Pending)
        .count()
}
