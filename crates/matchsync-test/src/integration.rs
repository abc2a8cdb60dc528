//! End-to-end match scenarios
//!
//! Each scenario builds a match over the in-memory network and returns a
//! report of what the peers observed:
//! - Slot reassignment after a leave
//! - Host-authoritative validation with stale acks
//! - Handshake rejection on mismatched declarations
//! - A flag broadcast over a retransmitting network

use std::collections::BTreeMap;
use std::sync::Arc;

use matchsync_core::{SyncError, SyncResult, UserId, ValidationStatus};
use matchsync_runtime::{Phase, SharedVar, VarRegistry};
use parking_lot::Mutex;

use crate::environment::SyncTestEnvironment;
use crate::network::NetworkConfig;

// ============================================================================
// SLOT REASSIGNMENT
// ============================================================================

/// Observations from the leave/rejoin scenario
#[derive(Clone, Debug, Default)]
pub struct ReassignmentReport {
    /// Owner of slot 0 before the leave
    pub first_owner: Option<UserId>,
    /// Peer that had no slot before the leave
    pub unassigned: Option<UserId>,
    /// Slot 0 right after the leave as (value, lock version, status), one per remaining peer
    pub reset_values: Vec<(f64, u64, ValidationStatus)>,
    /// Owner of slot 0 once the fourth peer joined, one per peer
    pub new_owners: Vec<Option<UserId>>,
    pub joiner: UserId,
}

/// Three peers over two slots; the owner of slot 0 leaves and a fourth joins
pub fn slot_reassignment() -> SyncResult<ReassignmentReport> {
    let mut env = SyncTestEnvironment::new(NetworkConfig::reliable(), |r: &VarRegistry| {
        r.declare_presence::<f64>("pos", 2)
    });
    env.create("h")?;
    env.join("a")?;
    env.join("b")?;
    env.settle();

    for peer in env.peers() {
        peer.vars.set(1.5);
    }
    env.settle();

    let mut report = ReassignmentReport {
        joiner: UserId::new("c"),
        ..ReassignmentReport::default()
    };
    if let Some(host) = env.peer("h") {
        report.first_owner = host.vars.owner(0);
        report.unassigned = env
            .user_ids()
            .into_iter()
            .find(|u| host.vars.slot_of(u).is_none());
    }
    let Some(leaver) = report.first_owner.clone() else {
        return Ok(report);
    };

    env.leave(leaver.as_str());
    env.settle();
    report.reset_values = env
        .peers()
        .map(|p| (p.vars.get_slot(0), p.vars.slot_lock_version(0), p.vars.slot_status(0)))
        .collect();

    env.join(report.joiner.as_str())?;
    env.settle();
    report.new_owners = env.peers().map(|p| p.vars.owner(0)).collect();
    Ok(report)
}

// ============================================================================
// HOST VALIDATION
// ============================================================================

/// Guest status at each step of the validation scenario
#[derive(Clone, Debug, Default)]
pub struct ValidationReport {
    /// Right after two quick local writes
    pub after_write: Option<(ValidationStatus, u64)>,
    /// After the host answered the first write only
    pub after_first_ack: Option<(ValidationStatus, u64)>,
    /// After the host answered both writes
    pub after_second_ack: Option<(ValidationStatus, u64)>,
    pub host_value: i64,
    pub guest_value: i64,
}

/// A guest writes twice before the host answers; the first ack is stale
pub fn host_validation() -> SyncResult<ValidationReport> {
    let mut env = SyncTestEnvironment::new(NetworkConfig::reliable(), |r: &VarRegistry| {
        r.declare_shared::<i64>("score")
    });
    env.create("h")?;
    env.join("g")?;
    env.settle();

    let (h, g) = (UserId::new("h"), UserId::new("g"));
    let mut report = ValidationReport::default();
    let status = |env: &SyncTestEnvironment<SharedVar<i64>>| {
        env.peer("g").map(|p| (p.vars.status(), p.vars.lock_version()))
    };

    if let Some(guest) = env.peer("g") {
        guest.vars.set(10);
        guest.vars.set(20);
    }
    report.after_write = status(&env);

    // each write went out in its own envelope
    env.network_mut().deliver_one(&g, &h);
    env.network_mut().deliver_one(&h, &g);
    report.after_first_ack = status(&env);

    env.settle();
    report.after_second_ack = status(&env);

    report.host_value = env.peer("h").map_or(0, |p| p.vars.get());
    report.guest_value = env.peer("g").map_or(0, |p| p.vars.get());
    Ok(report)
}

// ============================================================================
// HANDSHAKE REJECTION
// ============================================================================

#[derive(Clone, Debug)]
pub struct RejectionReport {
    pub guest_phase: Phase,
    pub guest_errors: Vec<SyncError>,
    /// Packets queued after the guest wrote post-failure
    pub in_flight_after_write: usize,
    pub host_value: bool,
}

type Flags = BTreeMap<String, SharedVar<bool>>;

fn declare_flags(registry: &VarRegistry, keys: &[&str]) -> SyncResult<Flags> {
    keys.iter()
        .map(|k| -> SyncResult<(String, SharedVar<bool>)> {
            Ok((k.to_string(), registry.declare_shared::<bool>(*k)?))
        })
        .collect()
}

/// Host declares `{A, B}`, the guest `{A, C}`
pub fn handshake_rejection() -> SyncResult<RejectionReport> {
    let mut env = SyncTestEnvironment::new(NetworkConfig::reliable(), |r: &VarRegistry| {
        declare_flags(r, &["A", "B"])
    });
    env.create("h")?;
    env.join_with("g", |r| declare_flags(r, &["A", "C"]))?;
    env.settle();

    let Some(guest) = env.peer("g") else {
        return Err(SyncError::SessionClosed);
    };
    if let Some(a) = guest.vars.get("A") {
        a.set(true);
    }
    Ok(RejectionReport {
        guest_phase: guest.phase(),
        guest_errors: guest.errors(),
        in_flight_after_write: env.network().in_flight(),
        host_value: env
            .peer("h")
            .and_then(|p| p.vars.get("A").map(|v| v.get()))
            .unwrap_or(false),
    })
}

// ============================================================================
// READY FLAG
// ============================================================================

/// What one guest saw of the flag
#[derive(Clone, Debug, PartialEq)]
pub struct FlagObservation {
    pub user_id: UserId,
    pub value: bool,
    pub status: ValidationStatus,
    pub lock_version: u64,
    pub firings: usize,
}

#[derive(Clone, Debug)]
pub struct ReadyReport {
    pub host_status: ValidationStatus,
    pub host_version: u64,
    pub guests: Vec<FlagObservation>,
    pub duplicated: u64,
}

/// Host sets `ready = true` while the network retransmits
pub fn ready_flag(seed: u64) -> SyncResult<ReadyReport> {
    let network = NetworkConfig::duplicating().with_seed(seed);
    let mut env = SyncTestEnvironment::new(network, |r: &VarRegistry| r.declare_shared::<bool>("ready"));
    env.create("h")?;
    env.join("g1")?;
    env.join("g2")?;
    env.settle();

    let mut counters = Vec::new();
    for peer in env.peers().filter(|p| p.user_id.as_str() != "h") {
        let count = Arc::new(Mutex::new(0usize));
        let sink = count.clone();
        peer.vars.on_value_changed(move |_| *sink.lock() += 1);
        counters.push((peer.user_id.clone(), count));
    }

    let (host_status, host_version) = match env.peer("h") {
        Some(host) => {
            host.vars.set(true);
            (host.vars.status(), host.vars.lock_version())
        }
        None => return Err(SyncError::SessionClosed),
    };
    env.settle();

    let guests = counters
        .into_iter()
        .filter_map(|(user_id, count)| {
            let peer = env.peer(user_id.as_str())?;
            let firings = *count.lock();
            Some(FlagObservation {
                value: peer.vars.get(),
                status: peer.vars.status(),
                lock_version: peer.vars.lock_version(),
                firings,
                user_id,
            })
        })
        .collect();

    Ok(ReadyReport {
        host_status,
        host_version,
        guests,
        duplicated: env.network().stats().duplicated,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use matchsync_runtime::UserVar;

    #[test]
    fn test_slot_reassignment() {
        let report = slot_reassignment().unwrap();
        assert_eq!(report.first_owner, Some(UserId::new("h")));
        assert_eq!(report.unassigned, Some(UserId::new("b")));

        assert_eq!(report.reset_values.len(), 2);
        for (value, version, status) in &report.reset_values {
            assert_eq!(*value, 0.0);
            assert_eq!(*version, 0);
            assert_eq!(*status, ValidationStatus::None);
        }

        assert_eq!(report.new_owners.len(), 3);
        assert!(report.new_owners.iter().all(|o| o.as_ref() == Some(&report.joiner)));
    }

    #[test]
    fn test_host_validation() {
        let report = host_validation().unwrap();
        assert_eq!(report.after_write, Some((ValidationStatus::Pending, 2)));
        // the ack for version 1 does not validate version 2
        assert_eq!(report.after_first_ack, Some((ValidationStatus::Pending, 2)));
        assert_eq!(report.after_second_ack, Some((ValidationStatus::Validated, 2)));
        assert_eq!(report.host_value, 20);
        assert_eq!(report.guest_value, 20);
    }

    #[test]
    fn test_handshake_rejection() {
        let report = handshake_rejection().unwrap();
        assert_eq!(report.guest_phase, Phase::Failed);
        assert!(matches!(
            report.guest_errors.as_slice(),
            [SyncError::SchemaMismatch { .. }]
        ));
        assert_eq!(report.in_flight_after_write, 0);
        assert!(!report.host_value);
    }

    #[test]
    fn test_ready_flag_end_to_end() {
        let report = ready_flag(7).unwrap();
        assert_eq!(report.host_status, ValidationStatus::Validated);
        assert_eq!(report.host_version, 1);
        assert_eq!(report.guests.len(), 2);
        for guest in &report.guests {
            assert!(guest.value);
            assert_eq!(guest.status, ValidationStatus::Validated);
            assert_eq!(guest.lock_version, 1);
            assert_eq!(guest.firings, 1, "{:?}", guest);
        }
    }

    #[test]
    fn test_ready_flag_under_many_seeds() {
        for seed in 0..20 {
            let report = ready_flag(seed).unwrap();
            assert!(report.guests.iter().all(|g| g.firings == 1 && g.lock_version == 1));
        }
    }

    #[test]
    fn test_versions_never_go_backwards() {
        let mut env = SyncTestEnvironment::new(NetworkConfig::duplicating().with_seed(3), |r: &VarRegistry| {
            r.declare_shared::<i64>("score")
        });
        env.create("h").unwrap();
        env.join("a").unwrap();
        env.join("b").unwrap();
        env.settle();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        if let Some(a) = env.peer("a") {
            a.vars.on_value_changed(move |c| sink.lock().push(c.lock_version));
        }
        for round in 0..30i64 {
            let user = ["h", "a", "b"][round as usize % 3];
            if let Some(p) = env.peer(user) {
                p.vars.set(round);
            }
            env.network_mut().step();
            env.network_mut().step();
        }
        env.settle();

        let versions = seen.lock().clone();
        assert!(!versions.is_empty());
        assert!(versions.windows(2).all(|w| w[0] <= w[1]), "{:?}", versions);
        assert!(env.agree(|p| (p.vars.get(), p.vars.lock_version(), p.vars.status())));
    }

    #[test]
    fn test_user_entries_only_writable_by_owner() {
        let mut env = SyncTestEnvironment::new(NetworkConfig::reliable(), |r: &VarRegistry| {
            r.declare_user::<String>("name")
        });
        env.create("h").unwrap();
        env.join("a").unwrap();
        env.join("b").unwrap();
        env.settle();

        for peer in env.peers() {
            let var: &UserVar<String> = &peer.vars;
            var.set(format!("i am {}", peer.user_id));
        }
        env.settle();

        for user in env.user_ids() {
            assert!(env.agree(|p| p.vars.get_for(&user)));
            let host = env.peer("h").unwrap();
            assert_eq!(host.vars.get_for(&user), format!("i am {}", user));
        }
        assert!(env.peers().all(|p| p.errors().is_empty()));
    }
}
