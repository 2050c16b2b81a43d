//! Consumer Coordinator: membership and partition assignment for a consumer
//! group. The rebalance algorithm is a pure free function over plain data so
//! it can be exercised directly without a transport; `ConsumerCoordinator`
//! wraps it with the state each operation needs to read and write.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use tracing::info;

use crate::config::CoordinatorConfig;

pub type ConsumerId = String;
pub type Partition = u32;

/// Sticky, range-minimal rebalance: members keep as many of their previous
/// partitions as fit their target share; only the remainder moves.
///
/// `|members| > |partitions|` is not an error: the trailing members in
/// sorted order simply receive an empty set.
pub fn rebalance(
    members: &BTreeSet<ConsumerId>,
    partition_count: u32,
    previous: &BTreeMap<ConsumerId, BTreeSet<Partition>>,
) -> BTreeMap<ConsumerId, BTreeSet<Partition>> {
    let mut assignment: BTreeMap<ConsumerId, BTreeSet<Partition>> =
        members.iter().map(|m| (m.clone(), BTreeSet::new())).collect();

    if members.is_empty() {
        return assignment;
    }

    let member_count = members.len() as u32;
    let base = partition_count / member_count;
    let remainder = partition_count % member_count;
    // First `remainder` members (in sorted order) get one extra partition so
    // totals differ by at most one, per the spec's target formula.
    let target_for = |idx: u32| -> u32 {
        if idx < remainder {
            base + 1
        } else {
            base
        }
    };

    let mut targets: BTreeMap<ConsumerId, u32> = BTreeMap::new();
    for (idx, member) in members.iter().enumerate() {
        targets.insert(member.clone(), target_for(idx as u32));
    }

    let mut claimed: BTreeSet<Partition> = BTreeSet::new();

    // First pass: sticky retention, bounded by each member's target.
    for member in members {
        let target = targets[member];
        if let Some(prev) = previous.get(member) {
            let keep: BTreeSet<Partition> = prev
                .iter()
                .filter(|p| **p < partition_count && !claimed.contains(*p))
                .take(target as usize)
                .copied()
                .collect();
            claimed.extend(&keep);
            assignment.get_mut(member).unwrap().extend(keep);
        }
    }

    // Second pass: round-robin the remainder to members still below target.
    let unassigned: Vec<Partition> = (0..partition_count).filter(|p| !claimed.contains(p)).collect();
    let mut cursor = 0usize;
    let member_list: Vec<&ConsumerId> = members.iter().collect();
    for partition in unassigned {
        let mut attempts = 0;
        loop {
            if attempts >= member_list.len() {
                break;
            }
            let member = member_list[cursor % member_list.len()];
            cursor += 1;
            attempts += 1;
            let current_len = assignment[member].len() as u32;
            if current_len < targets[member] {
                assignment.get_mut(member).unwrap().insert(partition);
                break;
            }
        }
    }

    assignment
}

#[derive(Debug, Clone)]
pub struct Registration {
    pub generation: u64,
    pub partitions: BTreeSet<Partition>,
}

/// Abstraction over the transport-backed coordination state
/// (`heartbeats:{group}`, `assignment:{group}`, `generation:{group}`,
/// `lock:{group}`), so `ConsumerCoordinator` can be driven by an in-memory
/// fake in tests and by the Redis transport in production.
pub trait CoordinatorBackend: Send + Sync {
    fn record_heartbeat(&self, group: &str, consumer: &ConsumerId, at: DateTime<Utc>);
    fn live_members(&self, group: &str, timeout: chrono::Duration, now: DateTime<Utc>) -> BTreeSet<ConsumerId>;
    fn read_assignment(&self, group: &str) -> BTreeMap<ConsumerId, BTreeSet<Partition>>;
    fn write_assignment(&self, group: &str, assignment: BTreeMap<ConsumerId, BTreeSet<Partition>>);
    fn bump_generation(&self, group: &str) -> u64;
    fn current_generation(&self, group: &str) -> u64;
    fn remove_member(&self, group: &str, consumer: &ConsumerId);
    /// Acquire the distributed rebalance lock; returns `false` if already held.
    fn try_acquire_lock(&self, group: &str) -> bool;
    fn release_lock(&self, group: &str);
}

pub struct ConsumerCoordinator<B> {
    backend: B,
    config: CoordinatorConfig,
}

impl<B: CoordinatorBackend> ConsumerCoordinator<B> {
    pub fn new(backend: B, config: CoordinatorConfig) -> Self {
        Self { backend, config }
    }

    pub fn register_consumer(&self, group: &str, consumer: &ConsumerId) -> Registration {
        self.backend.record_heartbeat(group, consumer, Utc::now());
        self.trigger_rebalance(group);
        Registration {
            generation: self.backend.current_generation(group),
            partitions: self
                .backend
                .read_assignment(group)
                .get(consumer)
                .cloned()
                .unwrap_or_default(),
        }
    }

    pub fn send_heartbeat(&self, group: &str, consumer: &ConsumerId) {
        self.backend.record_heartbeat(group, consumer, Utc::now());
    }

    pub fn get_assigned_partitions(&self, group: &str, consumer: &ConsumerId) -> BTreeSet<Partition> {
        self.backend.read_assignment(group).get(consumer).cloned().unwrap_or_default()
    }

    /// Detects membership drift (stale heartbeats or a changed live set) and
    /// triggers a rebalance if found. Returns whether one was triggered.
    pub fn check_for_rebalance(&self, group: &str) -> bool {
        let timeout = chrono::Duration::milliseconds(self.config.heartbeat_timeout_ms);
        let live = self.backend.live_members(group, timeout, Utc::now());
        let assigned_members: BTreeSet<ConsumerId> = self.backend.read_assignment(group).keys().cloned().collect();
        if live != assigned_members {
            self.trigger_rebalance(group);
            true
        } else {
            false
        }
    }

    pub fn trigger_rebalance(&self, group: &str) {
        if !self.backend.try_acquire_lock(group) {
            // Lost the race: the winner's rebalance will be visible on next read.
            return;
        }
        let timeout = chrono::Duration::milliseconds(self.config.heartbeat_timeout_ms);
        let live = self.backend.live_members(group, timeout, Utc::now());
        let previous = self.backend.read_assignment(group);
        let next = rebalance(&live, self.config.partition_count, &previous);
        self.backend.write_assignment(group, next);
        let generation = self.backend.bump_generation(group);
        self.backend.release_lock(group);
        info!(worker = "coordinator", group, generation, members = live.len(), "rebalanced");
    }

    pub fn remove_consumer(&self, group: &str, consumer: &ConsumerId) {
        info!(worker = "coordinator", group, consumer, "removing consumer");
        self.backend.remove_member(group, consumer);
        self.trigger_rebalance(group);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn members(names: &[&str]) -> BTreeSet<ConsumerId> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn splits_partitions_evenly_with_no_prior_assignment() {
        let assignment = rebalance(&members(&["a", "b"]), 16, &BTreeMap::new());
        assert_eq!(assignment["a"].len(), 8);
        assert_eq!(assignment["b"].len(), 8);
        let all: BTreeSet<u32> = assignment.values().flatten().copied().collect();
        assert_eq!(all.len(), 16);
    }

    #[test]
    fn uneven_split_differs_by_at_most_one() {
        let assignment = rebalance(&members(&["a", "b", "c"]), 16, &BTreeMap::new());
        let sizes: Vec<usize> = assignment.values().map(|p| p.len()).collect();
        assert!(sizes.iter().max().unwrap() - sizes.iter().min().unwrap() <= 1);
    }

    #[test]
    fn more_members_than_partitions_leaves_some_empty_without_erroring() {
        let assignment = rebalance(&members(&["a", "b", "c", "d", "e"]), 2, &BTreeMap::new());
        let empty_count = assignment.values().filter(|p| p.is_empty()).count();
        assert_eq!(empty_count, 3);
    }

    #[test]
    fn sticky_retention_keeps_partitions_when_membership_is_unchanged() {
        let mut previous = BTreeMap::new();
        previous.insert("a".to_string(), BTreeSet::from([0, 1, 2, 3]));
        previous.insert("b".to_string(), BTreeSet::from([4, 5, 6, 7]));

        let assignment = rebalance(&members(&["a", "b"]), 8, &previous);
        assert_eq!(assignment["a"], BTreeSet::from([0, 1, 2, 3]));
        assert_eq!(assignment["b"], BTreeSet::from([4, 5, 6, 7]));
    }

    #[test]
    fn evicted_members_partitions_are_redistributed() {
        let mut previous = BTreeMap::new();
        previous.insert("a".to_string(), BTreeSet::from([0, 1, 2, 3]));
        previous.insert("b".to_string(), BTreeSet::from([4, 5, 6, 7]));

        let assignment = rebalance(&members(&["a"]), 8, &previous);
        assert_eq!(assignment["a"].len(), 8);
    }

    mod proptest_tests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #![proptest_config(ProptestConfig {
                cases: 256,
                ..ProptestConfig::default()
            })]

            /// Every partition is assigned to exactly one member (or left
            /// unassigned only when members outnumber partitions), and no two
            /// members' counts differ by more than one.
            #[test]
            fn assignment_is_complete_and_balanced(
                member_count in 1usize..12,
                partition_count in 0u32..32,
            ) {
                let members: BTreeSet<ConsumerId> =
                    (0..member_count).map(|i| format!("consumer-{i}")).collect();
                let assignment = rebalance(&members, partition_count, &BTreeMap::new());

                let all: BTreeSet<Partition> = assignment.values().flatten().copied().collect();
                prop_assert_eq!(all, (0..partition_count).collect::<BTreeSet<_>>());

                let sizes: Vec<usize> = assignment.values().map(|p| p.len()).collect();
                if let (Some(max), Some(min)) = (sizes.iter().max(), sizes.iter().min()) {
                    prop_assert!(max - min <= 1);
                }
            }
        }
    }
}
