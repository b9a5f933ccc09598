//! Queue groups: policy-driven selection of hardware queues.
//!
//! A group names a contiguous block of hardware queues plus a placement
//! policy deciding which queue a caller gets. Two policies exist:
//!
//! - **Round-robin**: a shared rotation counter advanced by compare-and-swap.
//!   Under contention exactly one racer advances the counter; the others
//!   reuse the pre-advance offset, which is still a valid, loosely balanced
//!   pick.
//! - **CPU affinity**: a read-only CPU→queue table built once at creation
//!   from the runtime's CPU→NUMA map. Queues are split into per-NUMA-node
//!   blocks and handed to each node's CPUs round-robin, so work submitted
//!   from a CPU lands on a queue owned by its own node.

use std::sync::RwLock;
use std::sync::atomic::{AtomicU32, Ordering};

use crate::error::{Error, Result};
use crate::substrate::QueueId;
use crate::tasking::TaskingRuntime;

/// Identifier of a queue group.
pub type QueueGroupId = u16;

/// Queue placement policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupPolicy {
    /// Rotate over the group's queues, shared across all callers.
    RoundRobin,
    /// Pick by the calling thread's CPU, NUMA-locally.
    CpuAffinity,
}

enum PolicyState {
    RoundRobin(AtomicU32),
    /// CPU id → queue id, fixed at creation.
    Affinity(Box<[QueueId]>),
}

pub(crate) struct QueueGroup {
    first: QueueId,
    count: u32,
    state: PolicyState,
}

impl QueueGroup {
    fn new_round_robin(first: QueueId, count: u32) -> Self {
        Self {
            first,
            count,
            state: PolicyState::RoundRobin(AtomicU32::new(0)),
        }
    }

    fn new_affinity(first: QueueId, count: u32, cpu_numa_map: &[usize]) -> Self {
        Self {
            first,
            count,
            state: PolicyState::Affinity(build_affinity_table(first, count, cpu_numa_map)),
        }
    }

    /// Pick a queue for the calling thread.
    pub(crate) fn queue_for_caller<R: TaskingRuntime + ?Sized>(&self, runtime: &R) -> QueueId {
        match &self.state {
            PolicyState::RoundRobin(counter) => {
                if self.count <= 1 {
                    return self.first;
                }
                let offset = counter.load(Ordering::Relaxed);
                let next = if offset + 1 < self.count { offset + 1 } else { 0 };
                // One winner advances; losers return the stale offset,
                // which is still inside the group.
                let _ = counter.compare_exchange(offset, next, Ordering::Relaxed, Ordering::Relaxed);
                self.first + offset as QueueId
            }
            PolicyState::Affinity(table) => {
                let cpu = runtime.current_cpu().unwrap_or(0);
                // An unknown CPU (topology changed after creation) wraps
                // into the table rather than escaping the group.
                table[cpu % table.len()]
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn affinity_table(&self) -> Option<&[QueueId]> {
        match &self.state {
            PolicyState::Affinity(table) => Some(table),
            PolicyState::RoundRobin(_) => None,
        }
    }
}

/// Split `count` queues starting at `first` across the NUMA nodes present
/// in `cpu_numa_map`, then assign each node's block to that node's CPUs
/// round-robin. Returns the CPU-indexed queue table.
fn build_affinity_table(first: QueueId, count: u32, cpu_numa_map: &[usize]) -> Box<[QueueId]> {
    debug_assert!(count > 0);
    debug_assert!(!cpu_numa_map.is_empty());

    let max_node = cpu_numa_map.iter().copied().max().unwrap_or(0);
    let mut node_used = vec![false; max_node + 1];
    for &node in cpu_numa_map {
        node_used[node] = true;
    }
    let num_nodes = node_used.iter().filter(|used| **used).count() as u32;

    // Per-node queue block: (first, count).
    let mut node_block = vec![(first, 0u32); max_node + 1];

    if count >= num_nodes {
        // Even split, remainder to the first nodes in use.
        let per_node = count / num_nodes;
        let remainder = count % num_nodes;
        let mut next_queue = first;
        let mut used_rank = 0u32;
        for node in 0..=max_node {
            if !node_used[node] {
                continue;
            }
            let block = per_node + u32::from(used_rank < remainder);
            node_block[node] = (next_queue, block);
            next_queue += block as QueueId;
            used_rank += 1;
        }
    } else {
        // Fewer queues than nodes: one queue per node while they last, the
        // last queue shared by every remaining node.
        let mut assigned = 0u32;
        for node in 0..=max_node {
            if !node_used[node] {
                continue;
            }
            let offset = assigned.min(count - 1);
            node_block[node] = (first + offset as QueueId, 1);
            assigned += 1;
        }
    }

    // Round-robin each node's CPUs over that node's block.
    let mut node_cursor = vec![0u32; max_node + 1];
    let mut table = vec![first; cpu_numa_map.len()];
    for (cpu, &node) in cpu_numa_map.iter().enumerate() {
        let (block_first, block_count) = node_block[node];
        debug_assert!(block_count > 0);
        let cursor = &mut node_cursor[node];
        table[cpu] = block_first + *cursor as QueueId;
        *cursor = (*cursor + 1) % block_count;
    }
    table.into_boxed_slice()
}

/// Fixed-capacity table of queue groups, keyed by group id.
pub(crate) struct GroupTable {
    groups: RwLock<Vec<Option<std::sync::Arc<QueueGroup>>>>,
    max_queues: u32,
}

impl GroupTable {
    pub(crate) fn new(capacity: usize, max_queues: u32) -> Self {
        Self {
            groups: RwLock::new((0..capacity).map(|_| None).collect()),
            max_queues,
        }
    }

    pub(crate) fn create<R: TaskingRuntime + ?Sized>(
        &self,
        id: QueueGroupId,
        first: QueueId,
        count: u32,
        policy: GroupPolicy,
        runtime: &R,
    ) -> Result<()> {
        if count == 0 {
            return Err(Error::EmptyGroup);
        }
        if u32::from(first) >= self.max_queues || u32::from(first) + count > self.max_queues {
            return Err(Error::InvalidQueueRange { first, count });
        }

        // Build any policy data outside the table lock.
        let group = match policy {
            GroupPolicy::RoundRobin => QueueGroup::new_round_robin(first, count),
            GroupPolicy::CpuAffinity => {
                let map = runtime.cpu_numa_map().ok_or(Error::PolicyUnsupported)?;
                if map.is_empty() {
                    return Err(Error::PolicyUnsupported);
                }
                QueueGroup::new_affinity(first, count, &map)
            }
        };

        let mut groups = self.groups.write().expect("group table poisoned");
        if groups.get(id as usize).is_none() {
            return Err(Error::InvalidGroup(id));
        }
        if groups.iter().filter(|g| g.is_some()).count() >= groups.len() {
            return Err(Error::GroupTableFull);
        }
        let slot = &mut groups[id as usize];
        if slot.is_some() {
            return Err(Error::GroupExists(id));
        }
        *slot = Some(std::sync::Arc::new(group));
        Ok(())
    }

    pub(crate) fn delete(&self, id: QueueGroupId) -> Result<()> {
        let mut groups = self.groups.write().expect("group table poisoned");
        let slot = groups
            .get_mut(id as usize)
            .ok_or(Error::InvalidGroup(id))?;
        if slot.take().is_none() {
            return Err(Error::GroupNotFound(id));
        }
        Ok(())
    }

    pub(crate) fn get(&self, id: QueueGroupId) -> Result<std::sync::Arc<QueueGroup>> {
        let groups = self.groups.read().expect("group table poisoned");
        groups
            .get(id as usize)
            .ok_or(Error::InvalidGroup(id))?
            .clone()
            .ok_or(Error::GroupNotFound(id))
    }

    pub(crate) fn capacity(&self) -> usize {
        self.groups.read().expect("group table poisoned").len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::FakeRuntime;
    use std::collections::HashMap;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_round_robin_cycles_in_range() {
        let runtime = FakeRuntime::new();
        let group = QueueGroup::new_round_robin(4, 3);

        let picks: Vec<QueueId> = (0..9).map(|_| group.queue_for_caller(&runtime)).collect();
        for q in &picks {
            assert!((4..7).contains(q));
        }
        assert_eq!(picks, vec![4, 5, 6, 4, 5, 6, 4, 5, 6]);
    }

    #[test]
    fn test_round_robin_balanced_under_concurrency() {
        const CALLERS: usize = 4;
        const CALLS: usize = 2_500;
        const QUEUES: u32 = 5;

        let runtime = Arc::new(FakeRuntime::new());
        let group = Arc::new(QueueGroup::new_round_robin(0, QUEUES));

        let joins: Vec<_> = (0..CALLERS)
            .map(|_| {
                let runtime = runtime.clone();
                let group = group.clone();
                thread::spawn(move || {
                    let mut counts: HashMap<QueueId, usize> = HashMap::new();
                    for _ in 0..CALLS {
                        *counts.entry(group.queue_for_caller(&*runtime)).or_default() += 1;
                    }
                    counts
                })
            })
            .collect();

        let mut totals: HashMap<QueueId, usize> = HashMap::new();
        for j in joins {
            for (q, n) in j.join().unwrap() {
                *totals.entry(q).or_default() += n;
            }
        }

        let total: usize = totals.values().sum();
        assert_eq!(total, CALLERS * CALLS);
        let expected = total / QUEUES as usize;
        for q in 0..QUEUES as QueueId {
            let share = *totals.get(&q).unwrap_or(&0);
            // CAS losers repeat an offset, so distribution is loose but no
            // queue may be starved or dominate.
            assert!(
                share > expected / 4 && share < expected * 4,
                "queue {} got {} of {} calls",
                q,
                share,
                total
            );
        }
    }

    #[test]
    fn test_affinity_split_even() {
        // 2 nodes, 4 CPUs each; 4 queues -> 2 per node.
        let map = vec![0, 0, 1, 1, 0, 0, 1, 1];
        let table = build_affinity_table(0, 4, &map);

        for (cpu, &queue) in table.iter().enumerate() {
            if map[cpu] == 0 {
                assert!((0..2).contains(&queue), "cpu {} got queue {}", cpu, queue);
            } else {
                assert!((2..4).contains(&queue), "cpu {} got queue {}", cpu, queue);
            }
        }
        // Within a node, queues alternate round-robin.
        assert_ne!(table[0], table[1]);
        assert_ne!(table[2], table[3]);
    }

    #[test]
    fn test_affinity_remainder_to_first_nodes() {
        // 2 nodes, 5 queues -> node 0 gets 3, node 1 gets 2.
        let map = vec![0, 0, 0, 1, 1, 1];
        let table = build_affinity_table(10, 5, &map);

        for (cpu, &queue) in table.iter().enumerate() {
            if map[cpu] == 0 {
                assert!((10..13).contains(&queue));
            } else {
                assert!((13..15).contains(&queue));
            }
        }
    }

    #[test]
    fn test_affinity_fewer_queues_than_nodes() {
        // 3 nodes, 2 queues: nodes 0,1 get their own, node 2 reuses the last.
        let map = vec![0, 1, 2, 0, 1, 2];
        let table = build_affinity_table(0, 2, &map);

        assert_eq!(table[0], 0);
        assert_eq!(table[1], 1);
        assert_eq!(table[2], 1);
        assert_eq!(table[3], 0);
        assert_eq!(table[4], 1);
        assert_eq!(table[5], 1);
    }

    #[test]
    fn test_affinity_lookup_uses_current_cpu() {
        let runtime = FakeRuntime::new();
        runtime.set_cpu_numa_map(vec![0, 0, 1, 1]);
        let map = runtime.cpu_numa_map().unwrap();
        let group = QueueGroup::new_affinity(0, 2, &map);

        runtime.set_current_cpu(0);
        assert_eq!(group.queue_for_caller(&runtime), 0);
        runtime.set_current_cpu(2);
        assert_eq!(group.queue_for_caller(&runtime), 1);
    }

    #[test]
    fn test_table_create_delete_errors() {
        let runtime = FakeRuntime::new();
        let table = GroupTable::new(4, 8);

        table
            .create(0, 0, 4, GroupPolicy::RoundRobin, &runtime)
            .unwrap();
        assert!(matches!(
            table.create(0, 0, 2, GroupPolicy::RoundRobin, &runtime),
            Err(Error::GroupExists(0))
        ));
        assert!(matches!(
            table.create(1, 0, 0, GroupPolicy::RoundRobin, &runtime),
            Err(Error::EmptyGroup)
        ));
        assert!(matches!(
            table.create(1, 6, 4, GroupPolicy::RoundRobin, &runtime),
            Err(Error::InvalidQueueRange { .. })
        ));
        assert!(matches!(
            table.create(9, 0, 1, GroupPolicy::RoundRobin, &runtime),
            Err(Error::InvalidGroup(9))
        ));

        assert!(table.get(0).is_ok());
        table.delete(0).unwrap();
        assert!(matches!(table.delete(0), Err(Error::GroupNotFound(0))));
        assert!(matches!(table.get(0), Err(Error::GroupNotFound(0))));

        // The id is reusable after deletion.
        table
            .create(0, 2, 2, GroupPolicy::RoundRobin, &runtime)
            .unwrap();
    }

    #[test]
    fn test_affinity_requires_topology() {
        let runtime = FakeRuntime::new();
        runtime.clear_cpu_numa_map();
        let table = GroupTable::new(2, 8);
        assert!(matches!(
            table.create(0, 0, 2, GroupPolicy::CpuAffinity, &runtime),
            Err(Error::PolicyUnsupported)
        ));
    }
}
