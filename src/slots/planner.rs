//! Slot rebalancing plan - computes what needs to move, no I/O.
//!
//! The balancer pairs every master with its `divide` target and reconciles
//! surpluses against deficits with two pointers, producing the smallest set
//! of `(source, destination, count)` instructions that levels the cluster.

use super::distribution::divide;

/// A master's slot count going into the balancer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MasterLoad<K> {
    /// Caller-defined handle for the master (index, node id, ...).
    pub node: K,
    /// Number of slots the master owns now.
    pub count: usize,
}

impl<K> MasterLoad<K> {
    /// Create a new load entry.
    pub fn new(node: K, count: usize) -> Self {
        Self { node, count }
    }
}

/// A master's balanced state and the slots it needs to pull in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Balance<K> {
    /// Handle for the master.
    pub node: K,
    /// Slot count after the plan has been applied.
    pub count: usize,
    /// Target slot count from `divide`.
    pub target: usize,
    /// `(source, count)` pairs this master receives.
    pub need: Vec<(K, usize)>,
}

/// One slot transfer order: move `count` slots from `source` to `destination`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationInstruction<K> {
    /// Master giving slots away.
    pub source: K,
    /// Master receiving slots.
    pub destination: K,
    /// Number of slots to move.
    pub count: usize,
}

/// Complete rebalance plan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BalancePlan<K> {
    /// Masters sorted by their original slot count, descending.
    pub masters: Vec<Balance<K>>,
}

impl<K: Clone> BalancePlan<K> {
    /// Flatten the per-master needs into transfer instructions.
    pub fn instructions(&self) -> Vec<MigrationInstruction<K>> {
        self.masters
            .iter()
            .flat_map(|m| {
                m.need.iter().map(|(source, count)| MigrationInstruction {
                    source: source.clone(),
                    destination: m.node.clone(),
                    count: *count,
                })
            })
            .collect()
    }

    /// Check if the plan is empty (no work to do).
    pub fn is_empty(&self) -> bool {
        self.masters.iter().all(|m| m.need.is_empty())
    }

    /// Total number of slots that will change owner.
    pub fn slots_to_move(&self) -> usize {
        self.masters
            .iter()
            .flat_map(|m| m.need.iter().map(|(_, c)| *c))
            .sum()
    }
}

/// Compute a rebalance plan levelling `loads` against a budget of `total` slots.
///
/// Masters are sorted by count, descending (stable), then zipped with
/// `divide(total, masters)`. `i` walks from the most over-provisioned master,
/// `j` from the most under-provisioned one; each step moves
/// `min(excess_i, deficit_j)` from `i` to `j`. Slots never move between two
/// masters on the same side of their target.
pub fn slot_balance<K: Clone>(mut loads: Vec<MasterLoad<K>>, total: usize) -> BalancePlan<K> {
    loads.sort_by(|a, b| b.count.cmp(&a.count));
    let targets = divide(total, loads.len());

    let mut masters: Vec<Balance<K>> = loads
        .into_iter()
        .zip(targets)
        .map(|(load, target)| Balance {
            node: load.node,
            count: load.count,
            target,
            need: Vec::new(),
        })
        .collect();

    if masters.len() < 2 {
        return BalancePlan { masters };
    }

    let (mut i, mut j) = (0, masters.len() - 1);
    while i < j {
        let more = masters[i].count.saturating_sub(masters[i].target);
        if more == 0 {
            i += 1;
            continue;
        }

        let need = masters[j].target.saturating_sub(masters[j].count);
        if need == 0 {
            j -= 1;
            continue;
        }

        let moved = need.min(more);
        let source = masters[i].node.clone();
        masters[j].need.push((source, moved));
        masters[j].count += moved;
        masters[i].count -= moved;

        if need <= more {
            j -= 1;
        }
        if more <= need {
            i += 1;
        }
    }

    BalancePlan { masters }
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing,
    clippy::get_unwrap
)]
mod tests {
    use super::*;

    fn loads(counts: &[usize]) -> Vec<MasterLoad<usize>> {
        counts
            .iter()
            .enumerate()
            .map(|(idx, c)| MasterLoad::new(idx, *c))
            .collect()
    }

    #[test]
    fn test_three_master_scenario() {
        let plan = slot_balance(loads(&[8000, 6000, 2384]), 16384);

        let instructions = plan.instructions();
        assert_eq!(
            instructions,
            vec![
                MigrationInstruction {
                    source: 0,
                    destination: 2,
                    count: 2538
                },
                MigrationInstruction {
                    source: 1,
                    destination: 2,
                    count: 539
                },
            ]
        );

        let counts: Vec<usize> = plan.masters.iter().map(|m| m.count).collect();
        assert_eq!(counts, vec![5462, 5461, 5461]);
        assert_eq!(plan.slots_to_move(), 3077);
    }

    #[test]
    fn test_balanced_cluster_is_noop() {
        let plan = slot_balance(loads(&[5462, 5461, 5461]), 16384);
        assert!(plan.is_empty());
        assert_eq!(plan.slots_to_move(), 0);
    }

    #[test]
    fn test_new_empty_master() {
        let plan = slot_balance(loads(&[5462, 5461, 5461, 0]), 16384);
        let counts: Vec<usize> = plan.masters.iter().map(|m| m.count).collect();
        assert_eq!(counts, vec![4096, 4096, 4096, 4096]);

        // every instruction lands on the new master (index 3)
        for inst in plan.instructions() {
            assert_eq!(inst.destination, 3);
            assert_ne!(inst.source, 3);
        }
        assert_eq!(plan.slots_to_move(), 4096);
    }

    #[test]
    fn test_sort_is_stable_for_ties() {
        let plan = slot_balance(loads(&[10, 10, 0]), 20);
        let order: Vec<usize> = plan.masters.iter().map(|m| m.node).collect();
        assert_eq!(order, vec![0, 1, 2]);
        // targets are [7, 7, 6]
        assert_eq!(plan.masters[2].need, vec![(0, 3), (1, 3)]);
    }

    #[test]
    fn test_equal_excess_and_deficit_advance_both() {
        let plan = slot_balance(loads(&[15, 10, 5]), 30);
        assert_eq!(
            plan.instructions(),
            vec![MigrationInstruction {
                source: 0,
                destination: 2,
                count: 5
            }]
        );
    }

    #[test]
    fn test_single_and_empty_input() {
        let plan = slot_balance(loads(&[16384]), 16384);
        assert!(plan.is_empty());

        let plan: BalancePlan<usize> = slot_balance(Vec::new(), 16384);
        assert!(plan.masters.is_empty());
    }

    #[test]
    fn test_never_moves_between_same_side() {
        let plan = slot_balance(loads(&[9000, 7000, 384, 0]), 16384);
        for inst in plan.instructions() {
            let src = plan.masters.iter().find(|m| m.node == inst.source).unwrap();
            let dst = plan
                .masters
                .iter()
                .find(|m| m.node == inst.destination)
                .unwrap();
            // sources started above their target, destinations below
            assert!(src.need.is_empty());
            assert!(!dst.need.is_empty());
        }
        for m in &plan.masters {
            assert_eq!(m.count, m.target);
        }
    }
}
