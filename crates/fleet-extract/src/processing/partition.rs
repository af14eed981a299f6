//! Deterministic assignment of work items to workers

use crate::error::SetupError;
use crate::types::WorkItem;

/// Assigns a disjoint slice of the inventory to one worker.
///
/// Items are sorted by `(group_key, item_id)` and worker `i` of `W` takes every
/// item whose position `p` satisfies `p mod W == i`. Every worker computes the
/// same order independently, so no coordination is needed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkPartitioner {
    worker_index: usize,
    total_workers: usize,
}

impl WorkPartitioner {
    pub fn new(worker_index: usize, total_workers: usize) -> Result<Self, SetupError> {
        if total_workers == 0 || worker_index >= total_workers {
            return Err(SetupError::InvalidAssignment {
                index: worker_index,
                total: total_workers,
            });
        }
        Ok(Self {
            worker_index,
            total_workers,
        })
    }

    pub fn worker_index(&self) -> usize {
        self.worker_index
    }

    pub fn total_workers(&self) -> usize {
        self.total_workers
    }

    /// This worker's slice, in global enumeration order
    pub fn partition(&self, items: &[WorkItem]) -> Vec<WorkItem> {
        let mut sorted: Vec<&WorkItem> = items.iter().collect();
        sorted.sort_by(|a, b| a.cmp_order(b));

        sorted
            .into_iter()
            .enumerate()
            .filter(|(position, _)| position % self.total_workers == self.worker_index)
            .map(|(_, item)| item.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::HashSet;

    fn items(keys: &[(&str, &str)]) -> Vec<WorkItem> {
        keys.iter()
            .map(|(g, i)| WorkItem::new(*g, *i, format!("/in/{}/{}", g, i), 2048))
            .collect()
    }

    #[test]
    fn test_rejects_bad_assignment() {
        assert!(WorkPartitioner::new(0, 0).is_err());
        assert!(matches!(
            WorkPartitioner::new(3, 3),
            Err(SetupError::InvalidAssignment { index: 3, total: 3 })
        ));
        assert!(WorkPartitioner::new(2, 3).is_ok());
    }

    #[test]
    fn test_round_robin_over_sorted_order() {
        let inventory = items(&[("b", "1.pdf"), ("a", "2.pdf"), ("a", "1.pdf"), ("c", "1.pdf")]);

        let first = WorkPartitioner::new(0, 2).unwrap().partition(&inventory);
        let second = WorkPartitioner::new(1, 2).unwrap().partition(&inventory);

        let ids = |v: &[WorkItem]| v.iter().map(|w| w.to_string()).collect::<Vec<_>>();
        assert_eq!(ids(&first), vec!["a/1.pdf", "b/1.pdf"]);
        assert_eq!(ids(&second), vec!["a/2.pdf", "c/1.pdf"]);
    }

    #[test]
    fn test_more_workers_than_items() {
        let inventory = items(&[("a", "1.pdf")]);
        assert_eq!(WorkPartitioner::new(0, 4).unwrap().partition(&inventory).len(), 1);
        assert!(WorkPartitioner::new(3, 4).unwrap().partition(&inventory).is_empty());
    }

    proptest! {
        #[test]
        fn prop_partitions_are_disjoint_and_cover(
            keys in proptest::collection::hash_set(("[a-d]{1,2}", "[0-9]{1,3}\\.pdf"), 0..60),
            total in 1usize..8,
        ) {
            let inventory: Vec<WorkItem> = keys
                .iter()
                .map(|(g, i)| WorkItem::new(g.clone(), i.clone(), "/in/x", 2048))
                .collect();

            let mut seen = HashSet::new();
            let mut covered = 0;
            for index in 0..total {
                let slice = WorkPartitioner::new(index, total).unwrap().partition(&inventory);
                covered += slice.len();
                for item in slice {
                    prop_assert!(seen.insert(item.key()));
                }
            }
            prop_assert_eq!(covered, inventory.len());
        }

        #[test]
        fn prop_partition_ignores_input_order(
            keys in proptest::collection::hash_set(("[a-c]", "[0-9]{1,2}"), 0..30),
            total in 1usize..5,
        ) {
            let mut inventory: Vec<WorkItem> = keys
                .iter()
                .map(|(g, i)| WorkItem::new(g.clone(), i.clone(), "/in/x", 2048))
                .collect();
            let forward = WorkPartitioner::new(0, total).unwrap().partition(&inventory);
            inventory.reverse();
            let backward = WorkPartitioner::new(0, total).unwrap().partition(&inventory);
            prop_assert_eq!(forward, backward);
        }
    }
}
