use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashSet};

use ordered_float::NotNan;

/// A partially expanded tuple in the lazy k-best search. Ordered by score,
/// with lexicographically smaller rank vectors winning ties so that lower
/// indices are preferred deterministically.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Candidate {
    score: NotNan<f64>,
    ranks: Vec<usize>,
}

impl Ord for Candidate {
    fn cmp(&self, other: &Self) -> Ordering {
        self.score
            .cmp(&other.score)
            .then_with(|| other.ranks.cmp(&self.ranks))
    }
}

impl PartialOrd for Candidate {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Select the `k` highest-probability index tuples from per-slot marginal
/// distributions (one slot per sample or per cluster). The score of a tuple
/// is the product of its per-slot marginals. Ties are broken towards lower
/// genotype indices.
///
/// This is a lazy best-first search over the rank lattice: each slot's
/// marginals are sorted once, the all-best tuple is expanded first, and each
/// popped tuple enqueues its immediate successors.
pub(crate) fn select_top_k_tuples(marginals: &[Vec<f64>], k: usize) -> Vec<Vec<usize>> {
    if k == 0 || marginals.is_empty() || marginals.iter().any(|m| m.is_empty()) {
        return Vec::new();
    }
    // Per slot: genotype indices ordered by descending marginal, ties by
    // ascending index.
    let orders: Vec<Vec<usize>> = marginals
        .iter()
        .map(|m| {
            let mut order: Vec<usize> = (0..m.len()).collect();
            order.sort_by(|&a, &b| {
                m[b].partial_cmp(&m[a])
                    .unwrap_or(Ordering::Equal)
                    .then(a.cmp(&b))
            });
            order
        })
        .collect();
    let score_of = |ranks: &[usize]| -> NotNan<f64> {
        let ln_prob: f64 = ranks
            .iter()
            .zip(marginals.iter().zip(orders.iter()))
            .map(|(&rank, (m, order))| m[order[rank]].max(f64::MIN_POSITIVE).ln())
            .sum();
        NotNan::new(ln_prob).expect("bug: NaN marginal in top-k selection")
    };

    let mut heap = BinaryHeap::new();
    let mut seen = HashSet::new();
    let root = vec![0; marginals.len()];
    heap.push(Candidate {
        score: score_of(&root),
        ranks: root.clone(),
    });
    seen.insert(root);

    let mut result = Vec::with_capacity(k);
    while let Some(Candidate { ranks, .. }) = heap.pop() {
        result.push(
            ranks
                .iter()
                .enumerate()
                .map(|(slot, &rank)| orders[slot][rank])
                .collect::<Vec<_>>(),
        );
        if result.len() == k {
            break;
        }
        for slot in 0..ranks.len() {
            if ranks[slot] + 1 < marginals[slot].len() {
                let mut successor = ranks.clone();
                successor[slot] += 1;
                if seen.insert(successor.clone()) {
                    heap.push(Candidate {
                        score: score_of(&successor),
                        ranks: successor,
                    });
                }
            }
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_slot() {
        let tuples = select_top_k_tuples(&[vec![0.1, 0.7, 0.2]], 2);
        assert_eq!(tuples, vec![vec![1], vec![2]]);
    }

    #[test]
    fn test_best_tuple_first() {
        let tuples = select_top_k_tuples(&[vec![0.9, 0.1], vec![0.2, 0.8]], 4);
        assert_eq!(tuples[0], vec![0, 1]);
        assert_eq!(tuples.len(), 4);
    }

    #[test]
    fn test_ties_prefer_lower_index() {
        let tuples = select_top_k_tuples(&[vec![0.5, 0.5]], 2);
        assert_eq!(tuples, vec![vec![0], vec![1]]);
    }

    #[test]
    fn test_k_larger_than_space() {
        let tuples = select_top_k_tuples(&[vec![0.5, 0.5], vec![1.0]], 10);
        assert_eq!(tuples.len(), 2);
    }
}
