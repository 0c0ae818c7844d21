//! Bounded top-k selection with a total, deterministic order.

use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;

/// A scored node competing for a top-k slot.
///
/// Ordering is "greater is better": higher score first, then the lower
/// stream sequence number, then the lexicographically smaller node id.
/// Scores compare with `total_cmp`, so the order is total even for
/// values that `partial_cmp` cannot rank.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub score: f64,
    pub seq: u64,
    pub node_id: String,
}

impl Ord for Candidate {
    fn cmp(&self, other: &Self) -> Ordering {
        self.score
            .total_cmp(&other.score)
            .then_with(|| other.seq.cmp(&self.seq))
            .then_with(|| other.node_id.cmp(&self.node_id))
    }
}

impl PartialOrd for Candidate {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Candidate {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Candidate {}

/// Min-heap of at most `k` candidates. The root is the current worst
/// keeper; a newcomer replaces it only on strict improvement.
pub struct TopK {
    k: usize,
    heap: BinaryHeap<Reverse<Candidate>>,
    peak: usize,
}

impl TopK {
    pub fn new(k: usize) -> Self {
        Self {
            k,
            heap: BinaryHeap::with_capacity(k.min(4096)),
            peak: 0,
        }
    }

    /// Offer a candidate. Returns whether it was kept.
    pub fn offer(&mut self, candidate: Candidate) -> bool {
        if self.heap.len() < self.k {
            self.heap.push(Reverse(candidate));
            self.peak = self.peak.max(self.heap.len());
            return true;
        }
        let improves = match self.heap.peek() {
            Some(Reverse(worst)) => candidate > *worst,
            None => false,
        };
        if improves {
            self.heap.pop();
            self.heap.push(Reverse(candidate));
        }
        improves
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    /// Largest number of entries held at any point.
    pub fn peak_len(&self) -> usize {
        self.peak
    }

    /// Drain into best-first order.
    pub fn into_sorted(self) -> Vec<Candidate> {
        let mut out: Vec<Candidate> = self.heap.into_iter().map(|Reverse(c)| c).collect();
        out.sort_by(|a, b| b.cmp(a));
        out
    }
}
