use std::cmp::Ordering;
use std::collections::BinaryHeap;

/// A reclaimable bucket considered for evacuation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Candidate {
    pub bucket: u64,
    pub sectors_used: u32,
}

impl Candidate {
    pub fn new(bucket: u64, sectors_used: u32) -> Self {
        Self {
            bucket,
            sectors_used,
        }
    }
}

// Usage first; equal usage falls back to bucket index so selection is
// deterministic.
impl Ord for Candidate {
    fn cmp(&self, other: &Self) -> Ordering {
        self.sectors_used
            .cmp(&other.sectors_used)
            .then_with(|| self.bucket.cmp(&other.bucket))
    }
}

impl PartialOrd for Candidate {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Bounded heap keeping the `capacity` least-used candidates seen so far.
///
/// The top of the heap is the most-used retained candidate: it is the one a
/// smaller arrival evicts and the first to go when trimming to a budget.
/// `sectors_to_move` always equals the summed usage of the retained
/// candidates.
#[derive(Debug, Default)]
pub struct BucketHeap {
    heap: BinaryHeap<Candidate>,
    capacity: usize,
    sectors_to_move: u64,
}

impl BucketHeap {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            heap: BinaryHeap::with_capacity(capacity),
            capacity,
            sectors_to_move: 0,
        }
    }

    /// Empty the heap for a new sweep, keeping its allocation.
    pub fn reset(&mut self, capacity: usize) {
        self.heap.clear();
        self.heap.reserve(capacity);
        self.capacity = capacity;
        self.sectors_to_move = 0;
    }

    /// Offer a candidate. Returns whether it was retained.
    pub fn push_or_replace(&mut self, candidate: Candidate) -> bool {
        if !self.is_full() {
            self.sectors_to_move += u64::from(candidate.sectors_used);
            self.heap.push(candidate);
            return true;
        }

        match self.heap.peek_mut() {
            Some(mut top) if candidate < *top => {
                self.sectors_to_move -= u64::from(top.sectors_used);
                self.sectors_to_move += u64::from(candidate.sectors_used);
                *top = candidate;
                true
            }
            _ => false,
        }
    }

    pub fn peek_top(&self) -> Option<&Candidate> {
        self.heap.peek()
    }

    /// Remove the most-used retained candidate.
    pub fn pop_top(&mut self) -> Option<Candidate> {
        let top = self.heap.pop()?;
        self.sectors_to_move -= u64::from(top.sectors_used);
        Some(top)
    }

    /// Remove the least-used retained candidate.
    pub fn pop_min(&mut self) -> Option<Candidate> {
        let mut items = std::mem::take(&mut self.heap).into_vec();
        let index = items
            .iter()
            .enumerate()
            .min_by(|(_, a), (_, b)| a.cmp(b))
            .map(|(index, _)| index);
        let min = index.map(|index| items.swap_remove(index));
        self.heap = BinaryHeap::from(items);
        if let Some(candidate) = &min {
            self.sectors_to_move -= u64::from(candidate.sectors_used);
        }
        min
    }

    /// Evict the most-used candidates until the retained usage fits
    /// `budget`. Returns how many were evicted.
    pub fn trim_to(&mut self, budget: u64) -> usize {
        let mut evicted = 0;
        while self.sectors_to_move > budget {
            if self.pop_top().is_none() {
                break;
            }
            evicted += 1;
        }
        evicted
    }

    /// Take every retained candidate, least used first.
    pub fn drain_sorted(&mut self) -> Vec<Candidate> {
        self.sectors_to_move = 0;
        std::mem::take(&mut self.heap).into_sorted_vec()
    }

    pub fn sectors_to_move(&self) -> u64 {
        self.sectors_to_move
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.heap.len() >= self.capacity
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fill(heap: &mut BucketHeap, usages: &[u32]) {
        for (bucket, &used) in usages.iter().enumerate() {
            heap.push_or_replace(Candidate::new(bucket as u64, used));
        }
    }

    #[test]
    fn keeps_the_smallest_candidates() {
        let mut heap = BucketHeap::with_capacity(3);
        fill(&mut heap, &[90, 10, 70, 5, 40, 200]);

        let kept: Vec<u32> = heap.drain_sorted().iter().map(|c| c.sectors_used).collect();
        assert_eq!(kept, vec![5, 10, 40]);
        assert_eq!(heap.sectors_to_move(), 0);
    }

    #[test]
    fn running_total_tracks_replacements() {
        let mut heap = BucketHeap::with_capacity(2);
        fill(&mut heap, &[50, 30]);
        assert_eq!(heap.sectors_to_move(), 80);

        assert!(heap.push_or_replace(Candidate::new(9, 10)));
        assert_eq!(heap.sectors_to_move(), 40);
        assert!(!heap.push_or_replace(Candidate::new(10, 60)));
        assert_eq!(heap.sectors_to_move(), 40);
        assert_eq!(heap.peek_top().map(|c| c.sectors_used), Some(30));
    }

    #[test]
    fn trim_evicts_largest_first() {
        let mut heap = BucketHeap::with_capacity(8);
        fill(&mut heap, &[100, 20, 60, 5]);
        assert_eq!(heap.trim_to(90), 2);
        assert_eq!(heap.sectors_to_move(), 25);
        assert_eq!(heap.pop_min(), Some(Candidate::new(3, 5)));
        assert_eq!(heap.pop_min(), Some(Candidate::new(1, 20)));
        assert_eq!(heap.pop_min(), None);
        assert_eq!(heap.sectors_to_move(), 0);
    }

    #[test]
    fn equal_usage_breaks_ties_by_bucket_index() {
        let mut heap = BucketHeap::with_capacity(1);
        heap.push_or_replace(Candidate::new(7, 12));
        assert!(heap.push_or_replace(Candidate::new(3, 12)));
        assert!(!heap.push_or_replace(Candidate::new(5, 12)));
        assert_eq!(heap.peek_top(), Some(&Candidate::new(3, 12)));
    }

    #[test]
    fn zero_capacity_retains_nothing() {
        let mut heap = BucketHeap::with_capacity(0);
        assert!(!heap.push_or_replace(Candidate::new(0, 1)));
        assert!(heap.is_empty());
        assert_eq!(heap.trim_to(0), 0);
    }

    #[test]
    fn reset_clears_previous_sweep() {
        let mut heap = BucketHeap::with_capacity(2);
        fill(&mut heap, &[3, 4]);
        heap.reset(4);
        assert!(heap.is_empty());
        assert_eq!(heap.capacity(), 4);
        assert_eq!(heap.sectors_to_move(), 0);
    }
}
