//! [`EpochList`] identifies one iteration of the loops a graph node sits
//! inside of: a small tuple of monotonically-increasing counters, one per
//! loop dimension.

use smallvec::SmallVec;

/// Graphs are bounded to this many loop dimensions ("a small, fixed bound").
/// `SmallVec` keeps an `EpochList` inline up to this width with no heap
/// allocation.
pub const MAX_DIMS: usize = 8;

/// A tuple of non-negative loop counters, one per dimension of the
/// surrounding graph. Counters only ever increase until a graph-wide
/// [`EpochList::reset`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EpochList {
    counters: SmallVec<[u32; MAX_DIMS]>,
}

impl EpochList {
    /// A fresh, all-zero epoch for a graph with `dims` loop dimensions.
    pub fn zero(dims: usize) -> Self {
        assert!(dims <= MAX_DIMS, "graph has more than {MAX_DIMS} dimensions");
        EpochList {
            counters: smallvec::smallvec![0; dims],
        }
    }

    pub fn dims(&self) -> usize {
        self.counters.len()
    }

    /// The counter for dimension `d`. Panics if `d` is out of range.
    pub fn at(&self, d: usize) -> u32 {
        self.counters[d]
    }

    /// Increment dimension `d` by one. Panics if `d` is out of range.
    pub fn increment(&mut self, d: usize) {
        self.counters[d] += 1;
    }

    /// Sum of the counters at the given dimension indices. An empty slice
    /// yields `0`, identifying the single scalar key used by values that
    /// vary across no loop dimension.
    pub fn sum(&self, assoc_dims: &[usize]) -> u32 {
        assoc_dims.iter().map(|&d| self.counters[d]).sum()
    }

    /// True iff every dimension matches `other` exactly.
    pub fn same_as(&self, other: &EpochList) -> bool {
        self.counters == other.counters
    }

    /// True iff, componentwise, `self[d] >= other[d]` for every dimension.
    pub fn ahead_of(&self, other: &EpochList) -> bool {
        self.counters
            .iter()
            .zip(other.counters.iter())
            .all(|(a, b)| a >= b)
    }

    /// Overwrite every counter with `other`'s.
    pub fn copy_from(&mut self, other: &EpochList) {
        self.counters.clone_from(&other.counters);
    }

    /// Zero every counter, keeping the dimension count.
    pub fn reset(&mut self) {
        for c in self.counters.iter_mut() {
            *c = 0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sum_of_empty_dims_is_zero() {
        let e = EpochList::zero(3);
        assert_eq!(e.sum(&[]), 0);
    }

    #[test]
    fn increment_and_sum() {
        let mut e = EpochList::zero(3);
        e.increment(0);
        e.increment(0);
        e.increment(2);
        assert_eq!(e.sum(&[0, 2]), 3);
        assert_eq!(e.sum(&[1]), 0);
    }

    #[test]
    fn ahead_of_is_componentwise() {
        let mut a = EpochList::zero(2);
        let b = EpochList::zero(2);
        assert!(a.ahead_of(&b));
        a.increment(0);
        assert!(a.ahead_of(&b));
        assert!(!b.ahead_of(&a));
    }

    #[test]
    fn copy_from_and_reset_roundtrip() {
        let mut a = EpochList::zero(2);
        a.increment(1);
        let mut b = EpochList::zero(2);
        b.copy_from(&a);
        assert!(b.same_as(&a));
        b.reset();
        assert_eq!(b.at(1), 0);
        assert!(a.at(1) == 1, "reset must not affect the source");
    }

    #[test]
    #[should_panic]
    fn indexing_out_of_range_panics() {
        let e = EpochList::zero(2);
        e.at(5);
    }
}
