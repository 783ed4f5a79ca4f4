//! [`ValuePool`] stores one value of type `T` per epoch, keyed sparsely by
//! the epoch-sum over the dimensions the value actually varies across.

use crate::epoch::EpochList;
use hashbrown::HashMap;
use smallvec::SmallVec;

use crate::epoch::MAX_DIMS;

/// A sparse, epoch-indexed store for a single quantity (an argument, a
/// stage, a return code, a decision, ...) that a graph node tracks across
/// loop iterations.
///
/// `T` may itself be an owned buffer; [`ValuePool::remove`] and
/// [`ValuePool::reset`] hand such values back to the caller rather than
/// dropping them, so the caller can push them onto a recycle free-list
/// instead of deallocating.
#[derive(Debug)]
pub struct ValuePool<T> {
    assoc_dims: SmallVec<[usize; MAX_DIMS]>,
    values: HashMap<u32, T>,
}

impl<T> ValuePool<T> {
    /// A pool whose values vary across the given loop dimensions. An empty
    /// slice makes this a scalar pool, keyed under `0`.
    pub fn new(assoc_dims: &[usize]) -> Self {
        ValuePool {
            assoc_dims: assoc_dims.iter().copied().collect(),
            values: HashMap::new(),
        }
    }

    fn key(&self, epoch: &EpochList) -> u32 {
        epoch.sum(&self.assoc_dims)
    }

    /// Overwrite the mapping for `epoch`'s key, dropping any previous value
    /// at that key.
    pub fn set(&mut self, epoch: &EpochList, value: T) {
        let key = self.key(epoch);
        self.values.insert(key, value);
    }

    /// The value at `epoch`'s key. Panics if [`Self::has`] would be false —
    /// callers must check readiness first.
    pub fn get(&self, epoch: &EpochList) -> &T {
        let key = self.key(epoch);
        self.values
            .get(&key)
            .unwrap_or_else(|| panic!("ValuePool::get on unset epoch key {key}"))
    }

    /// A mutable view of the value at `epoch`'s key. Same precondition as
    /// [`Self::get`].
    pub fn get_mut(&mut self, epoch: &EpochList) -> &mut T {
        let key = self.key(epoch);
        self.values
            .get_mut(&key)
            .unwrap_or_else(|| panic!("ValuePool::get_mut on unset epoch key {key}"))
    }

    /// True iff a value has been set for `epoch`'s key and not since
    /// removed or reset.
    pub fn has(&self, epoch: &EpochList) -> bool {
        self.values.contains_key(&self.key(epoch))
    }

    /// Remove and return the value at `epoch`'s key. Panics if
    /// [`Self::has`] would be false.
    pub fn remove(&mut self, epoch: &EpochList) -> T {
        let key = self.key(epoch);
        self.values
            .remove(&key)
            .unwrap_or_else(|| panic!("ValuePool::remove on unset epoch key {key}"))
    }

    /// Clear every mapping, returning the removed values so the caller can
    /// recycle any owned buffers among them.
    pub fn reset(&mut self) -> Vec<T> {
        self.values.drain().map(|(_, v)| v).collect()
    }

    pub fn assoc_dims(&self) -> &[usize] {
        &self.assoc_dims
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scalar_pool_shares_one_key() {
        let mut pool: ValuePool<i32> = ValuePool::new(&[]);
        let mut e1 = EpochList::zero(2);
        let mut e2 = EpochList::zero(2);
        e1.increment(0);
        e2.increment(1);
        pool.set(&e1, 10);
        // e2 has a different dim incremented, but assoc_dims is empty so
        // both map to key 0.
        assert!(pool.has(&e2));
        assert_eq!(*pool.get(&e2), 10);
    }

    #[test]
    fn per_dim_pool_separates_iterations() {
        let mut pool: ValuePool<i32> = ValuePool::new(&[0]);
        let mut e0 = EpochList::zero(1);
        pool.set(&e0, 1);
        e0.increment(0);
        pool.set(&e0, 2);
        assert_eq!(*pool.get(&e0), 2);
        e0.reset();
        assert_eq!(*pool.get(&e0), 1);
    }

    #[test]
    fn remove_hands_back_ownership() {
        let mut pool: ValuePool<Vec<u8>> = ValuePool::new(&[]);
        let e = EpochList::zero(1);
        pool.set(&e, vec![1, 2, 3]);
        let recovered = pool.remove(&e);
        assert_eq!(recovered, vec![1, 2, 3]);
        assert!(!pool.has(&e));
    }

    #[test]
    #[should_panic]
    fn get_on_unset_epoch_panics() {
        let pool: ValuePool<i32> = ValuePool::new(&[]);
        let e = EpochList::zero(1);
        pool.get(&e);
    }
}
