//! Encoding for the identifier a [`crate::Backend`] attaches to every
//! in-flight submission. Packs `(node_id << K) | epoch_sum` into a single
//! `u64`, mirroring the `user_data` field of an `io_uring` submission queue
//! entry; `K` is the number of bits reserved for the epoch-sum component.

use std::fmt;

/// Default width reserved for the epoch-sum component. Call
/// [`EntryId::with_width`] for graphs that need a wider reservation (more
/// loop dimensions or more iterations per dimension than 16 bits of sum can
/// hold).
pub const DEFAULT_EPOCH_BITS: u32 = 16;

/// An error produced when an epoch-sum value cannot be represented in the
/// reserved bit width of an [`EntryId`].
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("epoch sum {epoch_sum} does not fit in {bits} reserved bits")]
pub struct EpochSumOverflow {
    pub epoch_sum: u32,
    pub bits: u32,
}

/// Identity of one in-flight backend entry: which node it belongs to, and at
/// which epoch-sum. Bijective on `(node_id, epoch_sum)` pairs that fit in the
/// chosen width.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct EntryId {
    raw: u64,
    bits: u32,
}

impl EntryId {
    /// Encode using [`DEFAULT_EPOCH_BITS`].
    pub fn new(node_id: u32, epoch_sum: u32) -> Result<Self, EpochSumOverflow> {
        Self::with_width(node_id, epoch_sum, DEFAULT_EPOCH_BITS)
    }

    /// Encode reserving `bits` for the epoch-sum component.
    pub fn with_width(node_id: u32, epoch_sum: u32, bits: u32) -> Result<Self, EpochSumOverflow> {
        debug_assert!(bits < 64, "reserved width must leave room for node_id");
        let mask = (1u64 << bits) - 1;
        if (epoch_sum as u64) > mask {
            return Err(EpochSumOverflow { epoch_sum, bits });
        }
        let raw = ((node_id as u64) << bits) | (epoch_sum as u64);
        Ok(EntryId { raw, bits })
    }

    pub fn node_id(&self) -> u32 {
        (self.raw >> self.bits) as u32
    }

    pub fn epoch_sum(&self) -> u32 {
        let mask = (1u64 << self.bits) - 1;
        (self.raw & mask) as u32
    }

    /// The raw packed value, suitable for stashing in a `user_data`-style
    /// field.
    pub fn raw(&self) -> u64 {
        self.raw
    }

    /// Reconstruct from a raw value previously returned by [`Self::raw`],
    /// given the width it was encoded with.
    pub fn from_raw(raw: u64, bits: u32) -> Self {
        EntryId { raw, bits }
    }
}

impl fmt::Debug for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntryId")
            .field("node_id", &self.node_id())
            .field("epoch_sum", &self.epoch_sum())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_raw() {
        let id = EntryId::new(42, 7).unwrap();
        assert_eq!(id.node_id(), 42);
        assert_eq!(id.epoch_sum(), 7);
        let back = EntryId::from_raw(id.raw(), DEFAULT_EPOCH_BITS);
        assert_eq!(back.node_id(), 42);
        assert_eq!(back.epoch_sum(), 7);
    }

    #[test]
    fn rejects_epoch_sum_too_wide_for_reservation() {
        assert!(EntryId::with_width(1, 4, 2).is_err());
        assert!(EntryId::with_width(1, 3, 2).is_ok());
    }

    #[test]
    fn distinct_pairs_never_collide() {
        use std::collections::HashSet;
        let mut seen = HashSet::new();
        for node in 0..50u32 {
            for epoch in 0..50u32 {
                let id = EntryId::new(node, epoch).unwrap();
                assert!(seen.insert(id.raw()), "collision at ({node}, {epoch})");
            }
        }
    }
}
