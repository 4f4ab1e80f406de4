//! Partition descriptors of the single-pass decoupled look-back scan.
//!
//! A descriptor is one 64-bit word: the low half holds the status flag, the
//! high half the published value. Packing both into one word lets a group
//! publish them with a single atomic store.

/// Number of elements scanned by one group.
pub const ELEMENTS_PER_GROUP: u32 = 256;

/// Threads per group.
pub const GROUP_THREADS: u32 = 128;

/// Nothing published yet.
pub const FLAG_NOT_READY: u32 = 0;
/// The value is the partition's own total.
pub const FLAG_AGGREGATE: u32 = 1;
/// The value is the inclusive prefix up to and including the partition.
pub const FLAG_PREFIX: u32 = 2;

#[inline]
pub const fn pack(flag: u32, value: u32) -> u64 {
    ((value as u64) << 32) | flag as u64
}

#[inline]
pub const fn unpack(descriptor: u64) -> (u32, u32) {
    (descriptor as u32, (descriptor >> 32) as u32)
}
