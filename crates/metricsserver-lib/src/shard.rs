//! Hash-based shard assignment
//!
//! The same rule assigns applications to server nodes and envelopes to
//! processor workers. Both callers must use [`owner`] so they never disagree
//! about which bucket a key belongs to.

const FNV_OFFSET_BASIS: u32 = 0x811c_9dc5;
const FNV_PRIME: u32 = 0x0100_0193;

/// 32-bit FNV-1a hash of `key`
pub fn fnv1a_32(key: &str) -> u32 {
    key.bytes().fold(FNV_OFFSET_BASIS, |hash, byte| {
        (hash ^ u32::from(byte)).wrapping_mul(FNV_PRIME)
    })
}

/// Bucket in `0..buckets` that owns `key`.
///
/// A bucket count of zero is treated as one.
pub fn owner(key: &str, buckets: usize) -> usize {
    let buckets = buckets.max(1) as u64;
    (u64::from(fnv1a_32(key)) % buckets) as usize
}

/// Whether `index` is the owning bucket of `key`
pub fn is_owner(key: &str, index: usize, buckets: usize) -> bool {
    owner(key, buckets) == index
}
