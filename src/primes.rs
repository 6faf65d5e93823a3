//! Bucket counts for the chained table.
//!
//! Each entry is prime and roughly double its predecessor, which keeps
//! `hash % bucket_count` well spread even for hashers with weak low bits.

const PRIMES: &[u64] = &[
    5,
    11,
    23,
    53,
    97,
    193,
    389,
    769,
    1543,
    3079,
    6151,
    12289,
    24593,
    49157,
    98317,
    196613,
    393241,
    786433,
    1572869,
    3145739,
    6291469,
    12582917,
    25165843,
    50331653,
    100663319,
    201326611,
    402653189,
    805306457,
    1610612741,
    3221225473,
    4294967291,
];

/// Smallest tabulated prime `>= n`, or `None` past the end of the table.
pub fn next_prime(n: usize) -> Option<usize> {
    let i = PRIMES.partition_point(|&p| p < n as u64);
    PRIMES
        .get(i)
        .and_then(|&p| usize::try_from(p).ok())
}

/// Whether `n` is one of the tabulated bucket counts.
pub fn is_tabulated(n: usize) -> bool {
    PRIMES.binary_search(&(n as u64)).is_ok()
}

/// Largest bucket count addressable on this target.
pub fn largest() -> usize {
    PRIMES
        .iter()
        .rev()
        .find_map(|&p| usize::try_from(p).ok())
        .unwrap_or(0)
}
