// ChainTable integration suite (public API only).
//
// Core invariants exercised:
// - Bucket counts are 0 or a tabulated prime.
// - The load factor never exceeds the configured maximum after an insert.
// - Erasure never shrinks the bucket array.
// - Equal elements inserted as multi stay contiguous in insertion order.
use assoc_engine::primes;
use assoc_engine::{ChainTable, Counting, Error, SlotAllocator, TableConfig};
use hashbrown::hash_map::DefaultHashBuilder;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use std::collections::HashSet;

// Test: random inserts with max_load_factor = 1.0.
// Verifies: every observed bucket count is tabulated and the load factor
// stays at or below 1.0 throughout.
#[test]
fn random_inserts_keep_prime_buckets_and_load_bound() {
    let mut rng = StdRng::seed_from_u64(2024);
    let mut t = ChainTable::new();
    let mut model = HashSet::new();
    for _ in 0..10_000 {
        let v: u64 = rng.gen();
        let (_, fresh) = t.emplace_unique(v).unwrap();
        assert_eq!(fresh, model.insert(v));
        assert!(primes::is_tabulated(t.bucket_count()), "{}", t.bucket_count());
        assert!(t.load_factor() <= 1.0);
    }
    assert_eq!(t.len(), model.len());
    assert!(model.iter().all(|v| t.contains(v)));
}

// Test: erase everything in random order.
// Verifies: the table ends empty with its bucket count unchanged.
#[test]
fn erase_all_in_random_order_keeps_buckets() {
    let mut t = ChainTable::new();
    for v in 0..1000u32 {
        t.emplace_unique(v).unwrap();
    }
    let buckets = t.bucket_count();
    let mut order: Vec<u32> = (0..1000).collect();
    order.shuffle(&mut StdRng::seed_from_u64(9));
    for v in order {
        assert_eq!(t.erase_unique(&v), Some(v));
        assert_eq!(t.bucket_count(), buckets);
    }
    assert!(t.is_empty());
    assert_eq!(t.iter().count(), 0);
    assert_eq!(t.bucket_count(), buckets);
}

// Test: key/value pairs keyed by the first field.
// Verifies: multi inserts group equal keys contiguously in insertion order
// and erase_multi removes the whole group.
#[test]
fn multimap_style_pairs() {
    #[derive(Debug)]
    struct Entry(&'static str, u32);
    impl PartialEq for Entry {
        fn eq(&self, o: &Self) -> bool {
            self.0 == o.0
        }
    }
    impl Eq for Entry {}
    impl std::hash::Hash for Entry {
        fn hash<H: std::hash::Hasher>(&self, h: &mut H) {
            self.0.hash(h)
        }
    }

    let mut t = ChainTable::new();
    for (i, k) in ["a", "b", "a", "c", "a", "b"].into_iter().enumerate() {
        t.emplace_multi(Entry(k, i as u32)).unwrap();
    }
    let a: Vec<u32> = t.equal_range(&Entry("a", 0)).map(|e| e.1).collect();
    assert_eq!(a, vec![0, 2, 4]);
    assert_eq!(t.count_multi(&Entry("b", 0)), 2);
    assert_eq!(t.erase_multi(&Entry("a", 0)), 3);
    assert_eq!(t.len(), 3);
    assert!(!t.contains(&Entry("a", 0)));
}

// Test: positions across growth.
// Verifies: a position taken before several rehashes still reads and
// erases the same element.
#[test]
fn positions_survive_growth() {
    let mut t = ChainTable::new();
    let (pos, _) = t.emplace_unique("anchor".to_string()).unwrap();
    for i in 0..500 {
        t.emplace_unique(format!("k{i}")).unwrap();
    }
    assert!(t.bucket_count() > 5);
    assert_eq!(t.get(pos).map(String::as_str), Some("anchor"));
    assert_eq!(t.erase(pos).as_deref(), Some("anchor"));
    assert!(t.get(pos).is_none());
    assert!(!t.contains("anchor"));
}

// Test: configuration and explicit sizing.
#[test]
fn config_reserve_and_rehash() {
    let cfg = TableConfig {
        max_load_factor: 2.0,
        initial_bucket_count: 20,
    };
    let mut t =
        ChainTable::with_config(cfg, DefaultHashBuilder::default(), SlotAllocator::new()).unwrap();
    assert_eq!(t.bucket_count(), 23);
    for v in 0..46u32 {
        t.emplace_unique(v).unwrap();
    }
    assert_eq!(t.bucket_count(), 23, "46 elements fit 23 buckets at load 2.0");
    t.emplace_unique(46).unwrap();
    assert_eq!(t.bucket_count(), 53);

    t.reserve(1000).unwrap();
    assert_eq!(t.bucket_count(), 769);
    assert_eq!(t.rehash(usize::MAX), Err(Error::CapacityOverflow));
    assert_eq!(t.bucket_count(), 769);
    assert_eq!(t.len(), 47);

    let bad = TableConfig {
        max_load_factor: -1.0,
        initial_bucket_count: 0,
    };
    assert!(matches!(
        ChainTable::<u32>::with_config(bad, DefaultHashBuilder::default(), SlotAllocator::new()),
        Err(Error::InvalidLoadFactor)
    ));
}

// Test: node accounting.
// Verifies: clear and drop release every node the table allocated.
#[test]
fn clear_and_drop_release_nodes() {
    let (alloc, stats) = Counting::new(SlotAllocator::new());
    let mut t = ChainTable::with_hasher_and_allocator(DefaultHashBuilder::default(), alloc);
    for v in 0..300u32 {
        t.emplace_multi(v % 50).unwrap();
    }
    assert_eq!(stats.live(), 300);
    t.clear();
    assert_eq!(stats.live(), 0);
    for v in 0..10u32 {
        t.emplace_unique(v).unwrap();
    }
    drop(t);
    assert_eq!(stats.live(), 0);
    assert_eq!(stats.allocations(), 310);
}
