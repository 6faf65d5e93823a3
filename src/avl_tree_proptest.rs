#![cfg(test)]

// Property tests for AvlTree kept inside the crate so they can call the
// structural `validate` after every step.

use crate::alloc::{Bounded, SlotAllocator};
use crate::avl_tree::AvlTree;
use crate::compare::Natural;
use crate::node::Link;
use proptest::prelude::*;
use std::collections::{BTreeMap, BTreeSet};
use std::ops::Bound;

#[derive(Clone, Debug)]
enum Op {
    Insert(i16),
    InsertHint(usize, i16),
    RangeInsert(Vec<i16>),
    Erase(i16),
    ErasePos(usize),
    Bounds(i16),
    Iterate,
}

fn arb_ops() -> impl Strategy<Value = Vec<Op>> {
    // Small key space so duplicates and hits are frequent.
    let key = -40i16..40;
    let op = prop_oneof![
        4 => key.clone().prop_map(Op::Insert),
        2 => (any::<usize>(), key.clone()).prop_map(|(i, v)| Op::InsertHint(i, v)),
        1 => proptest::collection::vec(key.clone(), 0..12).prop_map(Op::RangeInsert),
        1 => proptest::collection::vec(key.clone(), 0..12).prop_map(|mut v| {
            v.sort();
            Op::RangeInsert(v)
        }),
        2 => key.clone().prop_map(Op::Erase),
        1 => any::<usize>().prop_map(Op::ErasePos),
        1 => key.prop_map(Op::Bounds),
        1 => Just(Op::Iterate),
    ];
    proptest::collection::vec(op, 1..80)
}

/// Position `i` steps from the first element, modulo `len + 1`, so the
/// sentinel is also chosen.
fn nth_pos<A>(t: &AvlTree<i16, Natural, A>, i: usize) -> Link
where
    A: crate::alloc::NodeAllocator<crate::node::TreeNode<i16>>,
{
    let mut p = t.first();
    for _ in 0..i % (t.len() + 1) {
        p = t.next(p);
    }
    p
}

fn check_height(len: usize, height: usize) -> bool {
    // AVL bound: h < 1.4405 * log2(n + 2)
    len == 0 || (height as f64) < 1.4405 * ((len + 2) as f64).log2()
}

// Property: unique tree equivalence against BTreeSet.
// - `emplace_unique` (plain, hinted, ranged) inserts iff the key is absent.
// - lookups, bounds and ordered iteration agree with the model.
// - after every op the tree passes `validate` and respects the height bound.
proptest! {
    #![proptest_config(ProptestConfig { cases: 96, .. ProptestConfig::default() })]
    #[test]
    fn prop_unique_tree_matches_btreeset(ops in arb_ops()) {
        let mut sut: AvlTree<i16> = AvlTree::new();
        let mut model: BTreeSet<i16> = BTreeSet::new();

        for op in ops {
            match op {
                Op::Insert(v) => {
                    let (id, fresh) = sut.emplace_unique(v).unwrap();
                    prop_assert_eq!(fresh, model.insert(v));
                    prop_assert_eq!(sut.value(id), Some(&v));
                }
                Op::InsertHint(i, v) => {
                    let hint = nth_pos(&sut, i);
                    let (id, fresh) = sut.emplace_unique_hint(hint, v).unwrap();
                    prop_assert_eq!(fresh, model.insert(v));
                    prop_assert_eq!(sut.value(id), Some(&v));
                }
                Op::RangeInsert(vs) => {
                    let n = sut.range_insert_unique(vs.iter().copied()).unwrap();
                    let mut added = 0;
                    for v in vs {
                        added += usize::from(model.insert(v));
                    }
                    prop_assert_eq!(n, added);
                }
                Op::Erase(v) => {
                    prop_assert_eq!(sut.erase_unique(&v), model.take(&v));
                }
                Op::ErasePos(i) => {
                    let p = nth_pos(&sut, i);
                    match sut.erase(p) {
                        Some(v) => prop_assert!(model.remove(&v)),
                        None => prop_assert!(p.is_sentinel()),
                    }
                }
                Op::Bounds(v) => {
                    prop_assert_eq!(sut.get(sut.lower_bound(&v)), model.range(v..).next());
                    prop_assert_eq!(
                        sut.get(sut.upper_bound(&v)),
                        model.range((Bound::Excluded(v), Bound::Unbounded)).next()
                    );
                    prop_assert_eq!(sut.contains(&v), model.contains(&v));
                    prop_assert_eq!(sut.count_unique(&v), usize::from(model.contains(&v)));
                }
                Op::Iterate => {
                    let fwd: Vec<i16> = sut.iter().copied().collect();
                    let want: Vec<i16> = model.iter().copied().collect();
                    prop_assert_eq!(&fwd, &want);
                    let back: Vec<i16> = sut.iter().rev().copied().collect();
                    prop_assert_eq!(back, want.into_iter().rev().collect::<Vec<_>>());
                }
            }

            if let Err(e) = sut.validate() {
                prop_assert!(false, "invalid tree: {}", e);
            }
            prop_assert_eq!(sut.len(), model.len());
            prop_assert!(check_height(sut.len(), sut.height()));
            prop_assert_eq!(sut.get(sut.first()), model.first());
            prop_assert_eq!(sut.get(sut.last()), model.last());
        }
    }
}

// Property: multi tree equivalence against a count map.
// - `emplace_multi` always inserts; counts and `erase_multi` agree.
// - erasing arbitrary positions keeps the remaining order intact.
proptest! {
    #![proptest_config(ProptestConfig { cases: 96, .. ProptestConfig::default() })]
    #[test]
    fn prop_multi_tree_matches_count_map(ops in arb_ops()) {
        let mut sut: AvlTree<i16> = AvlTree::new();
        let mut model: BTreeMap<i16, usize> = BTreeMap::new();

        for op in ops {
            match op {
                Op::Insert(v) => {
                    let id = sut.emplace_multi(v).unwrap();
                    prop_assert_eq!(sut.value(id), Some(&v));
                    *model.entry(v).or_default() += 1;
                }
                Op::InsertHint(i, v) => {
                    let hint = nth_pos(&sut, i);
                    sut.emplace_multi_hint(hint, v).unwrap();
                    *model.entry(v).or_default() += 1;
                }
                Op::RangeInsert(vs) => {
                    let n = sut.range_insert_multi(vs.iter().copied()).unwrap();
                    prop_assert_eq!(n, vs.len());
                    for v in vs {
                        *model.entry(v).or_default() += 1;
                    }
                }
                Op::Erase(v) => {
                    let want = model.remove(&v).unwrap_or(0);
                    prop_assert_eq!(sut.erase_multi(&v), want);
                }
                Op::ErasePos(i) => {
                    let p = nth_pos(&sut, i);
                    if let Some(v) = sut.erase(p) {
                        let c = model.get_mut(&v).expect("erased value tracked");
                        *c -= 1;
                        if *c == 0 {
                            model.remove(&v);
                        }
                    }
                }
                Op::Bounds(v) => {
                    let want = model.get(&v).copied().unwrap_or(0);
                    prop_assert_eq!(sut.count_multi(&v), want);
                    let (lo, hi) = sut.equal_range(&v);
                    prop_assert_eq!(sut.range(lo, hi).count(), want);
                }
                Op::Iterate => {
                    let fwd: Vec<i16> = sut.iter().copied().collect();
                    let want: Vec<i16> = model
                        .iter()
                        .flat_map(|(&v, &c)| std::iter::repeat(v).take(c))
                        .collect();
                    prop_assert_eq!(fwd, want);
                }
            }

            if let Err(e) = sut.validate() {
                prop_assert!(false, "invalid tree: {}", e);
            }
            prop_assert_eq!(sut.len(), model.values().sum::<usize>());
            prop_assert!(check_height(sut.len(), sut.height()));
        }
    }
}

// Property: a range insert that runs out of nodes part way leaves the tree
// with exactly its previous contents.
proptest! {
    #![proptest_config(ProptestConfig { cases: 64, .. ProptestConfig::default() })]
    #[test]
    fn prop_failed_range_insert_rolls_back(
        base in proptest::collection::vec(-30i16..30, 0..20),
        batch in proptest::collection::vec(-30i16..30, 1..20),
        sorted in any::<bool>(),
        spare in 0usize..5,
    ) {
        prop_assume!(spare < batch.len());
        let limit = base.len() + spare;
        let alloc = Bounded::new(SlotAllocator::new(), limit);
        let mut t = AvlTree::with_comparator_and_allocator(Natural, alloc);
        t.range_insert_multi(base.iter().copied()).unwrap();
        let before: Vec<i16> = t.iter().copied().collect();

        let mut batch = batch;
        if sorted {
            batch.sort();
        }

        prop_assert!(t.range_insert_multi(batch).is_err());
        prop_assert_eq!(t.iter().copied().collect::<Vec<_>>(), before);
        if let Err(e) = t.validate() {
            prop_assert!(false, "invalid tree: {}", e);
        }
    }
}
