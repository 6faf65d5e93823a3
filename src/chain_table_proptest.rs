#![cfg(test)]

// Property tests for ChainTable kept inside the crate so they can call the
// structural `validate` after every step.

use crate::chain_table::{ChainPos, ChainTable};
use proptest::prelude::*;
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::hash::{BuildHasher, Hasher};

// Key newtype with Borrow<str> to exercise borrowed lookup.
#[derive(Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
struct Key(String);
impl fmt::Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}
impl std::borrow::Borrow<str> for Key {
    fn borrow(&self) -> &str {
        &self.0
    }
}

// Pool-indexed operations: indices shrink to earlier keys and op lists
// shrink in length.
#[derive(Clone, Debug)]
enum OpI {
    Insert(usize),
    InsertMulti(usize),
    EraseKey(usize),
    EraseMulti(usize),
    ErasePos(usize),
    Contains(String),
    Rehash(usize),
    Iterate,
}

fn arb_scenario() -> impl Strategy<Value = (Vec<String>, Vec<OpI>)> {
    proptest::collection::vec("[a-z]{0,4}", 1..=10).prop_flat_map(|pool| {
        let idxs: Vec<usize> = (0..pool.len()).collect();
        let idx = proptest::sample::select(idxs);
        let contains_pool = proptest::sample::select(pool.clone());
        let op = prop_oneof![
            4 => idx.clone().prop_map(OpI::Insert),
            3 => idx.clone().prop_map(OpI::InsertMulti),
            2 => idx.clone().prop_map(OpI::EraseKey),
            1 => idx.clone().prop_map(OpI::EraseMulti),
            1 => any::<usize>().prop_map(OpI::ErasePos),
            2 => prop_oneof![
                contains_pool.prop_map(|s: String| s),
                "[a-z]{0,4}".prop_map(|s| s)
            ]
            .prop_map(OpI::Contains),
            1 => (0usize..300).prop_map(OpI::Rehash),
            1 => Just(OpI::Iterate),
        ];
        proptest::collection::vec(op, 1..80).prop_map(move |ops| (pool.clone(), ops))
    })
}

fn nth_pos<S, A>(t: &ChainTable<Key, S, A>, i: usize) -> Option<ChainPos>
where
    A: crate::alloc::NodeAllocator<crate::node::ChainNode<Key>>,
{
    if t.is_empty() {
        return None;
    }
    let mut p = t.first();
    for _ in 0..i % t.len() {
        p = p.and_then(|p| t.next(p));
    }
    p
}

// Runs of equal keys must be contiguous in bucket order.
fn runs_contiguous<S, A>(t: &ChainTable<Key, S, A>) -> bool
where
    A: crate::alloc::NodeAllocator<crate::node::ChainNode<Key>>,
{
    let mut closed: BTreeSet<&Key> = BTreeSet::new();
    let mut prev: Option<&Key> = None;
    for k in t.iter() {
        if prev != Some(k) {
            if !closed.insert(k) {
                return false;
            }
            prev = Some(k);
        }
    }
    true
}

fn run_model<S: BuildHasher>(
    pool: Vec<String>,
    ops: Vec<OpI>,
    mut sut: ChainTable<Key, S>,
) -> Result<(), TestCaseError> {
    let mut model: HashMap<Key, usize> = HashMap::new();
    for op in ops {
        match op {
            OpI::Insert(i) => {
                let k = Key(pool[i].clone());
                let already = model.contains_key(&k);
                let (pos, fresh) = sut.emplace_unique(k.clone()).unwrap();
                prop_assert_eq!(fresh, !already);
                prop_assert_eq!(sut.get(pos), Some(&k));
                if fresh {
                    model.insert(k, 1);
                }
            }
            OpI::InsertMulti(i) => {
                let k = Key(pool[i].clone());
                let pos = sut.emplace_multi(k.clone()).unwrap();
                prop_assert_eq!(sut.get(pos), Some(&k));
                *model.entry(k).or_default() += 1;
            }
            OpI::EraseKey(i) => {
                let k = &pool[i];
                let got = sut.erase_unique(k.as_str());
                match model.get_mut(k.as_str()) {
                    Some(c) => {
                        prop_assert_eq!(got.as_ref().map(|g| g.0.as_str()), Some(k.as_str()));
                        *c -= 1;
                        if *c == 0 {
                            model.remove(k.as_str());
                        }
                    }
                    None => prop_assert!(got.is_none()),
                }
            }
            OpI::EraseMulti(i) => {
                let k = &pool[i];
                let want = model.remove(k.as_str()).unwrap_or(0);
                prop_assert_eq!(sut.erase_multi(k.as_str()), want);
            }
            OpI::ErasePos(i) => {
                if let Some(p) = nth_pos(&sut, i) {
                    let k = sut.erase(p).expect("position from a walk is live");
                    let c = model.get_mut(&k).expect("erased key tracked");
                    *c -= 1;
                    if *c == 0 {
                        model.remove(&k);
                    }
                    prop_assert!(sut.erase(p).is_none(), "erased position is stale");
                }
            }
            OpI::Contains(s) => {
                prop_assert_eq!(sut.contains(s.as_str()), model.contains_key(s.as_str()));
                prop_assert_eq!(sut.find(s.as_str()).is_some(), model.contains_key(s.as_str()));
                let want = model.get(s.as_str()).copied().unwrap_or(0);
                prop_assert_eq!(sut.count_multi(s.as_str()), want);
            }
            OpI::Rehash(n) => {
                let before: Vec<Key> = {
                    let mut v: Vec<Key> = sut.iter().cloned().collect();
                    v.sort();
                    v
                };
                sut.rehash(n).unwrap();
                let mut after: Vec<Key> = sut.iter().cloned().collect();
                after.sort();
                prop_assert_eq!(before, after);
            }
            OpI::Iterate => {
                let s_keys: BTreeSet<_> = sut.iter().cloned().collect();
                let m_keys: BTreeSet<_> = model.keys().cloned().collect();
                prop_assert_eq!(s_keys, m_keys);
                prop_assert_eq!(sut.iter().count(), sut.len());
            }
        }

        if let Err(e) = sut.validate() {
            prop_assert!(false, "invalid table: {}", e);
        }
        prop_assert!(runs_contiguous(&sut), "equal keys split across the table");
        prop_assert_eq!(sut.len(), model.values().sum::<usize>());
        prop_assert_eq!(sut.is_empty(), model.is_empty());
    }
    Ok(())
}

// Property: state-machine equivalence against a HashMap of counts.
// - unique inserts succeed iff the key is absent; multi inserts always do.
// - `find`/`contains`/`count_multi` parity with the model.
// - `erase(pos)` returns the element and leaves the position stale.
// - rehash keeps the multiset of elements.
// - after every op the table validates and equal keys stay contiguous.
proptest! {
    #![proptest_config(ProptestConfig { cases: 96, .. ProptestConfig::default() })]
    #[test]
    fn prop_state_machine((pool, ops) in arb_scenario()) {
        run_model(pool, ops, ChainTable::new())?;
    }
}

// Collision variant using a constant hasher to stress equality resolution.
#[derive(Clone, Default)]
struct ConstBuildHasher;
struct ConstHasher;
impl BuildHasher for ConstBuildHasher {
    type Hasher = ConstHasher;
    fn build_hasher(&self) -> Self::Hasher {
        ConstHasher
    }
}
impl Hasher for ConstHasher {
    fn write(&mut self, _bytes: &[u8]) {}
    fn finish(&self) -> u64 {
        0
    }
}

proptest! {
    #![proptest_config(ProptestConfig { cases: 48, .. ProptestConfig::default() })]
    #[test]
    fn prop_state_machine_collisions((pool, ops) in arb_scenario()) {
        run_model(pool, ops, ChainTable::with_hasher(ConstBuildHasher))?;
    }
}

// Sanity check that the key type hashes consistently with its borrowed form,
// which borrowed lookups rely on.
#[test]
fn key_hash_matches_str_hash() {
    let s = hashbrown::hash_map::DefaultHashBuilder::default();
    let k = Key("abc".into());
    assert_eq!(s.hash_one(&k), s.hash_one("abc"));
}
