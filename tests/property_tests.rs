#![allow(missing_docs)]

use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::Arc;

use proptest::prelude::*;

use cowkv::storage::{Common, KvFormat, Options, Tree};
use cowkv::MemStore;

#[derive(Debug, Clone)]
enum Operation {
    Put { key: Vec<u8>, val: Vec<u8> },
    Delete { key: Vec<u8> },
    Commit { lag: u64 },
}

fn arb_key() -> impl Strategy<Value = Vec<u8>> {
    prop::collection::vec(0u8..8, 1..6)
}

fn arb_operation() -> impl Strategy<Value = Operation> {
    prop_oneof![
        6 => (arb_key(), prop::collection::vec(any::<u8>(), 0..48))
            .prop_map(|(key, val)| Operation::Put { key, val }),
        3 => arb_key().prop_map(|key| Operation::Delete { key }),
        1 => (0u64..3).prop_map(|lag| Operation::Commit { lag }),
    ]
}

fn bound(b: &Bound<Vec<u8>>) -> Bound<&[u8]> {
    match b {
        Bound::Included(k) => Bound::Included(k.as_slice()),
        Bound::Excluded(k) => Bound::Excluded(k.as_slice()),
        Bound::Unbounded => Bound::Unbounded,
    }
}

fn arb_bound() -> impl Strategy<Value = Bound<Vec<u8>>> {
    prop_oneof![
        arb_key().prop_map(Bound::Included),
        arb_key().prop_map(Bound::Excluded),
        Just(Bound::Unbounded),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn prop_tree_matches_model(ops in prop::collection::vec(arb_operation(), 1..400)) {
        let mut cx = Common::create(
            Arc::new(MemStore::new()),
            Options::default().page_size(128),
        ).unwrap();
        let mut tree = Tree::open(&cx, b"prop", KvFormat).unwrap();
        let mut model = BTreeMap::new();
        cx.begin(0).unwrap();

        for op in ops {
            match op {
                Operation::Put { key, val } => {
                    let existed = tree.put(&mut cx, &key, &val).unwrap();
                    prop_assert_eq!(existed, model.insert(key, val).is_some());
                }
                Operation::Delete { key } => {
                    let removed = tree.delete(&mut cx, &key).unwrap();
                    prop_assert_eq!(removed, model.remove(&key).is_some());
                }
                Operation::Commit { lag } => {
                    cx.commit().unwrap();
                    let extents = tree.extents(&cx).unwrap();
                    cx.check_space(&extents).unwrap();
                    cx.begin(cx.committed().saturating_sub(lag)).unwrap();
                }
            }
        }
        cx.commit().unwrap();

        prop_assert_eq!(tree.audit(&cx).unwrap(), model.len());
        let entries = tree.cursor(&cx).unwrap().collect_all().unwrap();
        let expected: Vec<_> = model.clone().into_iter().collect();
        prop_assert_eq!(entries, expected);
        let extents = tree.extents(&cx).unwrap();
        cx.check_space(&extents).unwrap();
    }

    #[test]
    fn prop_ranges_match_model(
        keys in prop::collection::btree_set(arb_key(), 0..200),
        lo in arb_bound(),
        hi in arb_bound(),
    ) {
        let mut cx = Common::create(
            Arc::new(MemStore::new()),
            Options::default().page_size(64),
        ).unwrap();
        let mut tree = Tree::new(&cx, KvFormat).unwrap();
        cx.begin(0).unwrap();
        for key in &keys {
            tree.put(&mut cx, key, b"v").unwrap();
        }
        cx.commit().unwrap();

        let inverted = match (&lo, &hi) {
            (Bound::Included(a) | Bound::Excluded(a), Bound::Included(b) | Bound::Excluded(b)) => {
                a > b || (a == b && !(matches!(lo, Bound::Included(_)) && matches!(hi, Bound::Included(_))))
            }
            _ => false,
        };
        let expected: Vec<Vec<u8>> = if inverted {
            Vec::new()
        } else {
            keys.range::<Vec<u8>, _>((lo.clone(), hi.clone())).cloned().collect()
        };

        let forward: Vec<Vec<u8>> = tree
            .range(&cx, bound(&lo), bound(&hi))
            .unwrap()
            .collect_all()
            .unwrap()
            .into_iter()
            .map(|(k, _)| k)
            .collect();
        prop_assert_eq!(&forward, &expected);

        let backward: Vec<Vec<u8>> = tree
            .range(&cx, bound(&lo), bound(&hi))
            .unwrap()
            .rev()
            .collect_all()
            .unwrap()
            .into_iter()
            .map(|(k, _)| k)
            .collect();
        let mut reversed = expected.clone();
        reversed.reverse();
        prop_assert_eq!(backward, reversed);
    }
}
