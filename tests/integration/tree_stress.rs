#![allow(missing_docs)]

use rand::prelude::*;
use rand_chacha::ChaCha8Rng;
use std::collections::BTreeMap;
use std::sync::Arc;

use cowkv::storage::{Common, FixedFormat, KvFormat, Options, Tree};
use cowkv::{MemStore, Result};

const SEED: u64 = 0x5eed_cafe;
const ROUNDS: usize = 30;
const OPS_PER_ROUND: usize = 200;
const KEY_SPACE: u32 = 1_500;

fn same_entries(tree: &Tree<KvFormat>, cx: &Common, model: &BTreeMap<Vec<u8>, Vec<u8>>) -> Result<bool> {
    let entries = tree.cursor(cx)?.collect_all()?;
    Ok(entries.iter().map(|(k, v)| (k, v)).eq(model.iter()))
}

#[test]
fn randomized_kv_tree_matches_model() -> Result<()> {
    for (page_size, checksums) in [(256usize, false), (512, true), (4096, false)] {
        let store = MemStore::new();
        let opts = Options::default()
            .page_size(page_size)
            .checksums(checksums);
        let mut cx = Common::create(Arc::new(store.clone()), opts.clone())?;
        let mut tree = Tree::open(&cx, b"stress", KvFormat)?;
        let mut rng = ChaCha8Rng::seed_from_u64(SEED ^ page_size as u64);
        let mut model = BTreeMap::new();

        for round in 0..ROUNDS {
            let keep = cx.committed().saturating_sub(rng.gen_range(0..3));
            cx.begin(keep)?;
            for _ in 0..OPS_PER_ROUND {
                let key = format!("k{:05}", rng.gen_range(0..KEY_SPACE)).into_bytes();
                if rng.gen_bool(0.6) {
                    let val = vec![rng.gen::<u8>(); rng.gen_range(0..64)];
                    let existed = tree.put(&mut cx, &key, &val)?;
                    assert_eq!(existed, model.insert(key, val).is_some());
                } else {
                    let removed = tree.delete(&mut cx, &key)?;
                    assert_eq!(removed, model.remove(&key).is_some());
                }
            }
            cx.commit()?;
            assert_eq!(tree.audit(&cx)?, model.len());
            let extents = tree.extents(&cx)?;
            cx.check_space(&extents)?;
            if round % 10 == 9 {
                assert!(same_entries(&tree, &cx, &model)?);
            }
        }
        assert_eq!(cx.pager().outstanding(), 0);

        let cx = Common::open(Arc::new(store), opts)?;
        let tree = Tree::open(&cx, b"stress", KvFormat)?;
        assert!(same_entries(&tree, &cx, &model)?);
        let extents = tree.extents(&cx)?;
        cx.check_space(&extents)?;
    }
    Ok(())
}

#[test]
fn oversized_values_survive_random_deletes() -> Result<()> {
    for seed in 0..4u64 {
        let mut cx = Common::create(
            Arc::new(MemStore::new()),
            Options::default().page_size(256),
        )?;
        let mut tree = Tree::open(&cx, b"runs", KvFormat)?;
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let mut model = BTreeMap::new();

        for _ in 0..12 {
            cx.begin(cx.committed().saturating_sub(rng.gen_range(0..2)))?;
            for _ in 0..40 {
                let key = format!("r{:03}", rng.gen_range(0..60u32)).into_bytes();
                if rng.gen_bool(0.55) {
                    let len = if rng.gen_bool(0.5) {
                        rng.gen_range(200..6_000)
                    } else {
                        rng.gen_range(0..40)
                    };
                    let val = vec![rng.gen::<u8>(); len];
                    tree.put(&mut cx, &key, &val)?;
                    model.insert(key, val);
                } else {
                    let removed = tree.delete(&mut cx, &key)?;
                    assert_eq!(removed, model.remove(&key).is_some());
                }
            }
            cx.commit()?;
            assert_eq!(tree.audit(&cx)?, model.len());
            assert!(same_entries(&tree, &cx, &model)?);
            let extents = tree.extents(&cx)?;
            cx.check_space(&extents)?;
        }

        cx.begin(cx.committed())?;
        let keys: Vec<Vec<u8>> = model.keys().cloned().collect();
        for key in keys {
            assert!(tree.delete(&mut cx, &key)?);
        }
        cx.commit()?;
        assert!(tree.is_empty());
        assert_eq!(cx.pager().outstanding(), 0);
    }
    Ok(())
}

#[test]
fn randomized_fixed_tree_matches_model() -> Result<()> {
    let mut cx = Common::create(
        Arc::new(MemStore::new()),
        Options::default().page_size(128),
    )?;
    let mut tree = Tree::open(&cx, b"fixed", FixedFormat::new(8, 16))?;
    let mut rng = ChaCha8Rng::seed_from_u64(SEED);
    let mut model: BTreeMap<u64, [u8; 16]> = BTreeMap::new();

    for _ in 0..ROUNDS {
        cx.begin(cx.committed())?;
        for _ in 0..OPS_PER_ROUND {
            let key = rng.gen_range(0..KEY_SPACE as u64);
            if rng.gen_bool(0.55) {
                let mut val = [0u8; 16];
                rng.fill(&mut val);
                tree.put(&mut cx, &key.to_be_bytes(), &val)?;
                model.insert(key, val);
            } else {
                assert_eq!(
                    tree.delete(&mut cx, &key.to_be_bytes())?,
                    model.remove(&key).is_some()
                );
            }
        }
        cx.commit()?;
        assert_eq!(tree.audit(&cx)?, model.len());
        let extents = tree.extents(&cx)?;
        cx.check_space(&extents)?;
    }

    let mut cursor = tree.cursor(&cx)?;
    for (key, val) in &model {
        let (k, v) = cursor.next()?.expect("entry");
        assert_eq!(k, key.to_be_bytes());
        assert_eq!(&v[..], &val[..]);
    }
    assert!(cursor.next()?.is_none());
    assert!(tree.put(&mut cx, b"short", &[0; 16]).is_err());
    Ok(())
}

#[test]
fn destroy_returns_every_node() -> Result<()> {
    let mut cx = Common::create(
        Arc::new(MemStore::new()),
        Options::default().page_size(256),
    )?;
    cx.begin(0)?;
    let mut keep = Tree::open(&cx, b"keep", KvFormat)?;
    let mut gone = Tree::open(&cx, b"gone", KvFormat)?;
    for i in 0..300u32 {
        keep.put(&mut cx, &i.to_be_bytes(), b"k")?;
        gone.put(&mut cx, &i.to_be_bytes(), &[1u8; 30])?;
    }
    cx.commit()?;

    cx.begin(cx.committed() + 1)?;
    gone.destroy(&mut cx)?;
    assert_eq!(gone.root(), 0);
    assert_eq!(cx.names(), vec![b"keep".to_vec()]);
    cx.commit()?;
    let extents = keep.extents(&cx)?;
    let report = cx.check_space(&extents)?;
    assert!(report.free_bytes > 0);
    assert_eq!(keep.audit(&cx)?, 300);
    Ok(())
}
