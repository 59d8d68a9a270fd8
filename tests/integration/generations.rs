#![allow(missing_docs)]

use std::sync::{Arc, Once};

use tempfile::tempdir;
use tracing_subscriber::EnvFilter;

use cowkv::storage::{Common, KvFormat, Options, Tree};
use cowkv::{FileStore, KvError, MemStore, Result, Store};

fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("cowkv::meta=debug,cowkv::alloc=debug"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .with_ansi(false)
            .try_init();
    });
}

fn key(i: u32) -> Vec<u8> {
    format!("key-{i:04}").into_bytes()
}

#[test]
fn kept_snapshots_stay_readable() -> Result<()> {
    let mut cx = Common::create(
        Arc::new(MemStore::new()),
        Options::default().page_size(512),
    )?;
    let mut tree = Tree::open(&cx, b"data", KvFormat)?;
    cx.begin(0)?;
    for i in 0..200 {
        tree.put(&mut cx, &key(i), b"first")?;
    }
    cx.commit()?;
    let snap_gen = cx.committed();
    let snap_root = tree.root();

    for round in 0..5u32 {
        cx.begin(snap_gen)?;
        assert_eq!(cx.keep(), snap_gen);
        for i in 0..200 {
            if (i + round) % 7 == 0 {
                tree.delete(&mut cx, &key(i))?;
            } else {
                tree.put(&mut cx, &key(i), format!("round-{round}").as_bytes())?;
            }
        }
        cx.commit()?;
        let extents = tree.extents(&cx)?;
        cx.check_space(&extents)?;

        let snap = Tree::with_root(&cx, KvFormat, snap_root)?;
        assert_eq!(snap.audit(&cx)?, 200);
        for i in (0..200).step_by(13) {
            assert_eq!(snap.get(&cx, &key(i))?.as_deref(), Some(&b"first"[..]));
        }
    }
    Ok(())
}

#[test]
fn commits_survive_reopen_and_open_generations_do_not() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("store.kv");
    let opts = Options::default().page_size(1024).checksums(true);
    {
        let mut cx = Common::create(Arc::new(FileStore::open(&path)?), opts)?;
        let mut users = Tree::open(&cx, b"users", KvFormat)?;
        cx.begin(0)?;
        for i in 0..500 {
            users.put(&mut cx, &key(i), &i.to_be_bytes())?;
        }
        cx.commit()?;

        cx.begin(cx.committed())?;
        users.put(&mut cx, b"ghost", b"never committed")?;
        users.delete(&mut cx, &key(0))?;
        assert!(users.contains(&cx, b"ghost")?);
    }

    let cx = Common::open(
        Arc::new(FileStore::open(&path)?),
        Options::default().page_size(1024),
    )?;
    assert!(cx.options().checksums);
    assert!(!cx.is_active());
    assert_eq!(cx.ver(), cx.committed());
    assert_eq!(cx.names(), vec![b"users".to_vec()]);

    let users = Tree::open(&cx, b"users", KvFormat)?;
    assert_eq!(users.get(&cx, b"ghost")?, None);
    assert_eq!(users.get(&cx, &key(0))?, Some(0u32.to_be_bytes().to_vec()));
    assert_eq!(users.audit(&cx)?, 500);
    let extents = users.extents(&cx)?;
    cx.check_space(&extents)?;
    Ok(())
}

#[test]
fn rollback_discards_the_open_generation() -> Result<()> {
    let mut cx = Common::create(
        Arc::new(MemStore::new()),
        Options::default().page_size(256),
    )?;
    let mut tree = Tree::open(&cx, b"t", KvFormat)?;
    cx.begin(0)?;
    tree.put(&mut cx, b"kept", b"1")?;
    cx.commit()?;
    let committed = cx.committed();
    let end = cx.end();

    cx.begin(committed)?;
    for i in 0..300 {
        tree.put(&mut cx, &key(i), &[9u8; 40])?;
    }
    tree.delete(&mut cx, b"kept")?;
    cx.rollback()?;
    tree.reload(&cx)?;

    assert!(!cx.is_active());
    assert_eq!(cx.committed(), committed);
    assert_eq!(cx.end(), end);
    assert_eq!(tree.get(&cx, b"kept")?, Some(b"1".to_vec()));
    assert_eq!(tree.audit(&cx)?, 1);
    let extents = tree.extents(&cx)?;
    cx.check_space(&extents)?;

    cx.begin(committed)?;
    assert_eq!(cx.ver(), committed + 1);
    tree.put(&mut cx, b"after", b"2")?;
    cx.commit()?;
    assert_eq!(tree.audit(&cx)?, 2);
    Ok(())
}

#[test]
fn failed_growth_rolls_back_cleanly() -> Result<()> {
    init_tracing();
    let store = MemStore::new();
    let mut cx = Common::create(Arc::new(store.clone()), Options::default().page_size(512))?;
    let mut tree = Tree::open(&cx, b"t", KvFormat)?;
    cx.begin(0)?;
    for i in 0..100 {
        tree.put(&mut cx, &key(i), &[1u8; 24])?;
    }
    cx.commit()?;

    store.set_limit(Some(store.len()?));
    cx.begin(cx.committed())?;
    let mut i = 100;
    let err = loop {
        if let Err(err) = tree.put(&mut cx, &key(i), &[2u8; 100]) {
            break err;
        }
        i += 1;
        assert!(i < 10_000, "store never filled up");
    };
    assert!(matches!(err, KvError::StoreFull { .. }), "{err}");

    cx.rollback()?;
    tree.reload(&cx)?;
    assert_eq!(cx.pager().outstanding(), 0);
    assert_eq!(tree.audit(&cx)?, 100);
    let extents = tree.extents(&cx)?;
    cx.check_space(&extents)?;

    store.set_limit(None);
    cx.begin(cx.committed())?;
    for i in 100..400 {
        tree.put(&mut cx, &key(i), &[2u8; 100])?;
    }
    cx.commit()?;
    assert_eq!(tree.audit(&cx)?, 400);
    Ok(())
}

#[test]
fn failed_growth_cannot_be_committed() -> Result<()> {
    init_tracing();
    let store = MemStore::new();
    let mut cx = Common::create(Arc::new(store.clone()), Options::default().page_size(512))?;
    let mut tree = Tree::open(&cx, b"t", KvFormat)?;
    cx.begin(0)?;
    for i in 0..100 {
        tree.put(&mut cx, &key(i), &[1u8; 24])?;
    }
    cx.commit()?;
    let committed = cx.committed();

    store.set_limit(Some(store.len()?));
    cx.begin(committed)?;
    let mut i = 100;
    while tree.put(&mut cx, &key(i), &[2u8; 100]).is_ok() {
        i += 1;
        assert!(i < 10_000, "store never filled up");
    }
    assert!(cx.is_poisoned());
    store.set_limit(None);

    assert!(matches!(tree.put(&mut cx, b"late", b"x"), Err(KvError::Invalid(_))));
    assert!(matches!(cx.commit(), Err(KvError::Invalid(_))));
    assert!(cx.is_active());
    assert_eq!(cx.committed(), committed);

    cx.rollback()?;
    tree.reload(&cx)?;
    assert!(!cx.is_poisoned());
    assert_eq!(tree.audit(&cx)?, 100);
    for i in 0..100 {
        assert_eq!(tree.get(&cx, &key(i))?, Some(vec![1u8; 24]));
    }
    let extents = tree.extents(&cx)?;
    cx.check_space(&extents)?;

    let cx = Common::open(Arc::new(store), Options::default().page_size(512))?;
    assert_eq!(cx.committed(), committed);
    assert_eq!(Tree::open(&cx, b"t", KvFormat)?.audit(&cx)?, 100);
    Ok(())
}

#[test]
fn damaged_node_fails_its_checksum() -> Result<()> {
    let store = MemStore::new();
    let ps = 512usize;
    let mut cx = Common::create(
        Arc::new(store.clone()),
        Options::default().page_size(ps).checksums(true),
    )?;
    let mut tree = Tree::open(&cx, b"t", KvFormat)?;
    cx.begin(0)?;
    for i in 0..10 {
        tree.put(&mut cx, &key(i), b"value")?;
    }
    cx.commit()?;
    assert_eq!(tree.get(&cx, &key(3))?, Some(b"value".to_vec()));

    let spot = tree.root() + ps as u64 - 1;
    let mut byte = [0u8; 1];
    store.read_at(spot, &mut byte)?;
    store.write_at(spot, &[byte[0] ^ 0x5a])?;
    assert!(matches!(tree.get(&cx, &key(3)), Err(KvError::Corruption(_))));
    Ok(())
}

#[test]
fn torn_catalog_slot_falls_back_to_the_older_one() -> Result<()> {
    init_tracing();
    let store = MemStore::new();
    let opts = Options::default().page_size(512);
    let mut cx = Common::create(Arc::new(store.clone()), opts.clone())?;
    let mut tree = Tree::open(&cx, b"t", KvFormat)?;
    cx.begin(0)?;
    tree.put(&mut cx, b"a", b"1")?;
    cx.commit()?;
    let older = cx.committed();
    cx.begin(older)?;
    tree.put(&mut cx, b"b", b"2")?;
    cx.commit()?;
    let newest = cx.committed();

    let slot = (newest % 2) * 4096;
    store.write_at(slot + 64, &[0xff; 8])?;

    let cx = Common::open(Arc::new(store), opts)?;
    assert_eq!(cx.committed(), older);
    let tree = Tree::open(&cx, b"t", KvFormat)?;
    assert_eq!(tree.get(&cx, b"a")?, Some(b"1".to_vec()));
    assert_eq!(tree.get(&cx, b"b")?, None);
    let extents = tree.extents(&cx)?;
    cx.check_space(&extents)?;
    Ok(())
}

#[test]
fn generation_state_is_enforced() -> Result<()> {
    let mut cx = Common::create(Arc::new(MemStore::new()), Options::default())?;
    assert!(matches!(cx.commit(), Err(KvError::Invalid(_))));
    assert!(cx.alloc(1).is_err());

    cx.begin(u64::MAX)?;
    assert_eq!(cx.keep(), cx.ver());
    assert!(matches!(cx.begin(0), Err(KvError::Invalid(_))));
    cx.commit()?;

    cx.begin(0)?;
    assert_eq!(cx.keep(), 0);
    assert_eq!(cx.ver(), 2);
    cx.commit()?;
    Ok(())
}

#[test]
fn options_from_toml_shape_the_store() -> Result<()> {
    let opts = Options::from_toml_str("page_size = 1024\nchecksums = true\nrebalance_percent = 25\n")?;
    let store = MemStore::new();
    let cx = Common::create(Arc::new(store.clone()), opts.clone())?;
    assert_eq!(cx.page_size(), 1024);
    assert_eq!(cx.options(), &opts);
    assert_eq!(cx.hdr(), 16);
    drop(cx);

    assert!(matches!(
        Common::open(Arc::new(store.clone()), Options::default().page_size(2048)),
        Err(KvError::Invalid(_))
    ));
    assert!(matches!(
        Common::create(Arc::new(store), opts),
        Err(KvError::Invalid(_))
    ));
    Ok(())
}
