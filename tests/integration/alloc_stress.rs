#![allow(missing_docs)]

use rand::prelude::*;
use rand_chacha::ChaCha8Rng;
use std::sync::Arc;

use cowkv::storage::{Common, Options};
use cowkv::{MemStore, Off, Result, Ver};

const SEED: u64 = 0xA110_C8ED;
const GENERATIONS: u64 = 60;
const OPS: usize = 80;

struct Run {
    off: Off,
    pages: usize,
    stamp: Ver,
}

fn overlaps(a: Off, alen: u64, b: Off, blen: u64) -> bool {
    a < b + blen && b < a + alen
}

#[test]
fn random_alloc_free_keeps_space_tiled() -> Result<()> {
    let ps = 512usize;
    let mut cx = Common::create(
        Arc::new(MemStore::new()),
        Options::default().page_size(ps),
    )?;
    let mut rng = ChaCha8Rng::seed_from_u64(SEED);
    let mut live: Vec<Run> = Vec::new();
    // Ranges released while some kept snapshot may still read them: (off, bytes, version).
    let mut guarded: Vec<(Off, u64, Ver)> = Vec::new();

    for gen in 1..=GENERATIONS {
        cx.begin(gen.saturating_sub(rng.gen_range(0..4)))?;
        let ver = cx.ver();
        assert_eq!(ver, gen);
        guarded.retain(|&(_, _, v)| v >= cx.keep());

        for _ in 0..OPS {
            if live.is_empty() || rng.gen_bool(0.55) {
                let want = rng.gen_range(1..=16usize);
                let off = cx.alloc(want)?;
                let pages = want.next_power_of_two();
                let bytes = (pages * ps) as u64;
                assert_eq!(off % bytes, 0, "block not aligned to its size");
                assert!(
                    guarded
                        .iter()
                        .all(|&(g, glen, _)| !overlaps(off, bytes, g, glen)),
                    "handed out space a kept snapshot can still read"
                );
                assert!(live
                    .iter()
                    .all(|run| !overlaps(off, bytes, run.off, (run.pages * ps) as u64)));
                live.push(Run {
                    off,
                    pages,
                    stamp: ver,
                });
            } else {
                let run = live.swap_remove(rng.gen_range(0..live.len()));
                cx.free(run.off, run.stamp, run.pages)?;
                if run.stamp != ver {
                    guarded.push((run.off, (run.pages * ps) as u64, ver));
                }
            }
        }
        cx.commit()?;

        let extents: Vec<(Off, u64)> = live
            .iter()
            .map(|run| (run.off, (run.pages * ps) as u64))
            .collect();
        let report = cx.check_space(&extents)?;
        assert_eq!(report.free_blocks, cx.free_blocks().len());
        assert!(cx.pager().size() >= cx.end());
    }

    let stats = cx.alloc_stats();
    assert!(stats.splits > 0);
    assert!(stats.merges > 0);
    assert!(stats.grows > 0);

    cx.begin(GENERATIONS)?;
    for run in live.drain(..) {
        cx.free(run.off, run.stamp, run.pages)?;
    }
    cx.commit()?;
    cx.begin(u64::MAX)?;
    cx.commit()?;
    let report = cx.check_space(&[])?;
    assert_eq!(report.tree_bytes, 0);
    assert_eq!(report.meta_bytes + report.index_bytes + report.free_bytes, report.end);
    Ok(())
}

#[test]
fn reuse_waits_for_the_kept_generation() -> Result<()> {
    let mut cx = Common::create(
        Arc::new(MemStore::new()),
        Options::default().page_size(4096),
    )?;
    cx.begin(0)?;
    let a = cx.alloc(1)?;
    let _pin = cx.alloc(1)?;
    cx.commit()?;

    cx.begin(1)?;
    cx.free(a, 1, 1)?;
    cx.commit()?;

    for keep in [1, 2] {
        cx.begin(keep)?;
        let got = cx.alloc(1)?;
        assert_ne!(got, a, "reused while generation {keep} is kept");
        cx.rollback()?;
    }

    cx.begin(3)?;
    let mut seen = Vec::new();
    for _ in 0..4 {
        seen.push(cx.alloc(1)?);
    }
    assert!(seen.contains(&a));
    cx.commit()?;
    Ok(())
}

#[test]
fn freeing_garbage_is_rejected() -> Result<()> {
    let mut cx = Common::create(
        Arc::new(MemStore::new()),
        Options::default().page_size(1024),
    )?;
    cx.begin(0)?;
    let a = cx.alloc(2)?;
    assert!(cx.free(a + 1024, 1, 2).is_err());
    assert!(cx.free(0, 1, 1).is_err());
    assert!(cx.free(a, 1, 3).is_err());
    assert!(cx.alloc(0).is_err());
    cx.rollback()?;
    cx.check_space(&[])?;
    Ok(())
}
