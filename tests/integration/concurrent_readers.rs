#![allow(missing_docs)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;

use gbptree::primitives::io::MemFileIo;
use gbptree::{GbpTree, GbpTreeOptions, Result, U64Layout};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

const STABLE_KEYS: u64 = 2_000;

fn options() -> GbpTreeOptions {
    GbpTreeOptions::default()
        .with_page_size(512)
        .with_max_key_count(8)
}

/// Tree holding every odd key below `2 * STABLE_KEYS`; writers only touch even keys.
fn seeded_tree() -> Result<GbpTree<U64Layout>> {
    let tree = GbpTree::in_memory(MemFileIo::new(), U64Layout, options())?;
    let mut writer = tree.writer()?;
    for n in 0..STABLE_KEYS {
        let key = n * 2 + 1;
        writer.put(&key, &key)?;
    }
    drop(writer);
    tree.checkpoint()?;
    Ok(tree)
}

fn check_scan(entries: &[(u64, u64)]) {
    assert!(
        entries.windows(2).all(|pair| pair[0].0 < pair[1].0),
        "seek returned keys out of order"
    );
    let odd: Vec<u64> = entries
        .iter()
        .map(|(key, _)| *key)
        .filter(|key| key % 2 == 1)
        .collect();
    let expected: Vec<u64> = (0..STABLE_KEYS).map(|n| n * 2 + 1).collect();
    assert_eq!(odd, expected, "seek lost or repeated an untouched key");
    for (key, value) in entries {
        if key % 2 == 1 {
            assert_eq!(key, value);
        }
    }
}

#[test]
fn seek_survives_copy_on_write_between_steps() -> Result<()> {
    let tree = seeded_tree()?;
    let mut seek = tree.seek(..)?;
    let mut entries = Vec::new();
    for _ in 0..STABLE_KEYS / 2 {
        entries.push(seek.next().expect("entry")?);
    }

    // Stable nodes are copied; the seek holds on to old versions.
    for round in 0..4u64 {
        for n in 0..STABLE_KEYS {
            tree.put(&(n * 2), &round)?;
        }
        tree.checkpoint()?;
    }

    for entry in seek {
        entries.push(entry?);
    }
    check_scan(&entries);
    Ok(())
}

#[test]
fn readers_see_ordered_entries_while_writer_runs() -> Result<()> {
    let tree = seeded_tree()?;
    let done = AtomicBool::new(false);

    thread::scope(|scope| -> Result<()> {
        let mut readers = Vec::new();
        for seed in 0..4u64 {
            let tree = &tree;
            let done = &done;
            readers.push(scope.spawn(move || -> Result<u64> {
                let mut rng = ChaCha8Rng::seed_from_u64(seed);
                let mut scans = 0u64;
                while !done.load(Ordering::Acquire) || scans == 0 {
                    let entries: Vec<(u64, u64)> = tree.seek(..)?.collect::<Result<_>>()?;
                    check_scan(&entries);

                    let key = rng.gen_range(0..STABLE_KEYS) * 2 + 1;
                    assert_eq!(tree.get(&key)?, Some(key));
                    let window: Vec<u64> = tree
                        .seek(key..key + 40)?
                        .map(|entry| entry.map(|(key, _)| key))
                        .collect::<Result<_>>()?;
                    assert!(window.windows(2).all(|pair| pair[0] < pair[1]));
                    assert!(window.iter().all(|k| (key..key + 40).contains(k)));
                    scans += 1;
                }
                Ok(scans)
            }));
        }

        let writes = (|| -> Result<()> {
            let mut rng = ChaCha8Rng::seed_from_u64(0xD00D);
            for step in 0..6_000u64 {
                let key = rng.gen_range(0..STABLE_KEYS * 2) & !1;
                if rng.gen_bool(0.75) {
                    tree.put(&key, &step)?;
                } else {
                    tree.remove(&key)?;
                }
                if step % 500 == 499 {
                    tree.checkpoint()?;
                }
            }
            Ok(())
        })();
        done.store(true, Ordering::Release);
        writes?;

        for reader in readers {
            let scans = reader.join().expect("reader panicked")?;
            assert!(scans > 0);
        }
        Ok(())
    })?;

    let report = tree.consistency_report()?;
    assert!(report.is_clean(), "{:?}", report.violations);
    let stats = tree.stats();
    assert!(stats.seeks > 0);
    assert!(stats.successors_created > 0);
    Ok(())
}

#[test]
fn writer_handle_blocks_other_writers() -> Result<()> {
    let tree = seeded_tree()?;
    let mut writer = tree.writer()?;
    writer.put(&0, &7)?;
    assert_eq!(writer.get(&0)?, Some(7));

    thread::scope(|scope| {
        let handle = scope.spawn(|| tree.put(&2, &9));
        // Readers never wait for the writer.
        assert_eq!(tree.get(&1).ok().flatten(), Some(1));
        drop(writer);
        handle.join().expect("writer thread panicked")
    })?;
    assert_eq!(tree.get(&0)?, Some(7));
    assert_eq!(tree.get(&2)?, Some(9));
    Ok(())
}
