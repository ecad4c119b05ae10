use filecache::cache::{Expiration, FileCacheStore, GcBudget, StoreOptions, TagChecksum};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use tempfile::tempdir;

fn open(dir: &std::path::Path) -> FileCacheStore {
    FileCacheStore::new("shared", dir.join("shared"), StoreOptions::default())
}

#[test]
fn test_reader_never_misses_during_rewrites() {
    let temp = tempdir().unwrap();
    let writer = open(temp.path());
    let reader = open(temp.path());
    let old = vec![b'o'; 64 * 1024];
    let new = vec![b'n'; 64 * 1024];

    writer
        .set("hot", old.clone(), Expiration::Permanent, &[])
        .unwrap();

    let done = Arc::new(AtomicBool::new(false));
    let reader_done = Arc::clone(&done);
    let (old_r, new_r) = (old.clone(), new.clone());

    let reader_thread = thread::spawn(move || {
        let mut reads = 0;
        while !reader_done.load(Ordering::Acquire) || reads < 10 {
            let hit = reader.get("hot", false).expect("reader saw a miss");
            assert!(hit.payload() == old_r.as_slice() || hit.payload() == new_r.as_slice());
            reads += 1;
        }
        reads
    });

    for i in 0..200 {
        let payload = if i % 2 == 0 { &new } else { &old };
        writer
            .set("hot", payload.clone(), Expiration::Permanent, &[])
            .unwrap();
    }
    done.store(true, Ordering::Release);

    let reads = reader_thread.join().unwrap();
    assert!(reads >= 10);
}

#[test]
fn test_concurrent_tag_invalidations_are_counted() {
    let temp = tempdir().unwrap();
    let threads = 4;
    let per_thread = 20;

    let handles: Vec<_> = (0..threads)
        .map(|_| {
            let store = open(temp.path());
            thread::spawn(move || {
                for _ in 0..per_thread {
                    store.invalidate_tags(&["hot", "node:5"]).unwrap();
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    let store = open(temp.path());
    let snapshot = store.checksums().checksum(&["hot", "node:5"]).unwrap();
    assert_eq!(snapshot["hot"], (threads * per_thread) as u64);
    assert_eq!(snapshot["node:5"], (threads * per_thread) as u64);
}

#[test]
fn test_gc_concurrent_with_writers_keeps_valid_items() {
    let temp = tempdir().unwrap();
    let seed = open(temp.path());
    for i in 0..50 {
        seed.set(
            &format!("expired:{i}"),
            "x",
            Expiration::already_expired(),
            &[],
        )
        .unwrap();
    }

    let writers: Vec<_> = (0..3)
        .map(|w| {
            let store = open(temp.path());
            thread::spawn(move || {
                for i in 0..30 {
                    store
                        .set(&format!("valid:{w}:{i}"), "v", Expiration::Permanent, &[])
                        .unwrap();
                }
            })
        })
        .collect();

    let collector = open(temp.path());
    let gc = thread::spawn(move || {
        for _ in 0..5 {
            collector
                .garbage_collection_with(&GcBudget::unlimited())
                .unwrap();
        }
    });

    for handle in writers {
        handle.join().unwrap();
    }
    gc.join().unwrap();

    let store = open(temp.path());
    store.garbage_collection_with(&GcBudget::unlimited()).unwrap();
    for w in 0..3 {
        for i in 0..30 {
            assert!(store.get(&format!("valid:{w}:{i}"), false).is_some());
        }
    }
    for i in 0..50 {
        assert!(!store.item_path(&format!("expired:{i}")).exists());
    }
}
