use filecache::cache::{Expiration, FileCacheStore, GcBudget, StoreOptions};
use filetime::{set_file_mtime, FileTime};
use std::fs;
use std::time::{Duration, SystemTime};
use tempfile::tempdir;

fn store_in(dir: &std::path::Path) -> FileCacheStore {
    FileCacheStore::new("gc", dir.join("gc"), StoreOptions::default())
}

fn past() -> Expiration {
    Expiration::at(chrono::Utc::now() - chrono::Duration::seconds(10))
}

fn future() -> Expiration {
    Expiration::after(Duration::from_secs(3600))
}

#[test]
fn test_gc_removes_expired_and_keeps_valid() {
    let temp = tempdir().unwrap();
    let store = store_in(temp.path());

    for i in 0..10 {
        store
            .set(&format!("expired:{i}"), "x", past(), &[])
            .unwrap();
        store
            .set(&format!("fresh:{i}"), "y", future(), &[])
            .unwrap();
        store
            .set(&format!("permanent:{i}"), "z", Expiration::Permanent, &[])
            .unwrap();
    }

    let report = store.garbage_collection_with(&GcBudget::unlimited()).unwrap();
    assert!(report.complete);
    assert_eq!(report.scanned, 30);
    assert_eq!(report.removed_expired, 10);
    assert_eq!(report.removed(), 10);
    assert!(report.errors.is_empty());

    for i in 0..10 {
        assert!(!store.item_path(&format!("expired:{i}")).exists());
        assert!(store.get(&format!("fresh:{i}"), false).is_some());
        assert!(store.get(&format!("permanent:{i}"), false).is_some());
    }
}

#[test]
fn test_gc_removes_tag_invalidated_items() {
    let temp = tempdir().unwrap();
    let store = store_in(temp.path());

    store
        .set("tagged", "x", Expiration::Permanent, &["node:5"])
        .unwrap();
    store
        .set("other", "y", Expiration::Permanent, &["node:6"])
        .unwrap();
    store.invalidate_tags(&["node:5"]).unwrap();

    let report = store.garbage_collection_with(&GcBudget::unlimited()).unwrap();
    assert_eq!(report.removed_invalidated, 1);
    assert!(store.get("tagged", true).is_none());
    assert!(store.get("other", false).is_some());
}

#[test]
fn test_gc_removes_per_item_invalidations() {
    let temp = tempdir().unwrap();
    let store = store_in(temp.path());

    store.set("a", "x", Expiration::Permanent, &[]).unwrap();
    store.invalidate("a").unwrap();

    let report = store.garbage_collection_with(&GcBudget::unlimited()).unwrap();
    assert_eq!(report.removed_expired, 1);
    assert!(store.get("a", true).is_none());
}

#[test]
fn test_gc_on_missing_bin_is_empty() {
    let temp = tempdir().unwrap();
    let store = store_in(temp.path());

    let report = store.garbage_collection().unwrap();
    assert_eq!(report.scanned, 0);
    assert!(report.complete);
}

#[test]
fn test_gc_budget_is_respected_and_resumes() {
    let temp = tempdir().unwrap();
    let store = store_in(temp.path());

    for i in 0..25 {
        store.set(&format!("k{i:02}"), "x", past(), &[]).unwrap();
    }

    let budget = GcBudget::items(10);
    let first = store.garbage_collection_with(&budget).unwrap();
    assert_eq!(first.scanned, 10);
    assert!(!first.complete);

    let second = store.garbage_collection_with(&budget).unwrap();
    assert_eq!(second.scanned, 10);
    assert!(!second.complete);

    let third = store.garbage_collection_with(&budget).unwrap();
    assert_eq!(third.scanned, 5);
    assert!(third.complete);

    assert_eq!(first.removed() + second.removed() + third.removed(), 25);
    assert_eq!(store.stats().unwrap().items, 0);
}

#[test]
fn test_gc_removes_only_stale_temp_files() {
    let temp = tempdir().unwrap();
    let store = store_in(temp.path());
    store.set("a", "x", Expiration::Permanent, &[]).unwrap();

    let stale = store.directory().join(".tmp-abandoned");
    let in_flight = store.directory().join(".tmp-writing");
    fs::write(&stale, b"partial").unwrap();
    fs::write(&in_flight, b"partial").unwrap();

    let two_hours_ago = SystemTime::now() - Duration::from_secs(2 * 3600);
    set_file_mtime(&stale, FileTime::from_system_time(two_hours_ago)).unwrap();

    let report = store.garbage_collection_with(&GcBudget::unlimited()).unwrap();
    assert_eq!(report.removed_temp, 1);
    assert!(!stale.exists());
    assert!(in_flight.exists());
    assert!(store.get("a", false).is_some());
}

#[test]
fn test_gc_ignores_foreign_files() {
    let temp = tempdir().unwrap();
    let store = store_in(temp.path());
    store.set("a", "x", Expiration::Permanent, &[]).unwrap();

    let foreign = store.directory().join("notes.txt");
    fs::write(&foreign, b"not ours").unwrap();

    let report = store.garbage_collection_with(&GcBudget::unlimited()).unwrap();
    assert_eq!(report.scanned, 1);
    assert!(foreign.exists());
}

#[test]
fn test_budgeted_gc_progresses_across_store_instances() {
    let temp = tempdir().unwrap();
    let seed = store_in(temp.path());
    for key in ["a", "b"] {
        seed.set(key, "keep", Expiration::Permanent, &[]).unwrap();
    }
    for key in ["c", "d", "e"] {
        seed.set(key, "drop", past(), &[]).unwrap();
    }
    drop(seed);

    // Every run opens the bin afresh, as separate CLI invocations do.
    let mut removed = 0;
    for _ in 0..3 {
        let report = store_in(temp.path())
            .garbage_collection_with(&GcBudget::items(2))
            .unwrap();
        removed += report.removed_expired;
    }
    assert_eq!(removed, 3);

    let store = store_in(temp.path());
    assert!(store.get("a", false).is_some());
    assert!(store.get("b", false).is_some());
    assert_eq!(store.stats().unwrap().items, 2);
}

#[test]
fn test_finished_cycle_starts_over() {
    let temp = tempdir().unwrap();
    let store = store_in(temp.path());
    for key in ["a", "b", "c"] {
        store.set(key, "x", Expiration::Permanent, &[]).unwrap();
    }

    let budget = GcBudget::items(2);
    assert!(!store.garbage_collection_with(&budget).unwrap().complete);
    assert!(store_in(temp.path())
        .garbage_collection_with(&budget)
        .unwrap()
        .complete);

    // "a" sorts first, so only a fresh cycle can see it.
    store.set("a", "x", past(), &[]).unwrap();
    let report = store_in(temp.path())
        .garbage_collection_with(&budget)
        .unwrap();
    assert_eq!(report.removed_expired, 1);
}
