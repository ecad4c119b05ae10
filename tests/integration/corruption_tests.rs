use filecache::cache::{Expiration, FileCacheStore, GcBudget, StorageError, StoreOptions};
use std::fs;
use tempfile::tempdir;

fn store_in(dir: &std::path::Path) -> FileCacheStore {
    FileCacheStore::new("corrupt", dir.join("corrupt"), StoreOptions::default())
}

#[test]
fn test_truncated_item_is_miss_and_collected() {
    let temp = tempdir().unwrap();
    let store = store_in(temp.path());
    store
        .set("page", "a fairly long payload", Expiration::Permanent, &[])
        .unwrap();

    let path = store.item_path("page");
    let bytes = fs::read(&path).unwrap();
    fs::write(&path, &bytes[..bytes.len() / 2]).unwrap();

    assert!(store.get("page", false).is_none());
    assert!(store.get("page", true).is_none());
    assert_eq!(store.stats().unwrap().corrupt, 1);

    let report = store.garbage_collection_with(&GcBudget::unlimited()).unwrap();
    assert_eq!(report.removed_corrupt, 1);
    assert!(!path.exists());
}

#[test]
fn test_garbage_file_is_miss() {
    let temp = tempdir().unwrap();
    let store = store_in(temp.path());
    store.set("other", "x", Expiration::Permanent, &[]).unwrap();

    fs::write(store.item_path("page"), b"\x00\x01 definitely not json").unwrap();
    assert!(store.get("page", true).is_none());

    // Overwriting a corrupt file with a good item works.
    store.set("page", "fixed", Expiration::Permanent, &[]).unwrap();
    assert_eq!(store.get("page", false).unwrap().payload(), b"fixed");
}

#[test]
fn test_misplaced_item_is_miss_and_collected() {
    let temp = tempdir().unwrap();
    let store = store_in(temp.path());
    store.set("a", "payload of a", Expiration::Permanent, &[]).unwrap();

    fs::copy(store.item_path("a"), store.item_path("b")).unwrap();
    assert!(store.get("b", true).is_none());
    assert!(store.get("a", false).is_some());

    let report = store.garbage_collection_with(&GcBudget::unlimited()).unwrap();
    assert_eq!(report.removed_corrupt, 1);
    assert!(!store.item_path("b").exists());
    assert!(store.item_path("a").exists());
}

#[test]
fn test_partial_temp_file_does_not_affect_reads() {
    let temp = tempdir().unwrap();
    let store = store_in(temp.path());
    store.set("page", "complete", Expiration::Permanent, &[]).unwrap();

    fs::write(store.directory().join(".tmp-interrupted"), b"{\"format\":\"filecache-it").unwrap();

    assert_eq!(store.get("page", false).unwrap().payload(), b"complete");
    let stats = store.stats().unwrap();
    assert_eq!(stats.items, 1);
    assert_eq!(stats.temp_files, 1);
}

#[test]
fn test_corrupt_tag_counter_heals_on_invalidation() {
    let temp = tempdir().unwrap();
    let store = store_in(temp.path());
    store
        .set("page", "x", Expiration::Permanent, &["node:5"])
        .unwrap();
    store.invalidate_tags(&["node:5"]).unwrap();
    store
        .set("page", "y", Expiration::Permanent, &["node:5"])
        .unwrap();
    store
        .set("untagged", "z", Expiration::Permanent, &[])
        .unwrap();

    let counter = store
        .directory()
        .join(".checksums")
        .join("tags")
        .join(&*filecache::key::normalize("node:5"));
    assert!(counter.is_file());
    fs::write(&counter, b"garbage").unwrap();

    // Unverifiable tags are stale and cannot be snapshotted.
    assert!(store.get("page", false).is_none());
    assert!(matches!(
        store.set("new", "v", Expiration::Permanent, &["node:5"]),
        Err(StorageError::CorruptChecksum(_))
    ));

    store.invalidate_tags(&["node:5"]).unwrap();

    // The reset counter could collide with old snapshots, so the epoch moved.
    assert!(store.get("page", false).is_none());
    assert!(store.get("untagged", false).is_none());

    store
        .set("page", "healed", Expiration::Permanent, &["node:5"])
        .unwrap();
    assert_eq!(store.get("page", false).unwrap().payload(), b"healed");
}

#[test]
fn test_corrupt_epoch_heals_on_invalidate_all() {
    let temp = tempdir().unwrap();
    let store = store_in(temp.path());
    store.invalidate_all().unwrap();
    store.set("page", "x", Expiration::Permanent, &[]).unwrap();

    let epoch = store.directory().join(".checksums").join("epoch");
    fs::write(&epoch, b"{").unwrap();
    assert!(store.get("page", false).is_none());

    store.invalidate_all().unwrap();
    store.set("page", "y", Expiration::Permanent, &[]).unwrap();
    assert_eq!(store.get("page", false).unwrap().payload(), b"y");
}
