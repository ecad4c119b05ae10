use filecache::cache::{
    Expiration, FileCacheStore, NewCacheItem, StorageError, StoreOptions, REGISTRY_DIR,
};
use filecache::config::DirectorySettings;
use filecache::resolver::{BinDirectoryResolver, FileCacheFactory};
use std::time::Duration;
use tempfile::{tempdir, TempDir};

fn factory(root: &TempDir) -> FileCacheFactory {
    let directories = DirectorySettings {
        default: Some(root.path().to_path_buf()),
        bins: Default::default(),
    };
    FileCacheFactory::new(
        BinDirectoryResolver::new(directories).unwrap(),
        StoreOptions::default(),
    )
}

fn store(root: &TempDir) -> FileCacheStore {
    factory(root).get("render").unwrap()
}

#[test]
fn test_invalidate_all_scenario() {
    let root = tempdir().unwrap();
    let render = store(&root);

    render
        .set("page:1", "<html>", Expiration::Permanent, &["node:5"])
        .unwrap();
    assert_eq!(render.get("page:1", false).unwrap().payload(), b"<html>");

    render.invalidate_all().unwrap();
    assert!(render.get("page:1", false).is_none());

    let hit = render.get("page:1", true).unwrap();
    assert_eq!(hit.payload(), b"<html>");
    assert!(!hit.valid);
}

#[test]
fn test_tag_invalidation() {
    let root = tempdir().unwrap();
    let render = store(&root);

    render
        .set("a", "payload A", Expiration::Permanent, &["node:5"])
        .unwrap();
    render
        .set("b", "payload B", Expiration::Permanent, &["node:6"])
        .unwrap();

    render.invalidate_tags(&["node:5"]).unwrap();

    assert!(render.get("a", false).is_none());
    assert_eq!(render.get("a", true).unwrap().payload(), b"payload A");
    assert!(render.get("b", false).unwrap().valid);

    // Rewriting after the invalidation snapshots the new counter.
    render
        .set("a", "payload A2", Expiration::Permanent, &["node:5"])
        .unwrap();
    assert_eq!(render.get("a", false).unwrap().payload(), b"payload A2");
}

#[test]
fn test_expired_item_is_miss_unless_invalid_allowed() {
    let root = tempdir().unwrap();
    let render = store(&root);
    let past = chrono::Utc::now() - chrono::Duration::seconds(1);

    render
        .set("old", "stale", Expiration::at(past), &[])
        .unwrap();

    assert!(render.get("old", false).is_none());
    let hit = render.get("old", true).unwrap();
    assert_eq!(hit.payload(), b"stale");
    assert!(!hit.valid);
}

#[test]
fn test_future_expiration_is_hit() {
    let root = tempdir().unwrap();
    let render = store(&root);

    render
        .set("fresh", "ok", Expiration::after(Duration::from_secs(60)), &[])
        .unwrap();
    assert!(render.get("fresh", false).unwrap().valid);
}

#[test]
fn test_bin_isolation() {
    let root = tempdir().unwrap();
    let factory = factory(&root);
    let a = factory.get("a").unwrap();
    let b = factory.get("b").unwrap();

    a.set("x", "from a", Expiration::Permanent, &["shared"])
        .unwrap();
    assert!(b.get("x", true).is_none());

    b.set("x", "from b", Expiration::Permanent, &["shared"])
        .unwrap();
    a.invalidate_tags(&["shared"]).unwrap();

    assert!(a.get("x", false).is_none());
    assert_eq!(b.get("x", false).unwrap().payload(), b"from b");
}

#[test]
fn test_unsafe_and_long_keys() {
    let root = tempdir().unwrap();
    let render = store(&root);
    let long_key = "k".repeat(400);
    let keys = [
        "http://example.com/a?b=c",
        "../../etc/passwd",
        "ключ",
        long_key.as_str(),
    ];

    for (i, key) in keys.iter().enumerate() {
        render
            .set(key, format!("value {i}"), Expiration::Permanent, &[])
            .unwrap();
    }
    for (i, key) in keys.iter().enumerate() {
        let hit = render.get(key, false).unwrap();
        assert_eq!(hit.item.key, *key);
        assert_eq!(hit.payload(), format!("value {i}").as_bytes());
    }

    // Nothing escaped the bin directory.
    assert!(!root.path().join("etc").exists());
    assert_eq!(render.stats().unwrap().items, keys.len());
}

#[test]
fn test_delete_all_makes_every_key_miss() {
    let root = tempdir().unwrap();
    let render = store(&root);
    let keys: Vec<String> = (0..20).map(|i| format!("key:{i}")).collect();

    for key in &keys {
        render.set(key, "v", Expiration::Permanent, &[]).unwrap();
    }
    assert_eq!(render.delete_all().unwrap(), keys.len());

    for key in &keys {
        assert!(render.get(key, true).is_none(), "{key} survived delete_all");
    }
}

#[test]
fn test_multiple_operations() {
    let root = tempdir().unwrap();
    let render = store(&root);

    render
        .set_multiple(vec![
            NewCacheItem::new("a", "1"),
            NewCacheItem::new("b", "2").tags(["node:1"]),
            NewCacheItem::new("c", "3").expires(Expiration::already_expired()),
        ])
        .unwrap();

    let mut keys = vec!["a".to_string(), "b".to_string(), "c".to_string(), "d".to_string()];
    let hits = render.get_multiple(&mut keys, false);
    assert_eq!(hits.len(), 2);
    assert_eq!(hits["a"].payload(), b"1");
    assert_eq!(keys, vec!["c".to_string(), "d".to_string()]);

    render.invalidate_multiple(["a", "missing"]).unwrap();
    assert!(render.get("a", false).is_none());
    assert!(render.get("a", true).is_some());

    render.delete_multiple(["a", "b", "missing"]).unwrap();
    assert!(render.get("a", true).is_none());
    assert!(render.get("b", true).is_none());
}

#[test]
fn test_failed_item_does_not_block_batch() {
    let root = tempdir().unwrap();
    let render = store(&root);
    std::fs::create_dir_all(render.item_path("bad")).unwrap();

    let err = render
        .set_multiple(vec![
            NewCacheItem::new("a", "1"),
            NewCacheItem::new("bad", "2"),
            NewCacheItem::new("c", "3"),
        ])
        .unwrap_err();

    assert_eq!(err.attempted, 3);
    assert_eq!(err.failed_keys().collect::<Vec<_>>(), vec!["bad"]);
    assert!(matches!(err.failures[0].1, StorageError::Write { .. }));
    assert_eq!(render.get("a", false).unwrap().payload(), b"1");
    assert_eq!(render.get("c", false).unwrap().payload(), b"3");
}

#[cfg(unix)]
#[test]
fn test_cache_files_are_not_owner_only() {
    use std::os::unix::fs::PermissionsExt;

    let root = tempdir().unwrap();
    let render = store(&root);
    render.set("page", "v", Expiration::Permanent, &["node5"]).unwrap();
    render.invalidate_tags(&["node5"]).unwrap();
    render.invalidate_all().unwrap();

    // A plain write shows what the umask allows.
    let plain = root.path().join("plain");
    std::fs::write(&plain, b"v").unwrap();
    let mode = |p: &std::path::Path| std::fs::metadata(p).unwrap().permissions().mode() & 0o777;
    let expected = mode(&plain);

    let registry = render.directory().join(REGISTRY_DIR);
    assert_eq!(mode(&render.item_path("page")), expected);
    assert_eq!(mode(&registry.join("tags").join("node5")), expected);
    assert_eq!(mode(&registry.join("epoch")), expected);
}

#[test]
fn test_delete_and_invalidate_absent_keys_succeed() {
    let root = tempdir().unwrap();
    let render = store(&root);

    render.delete("nothing").unwrap();
    render.invalidate("nothing").unwrap();
    assert_eq!(render.delete_all().unwrap(), 0);
}

#[test]
fn test_wipe_resets_tag_state() {
    let root = tempdir().unwrap();
    let render = store(&root);

    render.invalidate_tags(&["node:5"]).unwrap();
    render.set("a", "v", Expiration::Permanent, &["node:5"]).unwrap();
    assert_eq!(render.get("a", false).unwrap().item.tags["node:5"], 1);

    render.wipe().unwrap();
    assert!(render.get("a", true).is_none());

    render.set("a", "v", Expiration::Permanent, &["node:5"]).unwrap();
    assert_eq!(render.get("a", false).unwrap().item.tags["node:5"], 0);
}

#[test]
fn test_remove_bin() {
    let root = tempdir().unwrap();
    let render = store(&root);

    render.set("a", "v", Expiration::Permanent, &["t"]).unwrap();
    render.invalidate_tags(&["t"]).unwrap();
    assert!(render.directory().exists());

    render.remove_bin().unwrap();
    assert!(!render.directory().exists());
    assert!(render.get("a", true).is_none());

    // Removing again and writing afterwards both work.
    render.remove_bin().unwrap();
    render.set("a", "again", Expiration::Permanent, &[]).unwrap();
    assert_eq!(render.get("a", false).unwrap().payload(), b"again");
}

#[cfg(unix)]
#[test]
fn test_unwritable_directory_is_storage_error() {
    use std::os::unix::fs::PermissionsExt;

    let root = tempdir().unwrap();
    let render = store(&root);
    std::fs::create_dir_all(render.directory()).unwrap();
    std::fs::set_permissions(render.directory(), std::fs::Permissions::from_mode(0o555)).unwrap();

    let result = render.set("a", "v", Expiration::Permanent, &[]);

    std::fs::set_permissions(render.directory(), std::fs::Permissions::from_mode(0o755)).unwrap();

    // Root ignores directory permissions.
    if let Err(err) = result {
        assert!(matches!(err, StorageError::NotWritable(_)), "unexpected error: {err}");
    }
}
