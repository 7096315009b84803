// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Restart and lazy-materialisation tests
//!
//! Each test mounts a filesystem over a shared store, drops it, and mounts
//! again to check what the store alone is able to reconstruct.

use std::sync::Arc;

use tempfile::TempDir;

use crate::config::{FsConfig, MetaStoreBackend, MetaStoreConfig};
use crate::error::FsError;
use crate::metastore::{InMemoryMetaStore, MetaStore};
use crate::node::NodeRecord;
use crate::testing::mock_store::FaultyMetaStore;
use crate::types::{NodeKind, ROOT_ID, S_IFDIR, S_IFREG};
use crate::vfs::FileSystem;

fn config() -> FsConfig {
    FsConfig {
        uid: Some(500),
        gid: Some(500),
        meta_store: MetaStoreConfig {
            backend: MetaStoreBackend::Memory,
            ..MetaStoreConfig::default()
        },
        ..FsConfig::default()
    }
}

fn mount(store: &Arc<InMemoryMetaStore>) -> FileSystem {
    FileSystem::new(&config(), store.clone()).unwrap()
}

/// `/docs` (dir) holding `readme` (file with content and an xattr)
fn populate(fs: &FileSystem) {
    let docs = fs.mkdir(ROOT_ID, "docs", 0o750, 500, 500).unwrap();
    let readme = fs.create(docs.ino, "readme", 0o600, 500, 500).unwrap();
    fs.write(readme.ino, 0, b"hello kvfs").unwrap();
    fs.set_extended_attribute(readme.ino, "user.origin", b"test").unwrap();
    fs.flush(readme.ino).unwrap();
}

#[test]
fn restart_restores_tree_counters_and_content() {
    let store = Arc::new(InMemoryMetaStore::new());
    let (docs_ino, readme_ino, stats) = {
        let fs = mount(&store);
        populate(&fs);
        let docs = fs.lookup(ROOT_ID, "docs").unwrap();
        let readme = fs.lookup(docs.ino, "readme").unwrap();
        (docs.ino, readme.ino, fs.stats())
    };

    let fs = mount(&store);
    assert_eq!(fs.stats(), stats);
    assert_eq!(fs.stats().bytes, 10);

    let docs = fs.lookup(ROOT_ID, "docs").unwrap();
    assert_eq!(docs.ino, docs_ino);
    assert_eq!(docs.mode, S_IFDIR | 0o750);

    let readme = fs.lookup(docs.ino, "readme").unwrap();
    assert_eq!(readme.ino, readme_ino);
    assert_eq!(readme.mode, S_IFREG | 0o600);
    assert_eq!(readme.size, 10);
    assert_eq!(fs.read(readme.ino, 0, 64).unwrap(), b"hello kvfs");
    assert_eq!(fs.get_extended_attribute(readme.ino, "user.origin").unwrap(), b"test");
    assert_eq!(fs.path_of(readme.ino).unwrap(), "/docs/readme");
    assert_eq!(fs.stats().materialize_fallbacks, 0);
}

#[test]
fn identifiers_never_collide_after_restart() {
    let store = Arc::new(InMemoryMetaStore::new());
    let highest = {
        let fs = mount(&store);
        populate(&fs);
        fs.create(ROOT_ID, "extra", 0o644, 0, 0).unwrap().ino
    };

    let fs = mount(&store);
    let fresh = fs.create(ROOT_ID, "after-restart", 0o644, 0, 0).unwrap();
    assert!(fresh.ino > highest);
}

#[test]
fn unreadable_info_still_avoids_indexed_identifiers() {
    let store = Arc::new(InMemoryMetaStore::new());
    let highest = {
        let fs = mount(&store);
        populate(&fs);
        fs.create(ROOT_ID, "extra", 0o644, 0, 0).unwrap().ino
    };
    store.put("kvfs:info", b"garbage").unwrap();

    let fs = mount(&store);
    let fresh = fs.create(ROOT_ID, "after-restart", 0o644, 0, 0).unwrap();
    assert!(fresh.ino > highest);
}

#[test]
fn materialisation_reads_each_record_once() {
    let inner = Arc::new(InMemoryMetaStore::new());
    populate(&mount(&inner));

    let store = Arc::new(FaultyMetaStore::new(inner.clone()));
    let fs = FileSystem::new(&config(), store.clone()).unwrap();
    assert_eq!(store.call_count("get"), 2);

    let docs = fs.lookup(ROOT_ID, "docs").unwrap();
    assert_eq!(store.call_count("get"), 3);
    fs.lookup(ROOT_ID, "docs").unwrap();
    assert_eq!(store.call_count("get"), 3);

    let listing = fs.list(docs.ino).unwrap();
    assert_eq!(listing.len(), 1);
    assert_eq!(listing[0].name, "readme");
    assert_eq!(store.call_count("get"), 3);

    fs.lookup(docs.ino, "readme").unwrap();
    assert_eq!(store.call_count("get"), 4);
}

#[test]
fn missing_record_falls_back_to_default_node() {
    let store = Arc::new(InMemoryMetaStore::new());
    let old_ino = {
        let fs = mount(&store);
        populate(&fs);
        let docs = fs.lookup(ROOT_ID, "docs").unwrap();
        fs.lookup(docs.ino, "readme").unwrap().ino
    };
    store.delete("/docs/readme").unwrap();

    let fs = mount(&store);
    let docs = fs.lookup(ROOT_ID, "docs").unwrap();
    let readme = fs.lookup(docs.ino, "readme").unwrap();

    assert_eq!(fs.stats().materialize_fallbacks, 1);
    assert_eq!(readme.kind, NodeKind::File);
    assert_eq!(readme.perm(), 0o644);
    assert_eq!((readme.uid, readme.gid), (500, 500));
    assert_ne!(readme.ino, old_ino);
    assert_eq!(fs.list(docs.ino).unwrap()[0].ino, readme.ino);

    // The synthesised node and the re-pointed index are written back on sync
    fs.sync_all().unwrap();
    let record = NodeRecord::decode(&store.get("/docs/readme").unwrap()).unwrap();
    assert_eq!(record.id, readme.ino);
    let docs_record = NodeRecord::decode(&store.get("/docs").unwrap()).unwrap();
    assert_eq!(docs_record.entries[0].ino, readme.ino);
}

#[test]
fn corrupt_record_falls_back_to_default_directory() {
    let store = Arc::new(InMemoryMetaStore::new());
    populate(&mount(&store));
    store.put("/docs", b"{ definitely not a record").unwrap();

    let fs = mount(&store);
    let docs = fs.lookup(ROOT_ID, "docs").unwrap();
    assert!(docs.is_dir());
    assert_eq!(docs.perm(), 0o755);
    assert!(fs.list(docs.ino).unwrap().is_empty());
    assert_eq!(fs.stats().materialize_fallbacks, 1);
}

#[test]
fn record_kind_mismatch_falls_back() {
    let store = Arc::new(InMemoryMetaStore::new());
    populate(&mount(&store));
    // The index says directory, the record says file
    let file_record = store.get("/docs/readme").unwrap();
    store.put("/docs", &file_record).unwrap();

    let fs = mount(&store);
    let docs = fs.lookup(ROOT_ID, "docs").unwrap();
    assert!(docs.is_dir());
    assert_eq!(fs.stats().materialize_fallbacks, 1);
}

#[test]
fn corrupt_root_falls_back_to_empty_root() {
    let store = Arc::new(InMemoryMetaStore::new());
    populate(&mount(&store));
    store.put("/", b"\x00\x01").unwrap();

    let fs = mount(&store);
    let stats = fs.stats();
    assert_eq!(stats.materialize_fallbacks, 1);
    assert_eq!((stats.files, stats.directories, stats.bytes), (0, 0, 0));
    assert!(fs.list(ROOT_ID).unwrap().is_empty());
    assert!(matches!(fs.lookup(ROOT_ID, "docs"), Err(FsError::NotFound)));

    // The identifier high-water mark still comes from the info record
    let again = fs.mkdir(ROOT_ID, "again", 0o755, 0, 0).unwrap();
    assert!(again.ino.as_u64() > 3);
    assert_eq!(fs.stats().directories, 1);
}

#[test]
fn remove_after_restart_materialises_first() {
    let store = Arc::new(InMemoryMetaStore::new());
    populate(&mount(&store));

    let fs = mount(&store);
    assert!(matches!(fs.remove(ROOT_ID, "docs"), Err(FsError::DirectoryNotEmpty)));

    let docs = fs.lookup(ROOT_ID, "docs").unwrap();
    fs.remove(docs.ino, "readme").unwrap();
    fs.remove(ROOT_ID, "docs").unwrap();

    let stats = fs.stats();
    assert_eq!((stats.files, stats.directories, stats.bytes), (0, 0, 0));
    assert_eq!(store.keys(), vec!["/", "kvfs:info"]);
}

#[test]
fn rename_rekeys_unmaterialised_descendants() {
    let store = Arc::new(InMemoryMetaStore::new());
    {
        let fs = mount(&store);
        let a = fs.mkdir(ROOT_ID, "a", 0o755, 0, 0).unwrap();
        let b = fs.mkdir(a.ino, "b", 0o755, 0, 0).unwrap();
        let c = fs.create(b.ino, "c", 0o644, 0, 0).unwrap();
        fs.write(c.ino, 0, b"deep").unwrap();
        fs.fsync(c.ino).unwrap();
    }

    {
        let fs = mount(&store);
        fs.rename(ROOT_ID, "a", ROOT_ID, "z").unwrap();
    }
    assert_eq!(store.keys(), vec!["/", "/z", "/z/b", "/z/b/c", "kvfs:info"]);

    let fs = mount(&store);
    let z = fs.lookup(ROOT_ID, "z").unwrap();
    let b = fs.lookup(z.ino, "b").unwrap();
    let c = fs.lookup(b.ino, "c").unwrap();
    assert_eq!(fs.read(c.ino, 0, 16).unwrap(), b"deep");
    assert_eq!(fs.stats().materialize_fallbacks, 0);
}

#[test]
fn rename_retargets_parent_for_later_paths() {
    let store = Arc::new(InMemoryMetaStore::new());
    let fs = mount(&store);
    let a = fs.mkdir(ROOT_ID, "a", 0o755, 0, 0).unwrap();
    let b = fs.mkdir(ROOT_ID, "b", 0o755, 0, 0).unwrap();
    let sub = fs.mkdir(a.ino, "sub", 0o755, 0, 0).unwrap();

    fs.rename(a.ino, "sub", b.ino, "moved").unwrap();
    assert_eq!(fs.path_of(sub.ino).unwrap(), "/b/moved");

    fs.create(sub.ino, "x", 0o644, 0, 0).unwrap();
    assert!(store.get("/b/moved/x").is_ok());
    assert!(store.get("/a/sub").is_err());
    assert!(fs.list(a.ino).unwrap().is_empty());
}

#[test]
fn sqlite_backend_survives_restart() {
    let dir = TempDir::new().unwrap();
    let config = FsConfig {
        uid: Some(0),
        gid: Some(0),
        meta_store: MetaStoreConfig {
            backend: MetaStoreBackend::Sqlite,
            dir: dir.path().to_path_buf(),
            prefix: "vol".to_string(),
            ..MetaStoreConfig::default()
        },
        ..FsConfig::default()
    };

    let ino = {
        let fs = FileSystem::from_config(&config).unwrap();
        let f = fs.create(ROOT_ID, "durable", 0o644, 0, 0).unwrap();
        fs.write(f.ino, 0, b"on disk").unwrap();
        fs.shutdown().unwrap();
        f.ino
    };

    let fs = FileSystem::from_config(&config).unwrap();
    let f = fs.lookup(ROOT_ID, "durable").unwrap();
    assert_eq!(f.ino, ino);
    assert_eq!(fs.read(f.ino, 0, 64).unwrap(), b"on disk");
    assert_eq!(fs.stats().files, 1);
}
