// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! kvfs core: an in-memory directory tree persisted to a key-value store
//!
//! The tree engine keeps every node in memory under one lock and mirrors each
//! node to a [`MetaStore`] keyed by its canonical path, so the tree can be
//! rebuilt lazily after a restart.

pub mod config;
pub mod error;
pub mod metastore;
pub mod node;
pub mod sequence;
pub mod testing;
pub mod types;
pub mod vfs;

#[cfg(test)]
mod test_persistence;

// Re-export key types
pub use config::{
    CachePolicy, ConfigError, FsConfig, MetaStoreBackend, MetaStoreConfig, DEFAULT_MAX_FILE_SIZE,
};
pub use error::{FsError, FsResult, StoreError, StoreResult};
pub use metastore::{open_store, InMemoryMetaStore, MetaStore, SqliteMetaStore};
pub use sequence::Sequence;
pub use types::{
    Attributes, DirEntry, FsStats, NodeId, NodeKind, SetAttrChanges, TimeOrNow, XattrMode,
    ROOT_ID,
};
pub use vfs::FileSystem;
