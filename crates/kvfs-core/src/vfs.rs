// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Filesystem tree engine
//!
//! Every node lives in one arena guarded by a single mutex. Each public
//! operation holds that mutex for its whole duration, so multi-directory
//! mutations such as rename are observed as one step by every other caller.
//! Mutations are pushed to the metadata store before the lock is released;
//! entries that the store knows about but memory does not are loaded lazily.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::SystemTime;

use tracing::{debug, info, warn};

use crate::config::FsConfig;
use crate::error::{FsError, FsResult, StoreError};
use crate::metastore::{open_store, MetaStore};
use crate::node::{child_key, FsInfo, Node, NodeData, NodeRecord};
use crate::sequence::Sequence;
use crate::types::{
    Attributes, DirEntry, FsStats, NodeId, NodeKind, SetAttrChanges, XattrMode, PERM_MASK,
    ROOT_ID,
};

/// Everything guarded by the filesystem lock
struct Tree {
    nodes: HashMap<NodeId, Node>,
    files: u64,
    directories: u64,
    bytes: u64,
}

impl Tree {
    fn node(&self, id: NodeId) -> FsResult<&Node> {
        self.nodes.get(&id).ok_or(FsError::NotFound)
    }

    fn node_mut(&mut self, id: NodeId) -> FsResult<&mut Node> {
        self.nodes.get_mut(&id).ok_or(FsError::NotFound)
    }

    fn dir(&self, id: NodeId) -> FsResult<(&HashMap<String, NodeId>, &HashMap<String, DirEntry>)> {
        match &self.node(id)?.data {
            NodeData::Directory { children, entries } => Ok((children, entries)),
            NodeData::File { .. } => Err(FsError::NotADirectory),
        }
    }

    fn dir_mut(
        &mut self,
        id: NodeId,
    ) -> FsResult<(&mut HashMap<String, NodeId>, &mut HashMap<String, DirEntry>)> {
        match &mut self.node_mut(id)?.data {
            NodeData::Directory { children, entries } => Ok((children, entries)),
            NodeData::File { .. } => Err(FsError::NotADirectory),
        }
    }

    /// Canonical store key of a node, rebuilt from parent back-pointers
    fn key_of(&self, id: NodeId, root_key: &str) -> FsResult<String> {
        let mut names = Vec::new();
        let mut current = self.node(id)?;
        while let Some(parent) = current.parent {
            if names.len() > self.nodes.len() {
                return Err(FsError::InvalidArgument);
            }
            names.push(current.name.as_str());
            current = self.node(parent)?;
        }
        Ok(names.iter().rev().fold(root_key.to_string(), |key, name| child_key(&key, name)))
    }

    /// Whether `ancestor` is `id` or one of its parents
    fn is_within(&self, id: NodeId, ancestor: NodeId) -> bool {
        let mut current = Some(id);
        for _ in 0..=self.nodes.len() {
            match current {
                Some(cur) if cur == ancestor => return true,
                Some(cur) => current = self.nodes.get(&cur).and_then(|n| n.parent),
                None => return false,
            }
        }
        false
    }

    /// `id` followed by its materialised descendants
    fn subtree(&self, id: NodeId) -> Vec<NodeId> {
        let mut out = Vec::new();
        let mut stack = vec![id];
        while let Some(cur) = stack.pop() {
            out.push(cur);
            if let Some(Node {
                data: NodeData::Directory { children, .. },
                ..
            }) = self.nodes.get(&cur)
            {
                stack.extend(children.values().copied());
            }
        }
        out
    }

    fn touch_modified(&mut self, id: NodeId, now: SystemTime) {
        if let Some(node) = self.nodes.get_mut(&id) {
            node.attrs.mtime = now;
            node.attrs.ctime = now;
            node.dirty = true;
        }
    }

    fn touch_accessed(&mut self, id: NodeId) {
        if let Some(node) = self.nodes.get_mut(&id) {
            node.attrs.atime = SystemTime::now();
        }
    }

    fn forget_counts(&mut self, node: &Node) {
        match &node.data {
            NodeData::File { content } => {
                self.files = self.files.saturating_sub(1);
                self.bytes = self.bytes.saturating_sub(content.len() as u64);
            }
            NodeData::Directory { .. } => {
                self.directories = self.directories.saturating_sub(1);
            }
        }
    }
}

fn validate_name(name: &str) -> FsResult<()> {
    if name.is_empty() || name == "." || name == ".." || name.contains('/') || name.contains('\0')
    {
        return Err(FsError::InvalidArgument);
    }
    Ok(())
}

/// Grow or shrink file content to `len` bytes, zero-filling
fn resize_content(content: &mut Vec<u8>, len: u64, max: u64) -> FsResult<()> {
    if len > max {
        return Err(FsError::FileTooLarge);
    }
    let len = usize::try_from(len).map_err(|_| FsError::FileTooLarge)?;
    if let Some(extra) = len.checked_sub(content.len()) {
        content.try_reserve_exact(extra).map_err(|_| FsError::NoSpace)?;
    }
    content.resize(len, 0);
    Ok(())
}

/// Largest identifier a record mentions, itself or one of its indexed children
fn highest_id(record: &NodeRecord) -> u64 {
    record
        .entries
        .iter()
        .map(|e| e.ino.as_u64())
        .fold(record.id.as_u64(), u64::max)
}

fn log_unsupported(id: NodeId, changes: &SetAttrChanges) {
    if let Some(fh) = changes.handle {
        debug!(ino = %id, fh, "setattr: file handle not supported, ignoring");
    }
    if let Some(lock_owner) = changes.lock_owner {
        debug!(ino = %id, lock_owner, "setattr: lock owner not supported, ignoring");
    }
    if changes.bkuptime.is_some() {
        debug!(ino = %id, "setattr: backup time not supported, ignoring");
    }
    if changes.chgtime.is_some() {
        debug!(ino = %id, "setattr: change time not supported, ignoring");
    }
    if changes.ctime.is_some() {
        debug!(ino = %id, "setattr: explicit ctime not supported, ignoring");
    }
}

/// A mounted tree: the root, the lock, the allocator and the store
pub struct FileSystem {
    read_only: bool,
    store: Arc<dyn MetaStore>,
    sequence: Sequence,
    uid: u32,
    gid: u32,
    max_file_size: u64,
    root_key: String,
    info_key: String,
    fallbacks: AtomicU64,
    tree: Mutex<Tree>,
}

impl FileSystem {
    /// Restore the tree rooted at the configured root key, or start a fresh one
    pub fn new(config: &FsConfig, store: Arc<dyn MetaStore>) -> FsResult<Self> {
        let uid = config.uid.unwrap_or_else(|| unsafe { libc::geteuid() });
        let gid = config.gid.unwrap_or_else(|| unsafe { libc::getegid() });
        let fs = Self {
            read_only: config.read_only,
            store,
            sequence: Sequence::new(),
            uid,
            gid,
            max_file_size: config.max_file_size,
            root_key: config.meta_store.fs_root.clone(),
            info_key: config.meta_store.fs_info.clone(),
            fallbacks: AtomicU64::new(0),
            tree: Mutex::new(Tree {
                nodes: HashMap::new(),
                files: 0,
                directories: 0,
                bytes: 0,
            }),
        };
        fs.restore()?;

        let stats = fs.stats();
        info!(
            name = %config.name,
            read_only = fs.read_only,
            files = stats.files,
            directories = stats.directories,
            last_id = stats.last_id,
            "filesystem ready"
        );
        Ok(fs)
    }

    /// Open the configured metadata store and restore the tree from it
    pub fn from_config(config: &FsConfig) -> FsResult<Self> {
        let store = open_store(&config.meta_store)?;
        Self::new(config, store)
    }

    fn restore(&self) -> FsResult<()> {
        let mut tree = self.lock();

        let info = match self.store.get(&self.info_key) {
            Ok(bytes) => match FsInfo::decode(&bytes) {
                Ok(info) => Some(info),
                Err(e) => {
                    warn!(key = %self.info_key, error = %e, "discarding unreadable filesystem info");
                    None
                }
            },
            Err(StoreError::NotFound) => None,
            Err(e) => return Err(e.into()),
        };
        if let Some(info) = &info {
            self.sequence.advance_to(info.last_id);
        }
        self.sequence.advance_to(ROOT_ID.as_u64());

        // Counters are only meaningful next to the root they were recorded with
        let (root, fresh, restored) = match self.store.get(&self.root_key) {
            Ok(bytes) => match NodeRecord::decode(&bytes) {
                Ok(record) if record.id == ROOT_ID && record.kind == NodeKind::Directory => {
                    self.sequence.advance_to(highest_id(&record));
                    (record.into_node(None), false, true)
                }
                Ok(record) => {
                    let reason = format!("root record has id {} kind {:?}", record.id, record.kind);
                    self.note_fallback(&self.root_key, &reason);
                    (self.default_root(), false, false)
                }
                Err(e) => {
                    self.note_fallback(&self.root_key, &e.to_string());
                    (self.default_root(), false, false)
                }
            },
            Err(StoreError::NotFound) => (self.default_root(), true, false),
            Err(e) => return Err(e.into()),
        };
        tree.nodes.insert(ROOT_ID, root);

        match info {
            Some(info) if restored => {
                tree.files = info.files;
                tree.directories = info.directories;
                tree.bytes = info.bytes;
            }
            _ => {}
        }

        if fresh && !self.read_only {
            self.persist_node(&mut tree, ROOT_ID)?;
            self.persist_info(&tree)?;
        }
        Ok(())
    }

    fn default_root(&self) -> Node {
        Node::synthesize(ROOT_ID, "", NodeKind::Directory, None, self.uid, self.gid)
    }

    fn lock(&self) -> MutexGuard<'_, Tree> {
        self.tree.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn check_writable(&self) -> FsResult<()> {
        if self.read_only {
            return Err(FsError::PermissionDenied);
        }
        Ok(())
    }

    pub fn root(&self) -> NodeId {
        ROOT_ID
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    pub fn stats(&self) -> FsStats {
        let tree = self.lock();
        FsStats {
            files: tree.files,
            directories: tree.directories,
            bytes: tree.bytes,
            last_id: self.sequence.current(),
            materialize_fallbacks: self.fallbacks.load(Ordering::Relaxed),
        }
    }

    /// Parent of a live node; the root is its own parent
    pub fn parent_of(&self, id: NodeId) -> FsResult<NodeId> {
        Ok(self.lock().node(id)?.parent.unwrap_or(id))
    }

    /// Canonical path of a live node
    pub fn path_of(&self, id: NodeId) -> FsResult<String> {
        self.lock().key_of(id, &self.root_key)
    }

    // Persistence glue

    fn persist_node(&self, tree: &mut Tree, id: NodeId) -> FsResult<()> {
        let key = tree.key_of(id, &self.root_key)?;
        let node = tree.node_mut(id)?;
        let bytes = NodeRecord::from_node(node).encode()?;
        if let Err(e) = self.store.put(&key, &bytes) {
            warn!(key = %key, error = %e, "failed to persist node");
            return Err(e.into());
        }
        node.dirty = false;
        Ok(())
    }

    fn persist_info(&self, tree: &Tree) -> FsResult<()> {
        let info = FsInfo {
            last_id: self.sequence.current(),
            files: tree.files,
            directories: tree.directories,
            bytes: tree.bytes,
        };
        if let Err(e) = self.store.put(&self.info_key, &info.encode()?) {
            warn!(key = %self.info_key, error = %e, "failed to persist filesystem info");
            return Err(e.into());
        }
        Ok(())
    }

    fn delete_record(&self, key: &str) {
        if let Err(e) = self.store.delete(key) {
            warn!(key, error = %e, "failed to delete metadata record");
        }
    }

    /// Copy an unmaterialised record, and everything its index names, to a new key
    fn move_record(&self, old: &str, new: &str) -> FsResult<()> {
        let bytes = match self.store.get(old) {
            Ok(bytes) => bytes,
            Err(StoreError::NotFound) => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        self.store.put(new, &bytes)?;
        if let Ok(record) = NodeRecord::decode(&bytes) {
            for entry in &record.entries {
                self.move_record(&child_key(old, &entry.name), &child_key(new, &entry.name))?;
            }
        }
        self.store.delete(old)?;
        Ok(())
    }

    fn note_fallback(&self, key: &str, reason: &str) {
        let total = self.fallbacks.fetch_add(1, Ordering::Relaxed) + 1;
        warn!(key, reason, total, "metadata record unusable, synthesising default node");
    }

    fn read_record(&self, tree: &Tree, key: &str, kind: NodeKind) -> Result<NodeRecord, String> {
        let bytes = self.store.get(key).map_err(|e| e.to_string())?;
        let record = NodeRecord::decode(&bytes).map_err(|e| e.to_string())?;
        if record.kind != kind {
            return Err(format!("record kind {:?} disagrees with index kind {:?}", record.kind, kind));
        }
        if record.id == ROOT_ID || tree.nodes.contains_key(&record.id) {
            return Err(format!("identifier {} is already live", record.id));
        }
        Ok(record)
    }

    /// Resolve `name` in `dir`, loading it from the store if only the index knows it
    fn materialize(&self, tree: &mut Tree, dir: NodeId, name: &str) -> FsResult<Option<NodeId>> {
        let entry = {
            let (children, entries) = tree.dir(dir)?;
            if let Some(id) = children.get(name) {
                return Ok(Some(*id));
            }
            match entries.get(name) {
                Some(entry) => entry.clone(),
                None => return Ok(None),
            }
        };

        let key = child_key(&tree.key_of(dir, &self.root_key)?, name);
        let mut node = match self.read_record(tree, &key, entry.kind) {
            Ok(record) => {
                self.sequence.advance_to(highest_id(&record));
                debug!(key = %key, ino = %record.id, "materialised node from store");
                record.into_node(Some(dir))
            }
            Err(reason) => {
                let id = NodeId(self.sequence.next());
                self.note_fallback(&key, &reason);
                Node::synthesize(id, name, entry.kind, Some(dir), self.uid, self.gid)
            }
        };
        node.name = name.to_string();
        let id = node.id;
        tree.nodes.insert(id, node);

        let (children, entries) = tree.dir_mut(dir)?;
        children.insert(name.to_string(), id);
        let reindexed = match entries.get_mut(name) {
            Some(entry) if entry.ino != id => {
                entry.ino = id;
                true
            }
            _ => false,
        };
        if reindexed {
            tree.node_mut(dir)?.dirty = true;
        }
        Ok(Some(id))
    }

    fn attach(
        &self,
        tree: &mut Tree,
        parent: NodeId,
        name: &str,
        build: impl FnOnce(NodeId) -> Node,
    ) -> FsResult<NodeId> {
        if tree.dir(parent)?.1.contains_key(name) {
            return Err(FsError::AlreadyExists);
        }
        let id = NodeId(self.sequence.next());
        let node = build(id);
        let entry = node.entry();
        tree.nodes.insert(id, node);

        let (children, entries) = tree.dir_mut(parent)?;
        children.insert(name.to_string(), id);
        entries.insert(name.to_string(), entry);
        tree.touch_modified(parent, SystemTime::now());
        Ok(id)
    }

    fn persist_new(&self, tree: &mut Tree, parent: NodeId, id: NodeId) -> FsResult<Attributes> {
        self.persist_node(tree, id)?;
        self.persist_node(tree, parent)?;
        self.persist_info(tree)?;
        Ok(tree.node(id)?.attrs.clone())
    }

    // Directory operations

    /// Create an empty file owned by the caller
    pub fn create(
        &self,
        parent: NodeId,
        name: &str,
        mode: u32,
        uid: u32,
        gid: u32,
    ) -> FsResult<Attributes> {
        self.check_writable()?;
        validate_name(name)?;
        let mut tree = self.lock();
        let id = self.attach(&mut tree, parent, name, |id| {
            Node::new_file(id, name, mode, Some(parent), uid, gid)
        })?;
        tree.files += 1;
        info!(parent = %parent, name, ino = %id, "created file");
        self.persist_new(&mut tree, parent, id)
    }

    pub fn mkdir(
        &self,
        parent: NodeId,
        name: &str,
        mode: u32,
        uid: u32,
        gid: u32,
    ) -> FsResult<Attributes> {
        self.check_writable()?;
        validate_name(name)?;
        let mut tree = self.lock();
        let id = self.attach(&mut tree, parent, name, |id| {
            Node::new_dir(id, name, mode, Some(parent), uid, gid)
        })?;
        tree.directories += 1;
        info!(parent = %parent, name, ino = %id, "created directory");
        self.persist_new(&mut tree, parent, id)
    }

    /// Unlink a file or an empty directory
    pub fn remove(&self, parent: NodeId, name: &str) -> FsResult<()> {
        self.remove_kind(parent, name, None)
    }

    /// Remove a file, refusing directories
    pub fn unlink(&self, parent: NodeId, name: &str) -> FsResult<()> {
        self.remove_kind(parent, name, Some(NodeKind::File))
    }

    /// Remove an empty directory, refusing files
    pub fn rmdir(&self, parent: NodeId, name: &str) -> FsResult<()> {
        self.remove_kind(parent, name, Some(NodeKind::Directory))
    }

    fn remove_kind(&self, parent: NodeId, name: &str, expected: Option<NodeKind>) -> FsResult<()> {
        self.check_writable()?;
        let mut tree = self.lock();
        let id = self
            .materialize(&mut tree, parent, name)?
            .ok_or(FsError::NotFound)?;
        match (expected, tree.node(id)?.kind()) {
            (Some(NodeKind::File), NodeKind::Directory) => return Err(FsError::IsADirectory),
            (Some(NodeKind::Directory), NodeKind::File) => return Err(FsError::NotADirectory),
            _ => {}
        }
        if let NodeData::Directory { entries, .. } = &tree.node(id)?.data {
            if !entries.is_empty() {
                return Err(FsError::DirectoryNotEmpty);
            }
        }
        let key = tree.key_of(id, &self.root_key)?;

        let (children, entries) = tree.dir_mut(parent)?;
        children.remove(name);
        entries.remove(name);
        tree.touch_modified(parent, SystemTime::now());
        if let Some(removed) = tree.nodes.remove(&id) {
            tree.forget_counts(&removed);
        }
        info!(parent = %parent, name, ino = %id, "removed");

        self.delete_record(&key);
        self.persist_node(&mut tree, parent)?;
        self.persist_info(&tree)
    }

    /// Move `old_name` in `src_dir` to `new_name` in `dst_dir`, replacing a compatible destination
    pub fn rename(
        &self,
        src_dir: NodeId,
        old_name: &str,
        dst_dir: NodeId,
        new_name: &str,
    ) -> FsResult<()> {
        self.rename_with(src_dir, old_name, dst_dir, new_name, true)
    }

    /// Like [`FileSystem::rename`], but fails with `AlreadyExists` if `new_name` is taken
    pub fn rename_noreplace(
        &self,
        src_dir: NodeId,
        old_name: &str,
        dst_dir: NodeId,
        new_name: &str,
    ) -> FsResult<()> {
        self.rename_with(src_dir, old_name, dst_dir, new_name, false)
    }

    fn rename_with(
        &self,
        src_dir: NodeId,
        old_name: &str,
        dst_dir: NodeId,
        new_name: &str,
        replace: bool,
    ) -> FsResult<()> {
        self.check_writable()?;
        validate_name(new_name)?;
        let mut tree = self.lock();
        tree.dir(src_dir)?;
        if !tree.node(dst_dir)?.is_dir() {
            return Err(FsError::InvalidTarget);
        }
        let id = self
            .materialize(&mut tree, src_dir, old_name)?
            .ok_or(FsError::NotFound)?;
        if !replace && tree.dir(dst_dir)?.1.contains_key(new_name) {
            return Err(FsError::AlreadyExists);
        }
        if src_dir == dst_dir && old_name == new_name {
            return Ok(());
        }
        let moving_dir = tree.node(id)?.is_dir();
        if moving_dir && tree.is_within(dst_dir, id) {
            return Err(FsError::InvalidArgument);
        }

        let replaced = match self.materialize(&mut tree, dst_dir, new_name)? {
            Some(existing) => {
                match (moving_dir, &tree.node(existing)?.data) {
                    (true, NodeData::Directory { entries, .. }) if !entries.is_empty() => {
                        return Err(FsError::DirectoryNotEmpty)
                    }
                    (true, NodeData::File { .. }) => return Err(FsError::NotADirectory),
                    (false, NodeData::Directory { .. }) => return Err(FsError::IsADirectory),
                    _ => {}
                }
                Some(existing)
            }
            None => None,
        };

        // Old keys of everything that moves, captured before any pointer changes
        let subtree = tree.subtree(id);
        let mut old_keys = Vec::with_capacity(subtree.len());
        let mut unmaterialized = Vec::new();
        for node_id in &subtree {
            let key = tree.key_of(*node_id, &self.root_key)?;
            if let NodeData::Directory { children, entries } = &tree.node(*node_id)?.data {
                for name in entries.keys().filter(|n| !children.contains_key(*n)) {
                    unmaterialized.push((*node_id, name.clone(), child_key(&key, name)));
                }
            }
            old_keys.push(key);
        }

        let now = SystemTime::now();
        if let Some(existing) = replaced {
            if let Some(node) = tree.nodes.remove(&existing) {
                tree.forget_counts(&node);
            }
        }
        let (children, entries) = tree.dir_mut(src_dir)?;
        children.remove(old_name);
        entries.remove(old_name);
        tree.touch_modified(src_dir, now);

        let node = tree.node_mut(id)?;
        node.name = new_name.to_string();
        node.parent = Some(dst_dir);
        node.attrs.ctime = now;
        node.dirty = true;
        let entry = node.entry();

        let (children, entries) = tree.dir_mut(dst_dir)?;
        children.insert(new_name.to_string(), id);
        entries.insert(new_name.to_string(), entry);
        tree.touch_modified(dst_dir, now);
        info!(
            src = %src_dir,
            old_name,
            dst = %dst_dir,
            new_name,
            ino = %id,
            replaced = replaced.is_some(),
            "renamed"
        );

        for node_id in &subtree {
            self.persist_node(&mut tree, *node_id)?;
        }
        for (dir, name, old_key) in &unmaterialized {
            let new_key = child_key(&tree.key_of(*dir, &self.root_key)?, name);
            self.move_record(old_key, &new_key)?;
        }
        for key in &old_keys {
            self.delete_record(key);
        }
        self.persist_node(&mut tree, src_dir)?;
        if dst_dir != src_dir {
            self.persist_node(&mut tree, dst_dir)?;
        }
        self.persist_info(&tree)
    }

    pub fn lookup(&self, dir: NodeId, name: &str) -> FsResult<Attributes> {
        let mut tree = self.lock();
        let found = self.materialize(&mut tree, dir, name)?;
        tree.touch_accessed(dir);
        let id = found.ok_or(FsError::NotFound)?;
        debug!(dir = %dir, name, ino = %id, "lookup");
        Ok(tree.node(id)?.attrs.clone())
    }

    /// Entry summaries straight from the index; children are not materialised
    pub fn list(&self, dir: NodeId) -> FsResult<Vec<DirEntry>> {
        let mut tree = self.lock();
        let mut listing: Vec<DirEntry> = tree.dir(dir)?.1.values().cloned().collect();
        listing.sort_by(|a, b| a.name.cmp(&b.name));
        tree.touch_accessed(dir);
        debug!(dir = %dir, entries = listing.len(), "list");
        Ok(listing)
    }

    // Attribute operations

    pub fn get_attributes(&self, id: NodeId) -> FsResult<Attributes> {
        let tree = self.lock();
        Ok(tree.node(id)?.attrs.clone())
    }

    pub fn set_attributes(&self, id: NodeId, changes: &SetAttrChanges) -> FsResult<Attributes> {
        self.check_writable()?;
        log_unsupported(id, changes);
        let mut tree = self.lock();
        let now = SystemTime::now();
        let node = tree.node_mut(id)?;

        let mut resized = None;
        if let Some(size) = changes.size {
            match &mut node.data {
                NodeData::File { content } => {
                    let old_len = content.len() as u64;
                    resize_content(content, size, self.max_file_size)?;
                    resized = Some((old_len, size));
                    node.attrs.set_size(size);
                    node.attrs.mtime = now;
                }
                NodeData::Directory { .. } => {
                    debug!(ino = %id, size, "setattr: size change on directory ignored");
                }
            }
        }
        if let Some(atime) = changes.atime {
            node.attrs.atime = atime.resolve();
        }
        if let Some(mtime) = changes.mtime {
            node.attrs.mtime = mtime.resolve();
        }
        if let Some(mode) = changes.mode {
            node.attrs.mode = node.attrs.kind.type_bits() | (mode & PERM_MASK);
        }
        if let Some(uid) = changes.uid {
            node.attrs.uid = uid;
        }
        if let Some(gid) = changes.gid {
            node.attrs.gid = gid;
        }
        if let Some(crtime) = changes.crtime {
            node.attrs.crtime = crtime;
        }
        if let Some(flags) = changes.flags {
            node.attrs.flags = flags;
        }
        node.attrs.ctime = now;
        node.dirty = true;
        let attrs = node.attrs.clone();

        if let Some((old_len, new_len)) = resized {
            tree.bytes = tree.bytes.saturating_sub(old_len).saturating_add(new_len);
        }
        debug!(ino = %id, mode = attrs.mode, size = attrs.size, "setattr");
        self.persist_node(&mut tree, id)?;
        if resized.is_some() {
            self.persist_info(&tree)?;
        }
        Ok(attrs)
    }

    pub fn get_extended_attribute(&self, id: NodeId, key: &str) -> FsResult<Vec<u8>> {
        let tree = self.lock();
        tree.node(id)?
            .xattrs
            .get(key)
            .cloned()
            .ok_or(FsError::NoExtendedAttribute)
    }

    pub fn set_extended_attribute(&self, id: NodeId, key: &str, value: &[u8]) -> FsResult<()> {
        self.set_extended_attribute_with(id, key, value, XattrMode::Upsert)
    }

    /// setxattr honouring create-only / replace-only requests
    pub fn set_extended_attribute_with(
        &self,
        id: NodeId,
        key: &str,
        value: &[u8],
        mode: XattrMode,
    ) -> FsResult<()> {
        self.check_writable()?;
        if key.is_empty() {
            return Err(FsError::InvalidArgument);
        }
        let mut tree = self.lock();
        let node = tree.node_mut(id)?;
        let exists = node.xattrs.contains_key(key);
        match mode {
            XattrMode::Create if exists => return Err(FsError::AlreadyExists),
            XattrMode::Replace if !exists => return Err(FsError::NoExtendedAttribute),
            _ => {}
        }
        node.xattrs.insert(key.to_string(), value.to_vec());
        node.attrs.ctime = SystemTime::now();
        node.dirty = true;
        debug!(ino = %id, key, len = value.len(), "setxattr");
        self.persist_node(&mut tree, id)
    }

    pub fn list_extended_attributes(&self, id: NodeId) -> FsResult<Vec<String>> {
        let tree = self.lock();
        let mut keys: Vec<String> = tree.node(id)?.xattrs.keys().cloned().collect();
        keys.sort();
        Ok(keys)
    }

    pub fn remove_extended_attribute(&self, id: NodeId, key: &str) -> FsResult<()> {
        self.check_writable()?;
        let mut tree = self.lock();
        let node = tree.node_mut(id)?;
        if node.xattrs.remove(key).is_none() {
            return Err(FsError::NoExtendedAttribute);
        }
        node.attrs.ctime = SystemTime::now();
        node.dirty = true;
        debug!(ino = %id, key, "removexattr");
        self.persist_node(&mut tree, id)
    }

    // File content

    /// Up to `size` bytes from `offset`; empty past end of file
    pub fn read(&self, id: NodeId, offset: u64, size: usize) -> FsResult<Vec<u8>> {
        let mut tree = self.lock();
        let node = tree.node_mut(id)?;
        let NodeData::File { content } = &node.data else {
            return Err(FsError::IsADirectory);
        };
        let start = usize::try_from(offset).unwrap_or(usize::MAX).min(content.len());
        let end = start.saturating_add(size).min(content.len());
        let data = content[start..end].to_vec();
        node.attrs.atime = SystemTime::now();
        Ok(data)
    }

    /// Write at `offset`, zero-filling any gap. Persisted on flush/fsync.
    pub fn write(&self, id: NodeId, offset: u64, data: &[u8]) -> FsResult<usize> {
        self.check_writable()?;
        let mut tree = self.lock();
        let now = SystemTime::now();
        let node = tree.node_mut(id)?;
        let NodeData::File { content } = &mut node.data else {
            return Err(FsError::IsADirectory);
        };
        if data.is_empty() {
            return Ok(0);
        }
        let end = offset
            .checked_add(data.len() as u64)
            .ok_or(FsError::FileTooLarge)?;
        let old_len = content.len() as u64;
        if end > old_len {
            resize_content(content, end, self.max_file_size)?;
        }
        let start = usize::try_from(offset).map_err(|_| FsError::FileTooLarge)?;
        content[start..start + data.len()].copy_from_slice(data);
        let new_len = content.len() as u64;
        node.attrs.set_size(new_len);
        node.attrs.mtime = now;
        node.attrs.ctime = now;
        node.dirty = true;

        tree.bytes = tree.bytes.saturating_sub(old_len).saturating_add(new_len);
        Ok(data.len())
    }

    /// Persist the node if it has unsaved changes
    pub fn flush(&self, id: NodeId) -> FsResult<()> {
        let mut tree = self.lock();
        if self.read_only || !tree.node(id)?.dirty {
            return Ok(());
        }
        self.persist_node(&mut tree, id)?;
        self.persist_info(&tree)
    }

    pub fn fsync(&self, id: NodeId) -> FsResult<()> {
        self.flush(id)
    }

    /// Every live node is accessible; only the read-only switch is enforced
    pub fn access(&self, id: NodeId) -> FsResult<()> {
        self.lock().node(id).map(|_| ())
    }

    // Lifecycle

    /// Persist every dirty node and the filesystem info, reporting the first failure
    pub fn sync_all(&self) -> FsResult<()> {
        if self.read_only {
            return Ok(());
        }
        let mut tree = self.lock();
        let mut dirty: Vec<NodeId> = tree.nodes.values().filter(|n| n.dirty).map(|n| n.id).collect();
        dirty.sort();

        let mut first_error = None;
        for id in dirty {
            if let Err(e) = self.persist_node(&mut tree, id) {
                first_error = first_error.or(Some(e));
            }
        }
        if let Err(e) = self.persist_info(&tree) {
            first_error = first_error.or(Some(e));
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Final flush; the adapter must already be unmounted
    pub fn shutdown(&self) -> FsResult<()> {
        let result = self.sync_all();
        match &result {
            Ok(()) => info!("filesystem state flushed"),
            Err(e) => warn!(error = %e, "filesystem shutdown left unsaved state"),
        }
        result
    }
}
