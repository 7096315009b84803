// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Core type definitions for kvfs

use serde::{Deserialize, Serialize};
use std::time::SystemTime;

/// File-type bits carried in [`Attributes::mode`]
pub const S_IFMT: u32 = libc::S_IFMT as u32;
pub const S_IFDIR: u32 = libc::S_IFDIR as u32;
pub const S_IFREG: u32 = libc::S_IFREG as u32;

/// Permission bits (including setuid/setgid/sticky)
pub const PERM_MASK: u32 = 0o7777;

pub const DEFAULT_DIR_PERM: u32 = 0o755;
pub const DEFAULT_FILE_PERM: u32 = 0o644;

/// Identifier of a node; doubles as the kernel inode number
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(pub u64);

impl NodeId {
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl From<u64> for NodeId {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The root directory always owns the first identifier, matching the FUSE root inode.
pub const ROOT_ID: NodeId = NodeId(1);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeKind {
    File,
    Directory,
}

impl NodeKind {
    pub(crate) fn type_bits(self) -> u32 {
        match self {
            NodeKind::File => S_IFREG,
            NodeKind::Directory => S_IFDIR,
        }
    }

    pub(crate) fn default_perm(self) -> u32 {
        match self {
            NodeKind::File => DEFAULT_FILE_PERM,
            NodeKind::Directory => DEFAULT_DIR_PERM,
        }
    }
}

/// POSIX-style node metadata
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Attributes {
    pub ino: NodeId,
    pub size: u64,
    /// Size in 512-byte units
    pub blocks: u64,
    pub atime: SystemTime,
    pub mtime: SystemTime,
    pub ctime: SystemTime,
    pub crtime: SystemTime,
    pub kind: NodeKind,
    /// Permission bits combined with the file-type bits
    pub mode: u32,
    pub nlink: u32,
    pub uid: u32,
    pub gid: u32,
    pub rdev: u32,
    pub flags: u32,
}

impl Attributes {
    pub(crate) fn new(ino: NodeId, kind: NodeKind, perm: u32, uid: u32, gid: u32) -> Self {
        let now = SystemTime::now();
        Self {
            ino,
            size: 0,
            blocks: 0,
            atime: now,
            mtime: now,
            ctime: now,
            crtime: now,
            kind,
            mode: kind.type_bits() | (perm & PERM_MASK),
            nlink: match kind {
                NodeKind::File => 1,
                NodeKind::Directory => 2,
            },
            uid,
            gid,
            rdev: 0,
            flags: 0,
        }
    }

    pub fn is_dir(&self) -> bool {
        self.mode & S_IFMT == S_IFDIR
    }

    pub fn perm(&self) -> u32 {
        self.mode & PERM_MASK
    }

    pub(crate) fn set_size(&mut self, size: u64) {
        self.size = size;
        self.blocks = size.div_ceil(512);
    }
}

/// One item of a directory's entries index
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirEntry {
    pub ino: NodeId,
    pub name: String,
    pub kind: NodeKind,
}

/// Timestamp change requested through setattr
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TimeOrNow {
    Now,
    Specific(SystemTime),
}

impl TimeOrNow {
    pub(crate) fn resolve(self) -> SystemTime {
        match self {
            TimeOrNow::Now => SystemTime::now(),
            TimeOrNow::Specific(t) => t,
        }
    }
}

/// Partial attribute update; `Some` marks a field as valid in the request
#[derive(Clone, Debug, Default)]
pub struct SetAttrChanges {
    pub size: Option<u64>,
    pub atime: Option<TimeOrNow>,
    pub mtime: Option<TimeOrNow>,
    pub mode: Option<u32>,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    pub crtime: Option<SystemTime>,
    pub flags: Option<u32>,
    // Accepted but not stored
    pub handle: Option<u64>,
    pub lock_owner: Option<u64>,
    pub bkuptime: Option<SystemTime>,
    pub chgtime: Option<SystemTime>,
    pub ctime: Option<SystemTime>,
}

/// How a setxattr call treats an existing value
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum XattrMode {
    /// Create or overwrite
    #[default]
    Upsert,
    /// Fail if the attribute exists
    Create,
    /// Fail if the attribute is missing
    Replace,
}

/// Filesystem statistics
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FsStats {
    pub files: u64,
    pub directories: u64,
    pub bytes: u64,
    /// Highest identifier handed out so far
    pub last_id: u64,
    /// Lookups that had to synthesise a default node because the store had no usable record
    pub materialize_fallbacks: u64,
}
