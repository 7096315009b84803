// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! kvfs FUSE adapter
//!
//! Maps FUSE operations onto [`FileSystem`] calls. Kernel inode numbers are
//! node identifiers, so no inode table is kept here.

#[cfg(not(all(feature = "fuse", target_os = "linux")))]
compile_error!("This module requires the 'fuse' feature on Linux");

use fuser::{
    FileAttr, FileType, ReplyAttr, ReplyCreate, ReplyData, ReplyDirectory, ReplyEmpty, ReplyEntry,
    ReplyOpen, ReplyStatfs, ReplyWrite, ReplyXattr, Request,
};
use kvfs_core::{
    Attributes, CachePolicy, FileSystem, FsError, NodeId, NodeKind, SetAttrChanges, TimeOrNow,
    XattrMode,
};
use libc::{
    c_int, EEXIST, EFBIG, EINVAL, EIO, EISDIR, ENAMETOOLONG, ENODATA, ENOENT, ENOSPC, ENOTDIR,
    ENOTEMPTY, EPERM, ERANGE,
};
use std::ffi::OsStr;
use std::sync::mpsc::Sender;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tracing::{debug, info, warn};

/// Maximum single path component length
const NAME_MAX: usize = 255;

/// Block size reported through getattr and statfs
const BLOCK_SIZE: u32 = 512;

/// Free space advertised by statfs; the tree lives in memory and has no fixed capacity
const FREE_BLOCKS: u64 = 1 << 24;
const FREE_FILES: u64 = 1 << 20;

/// Why the mount loop should stop
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ShutdownReason {
    /// SIGINT or SIGTERM
    Signal,
    /// The kernel tore the session down (e.g. `fusermount -u`)
    Unmounted,
}

pub struct KvFsFuse {
    fs: Arc<FileSystem>,
    attr_ttl: Duration,
    entry_ttl: Duration,
    /// Told when the kernel destroys the session
    shutdown: Option<Sender<ShutdownReason>>,
}

impl KvFsFuse {
    pub fn new(fs: Arc<FileSystem>, cache: &CachePolicy) -> Self {
        Self {
            fs,
            attr_ttl: Duration::from_millis(cache.attr_ttl_ms as u64),
            entry_ttl: Duration::from_millis(cache.entry_ttl_ms as u64),
            shutdown: None,
        }
    }

    pub fn with_shutdown_notifier(mut self, sender: Sender<ShutdownReason>) -> Self {
        self.shutdown = Some(sender);
        self
    }

    fn reply_entry(&self, result: Result<Attributes, FsError>, reply: ReplyEntry) {
        match result {
            Ok(attr) => reply.entry(&self.entry_ttl, &attr_to_fuse(&attr), 0),
            Err(err) => reply.error(errno(&err)),
        }
    }
}

/// Errno reported to the kernel for a core error
pub fn errno(err: &FsError) -> c_int {
    match err {
        FsError::PermissionDenied => EPERM,
        FsError::NotFound => ENOENT,
        FsError::AlreadyExists => EEXIST,
        FsError::DirectoryNotEmpty => ENOTEMPTY,
        FsError::InvalidTarget | FsError::NotADirectory => ENOTDIR,
        FsError::IsADirectory => EISDIR,
        FsError::InvalidArgument => EINVAL,
        FsError::NoExtendedAttribute => ENODATA,
        FsError::FileTooLarge => EFBIG,
        FsError::NoSpace => ENOSPC,
        FsError::Store(_) | FsError::Codec(_) => EIO,
    }
}

fn file_type(kind: NodeKind) -> FileType {
    match kind {
        NodeKind::File => FileType::RegularFile,
        NodeKind::Directory => FileType::Directory,
    }
}

/// Convert core attributes to a FUSE `FileAttr`
pub fn attr_to_fuse(attr: &Attributes) -> FileAttr {
    FileAttr {
        ino: attr.ino.as_u64(),
        size: attr.size,
        blocks: attr.blocks,
        atime: attr.atime,
        mtime: attr.mtime,
        ctime: attr.ctime,
        crtime: attr.crtime,
        kind: file_type(attr.kind),
        perm: attr.perm() as u16,
        nlink: attr.nlink,
        uid: attr.uid,
        gid: attr.gid,
        rdev: attr.rdev,
        blksize: BLOCK_SIZE,
        flags: attr.flags,
    }
}

fn time_or_now(value: fuser::TimeOrNow) -> TimeOrNow {
    match value {
        fuser::TimeOrNow::Now => TimeOrNow::Now,
        fuser::TimeOrNow::SpecificTime(t) => TimeOrNow::Specific(t),
    }
}

/// Component name as UTF-8, or the errno to reply with
fn component(name: &OsStr) -> Result<&str, c_int> {
    let name = name.to_str().ok_or(EINVAL)?;
    if name.len() > NAME_MAX {
        return Err(ENAMETOOLONG);
    }
    Ok(name)
}

fn xattr_mode(flags: i32) -> XattrMode {
    if flags & libc::XATTR_CREATE != 0 {
        XattrMode::Create
    } else if flags & libc::XATTR_REPLACE != 0 {
        XattrMode::Replace
    } else {
        XattrMode::Upsert
    }
}

/// Answer an xattr request: a zero `size` asks for the length only
fn reply_xattr(value: &[u8], size: u32, reply: ReplyXattr) {
    if size == 0 {
        reply.size(value.len() as u32);
    } else if value.len() <= size as usize {
        reply.data(value);
    } else {
        reply.error(ERANGE);
    }
}

impl fuser::Filesystem for KvFsFuse {
    fn init(&mut self, _req: &Request, _config: &mut fuser::KernelConfig) -> Result<(), c_int> {
        let stats = self.fs.stats();
        info!(
            files = stats.files,
            directories = stats.directories,
            bytes = stats.bytes,
            read_only = self.fs.is_read_only(),
            "kvfs FUSE adapter initialized"
        );
        Ok(())
    }

    fn destroy(&mut self) {
        info!("kvfs FUSE adapter destroyed");
        if let Some(sender) = self.shutdown.take() {
            // The main thread may already be gone when it initiated the unmount
            let _ = sender.send(ShutdownReason::Unmounted);
        }
    }

    fn lookup(&mut self, _req: &Request, parent: u64, name: &OsStr, reply: ReplyEntry) {
        let name = match component(name) {
            Ok(name) => name,
            Err(code) => return reply.error(code),
        };
        let result = self.fs.lookup(NodeId(parent), name);
        self.reply_entry(result, reply);
    }

    fn forget(&mut self, _req: &Request, _ino: u64, _nlookup: u64) {
        // Nodes stay resident until they are removed
    }

    fn getattr(&mut self, _req: &Request, ino: u64, _fh: Option<u64>, reply: ReplyAttr) {
        match self.fs.get_attributes(NodeId(ino)) {
            Ok(attr) => reply.attr(&self.attr_ttl, &attr_to_fuse(&attr)),
            Err(err) => reply.error(errno(&err)),
        }
    }

    fn setattr(
        &mut self,
        _req: &Request,
        ino: u64,
        mode: Option<u32>,
        uid: Option<u32>,
        gid: Option<u32>,
        size: Option<u64>,
        atime: Option<fuser::TimeOrNow>,
        mtime: Option<fuser::TimeOrNow>,
        ctime: Option<SystemTime>,
        fh: Option<u64>,
        crtime: Option<SystemTime>,
        chgtime: Option<SystemTime>,
        bkuptime: Option<SystemTime>,
        flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        let changes = SetAttrChanges {
            size,
            atime: atime.map(time_or_now),
            mtime: mtime.map(time_or_now),
            mode,
            uid,
            gid,
            crtime,
            flags,
            handle: fh,
            lock_owner: None,
            bkuptime,
            chgtime,
            ctime,
        };
        match self.fs.set_attributes(NodeId(ino), &changes) {
            Ok(attr) => reply.attr(&self.attr_ttl, &attr_to_fuse(&attr)),
            Err(err) => reply.error(errno(&err)),
        }
    }

    fn mkdir(
        &mut self,
        req: &Request,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        reply: ReplyEntry,
    ) {
        let name = match component(name) {
            Ok(name) => name,
            Err(code) => return reply.error(code),
        };
        let result = self.fs.mkdir(NodeId(parent), name, mode & !umask, req.uid(), req.gid());
        self.reply_entry(result, reply);
    }

    fn create(
        &mut self,
        req: &Request,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        flags: i32,
        reply: ReplyCreate,
    ) {
        let name = match component(name) {
            Ok(name) => name,
            Err(code) => return reply.error(code),
        };
        match self.fs.create(NodeId(parent), name, mode & !umask, req.uid(), req.gid()) {
            Ok(attr) => reply.created(&self.entry_ttl, &attr_to_fuse(&attr), 0, 0, flags as u32),
            Err(err) => reply.error(errno(&err)),
        }
    }

    fn unlink(&mut self, _req: &Request, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let name = match component(name) {
            Ok(name) => name,
            Err(code) => return reply.error(code),
        };
        match self.fs.unlink(NodeId(parent), name) {
            Ok(()) => reply.ok(),
            Err(err) => reply.error(errno(&err)),
        }
    }

    fn rmdir(&mut self, _req: &Request, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let name = match component(name) {
            Ok(name) => name,
            Err(code) => return reply.error(code),
        };
        match self.fs.rmdir(NodeId(parent), name) {
            Ok(()) => reply.ok(),
            Err(err) => reply.error(errno(&err)),
        }
    }

    fn rename(
        &mut self,
        _req: &Request,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        flags: u32,
        reply: ReplyEmpty,
    ) {
        let (name, newname) = match (component(name), component(newname)) {
            (Ok(name), Ok(newname)) => (name, newname),
            (Err(code), _) | (_, Err(code)) => return reply.error(code),
        };
        if flags & libc::RENAME_EXCHANGE != 0 {
            return reply.error(EINVAL);
        }
        let (src, dst) = (NodeId(parent), NodeId(newparent));
        let result = if flags & libc::RENAME_NOREPLACE != 0 {
            self.fs.rename_noreplace(src, name, dst, newname)
        } else {
            self.fs.rename(src, name, dst, newname)
        };
        match result {
            Ok(()) => reply.ok(),
            Err(err) => reply.error(errno(&err)),
        }
    }

    fn open(&mut self, _req: &Request, ino: u64, _flags: i32, reply: ReplyOpen) {
        match self.fs.get_attributes(NodeId(ino)) {
            Ok(attr) if attr.is_dir() => reply.error(EISDIR),
            Ok(_) => reply.opened(0, 0),
            Err(err) => reply.error(errno(&err)),
        }
    }

    fn read(
        &mut self,
        _req: &Request,
        ino: u64,
        _fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        if offset < 0 {
            return reply.error(EINVAL);
        }
        match self.fs.read(NodeId(ino), offset as u64, size as usize) {
            Ok(data) => reply.data(&data),
            Err(err) => reply.error(errno(&err)),
        }
    }

    fn write(
        &mut self,
        _req: &Request,
        ino: u64,
        _fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        if offset < 0 {
            return reply.error(EINVAL);
        }
        match self.fs.write(NodeId(ino), offset as u64, data) {
            Ok(written) => reply.written(written as u32),
            Err(err) => reply.error(errno(&err)),
        }
    }

    fn flush(&mut self, _req: &Request, ino: u64, _fh: u64, _lock_owner: u64, reply: ReplyEmpty) {
        match self.fs.flush(NodeId(ino)) {
            Ok(()) => reply.ok(),
            Err(err) => reply.error(errno(&err)),
        }
    }

    fn release(
        &mut self,
        _req: &Request,
        ino: u64,
        _fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        match self.fs.flush(NodeId(ino)) {
            Ok(()) => reply.ok(),
            Err(err) => {
                warn!(ino, error = %err, "persisting node on release failed");
                reply.error(errno(&err))
            }
        }
    }

    fn fsync(&mut self, _req: &Request, ino: u64, _fh: u64, _datasync: bool, reply: ReplyEmpty) {
        match self.fs.fsync(NodeId(ino)) {
            Ok(()) => reply.ok(),
            Err(err) => reply.error(errno(&err)),
        }
    }

    fn opendir(&mut self, _req: &Request, ino: u64, _flags: i32, reply: ReplyOpen) {
        match self.fs.get_attributes(NodeId(ino)) {
            Ok(attr) if attr.is_dir() => reply.opened(0, 0),
            Ok(_) => reply.error(ENOTDIR),
            Err(err) => reply.error(errno(&err)),
        }
    }

    fn readdir(
        &mut self,
        _req: &Request,
        ino: u64,
        _fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        let listing = match self.fs.list(NodeId(ino)) {
            Ok(listing) => listing,
            Err(err) => return reply.error(errno(&err)),
        };

        let parent = match self.fs.parent_of(NodeId(ino)) {
            Ok(parent) => parent.as_u64(),
            Err(err) => return reply.error(errno(&err)),
        };
        let dots = [
            (ino, FileType::Directory, "."),
            (parent, FileType::Directory, ".."),
        ];
        let entries = dots.into_iter().chain(
            listing
                .iter()
                .map(|entry| (entry.ino.as_u64(), file_type(entry.kind), entry.name.as_str())),
        );
        for (i, (entry_ino, kind, name)) in entries.enumerate().skip(offset.max(0) as usize) {
            if reply.add(entry_ino, (i + 1) as i64, kind, name) {
                break;
            }
        }
        reply.ok();
    }

    fn releasedir(&mut self, _req: &Request, _ino: u64, _fh: u64, _flags: i32, reply: ReplyEmpty) {
        reply.ok();
    }

    fn fsyncdir(&mut self, _req: &Request, ino: u64, _fh: u64, _datasync: bool, reply: ReplyEmpty) {
        match self.fs.fsync(NodeId(ino)) {
            Ok(()) => reply.ok(),
            Err(err) => reply.error(errno(&err)),
        }
    }

    fn statfs(&mut self, _req: &Request, _ino: u64, reply: ReplyStatfs) {
        let stats = self.fs.stats();
        let used_blocks = stats.bytes.div_ceil(BLOCK_SIZE as u64);
        // The root is not part of the directory counter
        let used_files = stats.files + stats.directories + 1;
        reply.statfs(
            used_blocks + FREE_BLOCKS,
            FREE_BLOCKS,
            FREE_BLOCKS,
            used_files + FREE_FILES,
            FREE_FILES,
            BLOCK_SIZE,
            NAME_MAX as u32,
            BLOCK_SIZE,
        );
    }

    fn setxattr(
        &mut self,
        _req: &Request,
        ino: u64,
        name: &OsStr,
        value: &[u8],
        flags: i32,
        _position: u32,
        reply: ReplyEmpty,
    ) {
        let Some(name) = name.to_str() else {
            return reply.error(EINVAL);
        };
        match self
            .fs
            .set_extended_attribute_with(NodeId(ino), name, value, xattr_mode(flags))
        {
            Ok(()) => reply.ok(),
            Err(err) => reply.error(errno(&err)),
        }
    }

    fn getxattr(&mut self, _req: &Request, ino: u64, name: &OsStr, size: u32, reply: ReplyXattr) {
        let Some(name) = name.to_str() else {
            return reply.error(ENODATA);
        };
        match self.fs.get_extended_attribute(NodeId(ino), name) {
            Ok(value) => reply_xattr(&value, size, reply),
            Err(err) => reply.error(errno(&err)),
        }
    }

    fn listxattr(&mut self, _req: &Request, ino: u64, size: u32, reply: ReplyXattr) {
        match self.fs.list_extended_attributes(NodeId(ino)) {
            Ok(names) => {
                let mut buffer = Vec::new();
                for name in &names {
                    buffer.extend_from_slice(name.as_bytes());
                    buffer.push(0);
                }
                reply_xattr(&buffer, size, reply);
            }
            Err(err) => reply.error(errno(&err)),
        }
    }

    fn removexattr(&mut self, _req: &Request, ino: u64, name: &OsStr, reply: ReplyEmpty) {
        let Some(name) = name.to_str() else {
            return reply.error(ENODATA);
        };
        match self.fs.remove_extended_attribute(NodeId(ino), name) {
            Ok(()) => reply.ok(),
            Err(err) => reply.error(errno(&err)),
        }
    }

    fn access(&mut self, _req: &Request, ino: u64, mask: i32, reply: ReplyEmpty) {
        debug!(ino, mask, "access");
        match self.fs.access(NodeId(ino)) {
            Ok(()) => reply.ok(),
            Err(err) => reply.error(errno(&err)),
        }
    }
}
