// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Error types for kvfs core

use std::io;

/// Failure reported by a metadata store backend
#[derive(thiserror::Error, Debug)]
pub enum StoreError {
    #[error("key not found")]
    NotFound,
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("backend error: {0}")]
    Backend(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Core filesystem error type
#[derive(thiserror::Error, Debug)]
pub enum FsError {
    #[error("permission denied")]
    PermissionDenied,
    #[error("not found")]
    NotFound,
    #[error("already exists")]
    AlreadyExists,
    #[error("directory not empty")]
    DirectoryNotEmpty,
    #[error("rename destination is not a directory")]
    InvalidTarget,
    #[error("not a directory")]
    NotADirectory,
    #[error("is a directory")]
    IsADirectory,
    #[error("invalid argument")]
    InvalidArgument,
    #[error("no such extended attribute")]
    NoExtendedAttribute,
    #[error("file too large")]
    FileTooLarge,
    #[error("out of memory for file content")]
    NoSpace,
    #[error("metadata store: {0}")]
    Store(#[from] StoreError),
    #[error("record codec: {0}")]
    Codec(#[from] serde_json::Error),
}

pub type FsResult<T> = Result<T, FsError>;
