// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Fault-injecting metadata store for tests
//!
//! Wraps a real [`MetaStore`], counts calls per operation and fails them
//! according to a [`FailureBehavior`] policy.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::error::{StoreError, StoreResult};
use crate::metastore::MetaStore;

/// Custom predicate: receives (operation_name, call_count) and returns Some(error) to fail
pub type FaultPredicate = Arc<dyn Fn(&str, u64) -> Option<StoreError> + Send + Sync>;

pub type ErrorFn = Arc<dyn Fn() -> StoreError + Send + Sync>;

#[derive(Default)]
pub enum FailureBehavior {
    #[default]
    AlwaysSucceed,

    /// Fail every call to `op` after `count` successful ones
    FailAfter {
        op: &'static str,
        count: u64,
        error_fn: ErrorFn,
    },

    /// Fail the first `count` calls to `op`
    FailFor {
        op: &'static str,
        count: u64,
        error_fn: ErrorFn,
    },

    AlwaysFail {
        op: &'static str,
        error_fn: ErrorFn,
    },

    Custom(FaultPredicate),
}

pub struct FaultyMetaStore {
    inner: Arc<dyn MetaStore>,
    behavior: Mutex<FailureBehavior>,
    call_counts: Mutex<HashMap<String, AtomicU64>>,
}

impl FaultyMetaStore {
    /// Wrap `inner` without injecting any failures
    pub fn new(inner: Arc<dyn MetaStore>) -> Self {
        Self::with_behavior(inner, FailureBehavior::AlwaysSucceed)
    }

    pub fn with_behavior(inner: Arc<dyn MetaStore>, behavior: FailureBehavior) -> Self {
        Self {
            inner,
            behavior: Mutex::new(behavior),
            call_counts: Mutex::new(HashMap::new()),
        }
    }

    pub fn set_behavior(&self, behavior: FailureBehavior) {
        *self.behavior.lock().unwrap() = behavior;
    }

    pub fn call_count(&self, op: &str) -> u64 {
        self.call_counts
            .lock()
            .unwrap()
            .get(op)
            .map(|c| c.load(Ordering::SeqCst))
            .unwrap_or(0)
    }

    pub fn reset_counters(&self) {
        let counts = self.call_counts.lock().unwrap();
        for counter in counts.values() {
            counter.store(0, Ordering::SeqCst);
        }
    }

    fn check_fault(&self, op: &str) -> StoreResult<()> {
        let mut counts = self.call_counts.lock().unwrap();
        let counter = counts.entry(op.to_string()).or_insert_with(|| AtomicU64::new(0));
        let current = counter.fetch_add(1, Ordering::SeqCst);
        drop(counts);

        let behavior = self.behavior.lock().unwrap();
        let failure = match &*behavior {
            FailureBehavior::AlwaysSucceed => None,
            FailureBehavior::FailAfter {
                op: target,
                count,
                error_fn,
            } => (op == *target && current >= *count).then(|| error_fn()),
            FailureBehavior::FailFor {
                op: target,
                count,
                error_fn,
            } => (op == *target && current < *count).then(|| error_fn()),
            FailureBehavior::AlwaysFail {
                op: target,
                error_fn,
            } => (op == *target).then(|| error_fn()),
            FailureBehavior::Custom(predicate) => predicate(op, current),
        };
        match failure {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

impl MetaStore for FaultyMetaStore {
    fn put(&self, key: &str, value: &[u8]) -> StoreResult<()> {
        self.check_fault("put")?;
        self.inner.put(key, value)
    }

    fn get(&self, key: &str) -> StoreResult<Vec<u8>> {
        self.check_fault("get")?;
        self.inner.get(key)
    }

    fn delete(&self, key: &str) -> StoreResult<()> {
        self.check_fault("delete")?;
        self.inner.delete(key)
    }
}

pub fn put_failure() -> StoreError {
    StoreError::Backend("injected put failure".to_string())
}

pub fn read_failure() -> StoreError {
    StoreError::Io(std::io::Error::from_raw_os_error(libc::EIO))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metastore::InMemoryMetaStore;

    fn base() -> Arc<dyn MetaStore> {
        Arc::new(InMemoryMetaStore::new())
    }

    #[test]
    fn counts_every_operation() {
        let store = FaultyMetaStore::new(base());
        store.put("/a", b"1").unwrap();
        store.get("/a").unwrap();
        store.get("/b").unwrap_err();
        store.delete("/a").unwrap();

        assert_eq!(store.call_count("put"), 1);
        assert_eq!(store.call_count("get"), 2);
        assert_eq!(store.call_count("delete"), 1);

        store.reset_counters();
        assert_eq!(store.call_count("get"), 0);
    }

    #[test]
    fn fail_after_count() {
        let store = FaultyMetaStore::with_behavior(
            base(),
            FailureBehavior::FailAfter {
                op: "put",
                count: 2,
                error_fn: Arc::new(put_failure),
            },
        );
        assert!(store.put("/a", b"").is_ok());
        assert!(store.put("/b", b"").is_ok());
        assert!(matches!(store.put("/c", b""), Err(StoreError::Backend(_))));
        assert!(store.get("/c").is_err());
        assert_eq!(store.call_count("put"), 3);
    }

    #[test]
    fn fail_for_count_then_recover() {
        let store = FaultyMetaStore::with_behavior(
            base(),
            FailureBehavior::FailFor {
                op: "get",
                count: 1,
                error_fn: Arc::new(read_failure),
            },
        );
        store.put("/a", b"x").unwrap();
        assert!(matches!(store.get("/a"), Err(StoreError::Io(_))));
        assert_eq!(store.get("/a").unwrap(), b"x");
    }

    #[test]
    fn custom_predicate_and_runtime_change() {
        let store = FaultyMetaStore::with_behavior(
            base(),
            FailureBehavior::Custom(Arc::new(|op, count| {
                (op == "delete" && count % 2 == 1).then(put_failure)
            })),
        );
        assert!(store.delete("/a").is_ok());
        assert!(store.delete("/a").is_err());
        assert!(store.delete("/a").is_ok());

        store.set_behavior(FailureBehavior::AlwaysFail {
            op: "put",
            error_fn: Arc::new(put_failure),
        });
        assert!(store.put("/a", b"").is_err());
        assert!(store.delete("/a").is_ok());
    }
}
