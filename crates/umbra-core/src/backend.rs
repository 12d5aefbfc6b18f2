//! Key-value backend abstraction for migration sources and targets.
//!
//! This module defines the contract every storage engine must implement to
//! participate in a migration, whether as the current primary or as the
//! shadow target. The contract is deliberately small:
//!
//! - **Point operations**: `put`, `get`, `delete`, all scoped to a namespace
//! - **Resumable scans**: cursor-based pagination in a stable key order so a
//!   backfill can stop and pick up where it left off
//!
//! Every operation accepts a deadline. Adapters for real engines translate
//! it into whatever cancellation mechanism the engine offers; an operation
//! that cannot complete in time fails with [`Error::Transient`].
//!
//! Backends report failures through the shared [`Error`] taxonomy; the
//! distinction between [`Error::Transient`] and [`Error::Permanent`] is what
//! callers use to decide whether to retry.

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::ops::Bound;
use std::sync::{PoisonError, RwLock};
use std::time::Duration;

use crate::error::{Error, Result};
use crate::namespace::Namespace;

/// An opaque position token for resumable scans.
///
/// Cursors are issued by a backend and are only meaningful to the backend
/// that issued them. They serialize as plain strings so a backfill can
/// persist its position between process restarts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ScanCursor(String);

impl ScanCursor {
    /// Creates a cursor from a backend-issued token.
    #[must_use]
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    /// Returns the raw token.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ScanCursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A single key-value pair returned from a scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyValue {
    /// The key within its namespace.
    pub key: String,
    /// The stored value.
    pub value: Bytes,
}

/// One page of scan results.
#[derive(Debug, Clone)]
pub struct ScanPage {
    /// The items in this page, in the backend's stable key order.
    pub items: Vec<KeyValue>,
    /// Cursor to pass to the next `scan` call, or `None` when the
    /// namespace has been fully traversed.
    pub next: Option<ScanCursor>,
}

impl ScanPage {
    /// Returns true when this page marks the end of the scan.
    #[must_use]
    pub fn is_last(&self) -> bool {
        self.next.is_none()
    }
}

/// Storage engine contract for migration participants.
///
/// Implementations wrap a concrete engine (Redis, DynamoDB, Postgres, an
/// in-memory map) and normalize its failures into the shared [`Error`]
/// taxonomy. All operations are scoped to a [`Namespace`]; keys from
/// different namespaces never collide.
///
/// Scans must traverse keys in a stable total order so that a cursor taken
/// from one page resumes strictly after that page, even across process
/// restarts. Keys written after a scan position has passed them are not
/// guaranteed to be observed by that scan.
#[async_trait]
pub trait KeyValueBackend: Send + Sync + 'static {
    /// Returns a short stable name for this backend, used in logs and
    /// metric labels.
    fn name(&self) -> &str;

    /// Writes a value under a key.
    async fn put(
        &self,
        namespace: &Namespace,
        key: &str,
        value: Bytes,
        deadline: Duration,
    ) -> Result<()>;

    /// Reads the value under a key.
    ///
    /// Returns `Ok(None)` when the key does not exist; [`Error::NotFound`]
    /// is reserved for config-store record lookups.
    async fn get(&self, namespace: &Namespace, key: &str, deadline: Duration)
        -> Result<Option<Bytes>>;

    /// Deletes a key.
    ///
    /// Succeeds even if the key does not exist (idempotent).
    async fn delete(&self, namespace: &Namespace, key: &str, deadline: Duration) -> Result<()>;

    /// Reads up to `limit` items starting after `cursor`.
    ///
    /// Passing `None` starts from the beginning of the namespace. A page
    /// with `next: None` (including an empty page) means the scan is
    /// complete.
    async fn scan(
        &self,
        namespace: &Namespace,
        cursor: Option<&ScanCursor>,
        limit: usize,
        deadline: Duration,
    ) -> Result<ScanPage>;
}

impl fmt::Debug for dyn KeyValueBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyValueBackend")
            .field("name", &self.name())
            .finish()
    }
}

/// Converts a lock poison error to an internal error.
fn poison_err<T>(_: PoisonError<T>) -> Error {
    Error::internal("backend lock poisoned")
}

/// In-memory key-value backend for testing.
///
/// Thread-safe via `RwLock`. Keys are held in a `BTreeMap` per namespace so
/// scans traverse in lexicographic key order, which makes cursors stable
/// across calls. The cursor token is simply the last key returned.
/// Operations complete immediately, so deadlines are accepted and ignored.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    name: String,
    namespaces: RwLock<HashMap<Namespace, BTreeMap<String, Bytes>>>,
}

impl MemoryBackend {
    /// Creates a new empty memory backend with the given name.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespaces: RwLock::new(HashMap::new()),
        }
    }

    /// Returns the number of keys stored in a namespace.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn key_count(&self, namespace: &Namespace) -> Result<usize> {
        let namespaces = self.namespaces.read().map_err(poison_err)?;
        Ok(namespaces.get(namespace).map_or(0, BTreeMap::len))
    }

    /// Returns a snapshot of all keys and values in a namespace, in key
    /// order. Intended for test assertions.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn dump(&self, namespace: &Namespace) -> Result<Vec<KeyValue>> {
        let namespaces = self.namespaces.read().map_err(poison_err)?;
        Ok(namespaces.get(namespace).map_or_else(Vec::new, |keys| {
            keys.iter()
                .map(|(key, value)| KeyValue {
                    key: key.clone(),
                    value: value.clone(),
                })
                .collect()
        }))
    }
}

#[async_trait]
impl KeyValueBackend for MemoryBackend {
    fn name(&self) -> &str {
        &self.name
    }

    async fn put(
        &self,
        namespace: &Namespace,
        key: &str,
        value: Bytes,
        _deadline: Duration,
    ) -> Result<()> {
        let mut namespaces = self.namespaces.write().map_err(poison_err)?;
        namespaces
            .entry(namespace.clone())
            .or_default()
            .insert(key.to_string(), value);
        Ok(())
    }

    async fn get(
        &self,
        namespace: &Namespace,
        key: &str,
        _deadline: Duration,
    ) -> Result<Option<Bytes>> {
        let namespaces = self.namespaces.read().map_err(poison_err)?;
        Ok(namespaces
            .get(namespace)
            .and_then(|keys| keys.get(key).cloned()))
    }

    async fn delete(&self, namespace: &Namespace, key: &str, _deadline: Duration) -> Result<()> {
        let mut namespaces = self.namespaces.write().map_err(poison_err)?;
        if let Some(keys) = namespaces.get_mut(namespace) {
            keys.remove(key);
        }
        Ok(())
    }

    async fn scan(
        &self,
        namespace: &Namespace,
        cursor: Option<&ScanCursor>,
        limit: usize,
        _deadline: Duration,
    ) -> Result<ScanPage> {
        let namespaces = self.namespaces.read().map_err(poison_err)?;
        let Some(keys) = namespaces.get(namespace) else {
            return Ok(ScanPage {
                items: Vec::new(),
                next: None,
            });
        };

        let start = match cursor {
            Some(c) => Bound::Excluded(c.as_str().to_string()),
            None => Bound::Unbounded,
        };

        let items: Vec<KeyValue> = keys
            .range((start, Bound::Unbounded))
            .take(limit)
            .map(|(key, value)| KeyValue {
                key: key.clone(),
                value: value.clone(),
            })
            .collect();

        // A full page may have landed exactly on the last key; the next
        // call will return an empty final page in that case.
        let next = if items.len() < limit {
            None
        } else {
            items.last().map(|kv| ScanCursor::new(kv.key.clone()))
        };

        Ok(ScanPage { items, next })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DEADLINE: Duration = Duration::from_secs(1);

    fn ns(s: &str) -> Namespace {
        Namespace::new(s).unwrap()
    }

    #[tokio::test]
    async fn put_get_delete_roundtrip() {
        let backend = MemoryBackend::new("mem");
        let orders = ns("orders");

        backend
            .put(&orders, "k1", Bytes::from_static(b"v1"), DEADLINE)
            .await
            .unwrap();
        assert_eq!(
            backend.get(&orders, "k1", DEADLINE).await.unwrap(),
            Some(Bytes::from_static(b"v1"))
        );

        backend.delete(&orders, "k1", DEADLINE).await.unwrap();
        assert_eq!(backend.get(&orders, "k1", DEADLINE).await.unwrap(), None);

        // Deleting a missing key is not an error.
        backend.delete(&orders, "k1", DEADLINE).await.unwrap();
    }

    #[tokio::test]
    async fn namespaces_are_isolated() {
        let backend = MemoryBackend::new("mem");
        backend
            .put(&ns("orders"), "k", Bytes::from_static(b"order"), DEADLINE)
            .await
            .unwrap();
        backend
            .put(&ns("users"), "k", Bytes::from_static(b"user"), DEADLINE)
            .await
            .unwrap();

        assert_eq!(
            backend.get(&ns("orders"), "k", DEADLINE).await.unwrap(),
            Some(Bytes::from_static(b"order"))
        );
        assert_eq!(
            backend.get(&ns("users"), "k", DEADLINE).await.unwrap(),
            Some(Bytes::from_static(b"user"))
        );
    }

    #[tokio::test]
    async fn scan_pages_in_key_order() {
        let backend = MemoryBackend::new("mem");
        let orders = ns("orders");
        for i in 0..10 {
            backend
                .put(
                    &orders,
                    &format!("key-{i:03}"),
                    Bytes::from(format!("v{i}")),
                    DEADLINE,
                )
                .await
                .unwrap();
        }

        let mut seen = Vec::new();
        let mut cursor = None;
        loop {
            let page = backend
                .scan(&orders, cursor.as_ref(), 3, DEADLINE)
                .await
                .unwrap();
            seen.extend(page.items.iter().map(|kv| kv.key.clone()));
            match page.next {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }

        let expected: Vec<String> = (0..10).map(|i| format!("key-{i:03}")).collect();
        assert_eq!(seen, expected);
    }

    #[tokio::test]
    async fn scan_resumes_strictly_after_cursor() {
        let backend = MemoryBackend::new("mem");
        let orders = ns("orders");
        for key in ["a", "b", "c"] {
            backend
                .put(&orders, key, Bytes::from_static(b"x"), DEADLINE)
                .await
                .unwrap();
        }

        let first = backend.scan(&orders, None, 2, DEADLINE).await.unwrap();
        assert_eq!(first.items.len(), 2);
        let cursor = first.next.unwrap();
        assert_eq!(cursor.as_str(), "b");

        let second = backend
            .scan(&orders, Some(&cursor), 2, DEADLINE)
            .await
            .unwrap();
        let keys: Vec<&str> = second.items.iter().map(|kv| kv.key.as_str()).collect();
        assert_eq!(keys, vec!["c"]);
        assert!(second.is_last());
    }

    #[tokio::test]
    async fn scan_of_empty_namespace_is_complete() {
        let backend = MemoryBackend::new("mem");
        let page = backend.scan(&ns("empty"), None, 100, DEADLINE).await.unwrap();
        assert!(page.items.is_empty());
        assert!(page.is_last());
    }

    #[tokio::test]
    async fn full_final_page_yields_one_empty_follow_up() {
        let backend = MemoryBackend::new("mem");
        let orders = ns("orders");
        for key in ["a", "b"] {
            backend
                .put(&orders, key, Bytes::from_static(b"x"), DEADLINE)
                .await
                .unwrap();
        }

        let first = backend.scan(&orders, None, 2, DEADLINE).await.unwrap();
        assert_eq!(first.items.len(), 2);
        let cursor = first.next.expect("full page keeps the scan open");

        let second = backend
            .scan(&orders, Some(&cursor), 2, DEADLINE)
            .await
            .unwrap();
        assert!(second.items.is_empty());
        assert!(second.is_last());
    }
}
