//! Shadow backend health probe.
//!
//! The orchestrator itself never talks to backends; before arming shadow
//! writes it asks a [`ShadowProbe`] whether the target looks healthy. The
//! default implementation round-trips a single marker key through the
//! backend and cleans up after itself.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tracing::debug;
use ulid::Ulid;

use umbra_core::{BackendRef, Namespace};

use crate::error::{Error, Result};
use crate::registry::BackendRegistry;

/// Prefix for probe marker keys; ordinary data never starts with it.
const PROBE_KEY_PREFIX: &str = "__umbra_probe__";

/// Health check consulted before a namespace starts mirroring writes.
#[async_trait]
pub trait ShadowProbe: Send + Sync + 'static {
    /// Returns `Ok` when the referenced backend can serve the namespace.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ProbeFailed`] describing what went wrong.
    async fn check(&self, namespace: &Namespace, backend: &BackendRef) -> Result<()>;
}

/// Probe that writes, reads back, and deletes a marker key.
pub struct BackendProbe {
    registry: Arc<BackendRegistry>,
    op_timeout: Duration,
}

impl std::fmt::Debug for BackendProbe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendProbe")
            .field("op_timeout", &self.op_timeout)
            .finish_non_exhaustive()
    }
}

impl BackendProbe {
    /// Creates a probe resolving backends through the given registry.
    #[must_use]
    pub fn new(registry: Arc<BackendRegistry>, op_timeout: Duration) -> Self {
        Self {
            registry,
            op_timeout,
        }
    }
}

#[async_trait]
impl ShadowProbe for BackendProbe {
    async fn check(&self, namespace: &Namespace, backend: &BackendRef) -> Result<()> {
        let target = self
            .registry
            .resolve(backend)
            .map_err(|err| Error::probe_failed(namespace, err.to_string()))?;

        let key = format!("{PROBE_KEY_PREFIX}{}", Ulid::new());
        let value = Bytes::from_static(b"probe");

        target
            .put(namespace, &key, value.clone(), self.op_timeout)
            .await
            .map_err(|err| Error::probe_failed(namespace, format!("put: {err}")))?;

        let read = target
            .get(namespace, &key, self.op_timeout)
            .await
            .map_err(|err| Error::probe_failed(namespace, format!("get: {err}")))?;

        if let Err(err) = target.delete(namespace, &key, self.op_timeout).await {
            debug!(
                namespace = %namespace,
                backend = %backend,
                error = %err,
                "probe marker cleanup failed"
            );
        }

        if read.as_ref() == Some(&value) {
            Ok(())
        } else {
            Err(Error::probe_failed(
                namespace,
                "marker readback did not return the written value",
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use umbra_core::{KeyValueBackend, MemoryBackend, ScanCursor, ScanPage};

    fn ns() -> Namespace {
        Namespace::new("orders").unwrap()
    }

    #[tokio::test]
    async fn healthy_backend_passes_and_leaves_no_marker() {
        let backend = Arc::new(MemoryBackend::new("shadow"));
        let mut registry = BackendRegistry::new();
        registry.insert("shadow", Arc::clone(&backend) as Arc<dyn KeyValueBackend>);
        let probe = BackendProbe::new(Arc::new(registry), Duration::from_secs(1));

        probe.check(&ns(), &BackendRef::new("shadow")).await.unwrap();
        assert_eq!(backend.key_count(&ns()).unwrap(), 0);
    }

    #[tokio::test]
    async fn unknown_backend_fails_the_probe() {
        let probe = BackendProbe::new(Arc::new(BackendRegistry::new()), Duration::from_secs(1));
        let err = probe
            .check(&ns(), &BackendRef::new("missing"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ProbeFailed { .. }));
    }

    /// Backend that accepts writes but always reads back nothing.
    struct BlackHole;

    #[async_trait]
    impl KeyValueBackend for BlackHole {
        fn name(&self) -> &str {
            "black-hole"
        }

        async fn put(
            &self,
            _namespace: &Namespace,
            _key: &str,
            _value: Bytes,
            _deadline: Duration,
        ) -> umbra_core::Result<()> {
            Ok(())
        }

        async fn get(
            &self,
            _namespace: &Namespace,
            _key: &str,
            _deadline: Duration,
        ) -> umbra_core::Result<Option<Bytes>> {
            Ok(None)
        }

        async fn delete(
            &self,
            _namespace: &Namespace,
            _key: &str,
            _deadline: Duration,
        ) -> umbra_core::Result<()> {
            Ok(())
        }

        async fn scan(
            &self,
            _namespace: &Namespace,
            _cursor: Option<&ScanCursor>,
            _limit: usize,
            _deadline: Duration,
        ) -> umbra_core::Result<ScanPage> {
            Ok(ScanPage {
                items: Vec::new(),
                next: None,
            })
        }
    }

    #[tokio::test]
    async fn lost_readback_fails_the_probe() {
        let mut registry = BackendRegistry::new();
        registry.insert("shadow", Arc::new(BlackHole) as Arc<dyn KeyValueBackend>);
        let probe = BackendProbe::new(Arc::new(registry), Duration::from_secs(1));

        let err = probe
            .check(&ns(), &BackendRef::new("shadow"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("readback"));
    }
}
