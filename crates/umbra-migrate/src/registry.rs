//! Resolution of plan backend references to live backend handles.
//!
//! Plans persist [`BackendRef`] names, not connection details. At startup
//! the host registers every configured backend here once; the registry is
//! immutable afterwards, so lookups are lock-free map reads.

use std::collections::HashMap;
use std::sync::Arc;

use umbra_core::{BackendRef, KeyValueBackend};

use crate::error::{Error, Result};

/// Maps backend reference names to live backend handles.
#[derive(Default)]
pub struct BackendRegistry {
    backends: HashMap<String, Arc<dyn KeyValueBackend>>,
}

impl std::fmt::Debug for BackendRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendRegistry")
            .field("backends", &self.backends.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl BackendRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a backend under a reference name, replacing any previous
    /// registration of the same name.
    pub fn insert(&mut self, reference: impl Into<String>, backend: Arc<dyn KeyValueBackend>) {
        self.backends.insert(reference.into(), backend);
    }

    /// Registers a backend and returns the registry, for chained setup.
    #[must_use]
    pub fn with(
        mut self,
        reference: impl Into<String>,
        backend: Arc<dyn KeyValueBackend>,
    ) -> Self {
        self.insert(reference, backend);
        self
    }

    /// Resolves a plan reference to a live backend.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnknownBackend`] if nothing is registered under
    /// the reference.
    pub fn resolve(&self, reference: &BackendRef) -> Result<Arc<dyn KeyValueBackend>> {
        self.backends
            .get(reference.as_str())
            .map(Arc::clone)
            .ok_or_else(|| Error::UnknownBackend {
                reference: reference.as_str().to_string(),
            })
    }

    /// Returns true if a backend is registered under the reference.
    #[must_use]
    pub fn contains(&self, reference: &BackendRef) -> bool {
        self.backends.contains_key(reference.as_str())
    }
}
