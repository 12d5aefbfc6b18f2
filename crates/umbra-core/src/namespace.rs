//! Namespace identification for migrated datasets.
//!
//! A namespace names one logical dataset (for example `user-profiles` or
//! `session_tokens`). Every migration plan, key-value operation, and metric
//! window is scoped to exactly one namespace, and migrations for different
//! namespaces never interact.
//!
//! # Example
//!
//! ```rust
//! use umbra_core::namespace::Namespace;
//!
//! let ns = Namespace::new("user-profiles").unwrap();
//! assert_eq!(ns.as_str(), "user-profiles");
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{Error, Result};

/// A unique identifier for a logical dataset under migration.
///
/// Namespaces must be:
/// - Non-empty
/// - Lowercase alphanumeric with hyphens and underscores
/// - At most 128 characters
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Namespace(String);

impl Namespace {
    /// Creates a new namespace after validating the format.
    ///
    /// # Errors
    ///
    /// Returns an error if the namespace is invalid.
    pub fn new(ns: impl Into<String>) -> Result<Self> {
        let ns = ns.into();
        Self::validate(&ns)?;
        Ok(Self(ns))
    }

    /// Creates a namespace without validation.
    ///
    /// Intended for values that have already been validated, such as
    /// namespaces read back from the config store.
    #[must_use]
    pub fn new_unchecked(ns: impl Into<String>) -> Self {
        Self(ns.into())
    }

    /// Returns the namespace as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Validates a namespace string.
    fn validate(ns: &str) -> Result<()> {
        if ns.is_empty() {
            return Err(Error::InvalidNamespace {
                message: "namespace cannot be empty".to_string(),
            });
        }

        if ns.len() > 128 {
            return Err(Error::InvalidNamespace {
                message: format!("namespace '{ns}' is too long (maximum 128 characters)"),
            });
        }

        if !ns
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '_')
        {
            return Err(Error::InvalidNamespace {
                message: format!(
                    "namespace '{ns}' contains invalid characters (only lowercase letters, digits, hyphens, and underscores allowed)"
                ),
            });
        }

        if ns.starts_with('-') || ns.ends_with('-') {
            return Err(Error::InvalidNamespace {
                message: format!("namespace '{ns}' cannot start or end with a hyphen"),
            });
        }

        Ok(())
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for Namespace {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
