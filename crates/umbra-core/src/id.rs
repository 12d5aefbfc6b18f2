//! Strongly-typed identifiers for umbra entities.
//!
//! Identifiers are ULIDs: lexicographically sortable by creation time,
//! globally unique without coordination, and URL-safe.
//!
//! # Example
//!
//! ```rust
//! use umbra_core::id::PlanId;
//!
//! let id = PlanId::generate();
//! let parsed: PlanId = id.to_string().parse().unwrap();
//! assert_eq!(id, parsed);
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use ulid::Ulid;

use crate::error::{Error, Result};

/// A unique identifier for a migration plan.
///
/// A namespace holds at most one live plan at a time, but plans are
/// identified independently so that audit records and logs from an old
/// migration are never confused with a later one over the same namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PlanId(Ulid);

impl PlanId {
    /// Generates a new unique plan ID.
    #[must_use]
    pub fn generate() -> Self {
        Self(Ulid::new())
    }

    /// Creates a plan ID from a raw ULID.
    #[must_use]
    pub const fn from_ulid(ulid: Ulid) -> Self {
        Self(ulid)
    }

    /// Returns the underlying ULID.
    #[must_use]
    pub const fn as_ulid(&self) -> Ulid {
        self.0
    }

    /// Returns the creation timestamp encoded in the ID.
    #[must_use]
    pub fn created_at(&self) -> chrono::DateTime<chrono::Utc> {
        let ms = self.0.timestamp_ms();
        chrono::DateTime::from_timestamp_millis(ms as i64).unwrap_or_else(chrono::Utc::now)
    }
}

impl fmt::Display for PlanId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for PlanId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Ulid::from_string(s)
            .map(Self)
            .map_err(|e| Error::InvalidId {
                message: format!("invalid plan ID '{s}': {e}"),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plan_id_roundtrip() {
        let id = PlanId::generate();
        let s = id.to_string();
        let parsed: PlanId = s.parse().unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn plan_ids_are_unique() {
        let id1 = PlanId::generate();
        let id2 = PlanId::generate();
        assert_ne!(id1, id2);
    }

    #[test]
    fn invalid_id_returns_error() {
        let result: Result<PlanId> = "not-a-valid-ulid".parse();
        assert!(result.is_err());
    }
}
