//! Accept or reject a write attempt against the ownership registry.

use std::fmt;

use serde::Serialize;

use crate::error::EngineResult;

use super::registrar::OwnershipRegistrar;

/// Outcome of an ownership check. A rejection is a business result, not an error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "verdict", rename_all = "snake_case")]
pub enum Verdict {
    /// The caller's secondary key is (now) the durable one.
    Accepted,
    /// The primary key is owned by a different secondary key.
    Rejected {
        /// The secondary key that owns the primary key.
        owned_secondary_key: String,
    },
}

impl Verdict {
    /// Returns true for `Accepted`.
    #[must_use]
    pub const fn is_accepted(&self) -> bool {
        matches!(self, Self::Accepted)
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Accepted => write!(f, "accepted"),
            Self::Rejected {
                owned_secondary_key,
            } => write!(f, "rejected(owned by {owned_secondary_key})"),
        }
    }
}

/// Compares the durable binding returned by the registrar with the caller's
/// key. There is no separate existence check, so two concurrent writers can
/// never both be told they were first.
#[derive(Clone)]
pub struct ConflictDetector {
    registrar: OwnershipRegistrar,
}

impl ConflictDetector {
    /// Creates a detector backed by the registrar.
    #[must_use]
    pub fn new(registrar: OwnershipRegistrar) -> Self {
        Self { registrar }
    }

    /// Claims `primary_key` for `secondary_key` and classifies the result.
    pub fn accept(&self, primary_key: &str, secondary_key: &str) -> EngineResult<Verdict> {
        let bound = self.registrar.claim(primary_key, secondary_key)?;
        if bound == secondary_key.trim() {
            return Ok(Verdict::Accepted);
        }

        tracing::warn!(
            primary_key = primary_key.trim(),
            attempted = secondary_key.trim(),
            owned_by = %bound,
            "ownership conflict"
        );
        Ok(Verdict::Rejected {
            owned_secondary_key: bound,
        })
    }

    /// The registrar this detector consults.
    #[must_use]
    pub fn registrar(&self) -> &OwnershipRegistrar {
        &self.registrar
    }
}
