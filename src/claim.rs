//! Ownership claims binding a primary key to a secondary key.
//!
//! A claim is created on the first attempt for a given primary key and is never
//! rewritten afterwards. Later attempts observe the durable binding instead of
//! replacing it.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A durable, immutable-once-set binding from a primary key to a secondary key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OwnershipClaim {
    /// The primary identifier. Unique across all claims.
    pub primary_key: String,
    /// The secondary identifier bound at first claim.
    pub secondary_key: String,
    /// When the claim became durable.
    pub claimed_at: DateTime<Utc>,
}

impl OwnershipClaim {
    /// Creates a claim stamped with the current time.
    #[must_use]
    pub fn new(primary_key: impl Into<String>, secondary_key: impl Into<String>) -> Self {
        Self {
            primary_key: primary_key.into(),
            secondary_key: secondary_key.into(),
            claimed_at: Utc::now(),
        }
    }

    /// Returns true if this claim binds the given secondary key.
    #[must_use]
    pub fn is_bound_to(&self, secondary_key: &str) -> bool {
        self.secondary_key == secondary_key
    }
}

impl fmt::Display for OwnershipClaim {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.primary_key, self.secondary_key)
    }
}

/// Result of an atomic insert-if-absent on the claim store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClaimWrite {
    /// No claim existed; the candidate became durable.
    Inserted(OwnershipClaim),
    /// A claim already existed and was left untouched.
    Existing(OwnershipClaim),
}

impl ClaimWrite {
    /// The durable claim, whichever way the write went.
    #[must_use]
    pub fn claim(&self) -> &OwnershipClaim {
        match self {
            Self::Inserted(c) | Self::Existing(c) => c,
        }
    }

    /// Consumes the write and returns the durable claim.
    #[must_use]
    pub fn into_claim(self) -> OwnershipClaim {
        match self {
            Self::Inserted(c) | Self::Existing(c) => c,
        }
    }

    /// Returns true if this call created the claim.
    #[must_use]
    pub const fn was_inserted(&self) -> bool {
        matches!(self, Self::Inserted(_))
    }
}
