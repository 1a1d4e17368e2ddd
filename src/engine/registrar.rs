//! First-writer-wins ownership claims.
//!
//! The registrar never reads before it writes. Every claim attempt is one
//! conditional insert on the claim store, and every caller, winner or not,
//! gets the durable binding back to compare locally.

use std::sync::Arc;

use crate::claim::{ClaimWrite, OwnershipClaim};
use crate::error::EngineResult;
use crate::storage::ClaimStore;
use crate::validation::InputLimits;

/// Owns the atomic claim primitive binding a primary key to a secondary key.
#[derive(Clone)]
pub struct OwnershipRegistrar {
    claims: Arc<dyn ClaimStore>,
    limits: InputLimits,
}

impl OwnershipRegistrar {
    /// Creates a registrar over the given claim store.
    #[must_use]
    pub fn new(claims: Arc<dyn ClaimStore>, limits: InputLimits) -> Self {
        Self { claims, limits }
    }

    /// Binds `primary_key` to `secondary_key` unless it is already bound, and
    /// returns whichever secondary key is durable.
    ///
    /// A mismatch is not an error; see [`super::ConflictDetector`].
    ///
    /// # Errors
    /// - `Validation` if either key is empty or malformed
    /// - `StorageUnavailable` if the claim store fails
    pub fn claim(&self, primary_key: &str, secondary_key: &str) -> EngineResult<String> {
        Ok(self.claim_write(primary_key, secondary_key)?.into_claim().secondary_key)
    }

    /// Same as [`OwnershipRegistrar::claim`], also reporting whether this call
    /// created the binding.
    pub fn claim_write(&self, primary_key: &str, secondary_key: &str) -> EngineResult<ClaimWrite> {
        let primary_key = self.limits.key("primary_key", primary_key)?;
        let secondary_key = self.limits.key("secondary_key", secondary_key)?;

        let write = self
            .claims
            .insert_if_absent(OwnershipClaim::new(primary_key, secondary_key))?;
        tracing::debug!(
            primary_key,
            secondary_key,
            bound = %write.claim().secondary_key,
            inserted = write.was_inserted(),
            "ownership claim"
        );
        Ok(write)
    }

    /// The durable claim for a primary key, if any. Pure read.
    pub fn owner_of(&self, primary_key: &str) -> EngineResult<Option<OwnershipClaim>> {
        let primary_key = self.limits.key("primary_key", primary_key)?;
        Ok(self.claims.get(primary_key)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{EngineError, ValidationError};
    use crate::storage::InMemoryClaimStore;

    fn registrar() -> OwnershipRegistrar {
        OwnershipRegistrar::new(Arc::new(InMemoryClaimStore::new()), InputLimits::default())
    }

    #[test]
    fn test_first_claim_binds() {
        let reg = registrar();
        assert_eq!(reg.claim("dept-1", "alice").unwrap(), "alice");
        assert_eq!(reg.claim("dept-1", "bob").unwrap(), "alice");
        assert_eq!(reg.claim("dept-1", "alice").unwrap(), "alice");
        assert_eq!(reg.owner_of("dept-1").unwrap().unwrap().secondary_key, "alice");
    }

    #[test]
    fn test_claim_write_reports_insertion() {
        let reg = registrar();
        assert!(reg.claim_write("p", "s").unwrap().was_inserted());
        assert!(!reg.claim_write("p", "s").unwrap().was_inserted());
    }

    #[test]
    fn test_keys_are_trimmed() {
        let reg = registrar();
        reg.claim(" p ", " s ").unwrap();
        assert_eq!(reg.owner_of("p").unwrap().unwrap().secondary_key, "s");
    }

    #[test]
    fn test_empty_keys_rejected_before_storage() {
        let reg = registrar();
        let err = reg.claim("", "s").unwrap_err();
        assert!(matches!(
            err,
            EngineError::Validation(ValidationError::EmptyKey { field: "primary_key" })
        ));
        let err = reg.claim("p", "  ").unwrap_err();
        assert!(err.is_validation());
        assert!(reg.owner_of("p").unwrap().is_none());
    }
}
