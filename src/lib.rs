//! # claimfold
//!
//! Storage-level consistency for write streams that race and repeat.
//!
//! Two independent problems, one crate:
//!
//! - **Ownership**: a primary key is bound to the first secondary key that
//!   claims it. The claim is one atomic conditional insert that returns the
//!   durable binding to every caller, so concurrent writers can never both
//!   believe they won.
//! - **Deduplication**: multiple versioned records per entity are appended
//!   without coordination. A batch resolver later marks, in a constant number
//!   of bulk statements, every record that is superseded (by a processed
//!   record, or by a more recent sibling) and activates the survivor.
//!
//! ## Core Concepts
//!
//! - **`OwnershipClaim`**: the durable primary-key to secondary-key binding
//! - **`EventRecord`**: one versioned observation about an entity
//! - **`RecordStatus`**: `Unresolved`, `Active`, `Processed`, or `Ignored`
//! - **`ResolutionReport`**: what one resolver run changed
//!
//! ## Usage
//!
//! ```rust
//! use chrono::{Duration, Utc};
//! use claimfold::{ClaimfoldEngine, ResolveScope, Verdict};
//! use serde_json::json;
//!
//! # fn main() -> claimfold::EngineResult<()> {
//! let engine = ClaimfoldEngine::in_memory();
//!
//! assert_eq!(engine.accept("badge-7", "emp-1")?, Verdict::Accepted);
//! assert!(!engine.accept("badge-7", "emp-2")?.is_accepted());
//!
//! let now = Utc::now();
//! engine.ingest("emp-1", json!({"title": "engineer"}), now - Duration::days(1))?;
//! let latest = engine.ingest("emp-1", json!({"title": "manager"}), now)?;
//!
//! engine.resolve(&ResolveScope::All)?;
//! assert_eq!(engine.active_record("emp-1")?.map(|r| r.id), Some(latest));
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

// Core types
pub mod claim;
pub mod error;
pub mod record;
pub mod validation;

// Storage, configuration and the engine
pub mod config;
pub mod engine;
pub mod storage;

pub use claim::{ClaimWrite, OwnershipClaim};
pub use config::{EngineConfig, IsolationConfig, LimitsConfig, SchedulerConfig};
pub use engine::{
    BatchResolver, ClaimfoldEngine, ConflictDetector, OwnershipRegistrar, RecordIngestor,
    ResolutionReport, ResolverScheduler, StatusProjector, Submission, Verdict,
};
pub use error::{EngineError, EngineResult, ValidationError};
pub use record::{EventRecord, NewRecord, RecordId, RecordStatus};
pub use storage::{
    BulkOutcome, BulkUpdate, ClaimStore, InMemoryClaimStore, InMemoryRecordStore, PhantomReads,
    RecordStore, ResolveScope, StorageError,
};
pub use validation::InputLimits;
