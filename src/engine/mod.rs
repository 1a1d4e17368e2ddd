//! The claimfold engine.
//!
//! Five components, each a thin policy layer over the storage traits:
//!
//! - [`OwnershipRegistrar`]: atomic first-writer-wins claims
//! - [`ConflictDetector`]: turns a claim result into a verdict
//! - [`RecordIngestor`]: append-only record intake
//! - [`BatchResolver`]: set-based resolution of competing records
//! - [`StatusProjector`]: reads the resolved state
//!
//! [`ClaimfoldEngine`] wires them over one claim store and one record store.

mod detector;
mod ingest;
mod projector;
mod registrar;
mod resolver;

/// Periodic background resolution.
pub mod scheduler;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::config::EngineConfig;
use crate::error::EngineResult;
use crate::record::{EventRecord, RecordId};
use crate::storage::{
    ClaimStore, InMemoryClaimStore, InMemoryRecordStore, RecordStore, ResolveScope,
};
use crate::validation::InputLimits;

pub use detector::{ConflictDetector, Verdict};
pub use ingest::RecordIngestor;
pub use projector::StatusProjector;
pub use registrar::OwnershipRegistrar;
pub use resolver::{BatchResolver, ResolutionReport, RESOLUTION_PASSES};
pub use scheduler::{ResolverScheduler, TickSummary};

/// Result of [`ClaimfoldEngine::submit`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Submission {
    /// Ownership verdict for the primary key.
    pub verdict: Verdict,
    /// The appended record. Present for rejected attempts too, so they stay
    /// auditable; a rejected record never becomes authoritative on its own
    /// merit, it only competes in resolution like any other record.
    pub record_id: RecordId,
}

/// Facade over the ownership and resolution components.
#[derive(Clone)]
pub struct ClaimfoldEngine {
    config: EngineConfig,
    records: Arc<dyn RecordStore>,
    detector: ConflictDetector,
    ingestor: RecordIngestor,
    resolver: BatchResolver,
    projector: StatusProjector,
}

impl ClaimfoldEngine {
    /// Create an engine with default configuration over the given stores.
    #[must_use]
    pub fn new(claims: Arc<dyn ClaimStore>, records: Arc<dyn RecordStore>) -> Self {
        Self::with_config(claims, records, EngineConfig::default())
    }

    /// Create an engine over the given stores.
    #[must_use]
    pub fn with_config(
        claims: Arc<dyn ClaimStore>,
        records: Arc<dyn RecordStore>,
        config: EngineConfig,
    ) -> Self {
        let limits = InputLimits::from(config.limits);
        let registrar = OwnershipRegistrar::new(claims, limits);
        Self {
            detector: ConflictDetector::new(registrar),
            ingestor: RecordIngestor::new(Arc::clone(&records), limits),
            resolver: BatchResolver::new(
                Arc::clone(&records),
                limits,
                config.isolation.phantom_reads,
            ),
            projector: StatusProjector::new(Arc::clone(&records), limits),
            records,
            config,
        }
    }

    /// Create an engine backed by fresh in-memory stores.
    #[must_use]
    pub fn in_memory() -> Self {
        Self::new(
            Arc::new(InMemoryClaimStore::new()),
            Arc::new(InMemoryRecordStore::new()),
        )
    }

    /// The configuration this engine was built with.
    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// See [`OwnershipRegistrar::claim`].
    pub fn claim(&self, primary_key: &str, secondary_key: &str) -> EngineResult<String> {
        self.detector.registrar().claim(primary_key, secondary_key)
    }

    /// See [`ConflictDetector::accept`].
    pub fn accept(&self, primary_key: &str, secondary_key: &str) -> EngineResult<Verdict> {
        self.detector.accept(primary_key, secondary_key)
    }

    /// See [`RecordIngestor::ingest`].
    pub fn ingest(
        &self,
        entity_key: &str,
        payload: serde_json::Value,
        observed_at: DateTime<Utc>,
    ) -> EngineResult<RecordId> {
        self.ingestor.ingest(entity_key, payload, observed_at)
    }

    /// See [`RecordIngestor::ingest_processed`].
    pub fn ingest_processed(
        &self,
        entity_key: &str,
        payload: serde_json::Value,
        observed_at: DateTime<Utc>,
    ) -> EngineResult<RecordId> {
        self.ingestor
            .ingest_processed(entity_key, payload, observed_at)
    }

    /// Checks ownership of `primary_key` and appends the record for
    /// `entity_key` in one call.
    ///
    /// The record is appended whatever the verdict. Validation of every input
    /// happens before the claim, so an invalid payload never leaves a claim
    /// behind.
    pub fn submit(
        &self,
        primary_key: &str,
        secondary_key: &str,
        entity_key: &str,
        payload: serde_json::Value,
        observed_at: DateTime<Utc>,
    ) -> EngineResult<Submission> {
        let limits = InputLimits::from(self.config.limits);
        limits.key("entity_key", entity_key)?;
        limits.payload(&payload)?;
        limits.timestamp("observed_at", observed_at)?;

        let verdict = self.detector.accept(primary_key, secondary_key)?;
        let record_id = self.ingestor.ingest(entity_key, payload, observed_at)?;
        Ok(Submission { verdict, record_id })
    }

    /// See [`BatchResolver::resolve`].
    pub fn resolve(&self, scope: &ResolveScope) -> EngineResult<ResolutionReport> {
        self.resolver.resolve(scope)
    }

    /// See [`StatusProjector::active_record`].
    pub fn active_record(&self, entity_key: &str) -> EngineResult<Option<EventRecord>> {
        self.projector.active_record(entity_key)
    }

    /// See [`StatusProjector::history`].
    pub fn history(&self, entity_key: &str) -> EngineResult<Vec<EventRecord>> {
        self.projector.history(entity_key)
    }

    /// See [`StatusProjector::pending_entities`].
    pub fn pending_entities(&self, limit: usize) -> EngineResult<Vec<String>> {
        self.projector.pending_entities(limit)
    }

    /// Start periodic resolution using this engine's scheduler settings.
    pub fn start_scheduler(&self) -> EngineResult<ResolverScheduler> {
        ResolverScheduler::start(
            self.resolver.clone(),
            Arc::clone(&self.records),
            self.config.scheduler,
        )
    }

    /// The ownership registrar.
    #[must_use]
    pub fn registrar(&self) -> &OwnershipRegistrar {
        self.detector.registrar()
    }

    /// The batch resolver.
    #[must_use]
    pub fn resolver(&self) -> &BatchResolver {
        &self.resolver
    }
}
