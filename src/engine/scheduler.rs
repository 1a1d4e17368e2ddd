//! Periodic background resolution.
//!
//! One thread wakes on a ticker (or an explicit trigger), lists unsettled
//! entities in chunks, and resolves each chunk. Failed runs are logged and
//! left for the next tick; resolution is idempotent, so nothing is lost.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{bounded, select, tick, Receiver, Sender, TryRecvError};

use crate::config::SchedulerConfig;
use crate::error::{EngineError, EngineResult};
use crate::storage::{PhantomReads, RecordStore};

use super::resolver::BatchResolver;

/// Totals for one tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickSummary {
    /// Chunks resolved.
    pub chunks: usize,
    /// Entities passed to the resolver.
    pub entities: usize,
    /// Records ignored across all chunks.
    pub ignored: u64,
    /// Records activated across all chunks.
    pub activated: u64,
}

impl TickSummary {
    /// Returns true if the tick mutated at least one record.
    #[must_use]
    pub const fn mutated(&self) -> bool {
        self.ignored > 0 || self.activated > 0
    }
}

struct Worker {
    resolver: BatchResolver,
    records: Arc<dyn RecordStore>,
    config: SchedulerConfig,
    ticks: Arc<AtomicU64>,
}

impl Worker {
    fn run(self, ticker: Receiver<std::time::Instant>, trigger: Receiver<()>, shutdown: Receiver<()>) {
        let mut immediate = false;
        loop {
            if immediate {
                if !matches!(shutdown.try_recv(), Err(TryRecvError::Empty)) {
                    break;
                }
            } else {
                select! {
                    recv(shutdown) -> _ => break,
                    recv(ticker) -> _ => {},
                    recv(trigger) -> _ => {},
                }
            }

            let summary = self.tick();
            self.ticks.fetch_add(1, Ordering::SeqCst);

            // Rows committed while a batch ran may have been missed; go again.
            immediate =
                summary.mutated() && self.resolver.phantom_reads() == PhantomReads::Possible;
        }
        tracing::debug!("resolver scheduler stopped");
    }

    fn tick(&self) -> TickSummary {
        let mut summary = TickSummary::default();
        for _ in 0..self.config.max_chunks_per_tick {
            let pending = match self.records.unsettled_entities(self.config.chunk_size) {
                Ok(pending) => pending,
                Err(err) => {
                    tracing::error!(error = %err, "listing unsettled entities failed");
                    break;
                }
            };
            if pending.is_empty() {
                break;
            }
            let full_chunk = pending.len() >= self.config.chunk_size;
            let entities = pending.len();

            match self.resolver.resolve_entities(pending) {
                Ok(report) => {
                    summary.chunks += 1;
                    summary.entities += entities;
                    summary.ignored += report.ignored_count;
                    summary.activated += report.activated_count;
                }
                Err(err) => {
                    tracing::error!(error = %err, entities, "scheduled resolution failed");
                    break;
                }
            }
            if !full_chunk {
                break;
            }
        }
        if summary.chunks > 0 {
            tracing::debug!(
                chunks = summary.chunks,
                entities = summary.entities,
                ignored = summary.ignored,
                activated = summary.activated,
                "scheduled tick finished"
            );
        }
        summary
    }
}

/// Runs the batch resolver on a fixed interval in a background thread.
///
/// Dropping the scheduler stops and joins the thread.
pub struct ResolverScheduler {
    trigger: Sender<()>,
    shutdown: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
    ticks: Arc<AtomicU64>,
}

impl ResolverScheduler {
    /// Starts the background thread.
    ///
    /// # Errors
    /// - `Config` if the scheduler settings are zero-valued
    /// - `Internal` if the thread cannot be spawned
    pub fn start(
        resolver: BatchResolver,
        records: Arc<dyn RecordStore>,
        config: SchedulerConfig,
    ) -> EngineResult<Self> {
        if config.interval_ms == 0 || config.chunk_size == 0 || config.max_chunks_per_tick == 0 {
            return Err(EngineError::config("scheduler settings must be non-zero"));
        }

        let (trigger_tx, trigger_rx) = bounded::<()>(1);
        let (shutdown_tx, shutdown_rx) = bounded::<()>(0);
        let ticker = tick(config.interval());
        let ticks = Arc::new(AtomicU64::new(0));

        let worker = Worker {
            resolver,
            records,
            config,
            ticks: Arc::clone(&ticks),
        };
        let handle = thread::Builder::new()
            .name("claimfold-resolver".to_string())
            .spawn(move || worker.run(ticker, trigger_rx, shutdown_rx))
            .map_err(|e| EngineError::internal(format!("failed to spawn resolver thread: {e}")))?;

        tracing::debug!(interval_ms = config.interval_ms, "resolver scheduler started");
        Ok(Self {
            trigger: trigger_tx,
            shutdown: Some(shutdown_tx),
            handle: Some(handle),
            ticks,
        })
    }

    /// Requests a tick now instead of waiting for the interval.
    ///
    /// Coalesces with a trigger that is already pending.
    pub fn trigger(&self) {
        let _ = self.trigger.try_send(());
    }

    /// Number of ticks completed so far.
    #[must_use]
    pub fn completed_ticks(&self) -> u64 {
        self.ticks.load(Ordering::SeqCst)
    }

    /// Stops the thread after its current tick and waits for it.
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        // Disconnecting the channel wakes the select.
        drop(self.shutdown.take());
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                tracing::error!("resolver scheduler thread panicked");
            }
        }
    }
}

impl Drop for ResolverScheduler {
    fn drop(&mut self) {
        self.stop();
    }
}
