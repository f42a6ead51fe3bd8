//! Resumable, batched reconciliation of scraped offers into the merged store.
//!
//! Each batch fetches source candidates past the checkpoint cursor, splits
//! them into already-present, merge-target and new offers, imports the new
//! ones with their duplicate records, merges version histories for the
//! merge-targets and only then advances the checkpoint.

pub mod config;
pub mod duplicates;
pub mod history;
pub mod identity;

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use realist_core::{MigrationState, NaturalKey, OfferIdentity};
use realist_storage::{BackoffPolicy, CheckpointStore, OfferStore, StoreError};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

pub use config::{ReconcileConfig, ReconcileInput};
pub use duplicates::DuplicateResolution;
pub use history::{merge_offer_versions, MergeDecision};
pub use identity::{classify_candidates, IdentityPartition, MergeTarget};

pub const CRATE_NAME: &str = "realist-reconcile";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreSide {
    Source,
    Destination,
}

impl fmt::Display for StoreSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Source => f.write_str("source"),
            Self::Destination => f.write_str("destination"),
        }
    }
}

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("natural key {key} is shared by offers {ids:?}")]
    NaturalKeyConflict { key: NaturalKey, ids: Vec<String> },
    #[error("{side} offer {id} disappeared during the batch")]
    MissingDocument { side: StoreSide, id: String },
    #[error("merge worker failed: {0}")]
    Worker(String),
}

impl ReconcileError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Store(err) if err.is_retryable())
    }
}

#[derive(Debug, Clone)]
pub struct ReconcileOptions {
    pub batch_size: usize,
    pub merge_concurrency: usize,
    pub backoff: BackoffPolicy,
}

impl Default for ReconcileOptions {
    fn default() -> Self {
        Self {
            batch_size: config::DEFAULT_BATCH_SIZE,
            merge_concurrency: config::DEFAULT_MERGE_CONCURRENCY,
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CursorSeed {
    pub from_id: Option<String>,
    pub processed_offers: Option<u64>,
}

/// Result of one fully applied batch, folded into the next checkpoint.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BatchOutcome {
    pub last_id: String,
    pub candidates: usize,
    pub already_present: usize,
    pub inserted_offers: usize,
    pub inserted_duplicates: usize,
    pub merged: usize,
    pub already_merged: usize,
    pub offers_with_multiple_duplicates: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunEnd {
    Exhausted,
    Interrupted,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub batches: usize,
    pub processed_offers: usize,
    pub already_present: usize,
    pub inserted_offers: usize,
    pub inserted_duplicates: usize,
    pub merged_offers: usize,
    pub already_merged: usize,
    pub end: RunEnd,
    pub state: MigrationState,
}

#[derive(Debug, Default)]
struct ImportOutcome {
    inserted_offers: usize,
    inserted_duplicates: usize,
    offers_with_multiple_duplicates: Vec<String>,
}

#[derive(Debug, Default)]
struct MergeTally {
    merged: usize,
    already_merged: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MergeApplied {
    Updated,
    AlreadyMerged,
}

pub struct Reconciler {
    source: Arc<dyn OfferStore>,
    destination: Arc<dyn OfferStore>,
    checkpoints: Arc<dyn CheckpointStore>,
    options: ReconcileOptions,
    shutdown: Option<watch::Receiver<bool>>,
}

impl Reconciler {
    pub fn new(
        source: Arc<dyn OfferStore>,
        destination: Arc<dyn OfferStore>,
        checkpoints: Arc<dyn CheckpointStore>,
        options: ReconcileOptions,
    ) -> Self {
        Self {
            source,
            destination,
            checkpoints,
            options,
            shutdown: None,
        }
    }

    pub fn with_shutdown(mut self, shutdown: watch::Receiver<bool>) -> Self {
        self.shutdown = Some(shutdown);
        self
    }

    fn shutdown_requested(&self) -> bool {
        self.shutdown
            .as_ref()
            .map(|rx| *rx.borrow())
            .unwrap_or(false)
    }

    pub async fn load_or_init_state(
        &self,
        seed: &CursorSeed,
    ) -> Result<MigrationState, ReconcileError> {
        match self.checkpoints.load().await? {
            Some(state) => {
                info!(
                    from_id = %state.from_id,
                    processed_offers = state.processed_offers,
                    "resuming from checkpoint"
                );
                Ok(state)
            }
            None => {
                let state = MigrationState::initial(
                    seed.from_id.clone(),
                    seed.processed_offers,
                    Utc::now(),
                );
                info!(
                    from_id = %state.from_id,
                    processed_offers = state.processed_offers,
                    "no checkpoint found; starting from configured cursor"
                );
                Ok(state)
            }
        }
    }

    /// Reconcile batches until the source is exhausted or shutdown is requested.
    pub async fn run(&self, seed: CursorSeed) -> Result<RunSummary, ReconcileError> {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let span = info_span!("reconcile_run", %run_id);
        self.run_inner(run_id, started_at, seed).instrument(span).await
    }

    async fn run_inner(
        &self,
        run_id: Uuid,
        started_at: DateTime<Utc>,
        seed: CursorSeed,
    ) -> Result<RunSummary, ReconcileError> {
        let mut state = self.load_or_init_state(&seed).await?;
        let mut summary = RunSummary {
            run_id,
            started_at,
            finished_at: started_at,
            batches: 0,
            processed_offers: 0,
            already_present: 0,
            inserted_offers: 0,
            inserted_duplicates: 0,
            merged_offers: 0,
            already_merged: 0,
            end: RunEnd::Exhausted,
            state: state.clone(),
        };

        let end = loop {
            if self.shutdown_requested() {
                info!(from_id = %state.from_id, "shutdown requested; stopping between batches");
                break RunEnd::Interrupted;
            }

            let span = info_span!("reconcile_batch", from_id = %state.from_id);
            let committed = self
                .run_batch_with_retry(&state)
                .instrument(span)
                .await
                .inspect_err(|err| {
                    error!(
                        from_id = %state.from_id,
                        error = %err,
                        "batch failed; checkpoint left unchanged"
                    );
                })?;

            let Some((outcome, next_state)) = committed else {
                break RunEnd::Exhausted;
            };
            summary.batches += 1;
            summary.processed_offers += outcome.candidates;
            summary.already_present += outcome.already_present;
            summary.inserted_offers += outcome.inserted_offers;
            summary.inserted_duplicates += outcome.inserted_duplicates;
            summary.merged_offers += outcome.merged;
            summary.already_merged += outcome.already_merged;
            state = next_state;
        };
        summary.end = end;

        info!(
            batches = summary.batches,
            processed_offers = state.processed_offers,
            end = ?summary.end,
            "reconciliation finished"
        );
        summary.finished_at = Utc::now();
        summary.state = state;
        Ok(summary)
    }

    async fn run_batch_with_retry(
        &self,
        state: &MigrationState,
    ) -> Result<Option<(BatchOutcome, MigrationState)>, ReconcileError> {
        let backoff = self.options.backoff;
        let mut attempt = 0;
        loop {
            match self.run_batch(state).await {
                Err(err) if err.is_retryable() && attempt < backoff.max_retries => {
                    let delay = backoff.delay_for_attempt(attempt);
                    attempt += 1;
                    warn!(
                        attempt,
                        max_retries = backoff.max_retries,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "transient failure; retrying batch from unchanged checkpoint"
                    );
                    tokio::time::sleep(delay).await;
                }
                other => return other,
            }
        }
    }

    async fn run_batch(
        &self,
        state: &MigrationState,
    ) -> Result<Option<(BatchOutcome, MigrationState)>, ReconcileError> {
        info!(
            from_id = %state.from_id,
            processed_offers = state.processed_offers,
            "processing offers"
        );
        let Some(outcome) = self.process_batch(state).await? else {
            return Ok(None);
        };

        let next = state.advanced(
            &outcome.last_id,
            outcome.candidates as u64,
            &outcome.offers_with_multiple_duplicates,
            Utc::now(),
        );
        self.checkpoints.save(&next).await?;
        info!(
            from_id = %next.from_id,
            processed_offers = next.processed_offers,
            flagged = next.offers_with_multiple_duplicates.len(),
            "state saved"
        );
        Ok(Some((outcome, next)))
    }

    /// Apply every insert and merge for the batch after `state.from_id`.
    ///
    /// Returns `None` when the source holds nothing past the cursor. The
    /// checkpoint is never touched here.
    pub async fn process_batch(
        &self,
        state: &MigrationState,
    ) -> Result<Option<BatchOutcome>, ReconcileError> {
        let candidates = self
            .source
            .find_identities_after(&state.from_id, self.options.batch_size)
            .await?;
        // The store's own order defines the cursor.
        let Some(last_id) = candidates.last().map(|c| c.id.clone()) else {
            return Ok(None);
        };

        let partition = classify_candidates(self.destination.as_ref(), &candidates).await?;
        let imported = self.import_new(&partition.new).await?;
        let tally = self.merge_all(&partition.merge_targets).await?;

        Ok(Some(BatchOutcome {
            last_id,
            candidates: candidates.len(),
            already_present: partition.already_present.len(),
            inserted_offers: imported.inserted_offers,
            inserted_duplicates: imported.inserted_duplicates,
            merged: tally.merged,
            already_merged: tally.already_merged,
            offers_with_multiple_duplicates: imported.offers_with_multiple_duplicates,
        }))
    }

    async fn import_new(&self, new: &[OfferIdentity]) -> Result<ImportOutcome, ReconcileError> {
        if new.is_empty() {
            return Ok(ImportOutcome::default());
        }

        let ids = new.iter().map(|o| o.id.clone()).collect::<Vec<_>>();
        let offers = self.source.find_offer_documents_by_ids(&ids).await?;
        if offers.len() < ids.len() {
            warn!(
                expected = ids.len(),
                found = offers.len(),
                "some new offers vanished from the source before import"
            );
        }
        let fetched_ids = offers.iter().map(|o| o.id.clone()).collect::<Vec<_>>();
        let duplicates =
            duplicates::resolve_duplicates(self.source.as_ref(), &fetched_ids).await?;

        // Duplicate records go first: an offer present by id on retry is
        // skipped, so its record must already be durable.
        let inserted_duplicates = self.destination.insert_duplicates(&duplicates.records).await?;
        let inserted_offers = self.destination.insert_offers(&offers).await?;
        info!(
            offers = inserted_offers,
            duplicates = inserted_duplicates,
            ids = %fetched_ids.join(", "),
            "imported offers"
        );

        Ok(ImportOutcome {
            inserted_offers,
            inserted_duplicates,
            offers_with_multiple_duplicates: duplicates.offers_with_multiple_duplicates,
        })
    }

    async fn merge_all(&self, targets: &[MergeTarget]) -> Result<MergeTally, ReconcileError> {
        let mut tally = MergeTally::default();
        if targets.is_empty() {
            return Ok(tally);
        }

        let permits = Arc::new(Semaphore::new(self.options.merge_concurrency.max(1)));
        let mut workers = JoinSet::new();
        for target in targets.iter().cloned() {
            let source = Arc::clone(&self.source);
            let destination = Arc::clone(&self.destination);
            let permits = Arc::clone(&permits);
            workers.spawn(async move {
                let _permit = permits
                    .acquire_owned()
                    .await
                    .map_err(|_| ReconcileError::Worker("merge pool closed".to_string()))?;
                merge_one(source.as_ref(), destination.as_ref(), &target).await
            });
        }

        while let Some(joined) = workers.join_next().await {
            let failure = match joined {
                Ok(Ok(MergeApplied::Updated)) => {
                    tally.merged += 1;
                    continue;
                }
                Ok(Ok(MergeApplied::AlreadyMerged)) => {
                    tally.already_merged += 1;
                    continue;
                }
                Ok(Err(err)) => err,
                Err(join_err) => ReconcileError::Worker(join_err.to_string()),
            };
            workers.abort_all();
            while workers.join_next().await.is_some() {}
            return Err(failure);
        }

        info!(
            merged = tally.merged,
            already_merged = tally.already_merged,
            "merged offers"
        );
        Ok(tally)
    }
}

async fn merge_one(
    source: &dyn OfferStore,
    destination: &dyn OfferStore,
    target: &MergeTarget,
) -> Result<MergeApplied, ReconcileError> {
    let current = destination
        .find_offer_by_id(&target.destination.id)
        .await?
        .ok_or_else(|| ReconcileError::MissingDocument {
            side: StoreSide::Destination,
            id: target.destination.id.clone(),
        })?;
    let incoming = source
        .find_offer_by_natural_key(&current.natural_key())
        .await?
        .ok_or_else(|| ReconcileError::MissingDocument {
            side: StoreSide::Source,
            id: target.candidate.id.clone(),
        })?;

    match merge_offer_versions(&incoming, &current)? {
        MergeDecision::AlreadyMerged => {
            debug!(offer_id = %current.id, "offer already merged");
            Ok(MergeApplied::AlreadyMerged)
        }
        MergeDecision::Update(patch) => {
            debug!(
                offer_id = %current.id,
                source_offer_id = %incoming.id,
                history_offset = history::history_offset(&incoming),
                "updating offer"
            );
            destination.update_offer_versions(&current.id, &patch).await?;
            Ok(MergeApplied::Updated)
        }
    }
}
