//! Per-listing reconciliation against the local store.

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::SignalRules;
use crate::error::AppError;
use crate::models::CachedRecord;
use crate::signals::compute_signals;
use crate::sync::{plan_reconcile, CycleStats, ReconcileAction, SyncOutcome};
use crate::traits::{RecordStore, UpstreamClient};

/// Converges one cached record with its upstream state.
pub struct Reconciler<'a, S: RecordStore, U: UpstreamClient> {
    store: &'a S,
    client: &'a U,
    ttl: chrono::Duration,
    rules: &'a SignalRules,
    cancel: &'a CancellationToken,
}

impl<'a, S: RecordStore, U: UpstreamClient> Reconciler<'a, S, U> {
    pub fn new(
        store: &'a S,
        client: &'a U,
        ttl: chrono::Duration,
        rules: &'a SignalRules,
        cancel: &'a CancellationToken,
    ) -> Self {
        Self {
            store,
            client,
            ttl,
            rules,
            cancel,
        }
    }

    /// Reconciles one listing and records the outcome into `stats`.
    ///
    /// Never fails: any error is logged and counted in `stats.errors`.
    pub async fn reconcile(&self, external_id: i64, stats: &mut CycleStats) {
        stats.record(self.process(external_id).await);
    }

    /// Reconciles one listing and returns what happened.
    pub async fn process(&self, external_id: i64) -> SyncOutcome {
        match self.try_process(external_id).await {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(external_id, error = %e, "Failed to reconcile listing");
                SyncOutcome::Failed
            }
        }
    }

    async fn try_process(&self, external_id: i64) -> Result<SyncOutcome, AppError> {
        let existing = self.store.find_by_external_id(external_id).await?;
        let now = Utc::now();
        let decision = plan_reconcile(existing.as_ref(), now);

        if !decision.needs_fetch() {
            return match (decision.action, existing) {
                (ReconcileAction::Reactivate, Some(mut record)) => {
                    record.touch(now, self.ttl);
                    self.store.upsert(&record).await?;
                    info!(external_id, "Listing reappeared upstream");
                    Ok(SyncOutcome::Reactivated)
                }
                _ => {
                    debug!(external_id, reason = decision.reason, "Skipping listing");
                    Ok(SyncOutcome::Skipped)
                }
            };
        }

        let detail = match self.client.fetch_detail(external_id, self.cancel).await {
            Ok(Some(detail)) => detail,
            Ok(None) | Err(AppError::NotFound(_)) => {
                info!(external_id, "Listed id has no detail upstream, ignoring");
                return Ok(SyncOutcome::NotFound);
            }
            Err(e) => {
                return Err(AppError::RecordProcessing {
                    external_id,
                    reason: e.to_string(),
                })
            }
        };

        let signals = compute_signals(&detail, self.rules);
        let fetched_at = Utc::now();

        match existing {
            None => {
                let record =
                    CachedRecord::from_detail(&detail, signals, fetched_at, self.ttl);
                self.store.upsert(&record).await?;
                debug!(external_id, "Created listing");
                Ok(SyncOutcome::Created)
            }
            Some(mut record) => {
                let changed = record.apply_detail(&detail, &signals, fetched_at, self.ttl);
                self.store.upsert(&record).await?;
                debug!(external_id, changed, "Refreshed listing");
                Ok(SyncOutcome::Updated)
            }
        }
    }
}
