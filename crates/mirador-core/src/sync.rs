//! Sync service layer: reconciliation decisions and cycle statistics.
//!
//! This module holds the pure parts of reconciliation, decoupled from
//! network and store I/O: what to do with one identifier given its cached
//! copy, and how outcomes roll up into a cycle summary.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::models::CachedRecord;

/// Outcome of reconciling a single listing during a cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    /// First time seeing this listing - record created
    Created,
    /// Cached copy was stale - detail re-fetched and merged
    Updated,
    /// Cached copy fresh and already present - nothing to do
    Skipped,
    /// Fresh cached copy that had been marked absent - flipped present again
    Reactivated,
    /// Upstream listed the id but its detail answered 404
    NotFound,
    /// Processing failed for this listing
    Failed,
}

/// What the reconciler should do with one identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileAction {
    /// Fetch detail and create a new record
    Create,
    /// Fetch detail and merge into the existing record
    Refresh,
    /// No fetch, no write
    Skip,
    /// No fetch, flip `upstream_present` back on and refresh timestamps
    Reactivate,
}

/// Result of freshness detection for a listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconcileDecision {
    pub action: ReconcileAction,
    /// Human-readable reason for the decision
    pub reason: &'static str,
}

impl ReconcileDecision {
    /// Returns true if this decision requires a detail fetch.
    pub fn needs_fetch(&self) -> bool {
        matches!(
            self.action,
            ReconcileAction::Create | ReconcileAction::Refresh
        )
    }
}

/// Decides how to reconcile an identifier given its cached copy.
///
/// # Arguments
/// * `existing` - The cached record for this id (None if never seen)
/// * `now` - Reference time for the staleness check
pub fn plan_reconcile(existing: Option<&CachedRecord>, now: DateTime<Utc>) -> ReconcileDecision {
    match existing {
        None => ReconcileDecision {
            action: ReconcileAction::Create,
            reason: "new listing",
        },
        Some(record) if record.is_stale(now) => ReconcileDecision {
            action: ReconcileAction::Refresh,
            reason: "cache expired",
        },
        Some(record) if record.upstream_present => ReconcileDecision {
            action: ReconcileAction::Skip,
            reason: "cache fresh",
        },
        Some(_) => ReconcileDecision {
            action: ReconcileAction::Reactivate,
            reason: "reappeared upstream",
        },
    }
}

/// How a cycle ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CycleStatus {
    #[default]
    Completed,
    /// Listing walk was incomplete; the staleness sweep was skipped
    Partial,
    /// Cancelled between batches; the staleness sweep was skipped
    Cancelled,
}

/// Summary of one sync cycle.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CycleStats {
    pub processed: usize,
    pub new_records: usize,
    pub updated_records: usize,
    pub skipped_duplicates: usize,
    pub reactivated: usize,
    pub not_found: usize,
    pub marked_inactive: u64,
    pub errors: usize,
    pub status: CycleStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
}

impl CycleStats {
    /// Creates a new empty stats tracker for a cycle starting at `started_at`.
    pub fn new(started_at: DateTime<Utc>) -> Self {
        Self {
            processed: 0,
            new_records: 0,
            updated_records: 0,
            skipped_duplicates: 0,
            reactivated: 0,
            not_found: 0,
            marked_inactive: 0,
            errors: 0,
            status: CycleStatus::Completed,
            started_at,
            finished_at: None,
            duration_ms: None,
        }
    }

    /// Records an outcome, incrementing the appropriate counter.
    pub fn record(&mut self, outcome: SyncOutcome) {
        self.processed += 1;
        match outcome {
            SyncOutcome::Created => self.new_records += 1,
            SyncOutcome::Updated => self.updated_records += 1,
            SyncOutcome::Skipped => self.skipped_duplicates += 1,
            SyncOutcome::Reactivated => self.reactivated += 1,
            SyncOutcome::NotFound => self.not_found += 1,
            SyncOutcome::Failed => self.errors += 1,
        }
    }

    /// Returns the number of listings reconciled without error.
    pub fn successful(&self) -> usize {
        self.processed - self.errors
    }

    /// Stamps the end of the cycle.
    pub fn finish(&mut self, finished_at: DateTime<Utc>) {
        self.finished_at = Some(finished_at);
        self.duration_ms = Some((finished_at - self.started_at).num_milliseconds());
    }
}

/// Result of the cleanup operation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CleanupReport {
    /// Long-expired records newly flagged for review
    pub expired_marked: u64,
    /// Disabled records absent upstream past the grace period
    pub hard_deleted: u64,
}
