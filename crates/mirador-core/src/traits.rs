//! Seams between the sync engine and its collaborators.
//!
//! The engine is generic over these traits so that:
//! - the PostgreSQL repository and the reqwest client live in their own crates
//! - unit tests can drive the whole engine with in-memory doubles

use std::future::Future;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::{HttpConfig, UpstreamConfig};
use crate::error::AppError;
use crate::models::{CachedRecord, ListingDetail, ListingPage, RecordFilter, RecordPatch};

/// Persistent collection of cached records keyed by `external_id`.
///
/// Implementations must make each `upsert` atomic and key it on
/// `external_id` only. Concurrent upserts for different keys must be safe.
pub trait RecordStore: Send + Sync {
    fn find_by_external_id(
        &self,
        external_id: i64,
    ) -> impl Future<Output = Result<Option<CachedRecord>, AppError>> + Send;

    /// Inserts the record, or updates the stored one with the same `external_id`.
    ///
    /// On update, the administrative columns `lifecycle_state` and
    /// `review_pending` keep their stored values. Returns the internal storage id.
    fn upsert(&self, record: &CachedRecord) -> impl Future<Output = Result<Uuid, AppError>> + Send;

    fn find_where(
        &self,
        filter: &RecordFilter,
    ) -> impl Future<Output = Result<Vec<CachedRecord>, AppError>> + Send;

    /// Returns the number of deleted records.
    fn delete_where(
        &self,
        filter: &RecordFilter,
    ) -> impl Future<Output = Result<u64, AppError>> + Send;

    fn count_where(
        &self,
        filter: &RecordFilter,
    ) -> impl Future<Output = Result<u64, AppError>> + Send;

    /// Bulk status update. Returns the number of affected records.
    fn update_where(
        &self,
        filter: &RecordFilter,
        patch: &RecordPatch,
    ) -> impl Future<Output = Result<u64, AppError>> + Send;
}

/// Client for the upstream listings API.
///
/// Implementations retry transient failures themselves and stop retrying
/// once `cancel` fires.
pub trait UpstreamClient: Send + Sync {
    /// Fetches one page of the list endpoint. Pages are numbered from 1.
    fn list_page(
        &self,
        page: u32,
        page_size: u32,
        cancel: &CancellationToken,
    ) -> impl Future<Output = Result<ListingPage, AppError>> + Send;

    /// Fetches full detail for one listing. `Ok(None)` means upstream answered 404.
    fn fetch_detail(
        &self,
        external_id: i64,
        cancel: &CancellationToken,
    ) -> impl Future<Output = Result<Option<ListingDetail>, AppError>> + Send;
}

/// Builds upstream clients from the current configuration.
///
/// The engine creates a fresh client per cycle so configuration updates
/// take effect on the next cycle.
pub trait UpstreamClientFactory: Send + Sync {
    type Client: UpstreamClient;

    fn create(&self, upstream: &UpstreamConfig, http: &HttpConfig)
        -> Result<Self::Client, AppError>;
}

impl<T: RecordStore> RecordStore for Arc<T> {
    fn find_by_external_id(
        &self,
        external_id: i64,
    ) -> impl Future<Output = Result<Option<CachedRecord>, AppError>> + Send {
        (**self).find_by_external_id(external_id)
    }

    fn upsert(&self, record: &CachedRecord) -> impl Future<Output = Result<Uuid, AppError>> + Send {
        (**self).upsert(record)
    }

    fn find_where(
        &self,
        filter: &RecordFilter,
    ) -> impl Future<Output = Result<Vec<CachedRecord>, AppError>> + Send {
        (**self).find_where(filter)
    }

    fn delete_where(
        &self,
        filter: &RecordFilter,
    ) -> impl Future<Output = Result<u64, AppError>> + Send {
        (**self).delete_where(filter)
    }

    fn count_where(
        &self,
        filter: &RecordFilter,
    ) -> impl Future<Output = Result<u64, AppError>> + Send {
        (**self).count_where(filter)
    }

    fn update_where(
        &self,
        filter: &RecordFilter,
        patch: &RecordPatch,
    ) -> impl Future<Output = Result<u64, AppError>> + Send {
        (**self).update_where(filter, patch)
    }
}

impl<T: UpstreamClient> UpstreamClient for Arc<T> {
    fn list_page(
        &self,
        page: u32,
        page_size: u32,
        cancel: &CancellationToken,
    ) -> impl Future<Output = Result<ListingPage, AppError>> + Send {
        (**self).list_page(page, page_size, cancel)
    }

    fn fetch_detail(
        &self,
        external_id: i64,
        cancel: &CancellationToken,
    ) -> impl Future<Output = Result<Option<ListingDetail>, AppError>> + Send {
        (**self).fetch_detail(external_id, cancel)
    }
}
