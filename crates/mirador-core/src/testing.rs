//! In-memory doubles for the store and upstream traits, used by unit tests.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::{HttpConfig, UpstreamConfig};
use crate::error::AppError;
use crate::models::{
    CachedRecord, ListingDetail, ListingPage, ListingSummary, RecordFilter, RecordPatch,
};
use crate::traits::{RecordStore, UpstreamClient, UpstreamClientFactory};

/// `RecordStore` over a `BTreeMap`, honoring `RecordFilter::matches`.
#[derive(Default)]
pub struct MemoryStore {
    records: Mutex<BTreeMap<i64, (Uuid, CachedRecord)>>,
    fail_upserts: Mutex<HashSet<i64>>,
    upserts: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, record: CachedRecord) {
        self.records
            .lock()
            .unwrap()
            .insert(record.external_id, (Uuid::new_v4(), record));
    }

    pub fn get(&self, external_id: i64) -> Option<CachedRecord> {
        self.records
            .lock()
            .unwrap()
            .get(&external_id)
            .map(|(_, r)| r.clone())
    }

    pub fn ids(&self) -> Vec<i64> {
        self.records.lock().unwrap().keys().copied().collect()
    }

    pub fn fail_upsert_for(&self, external_id: i64) {
        self.fail_upserts.lock().unwrap().insert(external_id);
    }

    pub fn upsert_count(&self) -> usize {
        self.upserts.load(Ordering::SeqCst)
    }
}

impl RecordStore for MemoryStore {
    async fn find_by_external_id(&self, external_id: i64) -> Result<Option<CachedRecord>, AppError> {
        Ok(self.get(external_id))
    }

    async fn upsert(&self, record: &CachedRecord) -> Result<Uuid, AppError> {
        if self.fail_upserts.lock().unwrap().contains(&record.external_id) {
            return Err(AppError::DatabaseError(sqlx::Error::PoolTimedOut));
        }
        self.upserts.fetch_add(1, Ordering::SeqCst);
        let mut records = self.records.lock().unwrap();
        let mut stored = record.clone();
        let id = match records.get(&record.external_id) {
            Some((id, existing)) => {
                stored.lifecycle_state = existing.lifecycle_state;
                stored.review_pending = existing.review_pending;
                *id
            }
            None => Uuid::new_v4(),
        };
        records.insert(record.external_id, (id, stored));
        Ok(id)
    }

    async fn find_where(&self, filter: &RecordFilter) -> Result<Vec<CachedRecord>, AppError> {
        Ok(self
            .records
            .lock()
            .unwrap()
            .values()
            .filter(|(_, r)| filter.matches(r))
            .map(|(_, r)| r.clone())
            .collect())
    }

    async fn delete_where(&self, filter: &RecordFilter) -> Result<u64, AppError> {
        let mut records = self.records.lock().unwrap();
        let before = records.len();
        records.retain(|_, (_, r)| !filter.matches(r));
        Ok((before - records.len()) as u64)
    }

    async fn count_where(&self, filter: &RecordFilter) -> Result<u64, AppError> {
        Ok(self
            .records
            .lock()
            .unwrap()
            .values()
            .filter(|(_, r)| filter.matches(r))
            .count() as u64)
    }

    async fn update_where(&self, filter: &RecordFilter, patch: &RecordPatch) -> Result<u64, AppError> {
        let mut count = 0;
        for (_, record) in self.records.lock().unwrap().values_mut() {
            if filter.matches(record) {
                patch.apply_to(record);
                count += 1;
            }
        }
        Ok(count)
    }
}

/// Scripted `UpstreamClient`: fixed pages of ids, per-id detail payloads.
///
/// Ids listed without a detail payload answer 404.
#[derive(Default)]
pub struct ScriptedUpstream {
    pages: Mutex<Vec<Vec<i64>>>,
    with_metadata: Mutex<bool>,
    page_failures: Mutex<HashMap<u32, Vec<AppError>>>,
    malformed: Mutex<HashMap<u32, usize>>,
    details: Mutex<HashMap<i64, Value>>,
    failing_details: Mutex<HashSet<i64>>,
    detail_calls: Mutex<HashMap<i64, usize>>,
    list_calls: AtomicUsize,
}

impl ScriptedUpstream {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the listing. Every listed id gets a minimal detail payload
    /// unless one was set explicitly.
    pub fn set_pages(&self, pages: Vec<Vec<i64>>) {
        {
            let mut details = self.details.lock().unwrap();
            for id in pages.iter().flatten() {
                details
                    .entry(*id)
                    .or_insert_with(|| json!({"id": id, "name": format!("Listing {}", id)}));
            }
        }
        *self.pages.lock().unwrap() = pages;
    }

    /// Emit explicit `has_more` metadata instead of relying on short pages.
    pub fn with_metadata(&self, on: bool) {
        *self.with_metadata.lock().unwrap() = on;
    }

    /// Queue errors returned by successive calls for `page`, before it succeeds.
    pub fn fail_page(&self, page: u32, errors: Vec<AppError>) {
        self.page_failures.lock().unwrap().insert(page, errors);
    }

    /// Pretend `page` also carried `count` entries without a usable id.
    pub fn add_malformed(&self, page: u32, count: usize) {
        self.malformed.lock().unwrap().insert(page, count);
    }

    pub fn set_detail(&self, id: i64, raw: Value) {
        self.details.lock().unwrap().insert(id, raw);
    }

    pub fn remove_detail(&self, id: i64) {
        self.details.lock().unwrap().remove(&id);
    }

    pub fn fail_detail(&self, id: i64) {
        self.failing_details.lock().unwrap().insert(id);
    }

    pub fn detail_calls(&self, id: i64) -> usize {
        self.detail_calls
            .lock()
            .unwrap()
            .get(&id)
            .copied()
            .unwrap_or(0)
    }

    pub fn total_detail_calls(&self) -> usize {
        self.detail_calls.lock().unwrap().values().sum()
    }

    pub fn list_calls(&self) -> usize {
        self.list_calls.load(Ordering::SeqCst)
    }
}

impl UpstreamClient for ScriptedUpstream {
    async fn list_page(
        &self,
        page: u32,
        _page_size: u32,
        _cancel: &CancellationToken,
    ) -> Result<ListingPage, AppError> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);

        if let Some(errors) = self.page_failures.lock().unwrap().get_mut(&page) {
            if !errors.is_empty() {
                return Err(errors.remove(0));
            }
        }

        let pages = self.pages.lock().unwrap();
        let index = page.saturating_sub(1) as usize;
        let ids = pages.get(index).cloned().unwrap_or_default();
        let has_more = if *self.with_metadata.lock().unwrap() {
            Some(index + 1 < pages.len())
        } else {
            None
        };

        let malformed = self
            .malformed
            .lock()
            .unwrap()
            .get(&page)
            .copied()
            .unwrap_or(0);

        Ok(ListingPage {
            raw_len: ids.len() + malformed,
            items: ids
                .into_iter()
                .map(|id| ListingSummary {
                    id,
                    extras: Default::default(),
                })
                .collect(),
            has_more,
        })
    }

    async fn fetch_detail(
        &self,
        external_id: i64,
        _cancel: &CancellationToken,
    ) -> Result<Option<ListingDetail>, AppError> {
        *self
            .detail_calls
            .lock()
            .unwrap()
            .entry(external_id)
            .or_default() += 1;

        if self.failing_details.lock().unwrap().contains(&external_id) {
            return Err(AppError::ServerError(503));
        }

        let raw = self.details.lock().unwrap().get(&external_id).cloned();
        match raw {
            Some(raw) => ListingDetail::from_value(external_id, raw).map(Some),
            None => Ok(None),
        }
    }
}

/// Factory handing out the shared scripted upstream.
#[derive(Clone, Default)]
pub struct ScriptedFactory {
    pub upstream: Arc<ScriptedUpstream>,
}

impl UpstreamClientFactory for ScriptedFactory {
    type Client = Arc<ScriptedUpstream>;

    fn create(
        &self,
        _upstream: &UpstreamConfig,
        _http: &HttpConfig,
    ) -> Result<Self::Client, AppError> {
        Ok(self.upstream.clone())
    }
}

/// A cached record with controllable timestamps.
pub fn cached(external_id: i64, fetched_at: DateTime<Utc>, upstream_present: bool) -> CachedRecord {
    let detail = ListingDetail::from_value(
        external_id,
        json!({"id": external_id, "name": format!("Listing {}", external_id)}),
    )
    .unwrap();
    let mut record =
        CachedRecord::from_detail(&detail, Default::default(), fetched_at, chrono::Duration::hours(24));
    record.upstream_present = upstream_present;
    record
}
