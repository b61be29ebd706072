//! Domain models: cached records, upstream payloads, and store predicates.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

use crate::error::AppError;

/// Administrative visibility of a record, independent of upstream presence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LifecycleState {
    #[default]
    Active,
    Disabled,
    Draft,
}

impl LifecycleState {
    pub fn as_str(&self) -> &'static str {
        match self {
            LifecycleState::Active => "active",
            LifecycleState::Disabled => "disabled",
            LifecycleState::Draft => "draft",
        }
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LifecycleState {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(LifecycleState::Active),
            "disabled" => Ok(LifecycleState::Disabled),
            "draft" => Ok(LifecycleState::Draft),
            other => Err(AppError::Generic(format!(
                "unknown lifecycle state: {}",
                other
            ))),
        }
    }
}

/// Scalar listing fields lifted out of the upstream detail payload.
///
/// All optional: upstream omits fields freely.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CoreFields {
    pub name: Option<String>,
    pub location: Option<String>,
    pub developer: Option<String>,
    pub min_price: Option<f64>,
    pub max_price: Option<f64>,
    pub sale_status: Option<String>,
    pub completion_date: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
}

impl CoreFields {
    /// Merges fresher values into `self`. A `None` in `fresh` never erases a known value.
    pub fn merge_from(&mut self, fresh: &CoreFields) {
        fn take<T: Clone>(slot: &mut Option<T>, fresh: &Option<T>) {
            if let Some(v) = fresh {
                *slot = Some(v.clone());
            }
        }

        take(&mut self.name, &fresh.name);
        take(&mut self.location, &fresh.location);
        take(&mut self.developer, &fresh.developer);
        take(&mut self.min_price, &fresh.min_price);
        take(&mut self.max_price, &fresh.max_price);
        take(&mut self.sale_status, &fresh.sale_status);
        take(&mut self.completion_date, &fresh.completion_date);
        take(&mut self.latitude, &fresh.latitude);
        take(&mut self.longitude, &fresh.longitude);
    }
}

/// A listing as cached in the local store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedRecord {
    pub external_id: i64,
    pub core: CoreFields,
    /// The upstream detail response, stored verbatim.
    pub raw_detail: Value,
    pub content_hash: String,
    pub upstream_present: bool,
    pub lifecycle_state: LifecycleState,
    pub review_pending: bool,
    pub feature_signals: BTreeSet<String>,
    pub first_seen_at: DateTime<Utc>,
    pub fetched_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    /// Set when a full enumeration stops listing this record.
    pub absent_since: Option<DateTime<Utc>>,
}

impl CachedRecord {
    /// Builds a brand-new record from a detail fetch.
    pub fn from_detail(
        detail: &ListingDetail,
        signals: BTreeSet<String>,
        now: DateTime<Utc>,
        ttl: chrono::Duration,
    ) -> Self {
        Self {
            external_id: detail.external_id,
            core: detail.core.clone(),
            raw_detail: detail.raw.clone(),
            content_hash: compute_content_hash(&detail.raw),
            upstream_present: true,
            lifecycle_state: LifecycleState::Active,
            review_pending: false,
            feature_signals: signals,
            first_seen_at: now,
            fetched_at: now,
            expires_at: now + ttl,
            absent_since: None,
        }
    }

    /// A record is stale iff `now > expires_at`.
    pub fn is_stale(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }

    /// Marks a successful upstream observation at `now`.
    pub fn touch(&mut self, now: DateTime<Utc>, ttl: chrono::Duration) {
        self.fetched_at = now;
        self.expires_at = now + ttl;
        self.upstream_present = true;
        self.absent_since = None;
    }

    /// Folds a fresh detail response into this record.
    ///
    /// Returns true if the raw payload changed since the last fetch.
    pub fn apply_detail(
        &mut self,
        detail: &ListingDetail,
        signals: &BTreeSet<String>,
        now: DateTime<Utc>,
        ttl: chrono::Duration,
    ) -> bool {
        let new_hash = compute_content_hash(&detail.raw);
        let changed = new_hash != self.content_hash;

        self.core.merge_from(&detail.core);
        self.raw_detail = detail.raw.clone();
        self.content_hash = new_hash;
        self.feature_signals.extend(signals.iter().cloned());
        self.touch(now, ttl);

        changed
    }
}

/// SHA-256 of the canonical JSON rendering of a payload, hex-encoded.
///
/// `serde_json` keeps object keys sorted, so equal payloads hash equally.
pub fn compute_content_hash(raw: &Value) -> String {
    let mut hasher = Sha256::new();
    hasher.update(raw.to_string().as_bytes());
    format!("{:x}", hasher.finalize())
}

/// One entry of the upstream list endpoint.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ListingSummary {
    pub id: i64,
    /// All other fields returned by upstream.
    #[serde(flatten)]
    pub extras: Map<String, Value>,
}

/// One page of the upstream list endpoint.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ListingPage {
    pub items: Vec<ListingSummary>,
    /// Entries upstream sent, including ones dropped for lacking an id.
    pub raw_len: usize,
    /// `None` when upstream sent no pagination metadata.
    pub has_more: Option<bool>,
}

/// A full upstream detail response.
#[derive(Debug, Clone, PartialEq)]
pub struct ListingDetail {
    pub external_id: i64,
    pub core: CoreFields,
    pub is_partner: bool,
    pub facility_count: usize,
    pub image_count: usize,
    pub raw: Value,
}

impl ListingDetail {
    /// Extracts the fields the engine reasons about from an upstream payload.
    ///
    /// Upstream field names are not stable, so each field accepts a few
    /// aliases. A payload wrapped as `{"data": {...}}` is unwrapped first.
    ///
    /// # Errors
    ///
    /// Returns `AppError::RecordProcessing` if the payload is not an object.
    pub fn from_value(external_id: i64, raw: Value) -> Result<Self, AppError> {
        let raw = match raw {
            Value::Object(mut obj) if !obj.contains_key("id") && obj.contains_key("data") => {
                obj.remove("data").unwrap_or(Value::Null)
            }
            other => other,
        };

        let obj = raw.as_object().ok_or_else(|| AppError::RecordProcessing {
            external_id,
            reason: "detail payload is not a JSON object".to_string(),
        })?;

        let core = CoreFields {
            name: string_field(obj, &["name", "title"]),
            location: location_field(obj),
            developer: developer_field(obj),
            min_price: number_field(obj, &["min_price", "price_from", "price"]),
            max_price: number_field(obj, &["max_price", "price_to"]),
            sale_status: string_field(obj, &["sale_status", "status"]),
            completion_date: string_field(obj, &["completion_date", "handover_date"]),
            latitude: number_field(obj, &["latitude", "lat"]),
            longitude: number_field(obj, &["longitude", "lng", "lon"]),
        };

        let is_partner = ["is_partner", "partner", "is_partner_project"]
            .iter()
            .filter_map(|k| obj.get(*k))
            .any(truthy);

        Ok(Self {
            external_id,
            core,
            is_partner,
            facility_count: array_len(obj, &["facilities", "amenities"]),
            image_count: array_len(obj, &["images", "gallery", "photos"]),
            raw,
        })
    }
}

fn string_field(obj: &Map<String, Value>, keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|k| match obj.get(*k) {
        Some(Value::String(s)) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    })
}

fn number_field(obj: &Map<String, Value>, keys: &[&str]) -> Option<f64> {
    keys.iter().find_map(|k| match obj.get(*k) {
        Some(Value::Number(n)) => n.as_f64(),
        Some(Value::String(s)) => s.trim().parse().ok(),
        _ => None,
    })
}

fn location_field(obj: &Map<String, Value>) -> Option<String> {
    ["location", "area", "community"]
        .iter()
        .find_map(|k| match obj.get(*k) {
            Some(Value::String(s)) if !s.trim().is_empty() => Some(s.trim().to_string()),
            Some(Value::Object(inner)) => string_field(inner, &["name", "title", "district"]),
            _ => None,
        })
}

fn developer_field(obj: &Map<String, Value>) -> Option<String> {
    match obj.get("developer") {
        Some(Value::Object(inner)) => string_field(inner, &["name", "title"]),
        _ => string_field(obj, &["developer", "developer_name"]),
    }
}

fn array_len(obj: &Map<String, Value>, keys: &[&str]) -> usize {
    keys.iter()
        .find_map(|k| obj.get(*k).and_then(Value::as_array))
        .map(Vec::len)
        .unwrap_or(0)
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_i64().unwrap_or(0) != 0,
        Value::String(s) => matches!(s.to_ascii_lowercase().as_str(), "true" | "yes" | "1"),
        _ => false,
    }
}

/// Store predicate: a conjunction of optional conditions.
///
/// An empty filter matches every record.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecordFilter {
    pub upstream_present: Option<bool>,
    pub lifecycle_state: Option<LifecycleState>,
    pub review_pending: Option<bool>,
    pub external_ids: Option<Vec<i64>>,
    /// `fetched_at >= t`
    pub fetched_since: Option<DateTime<Utc>>,
    /// `expires_at < t`
    pub expired_before: Option<DateTime<Utc>>,
    /// `absent_since < t`
    pub absent_before: Option<DateTime<Utc>>,
}

impl RecordFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn upstream_present(mut self, present: bool) -> Self {
        self.upstream_present = Some(present);
        self
    }

    pub fn lifecycle(mut self, state: LifecycleState) -> Self {
        self.lifecycle_state = Some(state);
        self
    }

    pub fn review_pending(mut self, pending: bool) -> Self {
        self.review_pending = Some(pending);
        self
    }

    pub fn ids(mut self, ids: Vec<i64>) -> Self {
        self.external_ids = Some(ids);
        self
    }

    pub fn fetched_since(mut self, t: DateTime<Utc>) -> Self {
        self.fetched_since = Some(t);
        self
    }

    pub fn expired_before(mut self, t: DateTime<Utc>) -> Self {
        self.expired_before = Some(t);
        self
    }

    pub fn absent_before(mut self, t: DateTime<Utc>) -> Self {
        self.absent_before = Some(t);
        self
    }

    /// Records that are present upstream and administratively active.
    pub fn active() -> Self {
        Self::new()
            .upstream_present(true)
            .lifecycle(LifecycleState::Active)
    }

    /// In-memory meaning of the filter. Store implementations must agree with it.
    pub fn matches(&self, record: &CachedRecord) -> bool {
        self.upstream_present
            .is_none_or(|v| record.upstream_present == v)
            && self
                .lifecycle_state
                .is_none_or(|v| record.lifecycle_state == v)
            && self.review_pending.is_none_or(|v| record.review_pending == v)
            && self
                .external_ids
                .as_ref()
                .is_none_or(|ids| ids.contains(&record.external_id))
            && self.fetched_since.is_none_or(|t| record.fetched_at >= t)
            && self.expired_before.is_none_or(|t| record.expires_at < t)
            && self
                .absent_before
                .is_none_or(|t| record.absent_since.is_some_and(|a| a < t))
    }
}

/// Bulk status update applied by `RecordStore::update_where`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecordPatch {
    pub upstream_present: Option<bool>,
    pub review_pending: Option<bool>,
    /// `Some(None)` clears the column.
    pub absent_since: Option<Option<DateTime<Utc>>>,
}

impl RecordPatch {
    /// Patch used by the staleness sweep.
    pub fn mark_absent(now: DateTime<Utc>) -> Self {
        Self {
            upstream_present: Some(false),
            absent_since: Some(Some(now)),
            ..Default::default()
        }
    }

    /// Patch used by cleanup for long-expired records.
    pub fn flag_for_review() -> Self {
        Self {
            review_pending: Some(true),
            ..Default::default()
        }
    }

    pub fn apply_to(&self, record: &mut CachedRecord) {
        if let Some(v) = self.upstream_present {
            record.upstream_present = v;
        }
        if let Some(v) = self.review_pending {
            record.review_pending = v;
        }
        if let Some(v) = self.absent_since {
            record.absent_since = v;
        }
    }
}
