//! Listing repository for PostgreSQL.
//!
//! Store predicates ([`RecordFilter`]) and bulk patches ([`RecordPatch`]) are
//! translated into SQL with `sqlx::QueryBuilder`; every value is bound, never
//! interpolated. The SQL meaning of a filter must agree with
//! `RecordFilter::matches`.

use chrono::{DateTime, Utc};
use mirador_core::error::AppError;
use mirador_core::models::{CachedRecord, CoreFields, LifecycleState, RecordFilter, RecordPatch};
use mirador_core::traits::RecordStore;
use serde::Serialize;
use sqlx::types::Json;
use sqlx::{PgPool, Pool, Postgres, QueryBuilder};
use tracing::info;
use uuid::Uuid;

/// Column list for SELECT queries. Must remain a const literal since it is
/// pushed into the query text verbatim.
const LISTING_COLUMNS: &str = "external_id, name, location, developer, min_price, max_price, sale_status, completion_date, latitude, longitude, raw_detail, content_hash, upstream_present, lifecycle_state, review_pending, feature_signals, first_seen_at, fetched_at, expires_at, absent_since";

/// Repository for cached listings in PostgreSQL.
///
/// # Examples
///
/// ```no_run
/// use sqlx::postgres::PgPoolOptions;
/// use mirador_db::RecordRepository;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let pool = PgPoolOptions::new()
///     .max_connections(5)
///     .connect("postgresql://localhost/mirador")
///     .await?;
///
/// let repo = RecordRepository::new(pool);
/// repo.migrate().await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct RecordRepository {
    pool: Pool<Postgres>,
}

impl RecordRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Applies the embedded schema migrations.
    pub async fn migrate(&self) -> Result<(), AppError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(e.into()))?;
        info!("Database schema up to date");
        Ok(())
    }

    /// Returns aggregate counts over the cached listings.
    pub async fn get_stats(&self) -> Result<StoreStats, AppError> {
        let row: StatsRow = sqlx::query_as(
            r#"
            SELECT
                COUNT(*) AS total,
                COUNT(*) FILTER (WHERE upstream_present) AS present,
                COUNT(*) FILTER (WHERE upstream_present AND lifecycle_state = 'active') AS active,
                COUNT(*) FILTER (WHERE review_pending) AS review_pending,
                COUNT(*) FILTER (WHERE expires_at < NOW()) AS stale,
                MAX(fetched_at) AS last_fetch
            FROM listings
            "#,
        )
        .fetch_one(&self.pool)
        .await
        .map_err(AppError::DatabaseError)?;

        Ok(StoreStats {
            total: row.total.unwrap_or(0),
            present: row.present.unwrap_or(0),
            active: row.active.unwrap_or(0),
            review_pending: row.review_pending.unwrap_or(0),
            stale: row.stale.unwrap_or(0),
            last_fetch: row.last_fetch,
        })
    }
}

impl RecordStore for RecordRepository {
    async fn find_by_external_id(&self, external_id: i64) -> Result<Option<CachedRecord>, AppError> {
        let mut qb = select_query();
        qb.push(" WHERE external_id = ").push_bind(external_id);

        let row = qb
            .build_query_as::<ListingRow>()
            .fetch_optional(&self.pool)
            .await
            .map_err(AppError::DatabaseError)?;

        row.map(CachedRecord::try_from).transpose()
    }

    /// Inserts or updates by `external_id`.
    ///
    /// `lifecycle_state` and `review_pending` of an existing row are left as
    /// stored: they are administrative columns, not upstream data.
    async fn upsert(&self, record: &CachedRecord) -> Result<Uuid, AppError> {
        let signals: Vec<String> = record.feature_signals.iter().cloned().collect();

        let rec: (Uuid,) = sqlx::query_as(
            r#"
            INSERT INTO listings (
                id,
                external_id,
                name,
                location,
                developer,
                min_price,
                max_price,
                sale_status,
                completion_date,
                latitude,
                longitude,
                raw_detail,
                content_hash,
                upstream_present,
                lifecycle_state,
                review_pending,
                feature_signals,
                first_seen_at,
                fetched_at,
                expires_at,
                absent_since
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19, $20, $21)
            ON CONFLICT (external_id)
            DO UPDATE SET
                name = EXCLUDED.name,
                location = EXCLUDED.location,
                developer = EXCLUDED.developer,
                min_price = EXCLUDED.min_price,
                max_price = EXCLUDED.max_price,
                sale_status = EXCLUDED.sale_status,
                completion_date = EXCLUDED.completion_date,
                latitude = EXCLUDED.latitude,
                longitude = EXCLUDED.longitude,
                raw_detail = EXCLUDED.raw_detail,
                content_hash = EXCLUDED.content_hash,
                upstream_present = EXCLUDED.upstream_present,
                feature_signals = EXCLUDED.feature_signals,
                fetched_at = EXCLUDED.fetched_at,
                expires_at = EXCLUDED.expires_at,
                absent_since = EXCLUDED.absent_since
            RETURNING id
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(record.external_id)
        .bind(&record.core.name)
        .bind(&record.core.location)
        .bind(&record.core.developer)
        .bind(record.core.min_price)
        .bind(record.core.max_price)
        .bind(&record.core.sale_status)
        .bind(&record.core.completion_date)
        .bind(record.core.latitude)
        .bind(record.core.longitude)
        .bind(Json(&record.raw_detail))
        .bind(&record.content_hash)
        .bind(record.upstream_present)
        .bind(record.lifecycle_state.as_str())
        .bind(record.review_pending)
        .bind(signals)
        .bind(record.first_seen_at)
        .bind(record.fetched_at)
        .bind(record.expires_at)
        .bind(record.absent_since)
        .fetch_one(&self.pool)
        .await
        .map_err(AppError::DatabaseError)?;

        Ok(rec.0)
    }

    async fn find_where(&self, filter: &RecordFilter) -> Result<Vec<CachedRecord>, AppError> {
        let mut qb = select_query();
        push_conditions(&mut qb, filter);
        qb.push(" ORDER BY external_id");

        let rows = qb
            .build_query_as::<ListingRow>()
            .fetch_all(&self.pool)
            .await
            .map_err(AppError::DatabaseError)?;

        rows.into_iter().map(CachedRecord::try_from).collect()
    }

    async fn delete_where(&self, filter: &RecordFilter) -> Result<u64, AppError> {
        let mut qb = QueryBuilder::new("DELETE FROM listings");
        push_conditions(&mut qb, filter);

        let result = qb
            .build()
            .execute(&self.pool)
            .await
            .map_err(AppError::DatabaseError)?;

        Ok(result.rows_affected())
    }

    async fn count_where(&self, filter: &RecordFilter) -> Result<u64, AppError> {
        let mut qb = QueryBuilder::new("SELECT COUNT(*) FROM listings");
        push_conditions(&mut qb, filter);

        let count: i64 = qb
            .build_query_scalar()
            .fetch_one(&self.pool)
            .await
            .map_err(AppError::DatabaseError)?;

        Ok(count.max(0) as u64)
    }

    async fn update_where(&self, filter: &RecordFilter, patch: &RecordPatch) -> Result<u64, AppError> {
        let Some(mut qb) = update_query(filter, patch) else {
            return Ok(0);
        };

        let result = qb
            .build()
            .execute(&self.pool)
            .await
            .map_err(AppError::DatabaseError)?;

        Ok(result.rows_affected())
    }
}

fn select_query() -> QueryBuilder<'static, Postgres> {
    let mut qb = QueryBuilder::new("SELECT ");
    qb.push(LISTING_COLUMNS).push(" FROM listings");
    qb
}

/// Builds the UPDATE for a patch, or `None` if the patch changes nothing.
fn update_query(filter: &RecordFilter, patch: &RecordPatch) -> Option<QueryBuilder<'static, Postgres>> {
    if patch.upstream_present.is_none()
        && patch.review_pending.is_none()
        && patch.absent_since.is_none()
    {
        return None;
    }

    let mut qb = QueryBuilder::new("UPDATE listings SET ");
    {
        let mut set = qb.separated(", ");
        if let Some(present) = patch.upstream_present {
            set.push("upstream_present = ").push_bind_unseparated(present);
        }
        if let Some(pending) = patch.review_pending {
            set.push("review_pending = ").push_bind_unseparated(pending);
        }
        if let Some(absent_since) = patch.absent_since {
            set.push("absent_since = ").push_bind_unseparated(absent_since);
        }
    }
    push_conditions(&mut qb, filter);
    Some(qb)
}

/// Appends the WHERE clause for `filter`. An empty filter matches every row.
fn push_conditions(qb: &mut QueryBuilder<'static, Postgres>, filter: &RecordFilter) {
    qb.push(" WHERE TRUE");

    if let Some(present) = filter.upstream_present {
        qb.push(" AND upstream_present = ").push_bind(present);
    }
    if let Some(state) = filter.lifecycle_state {
        qb.push(" AND lifecycle_state = ").push_bind(state.as_str());
    }
    if let Some(pending) = filter.review_pending {
        qb.push(" AND review_pending = ").push_bind(pending);
    }
    if let Some(ids) = &filter.external_ids {
        qb.push(" AND external_id = ANY(")
            .push_bind(ids.clone())
            .push(")");
    }
    if let Some(t) = filter.fetched_since {
        qb.push(" AND fetched_at >= ").push_bind(t);
    }
    if let Some(t) = filter.expired_before {
        qb.push(" AND expires_at < ").push_bind(t);
    }
    if let Some(t) = filter.absent_before {
        qb.push(" AND absent_since < ").push_bind(t);
    }
}

/// Aggregate counts over the store, for status output.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StoreStats {
    pub total: i64,
    pub present: i64,
    pub active: i64,
    pub review_pending: i64,
    pub stale: i64,
    pub last_fetch: Option<DateTime<Utc>>,
}

/// Helper struct for deserializing stats query results
#[derive(sqlx::FromRow)]
struct StatsRow {
    total: Option<i64>,
    present: Option<i64>,
    active: Option<i64>,
    review_pending: Option<i64>,
    stale: Option<i64>,
    last_fetch: Option<DateTime<Utc>>,
}

/// Helper struct for deserializing listing rows
#[derive(sqlx::FromRow)]
struct ListingRow {
    external_id: i64,
    name: Option<String>,
    location: Option<String>,
    developer: Option<String>,
    min_price: Option<f64>,
    max_price: Option<f64>,
    sale_status: Option<String>,
    completion_date: Option<String>,
    latitude: Option<f64>,
    longitude: Option<f64>,
    raw_detail: Json<serde_json::Value>,
    content_hash: String,
    upstream_present: bool,
    lifecycle_state: String,
    review_pending: bool,
    feature_signals: Vec<String>,
    first_seen_at: DateTime<Utc>,
    fetched_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
    absent_since: Option<DateTime<Utc>>,
}

impl TryFrom<ListingRow> for CachedRecord {
    type Error = AppError;

    fn try_from(row: ListingRow) -> Result<Self, Self::Error> {
        Ok(CachedRecord {
            external_id: row.external_id,
            core: CoreFields {
                name: row.name,
                location: row.location,
                developer: row.developer,
                min_price: row.min_price,
                max_price: row.max_price,
                sale_status: row.sale_status,
                completion_date: row.completion_date,
                latitude: row.latitude,
                longitude: row.longitude,
            },
            raw_detail: row.raw_detail.0,
            content_hash: row.content_hash,
            upstream_present: row.upstream_present,
            lifecycle_state: row.lifecycle_state.parse::<LifecycleState>()?,
            review_pending: row.review_pending,
            feature_signals: row.feature_signals.into_iter().collect(),
            first_seen_at: row.first_seen_at,
            fetched_at: row.fetched_at,
            expires_at: row.expires_at,
            absent_since: row.absent_since,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sql_for(filter: &RecordFilter) -> String {
        let mut qb = QueryBuilder::<Postgres>::new("SELECT COUNT(*) FROM listings");
        push_conditions(&mut qb, filter);
        qb.sql().to_string()
    }

    fn row(lifecycle_state: &str) -> ListingRow {
        let now = Utc::now();
        ListingRow {
            external_id: 42,
            name: Some("Marina Heights".to_string()),
            location: Some("Dubai Marina".to_string()),
            developer: None,
            min_price: Some(1_200_000.0),
            max_price: None,
            sale_status: Some("on_sale".to_string()),
            completion_date: None,
            latitude: Some(25.08),
            longitude: Some(55.14),
            raw_detail: Json(json!({"id": 42, "name": "Marina Heights"})),
            content_hash: "abc".to_string(),
            upstream_present: true,
            lifecycle_state: lifecycle_state.to_string(),
            review_pending: false,
            feature_signals: vec!["rich_media".to_string(), "partner_listing".to_string()],
            first_seen_at: now,
            fetched_at: now,
            expires_at: now + chrono::Duration::hours(24),
            absent_since: None,
        }
    }

    #[test]
    fn test_empty_filter_matches_all() {
        assert_eq!(
            sql_for(&RecordFilter::new()),
            "SELECT COUNT(*) FROM listings WHERE TRUE"
        );
    }

    #[test]
    fn test_active_filter_sql() {
        assert_eq!(
            sql_for(&RecordFilter::active()),
            "SELECT COUNT(*) FROM listings WHERE TRUE AND upstream_present = $1 AND lifecycle_state = $2"
        );
    }

    #[test]
    fn test_full_filter_sql_binds_every_value() {
        let now = Utc::now();
        let filter = RecordFilter::new()
            .upstream_present(false)
            .lifecycle(LifecycleState::Disabled)
            .review_pending(false)
            .ids(vec![1, 2])
            .fetched_since(now)
            .expired_before(now)
            .absent_before(now);

        let sql = sql_for(&filter);

        assert!(sql.contains("external_id = ANY($4)"));
        assert!(sql.contains("fetched_at >= $5"));
        assert!(sql.contains("expires_at < $6"));
        assert!(sql.ends_with("absent_since < $7"));
    }

    #[test]
    fn test_update_query_for_sweep_patch() {
        let filter = RecordFilter::new().upstream_present(true).ids(vec![2]);
        let qb = update_query(&filter, &RecordPatch::mark_absent(Utc::now())).unwrap();

        assert_eq!(
            qb.sql(),
            "UPDATE listings SET upstream_present = $1, absent_since = $2 WHERE TRUE AND upstream_present = $3 AND external_id = ANY($4)"
        );
    }

    #[test]
    fn test_update_query_empty_patch_is_none() {
        assert!(update_query(&RecordFilter::new(), &RecordPatch::default()).is_none());
    }

    #[test]
    fn test_select_query_columns() {
        let qb = select_query();
        assert!(qb.sql().starts_with("SELECT external_id, name,"));
        assert!(qb.sql().ends_with(" FROM listings"));
    }

    #[test]
    fn test_row_into_record() {
        let record = CachedRecord::try_from(row("draft")).unwrap();

        assert_eq!(record.external_id, 42);
        assert_eq!(record.core.name.as_deref(), Some("Marina Heights"));
        assert_eq!(record.lifecycle_state, LifecycleState::Draft);
        assert_eq!(record.raw_detail["id"], 42);
        // TEXT[] order does not matter, the record keeps a sorted set.
        assert_eq!(
            record.feature_signals.iter().cloned().collect::<Vec<_>>(),
            vec!["partner_listing".to_string(), "rich_media".to_string()]
        );
    }

    #[test]
    fn test_row_with_unknown_state_is_rejected() {
        assert!(CachedRecord::try_from(row("featured")).is_err());
    }
}
