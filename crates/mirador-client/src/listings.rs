use mirador_core::config::{HttpConfig, UpstreamConfig};
use mirador_core::error::AppError;
use mirador_core::models::{ListingDetail, ListingPage, ListingSummary};
use mirador_core::retry::RetryPolicy;
use mirador_core::traits::{UpstreamClient, UpstreamClientFactory};
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT};
use reqwest::{Client, StatusCode};
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;
use tracing::debug;
use url::Url;

/// Header carrying the upstream API key.
pub const API_KEY_HEADER: &str = "X-API-Key";

/// Header carrying the upstream API secret.
pub const API_SECRET_HEADER: &str = "X-API-Secret";

/// Keys under which list responses carry their array of summaries.
const LIST_KEYS: [&str; 3] = ["data", "items", "results"];

/// Keys under which list responses carry pagination metadata.
const META_KEYS: [&str; 2] = ["pagination", "meta"];

/// Maps an HTTP status to the error taxonomy.
///
/// - 2xx: `Ok`
/// - 401/403: `AuthError`, terminal
/// - 404 on a detail fetch (`external_id` given): `NotFound`
/// - 429: `RateLimitExceeded`, retried with a longer backoff
/// - 5xx: `ServerError`, retried
/// - anything else: `RequestFailed`, terminal
pub fn classify_status(
    status: StatusCode,
    external_id: Option<i64>,
    url: &Url,
) -> Result<(), AppError> {
    if status.is_success() {
        return Ok(());
    }
    let code = status.as_u16();
    let failed = || AppError::RequestFailed {
        status: code,
        url: url.to_string(),
    };
    Err(match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => AppError::AuthError(code),
        StatusCode::TOO_MANY_REQUESTS => AppError::RateLimitExceeded,
        StatusCode::NOT_FOUND => external_id.map_or_else(failed, AppError::NotFound),
        s if s.is_server_error() => AppError::ServerError(code),
        _ => failed(),
    })
}

/// HTTP client for the upstream listings API.
///
/// # Examples
///
/// ```no_run
/// use mirador_client::ListingsClient;
/// use mirador_core::config::{HttpConfig, UpstreamConfig};
/// use mirador_core::traits::UpstreamClient;
/// use tokio_util::sync::CancellationToken;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let upstream = UpstreamConfig {
///     base_url: Some("https://api.example.com/v1".to_string()),
///     api_key: Some("key".to_string()),
///     api_secret: None,
/// };
/// let client = ListingsClient::new(&upstream, &HttpConfig::default())?;
/// let page = client.list_page(1, 50, &CancellationToken::new()).await?;
/// println!("Found {} listings on page 1", page.items.len());
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct ListingsClient {
    client: Client,
    base_url: Url,
    retry: RetryPolicy,
    timeout_secs: u64,
}

impl ListingsClient {
    /// Creates a client for the configured upstream.
    ///
    /// # Errors
    ///
    /// - `AppError::ConfigurationError` if the base URL or key is missing, or
    ///   a credential is not a valid header value.
    /// - `AppError::InvalidUrl` if the base URL does not parse.
    pub fn new(upstream: &UpstreamConfig, http: &HttpConfig) -> Result<Self, AppError> {
        upstream.validate()?;
        let raw_url = upstream.base_url.as_deref().unwrap_or_default().trim();

        // Url::join drops the last path segment unless it ends with a slash.
        let normalized = format!("{}/", raw_url.trim_end_matches('/'));
        let base_url = Url::parse(&normalized)
            .map_err(|_| AppError::InvalidUrl(format!("Invalid upstream URL: {}", raw_url)))?;

        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
        headers.insert(
            API_KEY_HEADER,
            header_value(upstream.api_key.as_deref().unwrap_or_default())?,
        );
        if let Some(secret) = upstream.api_secret.as_deref().filter(|s| !s.is_empty()) {
            headers.insert(API_SECRET_HEADER, header_value(secret)?);
        }

        let client = Client::builder()
            .user_agent("Mirador/0.1 (listings-sync)")
            .timeout(http.timeout())
            .default_headers(headers)
            .build()
            .map_err(|e| {
                AppError::ConfigurationError(format!("Failed to build HTTP client: {}", e))
            })?;

        Ok(Self {
            client,
            base_url,
            retry: RetryPolicy::from_http_config(http),
            timeout_secs: http.timeout_secs,
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    fn endpoint(&self, path: &str) -> Result<Url, AppError> {
        self.base_url
            .join(path)
            .map_err(|e| AppError::InvalidUrl(e.to_string()))
    }

    /// One GET attempt: send, classify, decode JSON.
    async fn get_json(&self, url: &Url, external_id: Option<i64>) -> Result<Value, AppError> {
        let resp = self
            .client
            .get(url.clone())
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;

        classify_status(resp.status(), external_id, url)?;

        // A body cut off mid-read is a transport failure, not bad JSON.
        let body = resp.bytes().await.map_err(|e| self.transport_error(e))?;
        serde_json::from_slice(&body)
            .map_err(|e| AppError::Generic(format!("Invalid JSON from {}: {}", url, e)))
    }

    fn transport_error(&self, e: reqwest::Error) -> AppError {
        if e.is_timeout() {
            AppError::Timeout(self.timeout_secs)
        } else if e.is_connect() {
            AppError::NetworkError(format!("Connection failed: {}", e))
        } else {
            AppError::NetworkError(e.to_string())
        }
    }

    /// GET with the retry policy applied.
    async fn fetch(
        &self,
        url: &Url,
        external_id: Option<i64>,
        cancel: &CancellationToken,
    ) -> Result<Value, AppError> {
        self.retry
            .run(cancel, |attempt| {
                debug!(%url, attempt, "GET");
                self.get_json(url, external_id)
            })
            .await
    }
}

impl UpstreamClient for ListingsClient {
    async fn list_page(
        &self,
        page: u32,
        page_size: u32,
        cancel: &CancellationToken,
    ) -> Result<ListingPage, AppError> {
        let mut url = self.endpoint("properties")?;
        url.query_pairs_mut()
            .append_pair("page", &page.to_string())
            .append_pair("per_page", &page_size.to_string());

        let body = self.fetch(&url, None, cancel).await?;
        parse_list_page(body)
    }

    async fn fetch_detail(
        &self,
        external_id: i64,
        cancel: &CancellationToken,
    ) -> Result<Option<ListingDetail>, AppError> {
        let url = self.endpoint(&format!("properties/{}", external_id))?;

        match self.fetch(&url, Some(external_id), cancel).await {
            Ok(body) => ListingDetail::from_value(external_id, body).map(Some),
            Err(AppError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

/// Builds a [`ListingsClient`] per cycle from the current configuration.
#[derive(Debug, Clone, Copy, Default)]
pub struct ListingsClientFactory;

impl UpstreamClientFactory for ListingsClientFactory {
    type Client = ListingsClient;

    fn create(&self, upstream: &UpstreamConfig, http: &HttpConfig) -> Result<ListingsClient, AppError> {
        ListingsClient::new(upstream, http)
    }
}

fn header_value(value: &str) -> Result<HeaderValue, AppError> {
    HeaderValue::from_str(value).map_err(|_| {
        AppError::ConfigurationError("upstream credential is not a valid header value".to_string())
    })
}

/// Parses a list response.
///
/// Accepts a bare array, or an object carrying the array under `data`,
/// `items` or `results` (possibly nested one level, paginator style).
/// Entries without a usable `id` are dropped.
///
/// # Errors
///
/// Returns `AppError::Generic` if no listing array can be found.
pub fn parse_list_page(body: Value) -> Result<ListingPage, AppError> {
    let (items, container) = match body {
        Value::Array(items) => (items, Map::new()),
        Value::Object(mut obj) => {
            let nested = match obj.get("data") {
                Some(Value::Object(inner)) if LIST_KEYS.iter().any(|k| inner.contains_key(*k)) => {
                    obj.remove("data")
                }
                _ => None,
            };
            if let Some(Value::Object(inner)) = nested {
                // Paginator nested under `data`: metadata sits beside the array.
                obj = inner;
            }
            let items = take_array(&mut obj).ok_or_else(|| {
                AppError::Generic("List response has no listing array".to_string())
            })?;
            (items, obj)
        }
        other => {
            return Err(AppError::Generic(format!(
                "Unexpected list response: {}",
                type_name(&other)
            )))
        }
    };

    let has_more = META_KEYS
        .iter()
        .filter_map(|k| container.get(*k).and_then(Value::as_object))
        .find_map(has_more_from)
        .or_else(|| has_more_from(&container));

    let raw_len = items.len();
    let items = items
        .into_iter()
        .filter_map(|item| match summary_from(item) {
            Some(summary) => Some(summary),
            None => {
                debug!("Dropping list entry without a numeric id");
                None
            }
        })
        .collect();

    Ok(ListingPage {
        items,
        raw_len,
        has_more,
    })
}

fn take_array(obj: &mut Map<String, Value>) -> Option<Vec<Value>> {
    let key = LIST_KEYS
        .iter()
        .find(|k| obj.get(**k).is_some_and(Value::is_array))?;
    match obj.remove(*key) {
        Some(Value::Array(items)) => Some(items),
        _ => None,
    }
}

fn has_more_from(meta: &Map<String, Value>) -> Option<bool> {
    if let Some(flag) = meta.get("has_more").and_then(Value::as_bool) {
        return Some(flag);
    }
    let current = meta.get("current_page").and_then(as_u64)?;
    let last = ["last_page", "total_pages"]
        .iter()
        .find_map(|k| meta.get(*k).and_then(as_u64))?;
    Some(current < last)
}

fn summary_from(item: Value) -> Option<ListingSummary> {
    let Value::Object(mut extras) = item else {
        return None;
    };
    let id = extras.remove("id").as_ref().and_then(as_i64)?;
    Some(ListingSummary { id, extras })
}

fn as_i64(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn as_u64(value: &Value) -> Option<u64> {
    as_i64(value).and_then(|v| u64::try_from(v).ok())
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
