//! REST adapter for a PostgREST-style backing store.
//!
//! Tables live under `{base_url}/rest/v1/{table}`. Versioned updates are
//! guarded with a `version=eq.{sent-1}` filter so a stale write matches no
//! rows; a point read then tells a conflict from a missing record.
//! `watch` polls the table and pushes only when the row set changed.

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, StatusCode};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backing_store::{BackingStore, WatchCallback, WatchHandle};
use crate::config::RestConfig;
use crate::error::StoreError;
use crate::model::{Row, Table};
use crate::normalize;

const REST_PREFIX: &str = "/rest/v1";

struct RestClient {
    http: Client,
    base_url: String,
    api_key: String,
}

impl RestClient {
    fn table_url(&self, table: Table) -> String {
        format!("{}{REST_PREFIX}/{}", self.base_url, table.name())
    }

    fn authed(&self, req: RequestBuilder) -> RequestBuilder {
        req.header("apikey", &self.api_key)
            .bearer_auth(&self.api_key)
            .header("Accept", "application/json")
    }

    async fn fetch_all(&self, table: Table) -> Result<Vec<Value>, StoreError> {
        let req = self
            .http
            .get(self.table_url(table))
            .query(&[("select", "*")]);
        let body = self.send(self.authed(req), table, "*").await?;
        Ok(as_rows(body))
    }

    async fn send(&self, req: RequestBuilder, table: Table, id: &str) -> Result<Value, StoreError> {
        let resp = req.send().await.map_err(|e| transport_error(&e))?;
        let status = resp.status();
        let body_text = resp.text().await.unwrap_or_default();
        if !status.is_success() {
            return Err(classify_status(status, &body_text, table, id));
        }
        if body_text.trim().is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&body_text)
            .map_err(|e| StoreError::Rejected(format!("invalid JSON from {}: {e}", table.name())))
    }
}

/// Backing store reached over HTTP.
#[derive(Clone)]
pub struct RestBackingStore {
    client: Arc<RestClient>,
    poll_interval: Duration,
}

impl RestBackingStore {
    pub fn new(config: &RestConfig) -> Result<Self, StoreError> {
        let base_url = normalize_base_url(&config.base_url);
        if base_url.is_empty() {
            return Err(StoreError::Rejected("REST base URL is not configured".into()));
        }
        let http = Client::builder()
            .timeout(config.timeout())
            .build()
            .map_err(|e| StoreError::Rejected(format!("failed to create HTTP client: {e}")))?;
        info!(base_url = %base_url, "REST backing store configured");
        Ok(Self {
            client: Arc::new(RestClient {
                http,
                base_url,
                api_key: config.api_key.clone(),
            }),
            poll_interval: config.poll_interval(),
        })
    }

    pub fn table_url(&self, table: Table) -> String {
        self.client.table_url(table)
    }
}

#[async_trait]
impl BackingStore for RestBackingStore {
    fn watch(&self, table: Table, callback: WatchCallback) -> Result<WatchHandle, StoreError> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| StoreError::Unavailable(format!("no async runtime for watch: {e}")))?;
        let token = CancellationToken::new();
        let task_token = token.clone();
        let client = self.client.clone();
        let interval = self.poll_interval;

        runtime.spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut last: Option<Vec<Value>> = None;
            loop {
                tokio::select! {
                    _ = task_token.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                match client.fetch_all(table).await {
                    Ok(rows) => {
                        if last.as_ref() != Some(&rows) {
                            debug!(table = %table, rows = rows.len(), "Table changed, pushing snapshot");
                            callback(rows.clone());
                            last = Some(rows);
                        }
                    }
                    Err(e) => warn!(table = %table, "Poll failed: {e}"),
                }
            }
            debug!(table = %table, "Watch stopped");
        });

        Ok(WatchHandle::new(table, token))
    }

    async fn update(&self, table: Table, record: Row) -> Result<Row, StoreError> {
        let key = record_key(table, &record)?;
        let mut filters = vec![(table.key_field().to_string(), eq_filter(&key))];
        let sent_version = record.get("version").and_then(Value::as_i64);
        if table.is_versioned() {
            if let Some(sent) = sent_version {
                filters.push(("version".to_string(), eq_filter(&(sent - 1).to_string())));
            }
        }

        let req = self
            .client
            .http
            .patch(self.client.table_url(table))
            .query(&filters)
            .header("Prefer", "return=representation")
            .json(&Value::Object(record));
        let body = self.client.send(self.client.authed(req), table, &key).await?;

        if let Some(row) = as_rows(body).first() {
            return canonical(table, row);
        }

        // Nothing matched: either the row is gone or its version moved on.
        match self.read(table, &key).await? {
            None => Err(StoreError::NotFound {
                table: table.name().into(),
                id: key,
            }),
            Some(current) => Err(StoreError::Conflict {
                table: table.name().into(),
                id: key,
                current_version: current.get("version").and_then(Value::as_i64),
            }),
        }
    }

    async fn insert(&self, table: Table, record: Row) -> Result<Row, StoreError> {
        let key = record_key(table, &record)?;
        let req = self
            .client
            .http
            .post(self.client.table_url(table))
            .header("Prefer", "return=representation")
            .json(&Value::Object(record.clone()));
        let body = self.client.send(self.client.authed(req), table, &key).await?;
        match as_rows(body).first() {
            Some(row) => canonical(table, row),
            None => Ok(record),
        }
    }

    async fn read(&self, table: Table, key: &str) -> Result<Option<Row>, StoreError> {
        let req = self
            .client
            .http
            .get(self.client.table_url(table))
            .query(&[
                ("select", "*".to_string()),
                (table.key_field(), eq_filter(key)),
                ("limit", "1".to_string()),
            ]);
        let body = self.client.send(self.client.authed(req), table, key).await?;
        as_rows(body)
            .first()
            .map(|row| canonical(table, row))
            .transpose()
    }
}

/// Trim whitespace, trailing slashes and a trailing `/rest/v1`.
pub fn normalize_base_url(url: &str) -> String {
    let mut url = url.trim().trim_end_matches('/').to_string();
    if let Some(stripped) = url.strip_suffix(REST_PREFIX) {
        url = stripped.trim_end_matches('/').to_string();
    }
    url
}

/// PostgREST equality filter value.
pub fn eq_filter(value: &str) -> String {
    format!("eq.{value}")
}

/// Map a non-success HTTP status to a store error.
pub fn classify_status(status: StatusCode, body: &str, table: Table, id: &str) -> StoreError {
    let detail = error_detail(body).unwrap_or_else(|| format!("HTTP {}", status.as_u16()));
    match status.as_u16() {
        404 => StoreError::NotFound {
            table: table.name().into(),
            id: id.into(),
        },
        408 => StoreError::Timeout(detail),
        409 => StoreError::Conflict {
            table: table.name().into(),
            id: id.into(),
            current_version: None,
        },
        429 => StoreError::Unavailable(detail),
        s if s >= 500 => StoreError::Unavailable(detail),
        _ => StoreError::Rejected(format!("{detail} (HTTP {})", status.as_u16())),
    }
}

fn error_detail(body: &str) -> Option<String> {
    let json = serde_json::from_str::<Value>(body).ok()?;
    json.get("message")
        .or_else(|| json.get("error"))
        .or_else(|| json.get("hint"))
        .and_then(Value::as_str)
        .map(str::to_string)
}

fn transport_error(err: &reqwest::Error) -> StoreError {
    if err.is_timeout() {
        StoreError::Timeout(err.to_string())
    } else if err.is_builder() {
        StoreError::Rejected(format!("invalid request: {err}"))
    } else if err.is_decode() {
        StoreError::Rejected(format!("invalid response: {err}"))
    } else {
        StoreError::Connection(err.to_string())
    }
}

fn record_key(table: Table, record: &Row) -> Result<String, StoreError> {
    normalize::row_key(table, record)
        .map(str::to_string)
        .ok_or_else(|| StoreError::Rejected(format!("{} record without {}", table.name(), table.key_field())))
}

fn canonical(table: Table, raw: &Value) -> Result<Row, StoreError> {
    normalize::canonical_row(table, raw)
        .ok_or_else(|| StoreError::Rejected(format!("{} returned a row without a key", table.name())))
}

fn as_rows(body: Value) -> Vec<Value> {
    match body {
        Value::Array(rows) => rows,
        Value::Object(_) => vec![body],
        _ => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn config(url: &str) -> RestConfig {
        RestConfig {
            base_url: url.to_string(),
            api_key: "anon".to_string(),
            ..RestConfig::default()
        }
    }

    #[test]
    fn test_base_url_normalization() {
        assert_eq!(normalize_base_url(" https://db.test/ "), "https://db.test");
        assert_eq!(normalize_base_url("https://db.test/rest/v1/"), "https://db.test");
        assert_eq!(normalize_base_url("https://db.test"), "https://db.test");
    }

    #[test]
    fn test_table_urls() {
        let store = RestBackingStore::new(&config("https://db.test/")).unwrap();
        assert_eq!(
            store.table_url(Table::Batches),
            "https://db.test/rest/v1/order_batches"
        );
        assert_eq!(
            store.table_url(Table::Jobs),
            "https://db.test/rest/v1/job_order_headers"
        );
        assert_eq!(eq_filter("b-1"), "eq.b-1");
    }

    #[test]
    fn test_missing_url_is_rejected() {
        assert!(matches!(
            RestBackingStore::new(&config("  ")),
            Err(StoreError::Rejected(_))
        ));
    }

    #[test]
    fn test_status_classification() {
        let t = Table::Orders;
        assert!(classify_status(StatusCode::SERVICE_UNAVAILABLE, "", t, "o1").is_transient());
        assert!(classify_status(StatusCode::BAD_GATEWAY, "", t, "o1").is_transient());
        assert!(classify_status(StatusCode::TOO_MANY_REQUESTS, "", t, "o1").is_transient());
        assert!(classify_status(StatusCode::REQUEST_TIMEOUT, "", t, "o1").is_transient());
        assert!(classify_status(StatusCode::CONFLICT, "", t, "o1").is_conflict());
        assert!(classify_status(StatusCode::NOT_FOUND, "", t, "o1").is_not_found());

        let rejected = classify_status(
            StatusCode::BAD_REQUEST,
            r#"{"message":"invalid input syntax for type uuid"}"#,
            t,
            "o1",
        );
        assert!(!rejected.is_transient());
        assert_eq!(
            rejected,
            StoreError::Rejected("invalid input syntax for type uuid (HTTP 400)".into())
        );
    }

    #[test]
    fn test_rows_from_body() {
        assert_eq!(as_rows(json!([{"id": "a"}, {"id": "b"}])).len(), 2);
        assert_eq!(as_rows(json!({"id": "a"})).len(), 1);
        assert!(as_rows(Value::Null).is_empty());
    }

    #[test]
    fn test_watch_requires_runtime() {
        let store = RestBackingStore::new(&config("http://127.0.0.1:9")).unwrap();
        let result = store.watch(Table::Jobs, Arc::new(|_| {}));
        assert!(matches!(result, Err(StoreError::Unavailable(_))));
    }

    #[tokio::test]
    async fn test_watch_handle_stops_poller() {
        let store = RestBackingStore::new(&config("http://127.0.0.1:9")).unwrap();
        let handle = store.watch(Table::Jobs, Arc::new(|_| {})).unwrap();
        assert_eq!(handle.table(), Table::Jobs);
        assert!(!handle.is_stopped());
        handle.stop();
        assert!(handle.is_stopped());
    }
}
