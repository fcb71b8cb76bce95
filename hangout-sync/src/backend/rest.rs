//! PostgREST row store.
//!
//! Maps [`RowStore`] calls onto the hosted backend's REST endpoint:
//!
//! | Call         | Request                                                    |
//! |--------------|------------------------------------------------------------|
//! | `insert`     | `POST /{table}`                                            |
//! | `update`     | `PATCH /{table}?col=eq.v` + `Prefer: return=representation`|
//! | `upsert`     | `POST /{table}?on_conflict=k` + `resolution=merge-duplicates` |
//! | `select`     | `GET /{table}?select=*&order=c.asc&limit=n`                |
//! | `select_one` | `GET` + `Accept: application/vnd.pgrst.object+json`        |
//! | `delete`     | `DELETE /{table}?...` + `Prefer: return=representation`    |

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde_json::Value;

use super::{Condition, Filter, Query, RowStore, StoreError};
use crate::config::SyncConfig;

const SINGLE_OBJECT: &str = "application/vnd.pgrst.object+json";

pub struct RestStore {
    client: Client,
    base_url: String,
    key: String,
}

impl RestStore {
    pub fn new(base_url: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            key: key.into(),
        }
    }

    pub fn from_config(config: &SyncConfig) -> Self {
        Self::new(config.rest_url(), config.backend_key.clone())
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn request(&self, method: reqwest::Method, table: &str) -> RequestBuilder {
        self.client
            .request(method, format!("{}/{table}", self.base_url))
            .header("apikey", &self.key)
            .bearer_auth(&self.key)
    }

    async fn send(request: RequestBuilder) -> Result<Response, StoreError> {
        let response = request
            .send()
            .await
            .map_err(|e| StoreError::Network(e.to_string()))?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let message = response.text().await.unwrap_or_default();
        Err(match status {
            StatusCode::CONFLICT => StoreError::Conflict(message),
            _ => StoreError::Rejected { status: status.as_u16(), message },
        })
    }

    async fn json_rows(response: Response) -> Result<Vec<Value>, StoreError> {
        response
            .json::<Vec<Value>>()
            .await
            .map_err(|e| StoreError::SerializationError(e.to_string()))
    }
}

/// Render a JSON scalar the way PostgREST expects it in a query string.
fn literal(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => "null".to_string(),
        other => other.to_string(),
    }
}

/// Query-string pairs for a filter.
pub fn filter_params(filter: &Filter) -> Vec<(String, String)> {
    filter
        .conditions()
        .iter()
        .map(|c| match c {
            Condition::Eq(col, v) => (col.clone(), format!("eq.{}", literal(v))),
            Condition::Gte(col, v) => (col.clone(), format!("gte.{}", literal(v))),
            Condition::NotNull(col) => (col.clone(), "not.is.null".to_string()),
            Condition::IsNull(col) => (col.clone(), "is.null".to_string()),
        })
        .collect()
}

/// Query-string pairs for a full select.
pub fn query_params(query: &Query) -> Vec<(String, String)> {
    let mut params = vec![("select".to_string(), "*".to_string())];
    params.extend(filter_params(&query.filter));
    if let Some(order) = &query.order {
        let dir = if order.ascending { "asc" } else { "desc" };
        params.push(("order".to_string(), format!("{}.{dir}", order.column)));
    }
    if let Some(limit) = query.limit {
        params.push(("limit".to_string(), limit.to_string()));
    }
    params
}

#[async_trait]
impl RowStore for RestStore {
    async fn insert(&self, table: &str, rows: Vec<Value>) -> Result<(), StoreError> {
        let request = self
            .request(reqwest::Method::POST, table)
            .header("Prefer", "return=minimal")
            .json(&rows);
        Self::send(request).await?;
        Ok(())
    }

    async fn update(&self, table: &str, patch: Value, filter: &Filter) -> Result<usize, StoreError> {
        let request = self
            .request(reqwest::Method::PATCH, table)
            .query(&filter_params(filter))
            .header("Prefer", "return=representation")
            .json(&patch);
        let response = Self::send(request).await?;
        Ok(Self::json_rows(response).await?.len())
    }

    async fn upsert(&self, table: &str, row: Value, conflict_key: &str) -> Result<(), StoreError> {
        let request = self
            .request(reqwest::Method::POST, table)
            .query(&[("on_conflict", conflict_key)])
            .header("Prefer", "resolution=merge-duplicates,return=minimal")
            .json(&vec![row]);
        Self::send(request).await?;
        Ok(())
    }

    async fn select(&self, table: &str, query: &Query) -> Result<Vec<Value>, StoreError> {
        let request = self.request(reqwest::Method::GET, table).query(&query_params(query));
        let response = Self::send(request).await?;
        Self::json_rows(response).await
    }

    async fn select_one(&self, table: &str, filter: &Filter) -> Result<Value, StoreError> {
        let mut params = vec![("select".to_string(), "*".to_string())];
        params.extend(filter_params(filter));
        let request = self
            .request(reqwest::Method::GET, table)
            .query(&params)
            .header("Accept", SINGLE_OBJECT);
        match Self::send(request).await {
            Ok(response) => response
                .json::<Value>()
                .await
                .map_err(|e| StoreError::SerializationError(e.to_string())),
            // PostgREST answers 406 when a singular request matches zero rows.
            Err(StoreError::Rejected { status: 406, .. }) => {
                Err(StoreError::NotFound { table: table.to_string() })
            }
            Err(e) => Err(e),
        }
    }

    async fn delete(&self, table: &str, filter: &Filter) -> Result<usize, StoreError> {
        let request = self
            .request(reqwest::Method::DELETE, table)
            .query(&filter_params(filter))
            .header("Prefer", "return=representation");
        let response = Self::send(request).await?;
        Ok(Self::json_rows(response).await?.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pairs(p: &[(&str, &str)]) -> Vec<(String, String)> {
        p.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn test_filter_params() {
        let filter = Filter::new().eq("recipient", "Anvi").gte("timestamp", 10).not_null("id").is_null("read_at");
        assert_eq!(
            filter_params(&filter),
            pairs(&[("recipient", "eq.Anvi"), ("timestamp", "gte.10"), ("id", "not.is.null"), ("read_at", "is.null")])
        );
    }

    #[test]
    fn test_query_params() {
        let query = Query::new().order_by("timestamp", true).limit(100);
        assert_eq!(
            query_params(&query),
            pairs(&[("select", "*"), ("order", "timestamp.asc"), ("limit", "100")])
        );
        let desc = Query::new()
            .filter(Filter::new().eq("recipient", "Zxhan"))
            .order_by("timestamp", false);
        assert_eq!(
            query_params(&desc),
            pairs(&[("select", "*"), ("recipient", "eq.Zxhan"), ("order", "timestamp.desc")])
        );
    }

    #[test]
    fn test_bool_literal() {
        let filter = Filter::new().eq("is_online", true);
        assert_eq!(filter_params(&filter), pairs(&[("is_online", "eq.true")]));
    }

    #[test]
    fn test_base_url_from_config() {
        let store = RestStore::from_config(&SyncConfig::for_testing());
        assert_eq!(store.base_url(), "http://127.0.0.1:54321/rest/v1");
    }

    #[tokio::test]
    async fn test_unreachable_host_is_network_error() {
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let store = RestStore::new(format!("http://127.0.0.1:{port}/rest/v1"), "k");
        let err = store.select("messages", &Query::new()).await.unwrap_err();
        assert!(matches!(err, StoreError::Network(_)));
    }
}
