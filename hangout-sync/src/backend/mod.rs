//! Row-store abstraction over the hosted backend.
//!
//! The sync layer only needs a handful of table operations, so they are
//! captured by the object-safe [`RowStore`] trait. Rows are plain JSON
//! objects; typed conversion happens in the facade.
//!
//! - [`memory`]: in-process tables with fault injection, for tests and demos
//! - [`rest`]: PostgREST over HTTP

pub mod memory;
pub mod rest;

pub use memory::{BackendCall, MemoryBackend, Operation};
pub use rest::RestStore;

use async_trait::async_trait;
use serde_json::Value;
use std::cmp::Ordering;

pub mod tables {
    pub const MESSAGES: &str = "messages";
    pub const NOTIFICATIONS: &str = "notifications";
    pub const PRESENCE: &str = "presence";
    pub const SCORES: &str = "scores";
    pub const SYNC_STATE: &str = "sync_state";
    pub const STROKES: &str = "strokes";

    /// Primary key column of each table the sync layer writes.
    pub fn primary_key(table: &str) -> Option<&'static str> {
        match table {
            MESSAGES => Some("id"),
            PRESENCE | SCORES => Some("user_id"),
            SYNC_STATE => Some("key"),
            _ => None,
        }
    }
}

/// Row-store errors.
#[derive(Debug, Clone, PartialEq)]
pub enum StoreError {
    /// Transport failure, the request may not have reached the backend.
    Network(String),
    /// `select_one` matched no row.
    NotFound { table: String },
    /// Unique or primary key violation.
    Conflict(String),
    /// The backend answered with an error status.
    Rejected { status: u16, message: String },
    SerializationError(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::Network(e) => write!(f, "Network error: {e}"),
            StoreError::NotFound { table } => write!(f, "No matching row in {table}"),
            StoreError::Conflict(e) => write!(f, "Conflict: {e}"),
            StoreError::Rejected { status, message } => {
                write!(f, "Rejected by backend ({status}): {message}")
            }
            StoreError::SerializationError(e) => write!(f, "Serialization error: {e}"),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::SerializationError(e.to_string())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    Eq(String, Value),
    Gte(String, Value),
    NotNull(String),
    IsNull(String),
}

impl Condition {
    fn matches(&self, row: &Value) -> bool {
        match self {
            Condition::Eq(column, value) => row.get(column) == Some(value),
            Condition::Gte(column, value) => row
                .get(column)
                .map(|v| compare_values(v, value) != Ordering::Less)
                .unwrap_or(false),
            Condition::NotNull(column) => row.get(column).map(|v| !v.is_null()).unwrap_or(false),
            Condition::IsNull(column) => row.get(column).map(Value::is_null).unwrap_or(true),
        }
    }
}

/// Conjunction of column conditions.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Filter {
    conditions: Vec<Condition>,
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn eq(mut self, column: &str, value: impl Into<Value>) -> Self {
        self.conditions.push(Condition::Eq(column.to_string(), value.into()));
        self
    }

    pub fn gte(mut self, column: &str, value: impl Into<Value>) -> Self {
        self.conditions.push(Condition::Gte(column.to_string(), value.into()));
        self
    }

    pub fn not_null(mut self, column: &str) -> Self {
        self.conditions.push(Condition::NotNull(column.to_string()));
        self
    }

    /// Matches rows where `column` is null or absent.
    pub fn is_null(mut self, column: &str) -> Self {
        self.conditions.push(Condition::IsNull(column.to_string()));
        self
    }

    pub fn conditions(&self) -> &[Condition] {
        &self.conditions
    }

    pub fn is_empty(&self) -> bool {
        self.conditions.is_empty()
    }

    pub fn matches(&self, row: &Value) -> bool {
        self.conditions.iter().all(|c| c.matches(row))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Order {
    pub column: String,
    pub ascending: bool,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Query {
    pub filter: Filter,
    pub order: Option<Order>,
    pub limit: Option<usize>,
}

impl Query {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn filter(mut self, filter: Filter) -> Self {
        self.filter = filter;
        self
    }

    pub fn order_by(mut self, column: &str, ascending: bool) -> Self {
        self.order = Some(Order { column: column.to_string(), ascending });
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Apply filter, order and limit to an in-memory row set.
    pub fn apply(&self, rows: &[Value]) -> Vec<Value> {
        let mut selected: Vec<Value> = rows.iter().filter(|r| self.filter.matches(r)).cloned().collect();
        if let Some(order) = &self.order {
            selected.sort_by(|a, b| {
                let ord = compare_values(
                    a.get(&order.column).unwrap_or(&Value::Null),
                    b.get(&order.column).unwrap_or(&Value::Null),
                );
                if order.ascending { ord } else { ord.reverse() }
            });
        }
        if let Some(limit) = self.limit {
            selected.truncate(limit);
        }
        selected
    }
}

/// Total order over JSON scalars: null < bool < number < string; other
/// kinds compare equal.
fn compare_values(a: &Value, b: &Value) -> Ordering {
    fn rank(v: &Value) -> u8 {
        match v {
            Value::Null => 0,
            Value::Bool(_) => 1,
            Value::Number(_) => 2,
            Value::String(_) => 3,
            _ => 4,
        }
    }
    match (a, b) {
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        (Value::Number(x), Value::Number(y)) => {
            match (x.as_i64(), y.as_i64()) {
                (Some(x), Some(y)) => x.cmp(&y),
                _ => x
                    .as_f64()
                    .partial_cmp(&y.as_f64())
                    .unwrap_or(Ordering::Equal),
            }
        }
        (Value::String(x), Value::String(y)) => x.cmp(y),
        _ => rank(a).cmp(&rank(b)),
    }
}

/// The table operations the sync layer needs from the backend.
#[async_trait]
pub trait RowStore: Send + Sync {
    async fn insert(&self, table: &str, rows: Vec<Value>) -> Result<(), StoreError>;

    /// Patch every row matching `filter`, returning how many were changed.
    async fn update(&self, table: &str, patch: Value, filter: &Filter) -> Result<usize, StoreError>;

    /// Insert or merge into the row whose `conflict_key` column matches.
    async fn upsert(&self, table: &str, row: Value, conflict_key: &str) -> Result<(), StoreError>;

    async fn select(&self, table: &str, query: &Query) -> Result<Vec<Value>, StoreError>;

    /// Exactly one row, or [`StoreError::NotFound`].
    async fn select_one(&self, table: &str, filter: &Filter) -> Result<Value, StoreError>;

    async fn delete(&self, table: &str, filter: &Filter) -> Result<usize, StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_filter_matches() {
        let row = json!({ "user_id": "Anvi", "score": 3, "note": null });
        assert!(Filter::new().eq("user_id", "Anvi").matches(&row));
        assert!(!Filter::new().eq("user_id", "Zxhan").matches(&row));
        assert!(Filter::new().gte("score", 3).matches(&row));
        assert!(!Filter::new().gte("score", 4).matches(&row));
        assert!(Filter::new().not_null("score").matches(&row));
        assert!(!Filter::new().not_null("note").matches(&row));
        assert!(!Filter::new().not_null("missing").matches(&row));
        assert!(Filter::new().is_null("note").matches(&row));
        assert!(Filter::new().is_null("missing").matches(&row));
        assert!(!Filter::new().is_null("score").matches(&row));
        assert!(Filter::new().matches(&row));
    }

    #[test]
    fn test_query_order_and_limit() {
        let rows = vec![
            json!({ "timestamp": 3 }),
            json!({ "timestamp": 1 }),
            json!({ "timestamp": 2 }),
        ];
        let asc = Query::new().order_by("timestamp", true).limit(2).apply(&rows);
        assert_eq!(asc, vec![json!({ "timestamp": 1 }), json!({ "timestamp": 2 })]);
        let desc = Query::new().order_by("timestamp", false).apply(&rows);
        assert_eq!(desc[0], json!({ "timestamp": 3 }));
    }

    #[test]
    fn test_primary_keys() {
        assert_eq!(tables::primary_key(tables::MESSAGES), Some("id"));
        assert_eq!(tables::primary_key(tables::SYNC_STATE), Some("key"));
        assert_eq!(tables::primary_key(tables::STROKES), None);
    }

    #[test]
    fn test_store_error_display() {
        let err = StoreError::Rejected { status: 401, message: "bad key".into() };
        assert_eq!(err.to_string(), "Rejected by backend (401): bad key");
    }
}
