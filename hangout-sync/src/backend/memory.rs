//! In-process row store.
//!
//! Behaves like the hosted tables closely enough for the sync layer:
//! primary keys are enforced, upserts merge, and every write is mirrored as
//! a [`RowChange`] onto an optional [`MemoryHub`] just like the backend's
//! change feed. Tests can take the store offline, fail individual calls,
//! reject specific rows, add latency, and inspect every call made.

use async_trait::async_trait;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;

use super::{tables, Filter, Query, RowStore, StoreError};
use crate::channel::{MemoryHub, RowChange, RowChangeKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Insert,
    Update,
    Upsert,
    Select,
    SelectOne,
    Delete,
}

/// One recorded call against the store.
#[derive(Debug, Clone, PartialEq)]
pub struct BackendCall {
    pub op: Operation,
    pub table: String,
    /// Rows sent by inserts and upserts, the patch for updates.
    pub rows: Vec<Value>,
}

#[derive(Default)]
struct Tables {
    rows: HashMap<String, Vec<Value>>,
    calls: Vec<BackendCall>,
    fail_next: usize,
    rejections: Vec<(String, Filter)>,
}

pub struct MemoryBackend {
    state: Mutex<Tables>,
    reachable: AtomicBool,
    latency_ms: AtomicU64,
    feed: Option<MemoryHub>,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(Tables::default()),
            reachable: AtomicBool::new(true),
            latency_ms: AtomicU64::new(0),
            feed: None,
        }
    }

    /// Mirror every write onto `hub` as a row change.
    pub fn with_change_feed(mut self, hub: MemoryHub) -> Self {
        self.feed = Some(hub);
        self
    }

    // ─── Fault injection ──────────────────────────────────────────────

    /// While unreachable every call fails with [`StoreError::Network`].
    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    pub fn is_reachable(&self) -> bool {
        self.reachable.load(Ordering::SeqCst)
    }

    /// Fail the next `n` calls of any kind with a network error.
    pub async fn fail_next(&self, n: usize) {
        self.state.lock().await.fail_next = n;
    }

    /// Reject inserts into `table` of any row matching `filter`.
    pub async fn reject_rows(&self, table: &str, filter: Filter) {
        self.state.lock().await.rejections.push((table.to_string(), filter));
    }

    pub async fn clear_faults(&self) {
        let mut state = self.state.lock().await;
        state.fail_next = 0;
        state.rejections.clear();
        self.set_reachable(true);
    }

    /// Delay every call by `latency`.
    pub fn set_latency(&self, latency: Duration) {
        self.latency_ms.store(latency.as_millis() as u64, Ordering::SeqCst);
    }

    // ─── Inspection ───────────────────────────────────────────────────

    pub async fn rows(&self, table: &str) -> Vec<Value> {
        self.state.lock().await.rows.get(table).cloned().unwrap_or_default()
    }

    pub async fn calls(&self) -> Vec<BackendCall> {
        self.state.lock().await.calls.clone()
    }

    pub async fn calls_to(&self, op: Operation, table: &str) -> Vec<BackendCall> {
        self.state
            .lock()
            .await
            .calls
            .iter()
            .filter(|c| c.op == op && c.table == table)
            .cloned()
            .collect()
    }

    pub async fn clear_calls(&self) {
        self.state.lock().await.calls.clear();
    }

    /// Seed rows without recording a call or emitting changes.
    pub async fn seed(&self, table: &str, rows: Vec<Value>) {
        self.state
            .lock()
            .await
            .rows
            .entry(table.to_string())
            .or_default()
            .extend(rows);
    }

    // ─── Helpers ──────────────────────────────────────────────────────

    /// Record the call, wait out any latency, then apply network faults.
    async fn begin(&self, op: Operation, table: &str, rows: &[Value]) -> Result<(), StoreError> {
        self.state.lock().await.calls.push(BackendCall {
            op,
            table: table.to_string(),
            rows: rows.to_vec(),
        });
        let latency = self.latency_ms.load(Ordering::SeqCst);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }
        if !self.is_reachable() {
            return Err(StoreError::Network("backend unreachable".into()));
        }
        let mut state = self.state.lock().await;
        if state.fail_next > 0 {
            state.fail_next -= 1;
            return Err(StoreError::Network("injected failure".into()));
        }
        Ok(())
    }

    fn emit(&self, table: &str, kind: RowChangeKind, new: Option<Value>, old: Option<Value>) {
        if let Some(hub) = &self.feed {
            hub.emit_row_change(RowChange { table: table.to_string(), kind, new, old });
        }
    }
}

fn merge(target: &mut Value, patch: &Value) {
    if let (Value::Object(target), Value::Object(patch)) = (target, patch) {
        for (k, v) in patch {
            target.insert(k.clone(), v.clone());
        }
    }
}

fn as_object(row: &Value) -> Result<&Map<String, Value>, StoreError> {
    row.as_object()
        .ok_or_else(|| StoreError::SerializationError("row is not a JSON object".into()))
}

#[async_trait]
impl RowStore for MemoryBackend {
    async fn insert(&self, table: &str, rows: Vec<Value>) -> Result<(), StoreError> {
        self.begin(Operation::Insert, table, &rows).await?;
        let mut state = self.state.lock().await;

        for row in &rows {
            as_object(row)?;
            if state.rejections.iter().any(|(t, f)| t == table && f.matches(row)) {
                return Err(StoreError::Rejected { status: 400, message: "row rejected".into() });
            }
        }
        if let Some(pk) = tables::primary_key(table) {
            let existing = state.rows.get(table).map(Vec::as_slice).unwrap_or_default();
            for (i, row) in rows.iter().enumerate() {
                let key = row.get(pk);
                let clash = existing.iter().any(|r| r.get(pk) == key)
                    || rows[..i].iter().any(|r| r.get(pk) == key);
                if clash {
                    return Err(StoreError::Conflict(format!("duplicate {pk} in {table}")));
                }
            }
        }

        state.rows.entry(table.to_string()).or_default().extend(rows.iter().cloned());
        drop(state);
        for row in rows {
            self.emit(table, RowChangeKind::Insert, Some(row), None);
        }
        Ok(())
    }

    async fn update(&self, table: &str, patch: Value, filter: &Filter) -> Result<usize, StoreError> {
        self.begin(Operation::Update, table, std::slice::from_ref(&patch)).await?;
        as_object(&patch)?;
        let mut changes = Vec::new();
        {
            let mut state = self.state.lock().await;
            for row in state.rows.entry(table.to_string()).or_default().iter_mut() {
                if filter.matches(row) {
                    let old = row.clone();
                    merge(row, &patch);
                    changes.push((row.clone(), old));
                }
            }
        }
        let count = changes.len();
        for (new, old) in changes {
            self.emit(table, RowChangeKind::Update, Some(new), Some(old));
        }
        Ok(count)
    }

    async fn upsert(&self, table: &str, row: Value, conflict_key: &str) -> Result<(), StoreError> {
        self.begin(Operation::Upsert, table, std::slice::from_ref(&row)).await?;
        as_object(&row)?;
        let key = row.get(conflict_key).cloned().unwrap_or(Value::Null);
        let change = {
            let mut state = self.state.lock().await;
            let rows = state.rows.entry(table.to_string()).or_default();
            match rows.iter_mut().find(|r| r.get(conflict_key) == Some(&key)) {
                Some(existing) => {
                    let old = existing.clone();
                    merge(existing, &row);
                    (RowChangeKind::Update, existing.clone(), Some(old))
                }
                None => {
                    rows.push(row.clone());
                    (RowChangeKind::Insert, row, None)
                }
            }
        };
        self.emit(table, change.0, Some(change.1), change.2);
        Ok(())
    }

    async fn select(&self, table: &str, query: &Query) -> Result<Vec<Value>, StoreError> {
        self.begin(Operation::Select, table, &[]).await?;
        let state = self.state.lock().await;
        Ok(query.apply(state.rows.get(table).map(Vec::as_slice).unwrap_or_default()))
    }

    async fn select_one(&self, table: &str, filter: &Filter) -> Result<Value, StoreError> {
        self.begin(Operation::SelectOne, table, &[]).await?;
        let state = self.state.lock().await;
        let mut matching = state
            .rows
            .get(table)
            .into_iter()
            .flatten()
            .filter(|r| filter.matches(r));
        match (matching.next(), matching.next()) {
            (Some(row), None) => Ok(row.clone()),
            (None, _) => Err(StoreError::NotFound { table: table.to_string() }),
            (Some(_), Some(_)) => Err(StoreError::Rejected {
                status: 406,
                message: "more than one row matched".into(),
            }),
        }
    }

    async fn delete(&self, table: &str, filter: &Filter) -> Result<usize, StoreError> {
        self.begin(Operation::Delete, table, &[]).await?;
        let removed: Vec<Value> = {
            let mut state = self.state.lock().await;
            let rows = state.rows.entry(table.to_string()).or_default();
            let (gone, kept): (Vec<Value>, Vec<Value>) =
                rows.drain(..).partition(|r| filter.matches(r));
            *rows = kept;
            gone
        };
        let count = removed.len();
        for old in removed {
            self.emit(table, RowChangeKind::Delete, None, Some(old));
        }
        Ok(count)
    }
}
