//! Stroke batching buffer.
//!
//! Drawing produces many tiny segments per second. Instead of one insert per
//! segment they are collected for `stroke_flush_interval` and written as a
//! single batch:
//!
//! ```text
//!  push(draw) ─► [ s1 s2 s3 ... ] ──(timer fires)──► insert strokes [s1..sn]
//!  push(clear) ─► buffer discarded, timer cancelled, delete all strokes
//! ```
//!
//! There is one buffer per service and every caller goes through it, so
//! flush order is append order.

use hangout_core::{DrawingAction, StrokeRecord};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::backend::{tables, Filter, RowStore};
use crate::connectivity::NetworkMonitor;

#[derive(Default)]
struct BufferState {
    pending: Vec<StrokeRecord>,
    timer: Option<JoinHandle<()>>,
}

#[derive(Clone)]
pub struct StrokeBuffer {
    state: Arc<Mutex<BufferState>>,
    store: Arc<dyn RowStore>,
    network: NetworkMonitor,
    interval: Duration,
}

impl StrokeBuffer {
    pub fn new(store: Arc<dyn RowStore>, network: NetworkMonitor, interval: Duration) -> Self {
        Self {
            state: Arc::new(Mutex::new(BufferState::default())),
            store,
            network,
            interval,
        }
    }

    pub async fn push(&self, action: DrawingAction) {
        if matches!(action, DrawingAction::Clear { .. }) {
            self.clear().await;
            return;
        }
        let record = StrokeRecord::from_action(action, hangout_core::now_millis());
        let mut state = self.state.lock().await;
        state.pending.push(record);
        if state.timer.is_none() {
            let buffer = self.clone();
            state.timer = Some(tokio::spawn(async move {
                tokio::time::sleep(buffer.interval).await;
                buffer.flush().await;
            }));
        }
    }

    /// Drop buffered strokes and delete every persisted one.
    pub async fn clear(&self) {
        {
            let mut state = self.state.lock().await;
            let discarded = state.pending.len();
            state.pending.clear();
            if let Some(timer) = state.timer.take() {
                timer.abort();
            }
            if discarded > 0 {
                log::debug!("Discarded {discarded} unflushed strokes");
            }
        }
        if let Err(e) = self
            .store
            .delete(tables::STROKES, &Filter::new().not_null("timestamp"))
            .await
        {
            log::warn!("Failed to clear strokes: {e}");
        }
    }

    /// Write out whatever is buffered now, cancelling the timer.
    pub async fn flush_now(&self) {
        if let Some(timer) = self.state.lock().await.timer.take() {
            timer.abort();
        }
        self.flush().await;
    }

    pub async fn pending_len(&self) -> usize {
        self.state.lock().await.pending.len()
    }

    async fn flush(&self) {
        let batch = {
            let mut state = self.state.lock().await;
            state.timer = None;
            std::mem::take(&mut state.pending)
        };
        if batch.is_empty() {
            return;
        }
        if !self.network.is_online() {
            log::debug!("Offline, dropping {} strokes", batch.len());
            return;
        }
        let rows: Vec<serde_json::Value> = match batch.iter().map(serde_json::to_value).collect() {
            Ok(rows) => rows,
            Err(e) => {
                log::warn!("Could not encode strokes: {e}");
                return;
            }
        };
        let count = rows.len();
        if let Err(e) = self.store.insert(tables::STROKES, rows).await {
            log::warn!("Failed to save {count} strokes: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{MemoryBackend, Operation};
    use hangout_core::Identity;

    fn draw(x: f64) -> DrawingAction {
        DrawingAction::Draw {
            user: Identity::Zxhan,
            x,
            y: 0.5,
            last_x: 0.0,
            last_y: 0.0,
            color: "#fff".into(),
            size: 3.0,
            tool: "pen".into(),
        }
    }

    fn buffer(backend: &Arc<MemoryBackend>, online: bool) -> StrokeBuffer {
        StrokeBuffer::new(backend.clone(), NetworkMonitor::new(online), Duration::from_millis(100))
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_batch_for_burst() {
        let backend = Arc::new(MemoryBackend::new());
        let strokes = buffer(&backend, true);
        for i in 0..5 {
            strokes.push(draw(i as f64 / 10.0)).await;
        }
        tokio::time::sleep(Duration::from_millis(150)).await;
        let inserts = backend.calls_to(Operation::Insert, "strokes").await;
        assert_eq!(inserts.len(), 1);
        assert_eq!(inserts[0].rows.len(), 5);
        assert_eq!(inserts[0].rows[4]["payload"]["x"], 0.4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_clear_discards_buffer() {
        let backend = Arc::new(MemoryBackend::new());
        let strokes = buffer(&backend, true);
        strokes.push(draw(0.1)).await;
        strokes.push(draw(0.2)).await;
        strokes.push(DrawingAction::Clear { user: Identity::Anvi }).await;
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(backend.calls_to(Operation::Insert, "strokes").await.is_empty());
        assert_eq!(backend.calls_to(Operation::Delete, "strokes").await.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_offline_flush_drops_batch() {
        let backend = Arc::new(MemoryBackend::new());
        let strokes = buffer(&backend, false);
        strokes.push(draw(0.1)).await;
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(backend.calls().await.is_empty());
        assert_eq!(strokes.pending_len().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_flush_now() {
        let backend = Arc::new(MemoryBackend::new());
        let strokes = buffer(&backend, true);
        strokes.push(draw(0.1)).await;
        strokes.flush_now().await;
        assert_eq!(backend.rows("strokes").await.len(), 1);
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(backend.calls_to(Operation::Insert, "strokes").await.len(), 1);
    }
}
