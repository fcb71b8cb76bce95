//! # hangout-sync: Realtime sync layer for the two-person hangout
//!
//! Multiplexes ephemeral broadcasts, backend persistence, offline queuing
//! and reconnection recovery for every feature (chat, presence, canvas,
//! games, music, theme) behind one [`SyncService`].
//!
//! ## Architecture
//!
//! ```text
//!                 ┌──────────────────────────────┐
//!  feature code ─►│ SyncService (error boundary) │
//!                 └──┬──────────┬─────────┬──────┘
//!                    │          │         │
//!          ┌─────────▼───┐ ┌────▼─────┐ ┌─▼────────────┐
//!          │ Realtime    │ │ RowStore │ │ DurableQueue │
//!          │ Channel     │ │ (REST /  │ │ + StrokeBuf  │
//!          │ (reconnect) │ │  memory) │ └──────┬───────┘
//!          └──────┬──────┘ └──────────┘        │
//!                 │                      ┌─────▼──────┐
//!     Phoenix websocket / MemoryHub      │ LocalStore │ (RocksDB + LZ4)
//!                                        └────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`config`]: service, backoff and endpoint configuration
//! - [`backend`]: row-store abstraction, PostgREST and in-memory stores
//! - [`channel`]: realtime channel, transports, reconnect state machine
//! - [`local`]: durable key/value store for client-side state
//! - [`queue`]: offline send queue
//! - [`strokes`]: stroke batching buffer
//! - [`connectivity`]: online/offline signal
//! - [`heartbeat`]: presence heartbeat
//! - [`service`]: the facade

pub mod config;
pub mod backend;
pub mod channel;
pub mod local;
pub mod queue;
pub mod strokes;
pub mod connectivity;
pub mod heartbeat;
pub mod service;

// Re-exports for convenience
pub use config::{BackoffConfig, SyncConfig};
pub use backend::{
    tables, BackendCall, Filter, MemoryBackend, Operation, Query, RestStore, RowStore, StoreError,
};
pub use channel::{
    ChannelError, ChannelEvent, ConnectionState, MemoryHub, PhoenixTransport, RealtimeChannel,
    RealtimeTransport, RowChange, RowChangeKind, Subscription,
};
pub use local::{LocalStore, LocalStoreConfig, LocalStoreError, MemoryLocalStore, RocksLocalStore};
pub use queue::{DurableQueue, EnqueueOutcome, OfflineQueue, QueueEntry};
pub use strokes::StrokeBuffer;
pub use connectivity::NetworkMonitor;
pub use heartbeat::HeartbeatHandle;
pub use service::{DrainReport, SendOutcome, SyncService};
