//! Presence heartbeat.
//!
//! Keeps our presence row fresh while the app is open:
//!
//! ```text
//!  spawn ──► Online ──(every interval, while visible)──► Online ...
//!  hidden ──► Away        visible ──► Online        stop ──► Offline
//! ```

use hangout_core::{Identity, PresenceStatus};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

use crate::service::SyncService;

pub struct HeartbeatHandle {
    service: SyncService,
    identity: Identity,
    visible: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl HeartbeatHandle {
    pub(crate) fn spawn(service: SyncService, identity: Identity, every: Duration) -> Self {
        let (visible, mut visibility) = watch::channel(true);
        let sync = service.clone();
        let task = tokio::spawn(async move {
            sync.update_presence(identity, PresenceStatus::Online).await;
            let mut ticker = interval_at(Instant::now() + every, every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let visible = *visibility.borrow();
                        if visible {
                            sync.update_presence(identity, PresenceStatus::Online).await;
                        }
                    }
                    changed = visibility.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        let visible = *visibility.borrow_and_update();
                        let status = if visible {
                            PresenceStatus::Online
                        } else {
                            PresenceStatus::Away
                        };
                        sync.update_presence(identity, status).await;
                    }
                }
            }
        });
        log::debug!("Heartbeat started for {identity} every {every:?}");
        Self { service, identity, visible, task }
    }

    /// Report whether the app is in the foreground.
    pub fn set_visible(&self, visible: bool) {
        self.visible.send_if_modified(|current| {
            let changed = *current != visible;
            *current = visible;
            changed
        });
    }

    pub fn is_visible(&self) -> bool {
        *self.visible.borrow()
    }

    /// Stop beating and mark `identity` offline.
    pub async fn stop(self) {
        self.task.abort();
        self.service.update_presence(self.identity, PresenceStatus::Offline).await;
        log::debug!("Heartbeat stopped for {}", self.identity);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{MemoryBackend, Operation};
    use crate::channel::MemoryHub;
    use crate::config::SyncConfig;
    use crate::connectivity::NetworkMonitor;
    use crate::local::MemoryLocalStore;
    use std::sync::Arc;

    fn service(backend: &Arc<MemoryBackend>) -> SyncService {
        SyncService::new(
            SyncConfig::for_testing(),
            backend.clone(),
            Arc::new(MemoryHub::default()),
            Arc::new(MemoryLocalStore::new()),
            NetworkMonitor::new(true),
        )
    }

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_beats_while_visible() {
        let backend = Arc::new(MemoryBackend::new());
        let sync = service(&backend);
        let heartbeat = sync.start_heartbeat(Identity::Anvi);
        settle().await;
        assert!(sync.presence_view().is_online(Identity::Anvi));

        tokio::time::sleep(Duration::from_millis(450)).await;
        settle().await;
        // Immediate beat plus two ticks at 200ms and 400ms.
        assert_eq!(backend.calls_to(Operation::Upsert, "presence").await.len(), 3);
        heartbeat.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_hidden_is_away_then_stop_is_offline() {
        let backend = Arc::new(MemoryBackend::new());
        let sync = service(&backend);
        let heartbeat = sync.start_heartbeat(Identity::Zxhan);
        settle().await;

        heartbeat.set_visible(false);
        settle().await;
        let view = sync.presence_view();
        assert_eq!(view.get(Identity::Zxhan).map(|r| r.status), Some(PresenceStatus::Away));

        heartbeat.stop().await;
        let view = sync.presence_view();
        assert_eq!(view.get(Identity::Zxhan).map(|r| r.status), Some(PresenceStatus::Offline));
    }
}
