//! Online/offline signal.
//!
//! The sync layer never probes the network itself on the hot path; it asks
//! the [`NetworkMonitor`]. Whoever owns the process (the peer binary, a UI
//! shell, a test) feeds it, either directly or through
//! [`NetworkMonitor::spawn_tcp_probe`].

use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::task::JoinHandle;

#[derive(Clone)]
pub struct NetworkMonitor {
    state: Arc<watch::Sender<bool>>,
}

impl NetworkMonitor {
    pub fn new(online: bool) -> Self {
        let (state, _) = watch::channel(online);
        Self { state: Arc::new(state) }
    }

    pub fn is_online(&self) -> bool {
        *self.state.borrow()
    }

    /// Record connectivity. Watchers are only woken on an actual transition.
    pub fn set_online(&self, online: bool) {
        let changed = self.state.send_if_modified(|current| {
            if *current == online {
                false
            } else {
                *current = online;
                true
            }
        });
        if changed {
            log::info!("Network is {}", if online { "online" } else { "offline" });
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.state.subscribe()
    }

    /// Periodically try a TCP connect to `addr` (`host:port`) and record the
    /// outcome.
    pub fn spawn_tcp_probe(&self, addr: String, every: Duration) -> JoinHandle<()> {
        let monitor = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            loop {
                ticker.tick().await;
                let reachable = matches!(
                    tokio::time::timeout(every, TcpStream::connect(&addr)).await,
                    Ok(Ok(_))
                );
                monitor.set_online(reachable);
            }
        })
    }
}

impl Default for NetworkMonitor {
    fn default() -> Self {
        Self::new(true)
    }
}
