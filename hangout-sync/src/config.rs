//! Sync layer configuration.
//!
//! Every timing constant the sync layer depends on lives here so it can be
//! tuned without touching code. `Default` is the production profile,
//! `for_testing()` shrinks timers so tests run quickly.

use std::time::Duration;

/// Endpoint used when `HANGOUT_BACKEND_URL` is not set.
pub const PLACEHOLDER_URL: &str = "https://your-project-url.supabase.co";
/// Credential used when `HANGOUT_BACKEND_KEY` is not set.
pub const PLACEHOLDER_KEY: &str = "your-anon-key";

pub const ENV_BACKEND_URL: &str = "HANGOUT_BACKEND_URL";
pub const ENV_BACKEND_KEY: &str = "HANGOUT_BACKEND_KEY";

/// Reconnect backoff: `min(base * 2^(n-1), max)` for failed attempt `n`,
/// giving up after `max_attempts` consecutive failures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackoffConfig {
    pub base: Duration,
    pub max: Duration,
    pub max_attempts: u32,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(2),
            max: Duration::from_secs(30),
            max_attempts: 10,
        }
    }
}

impl BackoffConfig {
    pub fn for_testing() -> Self {
        Self {
            base: Duration::from_millis(10),
            max: Duration::from_millis(80),
            max_attempts: 4,
        }
    }

    /// Delay before retrying after the `attempt`-th consecutive failure.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let shift = (attempt - 1).min(31);
        self.base
            .checked_mul(1u32 << shift)
            .map_or(self.max, |d| d.min(self.max))
    }
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Backend project URL (`https://<project>.supabase.co`).
    pub backend_url: String,
    /// Anonymous access key sent with every request.
    pub backend_key: String,
    /// Name of the shared realtime channel.
    pub channel_name: String,
    /// Local store key holding the persisted offline queue.
    pub queue_key: String,
    /// Maximum number of queued sends.
    pub queue_capacity: usize,
    /// How long strokes are buffered before one batch insert.
    pub stroke_flush_interval: Duration,
    /// Presence heartbeat period.
    pub heartbeat_interval: Duration,
    /// Periodic queue drain, in addition to reconnect and back-online triggers.
    pub queue_retry_interval: Option<Duration>,
    /// Websocket keepalive period.
    pub socket_heartbeat_interval: Duration,
    pub message_fetch_limit: usize,
    /// Compare-and-swap attempts before a score update is abandoned.
    pub score_cas_attempts: u32,
    pub backoff: BackoffConfig,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            backend_url: PLACEHOLDER_URL.to_string(),
            backend_key: PLACEHOLDER_KEY.to_string(),
            channel_name: "hangout_sync".to_string(),
            queue_key: "offline_queue".to_string(),
            queue_capacity: 10_000,
            stroke_flush_interval: Duration::from_millis(100),
            heartbeat_interval: Duration::from_secs(30),
            queue_retry_interval: None,
            socket_heartbeat_interval: Duration::from_secs(25),
            message_fetch_limit: 100,
            score_cas_attempts: 5,
            backoff: BackoffConfig::default(),
        }
    }
}

impl SyncConfig {
    /// Create config for testing (short timers, small queue).
    pub fn for_testing() -> Self {
        Self {
            backend_url: "http://127.0.0.1:54321".to_string(),
            backend_key: "test-key".to_string(),
            queue_capacity: 64,
            heartbeat_interval: Duration::from_millis(200),
            socket_heartbeat_interval: Duration::from_millis(200),
            backoff: BackoffConfig::for_testing(),
            ..Self::default()
        }
    }

    /// Read the backend endpoint and key from the process environment.
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Like [`from_env`](Self::from_env) with an injectable lookup.
    ///
    /// Missing values fall back to placeholders. Backend calls will then
    /// fail and be logged, the process keeps running.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();
        match lookup(ENV_BACKEND_URL).filter(|v| !v.trim().is_empty()) {
            Some(url) => config.backend_url = url.trim_end_matches('/').to_string(),
            None => log::warn!("{ENV_BACKEND_URL} not set, using placeholder {PLACEHOLDER_URL}"),
        }
        match lookup(ENV_BACKEND_KEY).filter(|v| !v.trim().is_empty()) {
            Some(key) => config.backend_key = key,
            None => log::warn!("{ENV_BACKEND_KEY} not set, backend calls will be rejected"),
        }
        config
    }

    pub fn is_placeholder(&self) -> bool {
        self.backend_url == PLACEHOLDER_URL || self.backend_key == PLACEHOLDER_KEY
    }

    /// PostgREST root, e.g. `https://x.supabase.co/rest/v1`.
    pub fn rest_url(&self) -> String {
        format!("{}/rest/v1", self.backend_url.trim_end_matches('/'))
    }

    /// Realtime websocket endpoint derived from the backend URL.
    pub fn realtime_url(&self) -> String {
        let base = self.backend_url.trim_end_matches('/');
        let ws_base = if let Some(rest) = base.strip_prefix("https://") {
            format!("wss://{rest}")
        } else if let Some(rest) = base.strip_prefix("http://") {
            format!("ws://{rest}")
        } else {
            base.to_string()
        };
        format!("{ws_base}/realtime/v1/websocket?apikey={}&vsn=1.0.0", self.backend_key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_sequence() {
        let backoff = BackoffConfig::default();
        let delays: Vec<u64> = (1..=6).map(|n| backoff.delay_for(n).as_secs()).collect();
        assert_eq!(delays, vec![2, 4, 8, 16, 30, 30]);
    }

    #[test]
    fn test_backoff_large_attempt_saturates() {
        let backoff = BackoffConfig::default();
        assert_eq!(backoff.delay_for(200), backoff.max);
        assert_eq!(backoff.delay_for(0), Duration::ZERO);
    }

    #[test]
    fn test_config_default() {
        let config = SyncConfig::default();
        assert_eq!(config.channel_name, "hangout_sync");
        assert_eq!(config.queue_key, "offline_queue");
        assert_eq!(config.stroke_flush_interval, Duration::from_millis(100));
        assert_eq!(config.message_fetch_limit, 100);
        assert!(config.is_placeholder());
    }

    #[test]
    fn test_from_lookup_reads_values() {
        let config = SyncConfig::from_lookup(|name| match name {
            ENV_BACKEND_URL => Some("https://abc.supabase.co/".to_string()),
            ENV_BACKEND_KEY => Some("k".to_string()),
            _ => None,
        });
        assert_eq!(config.backend_url, "https://abc.supabase.co");
        assert_eq!(config.rest_url(), "https://abc.supabase.co/rest/v1");
        assert_eq!(
            config.realtime_url(),
            "wss://abc.supabase.co/realtime/v1/websocket?apikey=k&vsn=1.0.0"
        );
        assert!(!config.is_placeholder());
    }

    #[test]
    fn test_from_lookup_falls_back() {
        let config = SyncConfig::from_lookup(|_| None);
        assert_eq!(config.backend_url, PLACEHOLDER_URL);
        assert_eq!(config.backend_key, PLACEHOLDER_KEY);
    }

    #[test]
    fn test_http_maps_to_ws() {
        let config = SyncConfig::for_testing();
        assert!(config.realtime_url().starts_with("ws://127.0.0.1:54321/realtime/v1/websocket"));
    }
}
