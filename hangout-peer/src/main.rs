//! Headless hangout participant.
//!
//! Joins the shared channel as one identity, keeps presence alive, sends
//! every stdin line as a chat message and logs whatever arrives.
//!
//! ```text
//! HANGOUT_BACKEND_URL=https://x.supabase.co HANGOUT_BACKEND_KEY=... \
//!     RUST_LOG=info hangout-peer Anvi --data-dir ./state
//! ```
//!
//! Lines starting with `/` are commands: `/shake`, `/missyou`,
//! `/theme #rrggbb`, `/away`, `/back`, `/inbox`, `/flush`.

use hangout_core::{ChatMessage, Identity, MissYouKind, ThemeState, Topic, TopicEvent};
use hangout_sync::{
    LocalStoreConfig, NetworkMonitor, PhoenixTransport, RestStore, RocksLocalStore, SyncConfig,
    SyncService,
};
use clap::Parser;
use log::info;
use reqwest::Url;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};

#[derive(Parser)]
#[command(name = "hangout-peer")]
#[command(about = "Headless hangout participant")]
struct Args {
    /// Who this peer speaks as (Zxhan or Anvi)
    #[arg(env = "HANGOUT_IDENTITY")]
    identity: Identity,

    /// Directory for the local durable store
    #[arg(short, long, env = "HANGOUT_DATA_DIR", default_value = "hangout_local")]
    data_dir: PathBuf,

    /// Seconds between backend reachability probes
    #[arg(short, long, default_value_t = 15)]
    probe_secs: u64,
}

/// `host:port` of the backend, for the reachability probe.
fn probe_addr(url: &str) -> Option<String> {
    let url = Url::parse(url).ok()?;
    let host = url.host_str()?;
    let port = url.port_or_known_default()?;
    Some(format!("{host}:{port}"))
}

async fn handle_line(sync: &SyncService, me: Identity, line: &str) {
    let mut parts = line.splitn(2, ' ');
    match (parts.next().unwrap_or_default(), parts.next()) {
        ("/shake", _) => {
            if let Err(e) = sync.send_miss_you(me, MissYouKind::Shake).await {
                log::warn!("{e}");
            }
        }
        ("/missyou", _) => {
            if let Err(e) = sync.send_miss_you(me, MissYouKind::MissYou).await {
                log::warn!("{e}");
            }
        }
        ("/theme", Some(accent)) => {
            let event = TopicEvent::Theme(ThemeState { accent: accent.trim().to_string() });
            if let Err(e) = sync.publish(&event).await {
                log::warn!("{e}");
            }
        }
        ("/away", _) => sync.update_presence(me, hangout_core::PresenceStatus::Away).await,
        ("/back", _) => sync.update_presence(me, hangout_core::PresenceStatus::Online).await,
        ("/inbox", _) => {
            for n in sync.fetch_notifications(me).await {
                info!("[{}] {}", n.timestamp, n.kind);
            }
        }
        ("/flush", _) => {
            let report = sync.process_offline_queue().await;
            info!("Delivered {}, still pending {}", report.delivered, report.requeued);
        }
        (command, _) if command.starts_with('/') => log::warn!("Unknown command {command}"),
        _ => {
            let message = ChatMessage::text(me, line);
            let outcome = sync.save_message(&message).await;
            info!("Message {} {:?}", message.id, outcome);
        }
    }
}

#[tokio::main]
async fn main() {
    env_logger::init();

    let args = Args::parse();
    let me = args.identity;
    info!("Starting hangout peer as {me}...");

    let config = SyncConfig::from_env();
    if config.is_placeholder() {
        log::warn!("Backend is not configured, everything will queue locally");
    }

    let local = match RocksLocalStore::open(LocalStoreConfig {
        path: args.data_dir.join(me.as_str()),
        ..LocalStoreConfig::default()
    }) {
        Ok(local) => local,
        Err(e) => {
            log::error!("Cannot open local store: {e}");
            std::process::exit(1);
        }
    };

    let network = NetworkMonitor::new(true);
    let probe = probe_addr(&config.backend_url)
        .map(|addr| network.spawn_tcp_probe(addr, Duration::from_secs(args.probe_secs)));

    let sync = SyncService::new(
        config.clone(),
        Arc::new(RestStore::from_config(&config)),
        Arc::new(PhoenixTransport::from_config(&config, me.as_str())),
        Arc::new(local),
        network,
    );

    for topic in Topic::ALL {
        sync.subscribe(topic, move |event| info!("<- {}: {:?}", event.topic(), event));
    }
    sync.subscribe_messages(move |kind, message| {
        if message.sender != me {
            info!("<- message {:?} from {}: {}", kind, message.sender, message.content.as_deref().unwrap_or("[media]"));
        }
    });

    sync.start().await;
    for message in sync.fetch_messages().await {
        info!("{}: {}", message.sender, message.content.as_deref().unwrap_or("[media]"));
    }
    let heartbeat = sync.start_heartbeat(me);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => match line {
                Ok(Some(line)) if !line.trim().is_empty() => handle_line(&sync, me, line.trim()).await,
                Ok(Some(_)) => {}
                Ok(None) => break,
                Err(e) => {
                    log::error!("stdin: {e}");
                    break;
                }
            },
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    info!("Shutting down...");
    heartbeat.stop().await;
    sync.shutdown().await;
    if let Some(probe) = probe {
        probe.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_probe_addr() {
        assert_eq!(probe_addr("https://abc.supabase.co"), Some("abc.supabase.co:443".into()));
        assert_eq!(probe_addr("http://127.0.0.1:54321/"), Some("127.0.0.1:54321".into()));
        assert_eq!(probe_addr("ws://localhost/realtime"), Some("localhost:80".into()));
        assert_eq!(probe_addr("not a url"), None);
    }

    #[test]
    fn test_args_parse() {
        let args = Args::try_parse_from(["hangout-peer", "Anvi", "--data-dir", "/tmp/h", "-p", "5"]).unwrap();
        assert_eq!(args.identity, Identity::Anvi);
        assert_eq!(args.data_dir, PathBuf::from("/tmp/h"));
        assert_eq!(args.probe_secs, 5);
    }

    #[test]
    fn test_args_reject_unknown_identity() {
        assert!(Args::try_parse_from(["hangout-peer", "Mallory"]).is_err());
    }
}
