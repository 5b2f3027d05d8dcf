use clap::{Arg, ArgAction, Command};
use log::{info, warn};
use preview_sync::config::{Config, DEFAULT_GATEWAY_URL, app_name, version};
use preview_sync::connection::ConnectionRegistry;
use preview_sync::gateway::StatusFeed;
use preview_sync::heartbeat::HeartbeatScheduler;
use preview_sync::sync::{SourceDescriptor, SourceKind, SourceSyncController, SyncSnapshot};
use preview_sync::types::{ProfileId, SourceId};
use std::sync::Arc;
use std::time::Duration;
use std::{panic, process};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

const SUMMARY_INTERVAL: Duration = Duration::from_secs(30);

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let matches = Command::new(app_name())
        .version(version())
        .author(env!("CARGO_PKG_AUTHORS"))
        .about(env!("CARGO_PKG_DESCRIPTION"))
        .arg(
            Arg::new("gateway")
                .short('g')
                .long("gateway")
                .value_name("URL")
                .help("Base url of the local media gateway.")
                .default_value(DEFAULT_GATEWAY_URL),
        )
        .arg(
            Arg::new("profile")
                .short('p')
                .long("profile")
                .value_name("PROFILE")
                .help("Active profile; without one no preview is started."),
        )
        .arg(
            Arg::new("source")
                .short('s')
                .long("source")
                .value_name("ID[:KIND]")
                .help("Source attached to the profile, e.g. cam1:video_device.")
                .action(ArgAction::Append),
        )
        .arg(
            Arg::new("ice-server")
                .long("ice-server")
                .value_name("URL")
                .help("STUN/TURN server for the offer/answer transport.")
                .action(ArgAction::Append),
        )
        .arg(
            Arg::new("ice-timeout")
                .long("ice-timeout")
                .value_name("MS")
                .help("Ceiling on the ICE gathering wait, in milliseconds.")
                .value_parser(clap::value_parser!(u64)),
        )
        .get_matches();

    let mut config = Config::new(
        matches
            .get_one::<String>("gateway")
            .map(String::as_str)
            .unwrap_or(DEFAULT_GATEWAY_URL),
    );
    if let Some(servers) = matches.get_many::<String>("ice-server") {
        config.ice_servers = servers.cloned().collect();
    }
    if let Some(ms) = matches.get_one::<u64>("ice-timeout") {
        config.ice_gathering_timeout = Duration::from_millis(*ms);
    }

    let sources: Vec<SourceDescriptor> = matches
        .get_many::<String>("source")
        .map(|values| values.map(|value| parse_source(value)).collect())
        .unwrap_or_default();
    let profile = matches.get_one::<String>("profile").map(ProfileId::new);
    let snapshot = SyncSnapshot::from_sources(profile, &sources);

    // kill the process as soon as a worker thread panics
    let orig_hook = panic::take_hook();
    panic::set_hook(Box::new(move |panic_info| {
        orig_hook(panic_info);
        process::exit(105);
    }));

    let shutdown = CancellationToken::new();
    let on_signal = shutdown.clone();
    ctrlc::set_handler(move || {
        on_signal.cancel();
    })?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    runtime.block_on(run(config, snapshot, shutdown))
}

async fn run(config: Config, snapshot: SyncSnapshot, shutdown: CancellationToken) -> anyhow::Result<()> {
    info!("{} v{} using gateway {}", app_name(), version(), config.gateway_url);

    let registry = Arc::new(ConnectionRegistry::from_config(&config)?);
    let feed = StatusFeed::initialize(
        config.events_url(),
        Arc::clone(registry.availability()),
        config.feed_max_backoff,
    );

    let heartbeat = HeartbeatScheduler::new(config.heartbeat_tick);
    let summary = {
        let registry = Arc::clone(&registry);
        heartbeat.register("status-summary", SUMMARY_INTERVAL, move || {
            let registry = Arc::clone(&registry);
            async move {
                log_summary(&registry);
                Ok(())
            }
        })
    };

    if snapshot.required.is_empty() {
        warn!("No source needs a preview, waiting for Ctrl-C");
    }

    let controller = SourceSyncController::new(registry.clone());
    let (_snapshots, rx) = watch::channel(snapshot);
    controller.run(rx, shutdown).await;

    summary.unsubscribe();
    feed.dispose().await;
    info!("Bye");
    Ok(())
}

fn log_summary(registry: &ConnectionRegistry) {
    let counts = registry.state_counts();
    if counts.is_empty() {
        info!("No active previews (gateway {:?})", registry.availability().cached_status());
        return;
    }

    let states: Vec<String> = counts
        .iter()
        .map(|(state, count)| format!("{}={}", state, count))
        .collect();
    info!("{} preview(s): {}", registry.len(), states.join(", "));
}

/// `id` or `id:kind`; a suffix that isn't a known kind stays part of the id
fn parse_source(value: &str) -> SourceDescriptor {
    if let Some((id, kind)) = value.rsplit_once(':') {
        if let Ok(kind) = kind.parse::<SourceKind>() {
            return SourceDescriptor::new(SourceId::from(id), kind);
        }
    }
    SourceDescriptor::new(SourceId::from(value), SourceKind::VideoDevice)
}
