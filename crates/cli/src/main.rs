//! Binary entry point: flag parsing, tracing/metrics init, and wiring of
//! the watcher, sync workers, process supervisor and telemetry collector.

#![forbid(unsafe_code)]

use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use kube::Client;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use onion_core::{ObjectKey, Settings};
use onion_daemon::{DaemonConfig, Supervisor};
use onion_kubehub::{run_watcher, DesiredCache, KubeStatusWriter};
use onion_queue::WorkQueue;
use onion_sync::{Controller, StatusReporter, Syncer};
use onion_telemetry::{Collector, ControlAddr};

#[derive(Parser, Debug)]
#[command(name = "onion-local-manager", version, about = "Keeps a local tor daemon in sync with one OnionService")]
struct Cli {
    /// Namespace of the OnionService to manage
    #[arg(long)]
    namespace: String,

    /// Name of the OnionService to manage
    #[arg(long)]
    name: String,

    /// Path of the managed tor config file
    #[arg(long, default_value = "/run/tor/torfile")]
    config_path: PathBuf,

    /// Hidden service directory (tor writes `hostname` here)
    #[arg(long, default_value = "/run/tor/service")]
    service_dir: PathBuf,

    /// Private key file referenced by the rendered config
    #[arg(long, default_value = "/run/tor/private_key")]
    private_key_path: PathBuf,

    /// Daemon binary to supervise
    #[arg(long, default_value = "tor")]
    tor_binary: PathBuf,

    /// Concurrent sync workers
    #[arg(long, default_value_t = 1)]
    workers: usize,

    /// Control socket path for telemetry scraping
    #[arg(long, conflicts_with = "control_port")]
    control_socket: Option<PathBuf>,

    /// Control TCP address (host:port) for telemetry scraping
    #[arg(long)]
    control_port: Option<String>,

    /// Seconds between telemetry scrapes
    #[arg(long, default_value_t = 30)]
    scrape_interval_secs: u64,
}

fn init_tracing() {
    let env = std::env::var("ONION_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("ONION_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            warn!(addr = %addr, "invalid ONION_METRICS_ADDR; expected host:port");
        }
    }
}

fn spawn_signal_handler(cancel: CancellationToken) {
    tokio::spawn(async move {
        use tokio::signal::unix::{signal, SignalKind};
        let mut term = match signal(SignalKind::terminate()) {
            Ok(s) => s,
            Err(e) => {
                error!(error = %e, "cannot install SIGTERM handler");
                cancel.cancel();
                return;
            }
        };
        let mut hup = match signal(SignalKind::hangup()) {
            Ok(s) => s,
            Err(e) => {
                error!(error = %e, "cannot install SIGHUP handler");
                cancel.cancel();
                return;
            }
        };
        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    info!("received SIGINT");
                    break;
                }
                _ = term.recv() => {
                    info!("received SIGTERM");
                    break;
                }
                _ = hup.recv() => {
                    // Daemon reloads are driven by the sync loop, not by
                    // signalling the manager.
                    info!("received SIGHUP; ignoring");
                }
            }
        }
        cancel.cancel();
    });
}

fn control_addr(cli: &Cli) -> Option<ControlAddr> {
    match (&cli.control_socket, &cli.control_port) {
        (Some(path), _) => Some(ControlAddr::Unix(path.clone())),
        (None, Some(addr)) => Some(ControlAddr::Tcp(addr.clone())),
        (None, None) => None,
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Flag errors must exit before any listener or subscriber is armed.
    let cli = Cli::parse();
    init_tracing();
    init_metrics();

    let settings = Settings {
        config_path: cli.config_path.clone(),
        service_dir: cli.service_dir.clone(),
        private_key_path: cli.private_key_path.clone(),
        tor_binary: cli.tor_binary.clone(),
        workers: cli.workers.max(1),
        ..Settings::default()
    };
    let key = ObjectKey::new(&cli.namespace, &cli.name);

    // The daemon drops hostname and key material in here; keep it
    // owner-only. The dir may not exist yet on first start.
    {
        use std::os::unix::fs::PermissionsExt;
        if let Err(e) = std::fs::set_permissions(
            settings.service_dir(),
            std::fs::Permissions::from_mode(0o700),
        ) {
            debug!(error = %e, dir = %settings.service_dir.display(), "could not restrict service dir");
        }
    }

    let client = Client::try_default().await.context("building kube client")?;

    let cancel = CancellationToken::new();
    spawn_signal_handler(cancel.clone());

    let cache = DesiredCache::new();
    let queue = WorkQueue::new();
    let supervisor = Supervisor::new(
        DaemonConfig {
            program: settings.tor_binary.clone(),
            config_path: settings.config_path.clone(),
            restart_delay: settings.restart_delay,
        },
        cancel.clone(),
    );

    let writer = KubeStatusWriter::new(client.clone(), &key.namespace);
    let reporter = StatusReporter::new(writer, settings.hostname_path());
    let syncer = Syncer::new(Arc::clone(&cache), Arc::clone(&supervisor), reporter, settings.clone());
    let controller = Arc::new(Controller::new(Arc::clone(&queue), syncer, settings.max_retries));

    let watcher = tokio::spawn(run_watcher(
        client,
        key.clone(),
        Arc::clone(&cache),
        Arc::clone(&queue),
        settings.settle_delay,
        cancel.clone(),
    ));

    // Shutdown order: cancellation stops the watcher and the supervised
    // process; draining the queue lets workers finish their current item.
    {
        let cancel = cancel.clone();
        let queue = Arc::clone(&queue);
        tokio::spawn(async move {
            cancel.cancelled().await;
            queue.shut_down();
        });
    }

    if let Some(addr) = control_addr(&cli) {
        let collector = Collector::new(addr, Duration::from_secs(cli.scrape_interval_secs.max(1)));
        tokio::spawn(collector.run(cancel.clone()));
    }

    let mut workers = Vec::with_capacity(settings.workers);
    for _ in 0..settings.workers {
        let controller = Arc::clone(&controller);
        workers.push(tokio::spawn(async move { controller.run_worker().await }));
    }

    info!(key = %key, workers = settings.workers, "local manager started");
    for worker in workers {
        let _ = worker.await;
    }
    let _ = watcher.await;
    info!("local manager stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn flag_definitions_are_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn control_endpoints_map_to_addr() {
        let cli = Cli::parse_from([
            "onion-local-manager",
            "--namespace",
            "tor",
            "--name",
            "svc",
            "--control-socket",
            "/run/tor/control",
        ]);
        assert!(matches!(control_addr(&cli), Some(ControlAddr::Unix(_))));

        let cli = Cli::parse_from(["onion-local-manager", "--namespace", "tor", "--name", "svc"]);
        assert!(control_addr(&cli).is_none());
    }
}
