use anyhow::Context;
use clap::Parser;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod api;
mod config;
mod error;
mod files;
mod generation;
mod management;
mod mbuf;
mod module;
mod modules;
mod port;
mod resource;
mod ring;
mod shell;
mod snapshot;
mod stats;
mod tap;
#[cfg(test)]
mod testutil;
mod worker;

use config::{CliArgs, Config};
use generation::GenerationManager;
use mbuf::PacketPool;
use port::PortSet;
use snapshot::{ControlPorts, Slot, Snapshot};
use stats::StatsTable;
use worker::{RingSet, Worker, WorkerTable};

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let cli = CliArgs::parse();

    // Load config from file if provided, otherwise use defaults.
    let mut config = if let Some(ref config_path) = cli.config {
        Config::from_file(Path::new(config_path))?
    } else {
        Config::default()
    };
    config.merge_cli(&cli);
    config.validate()?;

    // Logging.
    if config.quiet {
        tracing_subscriber::registry()
            .with(tracing_subscriber::EnvFilter::new("error"))
            .with(tracing_subscriber::fmt::layer())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(tracing_subscriber::EnvFilter::new(
                std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
            ))
            .with(tracing_subscriber::fmt::layer())
            .init();
    }

    let shutdown = Arc::new(AtomicBool::new(false));
    {
        let shutdown = shutdown.clone();
        ctrlc::set_handler(move || {
            tracing::info!("signal received, stopping");
            shutdown.store(true, Ordering::Relaxed);
        })?;
    }

    // ── Dataplane setup ───────────────────────────────────────────────
    let (manager, workers) = build_dataplane(&config)?;
    let stats = Arc::new(StatsTable::new());

    if config.pin_cores {
        if let Some(mgmt) = workers.mgmt() {
            if let Err(e) = worker::pin_to_core(mgmt.lcore as usize) {
                tracing::warn!(lcore = mgmt.lcore, "failed to pin management core: {}", e);
            }
        }
    }

    // ── Worker cores ──────────────────────────────────────────────────
    let cores: Vec<_> = workers.packet_cores().cloned().collect();
    let ready = Arc::new(Barrier::new(cores.len() + 1));
    let mut handles = Vec::with_capacity(cores.len());
    for desc in cores {
        let lcore = desc.lcore;
        let core = Worker::new(
            desc,
            manager.registry().clone(),
            stats.clone(),
            shutdown.clone(),
            config.burst,
        );
        let manager = manager.clone();
        let ready = ready.clone();
        let pin = config.pin_cores;
        let handle = thread::Builder::new()
            .name(format!("lcore-{}", lcore))
            .spawn(move || {
                if pin {
                    if let Err(e) = worker::pin_to_core(lcore as usize) {
                        tracing::warn!(lcore, "failed to pin worker: {}", e);
                    }
                }
                core.run(&manager, &ready);
            })
            .with_context(|| format!("failed to launch lcore {}", lcore))?;
        handles.push(handle);
    }
    ready.wait();
    tracing::info!(cores = handles.len(), "all worker cores running");

    // ── Control surface ───────────────────────────────────────────────
    let app_state = Arc::new(api::AppState {
        manager: manager.clone(),
        stats: stats.clone(),
        start_time: std::time::Instant::now(),
    });
    let app = api::router(app_state, &config.allowed_ips);
    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", config.api_port)).await?;
    tracing::info!("Server running on http://0.0.0.0:{}", config.api_port);
    tokio::spawn(async move {
        if let Err(e) = axum::serve(
            listener,
            app.into_make_service_with_connect_info::<std::net::SocketAddr>(),
        )
        .await
        {
            tracing::error!("api server failed: {}", e);
        }
    });

    if let Some(port) = config.shell_port {
        let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", port)).await?;
        tracing::info!("Shell listening on 0.0.0.0:{}", port);
        tokio::spawn(shell::serve(
            listener,
            manager.clone(),
            stats.clone(),
            shutdown.clone(),
        ));
    }

    // ── Management loop ───────────────────────────────────────────────
    management::run(manager.clone(), config.mgmt_tick(), shutdown.clone()).await;

    // ── Shutdown ──────────────────────────────────────────────────────
    for handle in handles {
        if handle.join().is_err() {
            tracing::error!("worker thread panicked");
        }
    }
    manager.shutdown()?;
    tracing::info!("dataplane stopped");
    Ok(())
}

/// Load topology, create rings, ports and pool, register modules and run
/// their `init` on the first snapshot.
fn build_dataplane(config: &Config) -> anyhow::Result<(Arc<GenerationManager>, Arc<WorkerTable>)> {
    let dir = config.config_dir.as_path();
    tracing::info!(dir = %dir.display(), "loading configuration");

    let workers = Arc::new(WorkerTable::new(files::load_workers(dir)?)?);
    let rings = Arc::new(RingSet::setup(&workers, config.ring_size)?);

    let pool = PacketPool::new("pktmbuf_pool", config.pool_size, config.buffer_size)?;

    let port_configs = files::load_interfaces(dir)?;
    let ports = Arc::new(PortSet::open(port_configs, &pool, config.ring_size)?);
    if ports.is_empty() {
        anyhow::bail!("no ports configured in {}", dir.display());
    }
    workers.check_ports(&ports)?;

    let registry = Arc::new(modules::builtin(dir));

    let snapshot = Snapshot::new(
        Slot::A,
        pool,
        ports,
        workers.clone(),
        rings,
        config.promiscuous,
        ControlPorts {
            api_port: config.api_port,
            shell_port: config.shell_port,
        },
    );
    let manager = GenerationManager::new(registry, snapshot, config.quiesce_poll())?;
    Ok((Arc::new(manager), workers))
}
