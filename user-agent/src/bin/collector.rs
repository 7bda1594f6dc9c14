// src/bin/collector.rs

//! Collector entry-point.
//!
//! `warden-collector [config]`
//!
//! Accepts agent links, runs the collector detector set over every event they
//! send and broadcasts each line typed on stdin to all connected agents as a
//! command.

use std::{
    env,
    io::{self, BufRead},
    path::{Path, PathBuf},
    sync::Arc,
    thread,
};

use anyhow::{Context, Result};
use chrono::Local;
use log::Level;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use warden::{
    config,
    db,
    detect::{self, AlertSink, Detector, FirstSeenDetector, ImageLoadMonitor, RemoteThreadDetector},
    logging::setup_logging,
    telemetry,
    transport::{AgentRegistry, CollectorServer, Inbound},
    warden_log,
};

const LEDGER_QUEUE_CAPACITY: usize = 1024;

fn exe_dir() -> Result<PathBuf> {
    let exe = env::current_exe().context("cannot determine exe path")?;
    Ok(exe.parent().map(Path::to_path_buf).unwrap_or_default())
}

/// Console lines from a detached thread, so an idle read never blocks
/// shutdown.
fn spawn_stdin_reader() -> mpsc::Receiver<String> {
    let (tx, rx) = mpsc::channel(16);
    let spawned = thread::Builder::new().name("warden-console".into()).spawn(move || {
        for line in io::stdin().lock().lines() {
            let Ok(line) = line else { break };
            if tx.blocking_send(line).is_err() {
                break;
            }
        }
    });
    if let Err(e) = spawned {
        warden_log!(Level::Warn, "collector", "no command console: {}", e);
    }
    rx
}

/// Broadcast every console line to all agents.
async fn command_console(registry: AgentRegistry, mut lines: mpsc::Receiver<String>, cancel: CancellationToken) {
    loop {
        let line = tokio::select! {
            line = lines.recv() => line,
            _ = cancel.cancelled() => return,
        };
        let Some(line) = line else { return };
        let command = line.trim();
        if command.is_empty() {
            continue;
        }
        let reached = registry.broadcast(command).await;
        warden_log!(Level::Info, "collector", "command {:?} sent to {} agent(s)", command, reached);
    }
}

/// Hand every inbound event to the detectors.
async fn dispatch(mut inbound: mpsc::Receiver<Inbound>, bus: detect::DetectorBus) {
    while let Some(msg) = inbound.recv().await {
        warden_log!(Level::Trace, "collector", "agent {} sent {} event", msg.agent, msg.event.kind);
        bus.publish(&Arc::new(msg.event));
    }
}

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        eprintln!("[{}][ERROR][main] {:#}", Local::now().to_rfc3339(), e);
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    let base_dir = exe_dir()?;
    let path = env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| base_dir.join("warden.toml"));
    let cfg = config::load(&path).with_context(|| format!("loading {}", path.display()))?;
    setup_logging(&base_dir, &cfg.logging, "warden-collector.log").context("logging setup failed")?;
    telemetry::install(&cfg.metrics).context("metrics exporter")?;

    let cancel = CancellationToken::new();

    let mut alerts = AlertSink::new();
    let mut ledger_task = None;
    if cfg.database.enable {
        let conn = db::init_database(&base_dir, &cfg.database).context("opening the ledger")?;
        let (tx, task) = db::spawn_ledger_writer(conn, &cfg.database, LEDGER_QUEUE_CAPACITY);
        alerts = alerts.with_ledger(tx);
        ledger_task = Some(task);
    }

    let detectors: Vec<Box<dyn Detector>> = vec![
        Box::new(RemoteThreadDetector::new()),
        Box::new(FirstSeenDetector::new()),
        Box::new(ImageLoadMonitor::new()),
    ];
    let (bus, detector_tasks) =
        detect::spawn_detectors(detectors, cfg.agent.detector_queue_capacity, alerts, cancel.clone());

    let (inbound_tx, inbound_rx) = mpsc::channel(cfg.collector.inbound_capacity.max(1));
    let server = CollectorServer::bind(cfg.collector.clone(), inbound_tx)
        .await
        .with_context(|| format!("binding {}", cfg.collector.listen))?;
    let registry = server.registry();

    let dispatcher = tokio::spawn(dispatch(inbound_rx, bus));
    let console = tokio::spawn(command_console(registry, spawn_stdin_reader(), cancel.clone()));
    let listener = tokio::spawn(server.run(cancel.clone()));

    tokio::signal::ctrl_c().await.context("waiting for Ctrl-C")?;
    warden_log!(Level::Warn, "main", "shutdown initiated");
    cancel.cancel();

    // the listener owns the last inbound sender, the dispatcher the bus
    let _ = listener.await;
    let _ = dispatcher.await;
    let _ = console.await;
    for task in detector_tasks {
        let _ = task.await;
    }
    if let Some(task) = ledger_task {
        let _ = task.await;
    }
    warden_log!(Level::Info, "main", "collector stopped");
    Ok(())
}
