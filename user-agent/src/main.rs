// src/main.rs

//! Agent entry-point.
//!
//! `warden-agent [config] [protected_pid] [endpoint]`
//!
//! 1. Load configuration, apply command-line overrides, set up logging
//! 2. Start the runtime, the metrics exporter and the scoring ledger
//! 3. Spawn the detectors and the collector link
//! 4. Connect to the kernel port and start ingestion
//! 5. Wait for Ctrl-C, then stop producers before consumers

use std::{
    env,
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::{Context, Result};
use chrono::Local;
use log::Level;
use shared::{constants::SCAN_COMMAND, kernel::FrameLayout};
use tokio::runtime::Runtime;
use tokio_util::sync::CancellationToken;

use warden::{
    comms::{self, BufferPool, IngestOptions, Ingestion},
    config::{self, AgentContext, Config},
    db,
    detect::{self, AlertSink, Detector, DllInjectionDetector, FirstSeenDetector, RemoteThreadDetector},
    enrich::Enricher,
    introspect,
    logging::setup_logging,
    pipeline::ForwardingSink,
    telemetry,
    transport::{CommandHandler, TransportClient},
    warden_log,
};

const LEDGER_QUEUE_CAPACITY: usize = 1024;

/// Directory that contains the running executable.
fn exe_dir() -> Result<PathBuf> {
    let exe = env::current_exe().context("cannot determine exe path")?;
    Ok(exe.parent().map(Path::to_path_buf).unwrap_or_default())
}

fn load_config(base_dir: &Path, args: &[String]) -> Result<Config> {
    let path = args
        .first()
        .map(PathBuf::from)
        .unwrap_or_else(|| base_dir.join("warden.toml"));
    let mut cfg = config::load(&path).with_context(|| format!("loading {}", path.display()))?;
    config::apply_overrides(
        &mut cfg,
        args.get(1).map(String::as_str),
        args.get(2).map(String::as_str),
    )?;
    config::require_agent_identity(&cfg)?;
    Ok(cfg)
}

/// Commands pushed by the collector.
fn command_handler() -> CommandHandler {
    Arc::new(|payload: Vec<u8>| {
        let text = String::from_utf8_lossy(&payload);
        match text.trim() {
            SCAN_COMMAND => warden_log!(Level::Info, "command", "module scan requested by collector"),
            other => warden_log!(Level::Warn, "command", "unknown command {:?}", other),
        }
    })
}

fn run() -> Result<()> {
    // 1 ─ Context
    let args: Vec<String> = env::args().skip(1).collect();
    let base_dir = exe_dir()?;
    let cfg = load_config(&base_dir, &args)?;
    setup_logging(&base_dir, &cfg.logging, "warden-agent.log").context("logging setup failed")?;

    let ctx = AgentContext::new(cfg.agent.protected_pid);
    warden_log!(
        Level::Info,
        "main",
        "agent {} protecting pid {}, collector {}",
        ctx.agent_pid,
        ctx.protected_pid,
        cfg.transport.endpoint
    );

    // 2 ─ Runtime, metrics, ledger
    let rt = Runtime::new().context("Tokio runtime creation failed")?;
    let _guard = rt.enter();
    telemetry::install(&cfg.metrics).context("metrics exporter")?;
    let cancel = CancellationToken::new();

    let mut alerts = AlertSink::new();
    let mut ledger_task = None;
    let mut wal_task = None;
    if cfg.database.enable {
        let conn = db::init_database(&base_dir, &cfg.database).context("opening the ledger")?;
        let (tx, task) = db::spawn_ledger_writer(conn, &cfg.database, LEDGER_QUEUE_CAPACITY);
        alerts = alerts.with_ledger(tx);
        ledger_task = Some(task);
        wal_task = db::spawn_wal_maintenance(
            db::db_path(&base_dir, &cfg.database),
            &cfg.database,
            cancel.clone(),
        );
    }

    // 3 ─ Detectors and collector link
    let introspector = introspect::native();
    let detectors: Vec<Box<dyn Detector>> = vec![
        Box::new(RemoteThreadDetector::new()),
        Box::new(DllInjectionDetector::new(Arc::clone(&introspector), cfg.agent.injection_policy)),
        Box::new(FirstSeenDetector::new()),
    ];
    let (bus, detector_tasks) =
        detect::spawn_detectors(detectors, cfg.agent.detector_queue_capacity, alerts, cancel.clone());

    let link = TransportClient::spawn(cfg.transport.clone(), command_handler());

    // 4 ─ Kernel port and ingestion
    let port = comms::port::connect(&cfg.agent.port_name, &ctx)
        .with_context(|| format!("connecting to {}", cfg.agent.port_name))?;
    let pool = BufferPool::new(FrameLayout::native().frame_size());
    let enricher = Arc::new(Enricher::new(ctx, introspector));
    let forwarding = cancel.child_token();
    let sink = Arc::new(ForwardingSink::new(bus, Some(link.handle()), forwarding.clone()));
    let ingestion = Ingestion::start(
        port,
        Arc::clone(&pool),
        enricher,
        sink,
        IngestOptions::from_config(&cfg.agent),
        cancel.child_token(),
    )
    .context("starting ingestion threads")?;

    // 5 ─ Wait for shutdown
    rt.block_on(tokio::signal::ctrl_c()).context("waiting for Ctrl-C")?;
    warden_log!(Level::Warn, "main", "shutdown initiated");

    // producers first: workers drain, then the sink (bus + link handle) drops.
    // Workers stuck on a full outbound queue give up after the grace period.
    let grace = cfg.transport.shutdown_grace;
    rt.spawn(async move {
        tokio::time::sleep(grace).await;
        forwarding.cancel();
    });
    ingestion.shutdown();
    rt.block_on(async {
        link.shutdown(grace).await;
        for task in detector_tasks {
            let _ = task.await;
        }
        // every alert sink is gone, so the ledger writer flushes and returns
        if let Some(task) = ledger_task {
            let _ = task.await;
        }
        cancel.cancel();
        if let Some(task) = wal_task {
            let _ = task.await;
        }
    });
    warden_log!(
        Level::Info,
        "main",
        "stopped cleanly ({} frame buffers allocated)",
        pool.allocated()
    );
    Ok(())
}

fn main() {
    if let Err(e) = run() {
        eprintln!("[{}][ERROR][main] {:#}", Local::now().to_rfc3339(), e);
        std::process::exit(1);
    }
}
