//! Port ingestion: receiver threads → bounded job queue → worker threads.
//!
//! Receivers block on the port with a leased buffer and push the filled
//! buffer onto the job queue; a full queue blocks the receiver, never drops
//! the frame. Workers decode, normalize, enrich and publish, then the buffer
//! returns to the pool when the lease is dropped.
//!
//! Shutdown: cancel → close the port → receivers exit and drop their queue
//! senders → workers drain what is left and exit on disconnect.

use std::{
    io,
    sync::Arc,
    thread::{self, JoinHandle},
};

use crossbeam::channel::{self, Receiver, Sender};
use log::Level;
use metrics::counter;
use shared::{
    event::NormalizedEvent,
    kernel::{DecodeError, FrameLayout, decode_frame},
};
use tokio_util::sync::CancellationToken;

use crate::{
    comms::{
        pool::{BufferPool, PooledBuffer},
        port::{MessagePort, PortError},
    },
    config::AgentConfig,
    enrich::Enricher,
    telemetry, warden_log,
};

/// Downstream of the workers. Called from worker threads, so it may block.
pub trait EventSink: Send + Sync + 'static {
    fn publish(&self, ev: Arc<NormalizedEvent>);
}

#[derive(Debug, Clone, Copy)]
pub struct IngestOptions {
    pub receivers: usize,
    pub workers: usize,
    pub queue_capacity: usize,
    pub layout: FrameLayout,
}

impl IngestOptions {
    pub fn from_config(cfg: &AgentConfig) -> Self {
        Self {
            receivers: cfg.receivers,
            workers: cfg.workers,
            queue_capacity: cfg.queue_capacity,
            layout: FrameLayout::native(),
        }
    }
}

/// Running receiver and worker threads.
pub struct Ingestion {
    port: Arc<dyn MessagePort>,
    cancel: CancellationToken,
    receivers: Vec<JoinHandle<()>>,
    workers: Vec<JoinHandle<()>>,
    depth: Receiver<PooledBuffer>,
}

impl Ingestion {
    pub fn start(
        port: Arc<dyn MessagePort>,
        pool: Arc<BufferPool>,
        enricher: Arc<Enricher>,
        sink: Arc<dyn EventSink>,
        opts: IngestOptions,
        cancel: CancellationToken,
    ) -> io::Result<Self> {
        let (jobs_tx, jobs_rx) = channel::bounded::<PooledBuffer>(opts.queue_capacity);

        let mut workers = Vec::with_capacity(opts.workers);
        for i in 0..opts.workers {
            let rx = jobs_rx.clone();
            let enricher = Arc::clone(&enricher);
            let sink = Arc::clone(&sink);
            let layout = opts.layout;
            workers.push(
                thread::Builder::new()
                    .name(format!("warden-worker-{i}"))
                    .spawn(move || worker_loop(rx, layout, &enricher, sink.as_ref()))?,
            );
        }

        let mut receivers = Vec::with_capacity(opts.receivers);
        for i in 0..opts.receivers {
            let tx = jobs_tx.clone();
            let port = Arc::clone(&port);
            let pool = Arc::clone(&pool);
            let cancel = cancel.clone();
            receivers.push(
                thread::Builder::new()
                    .name(format!("warden-rx-{i}"))
                    .spawn(move || receiver_loop(port.as_ref(), &pool, tx, &cancel))?,
            );
        }
        drop(jobs_tx);

        warden_log!(
            Level::Info,
            "ingest",
            "{} receiver(s), {} worker(s), queue capacity {}",
            opts.receivers,
            opts.workers,
            opts.queue_capacity
        );
        Ok(Self { port, cancel, receivers, workers, depth: jobs_rx })
    }

    /// Frames received but not yet picked up by a worker.
    pub fn queue_depth(&self) -> usize {
        self.depth.len()
    }

    /// Stop receiving, then let the workers drain every queued frame.
    pub fn shutdown(self) {
        self.cancel.cancel();
        self.port.close();
        for h in self.receivers {
            if h.join().is_err() {
                warden_log!(Level::Error, "ingest", "receiver thread panicked");
            }
        }
        drop(self.depth);
        for h in self.workers {
            if h.join().is_err() {
                warden_log!(Level::Error, "ingest", "worker thread panicked");
            }
        }
        warden_log!(Level::Info, "ingest", "ingestion drained and stopped");
    }
}

fn receiver_loop(
    port: &dyn MessagePort,
    pool: &Arc<BufferPool>,
    jobs: Sender<PooledBuffer>,
    cancel: &CancellationToken,
) {
    while !cancel.is_cancelled() {
        let mut buf = pool.lease();
        match port.receive(&mut buf) {
            Ok(()) => {
                counter!(telemetry::FRAMES_RECEIVED).increment(1);
                // blocks while the queue is full
                if jobs.send(buf).is_err() {
                    break;
                }
            }
            Err(PortError::Closed) => break,
            Err(_) if cancel.is_cancelled() => break,
            Err(e) => {
                warden_log!(Level::Error, "port", "receive failed: {}", e);
            }
        }
    }
}

fn worker_loop(
    jobs: Receiver<PooledBuffer>,
    layout: FrameLayout,
    enricher: &Enricher,
    sink: &dyn EventSink,
) {
    for buf in jobs.iter() {
        if let Some(ev) = process_frame(&buf, layout, enricher) {
            sink.publish(Arc::new(ev));
        }
        // `buf` goes back to the pool here
    }
}

/// Decode, normalize and enrich one raw frame. Undecodable frames are
/// logged, counted and dropped; they are never re-delivered.
pub fn process_frame(
    frame: &[u8],
    layout: FrameLayout,
    enricher: &Enricher,
) -> Option<NormalizedEvent> {
    match decode_frame(frame, layout) {
        Ok((_, variant)) => {
            let mut ev = NormalizedEvent::from(variant);
            enricher.enrich(&mut ev);
            Some(ev)
        }
        Err(DecodeError::UnknownTag { tag, message_id }) => {
            counter!(telemetry::FRAMES_DROPPED, "reason" => "unknown_tag").increment(1);
            warden_log!(Level::Warn, "decode", "unknown tag {} in message {}, dropped", tag, message_id);
            None
        }
        Err(e) => {
            counter!(telemetry::FRAMES_DROPPED, "reason" => "malformed").increment(1);
            warden_log!(Level::Warn, "decode", "malformed frame dropped: {}", e);
            None
        }
    }
}
