//! Agent side of the collector link.
//!
//! One task owns the connection and walks
//! `Disconnected → Connecting → Connected → Disconnected` until halted.
//! While connected, three loops share the socket: read (commands in, pings
//! answered), write (drain the outbound queue) and keepalive. The first loop
//! to fail ends the session; the next connect attempt follows immediately and
//! failed attempts back off exponentially.
//!
//! A frame taken off the queue stays pending until it is fully written, so a
//! session dying mid-write resends it on the next connection.

use std::{sync::Arc, time::Duration};

use log::Level;
use metrics::counter;
use serde::Serialize;
use shared::{
    event::NormalizedEvent,
    framing::{Frame, FrameError, read_frame, write_frame},
};
use thiserror::Error;
use tokio::{
    net::{
        TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    runtime::Handle,
    sync::{Mutex, mpsc, watch},
    task::JoinHandle,
    time::{Instant, interval_at, timeout},
};
use tokio_util::sync::CancellationToken;

use super::backoff::Backoff;
use crate::{config::TransportConfig, telemetry, warden_log};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    /// The client task has exited.
    Stopped,
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connect to {endpoint} failed: {source}")]
    Connect {
        endpoint: String,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Frame(#[from] FrameError),

    #[error("{0} timed out")]
    Timeout(&'static str),

    #[error("peer closed the link: {0}")]
    PeerClosed(String),

    #[error("transport is shut down")]
    Closed,

    #[error("send abandoned on shutdown")]
    Cancelled,

    #[error("JSON encoding failed: {0}")]
    Json(#[from] serde_json::Error),
}

/// Called with the payload of every text or binary frame the peer sends.
pub type CommandHandler = Arc<dyn Fn(Vec<u8>) + Send + Sync>;

pub(crate) type SharedWriter = Arc<Mutex<OwnedWriteHalf>>;

/// Write one frame under the writer lock, bounded by `limit`.
pub(crate) async fn send_frame(
    writer: &SharedWriter,
    frame: &Frame,
    limit: Duration,
    what: &'static str,
) -> Result<(), TransportError> {
    let mut w = writer.lock().await;
    timeout(limit, write_frame(&mut *w, frame))
        .await
        .map_err(|_| TransportError::Timeout(what))??;
    Ok(())
}

/// Producer side of the outbound queue. Cheap to clone.
#[derive(Clone)]
pub struct TransportHandle {
    tx: mpsc::Sender<Frame>,
    rt: Handle,
}

impl TransportHandle {
    /// Queue a frame, parking the calling thread while the queue is full.
    /// Gives up with [`TransportError::Cancelled`] once `stop` fires and the
    /// queue still has no room. Must not be called from inside the async
    /// runtime.
    pub fn send_blocking(&self, frame: Frame, stop: &CancellationToken) -> Result<(), TransportError> {
        self.rt.block_on(async {
            tokio::select! {
                biased;
                sent = self.tx.send(frame) => sent.map_err(|_| TransportError::Closed),
                _ = stop.cancelled() => Err(TransportError::Cancelled),
            }
        })
    }

    pub fn send_event_blocking(
        &self,
        ev: &NormalizedEvent,
        stop: &CancellationToken,
    ) -> Result<(), TransportError> {
        self.send_blocking(Frame::Text(serde_json::to_string(ev)?), stop)
    }

    pub async fn send(&self, frame: Frame) -> Result<(), TransportError> {
        self.tx.send(frame).await.map_err(|_| TransportError::Closed)
    }

    /// Queue any serializable value as a text frame.
    pub async fn send_json<T: Serialize + ?Sized>(&self, value: &T) -> Result<(), TransportError> {
        self.send(Frame::Text(serde_json::to_string(value)?)).await
    }

    /// Frames waiting in the queue.
    pub fn queued(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }
}

/// Owning side of the link: the task, its state and its halt switch.
pub struct TransportClient {
    handle: TransportHandle,
    state: watch::Receiver<ConnectionState>,
    halt: CancellationToken,
    task: JoinHandle<()>,
}

impl TransportClient {
    /// Start the connection task on the current runtime.
    pub fn spawn(cfg: TransportConfig, on_command: CommandHandler) -> Self {
        let (tx, rx) = mpsc::channel(cfg.outbound_capacity.max(1));
        let (state_tx, state) = watch::channel(ConnectionState::Disconnected);
        let halt = CancellationToken::new();
        let task = tokio::spawn(run(cfg, rx, on_command, state_tx, halt.clone()));
        Self { handle: TransportHandle { tx, rt: Handle::current() }, state, halt, task }
    }

    pub fn handle(&self) -> TransportHandle {
        self.handle.clone()
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    pub async fn send_json<T: Serialize + ?Sized>(&self, value: &T) -> Result<(), TransportError> {
        self.handle.send_json(value).await
    }

    /// Close the queue and let the task flush it; after `grace` the link is
    /// cut regardless. Every other [`TransportHandle`] must be dropped first
    /// for the queue to close.
    pub async fn shutdown(self, grace: Duration) {
        let Self { handle, halt, mut task, .. } = self;
        drop(handle);
        if timeout(grace, &mut task).await.is_err() {
            warden_log!(Level::Warn, "transport", "outbound queue not drained within {:?}, closing", grace);
            halt.cancel();
            let _ = task.await;
        }
    }
}

struct Outbound {
    rx: mpsc::Receiver<Frame>,
    pending: Option<Frame>,
}

async fn run(
    cfg: TransportConfig,
    rx: mpsc::Receiver<Frame>,
    on_command: CommandHandler,
    state: watch::Sender<ConnectionState>,
    halt: CancellationToken,
) {
    let backoff = Backoff::new(cfg.backoff);
    let mut outbound = Outbound { rx, pending: None };
    let mut attempt: u32 = 0;

    while !halt.is_cancelled() {
        state.send_replace(ConnectionState::Connecting);
        let connected = tokio::select! {
            r = timeout(CONNECT_TIMEOUT, TcpStream::connect(&cfg.endpoint)) => r,
            _ = halt.cancelled() => break,
        };
        let stream = match connected {
            Ok(Ok(stream)) => stream,
            failed => {
                let err = match failed {
                    Ok(Err(source)) => TransportError::Connect { endpoint: cfg.endpoint.clone(), source },
                    _ => TransportError::Timeout("connect"),
                };
                counter!(telemetry::TRANSPORT_RECONNECTS).increment(1);
                state.send_replace(ConnectionState::Disconnected);
                let delay = backoff.delay_for(attempt);
                attempt = attempt.saturating_add(1);
                warden_log!(Level::Warn, "transport", "{}; retrying in {:?}", err, delay);
                let slept = tokio::select! {
                    _ = tokio::time::sleep(delay) => true,
                    _ = halt.cancelled() => false,
                };
                if !slept {
                    break;
                }
                continue;
            }
        };

        attempt = 0;
        state.send_replace(ConnectionState::Connected);
        warden_log!(Level::Info, "transport", "connected to {}", cfg.endpoint);

        match session(stream, &cfg, &mut outbound, &on_command, &halt).await {
            Ok(()) => {
                warden_log!(Level::Info, "transport", "outbound queue drained, link closed");
                break;
            }
            Err(TransportError::Closed) => break,
            Err(e) => {
                counter!(telemetry::TRANSPORT_RECONNECTS).increment(1);
                state.send_replace(ConnectionState::Disconnected);
                warden_log!(Level::Warn, "transport", "link to {} lost: {}", cfg.endpoint, e);
            }
        }
    }
    state.send_replace(ConnectionState::Stopped);
}

/// Drive one connection. `Ok` means the outbound queue closed and was fully
/// written; every error means the socket is unusable.
async fn session(
    stream: TcpStream,
    cfg: &TransportConfig,
    outbound: &mut Outbound,
    on_command: &CommandHandler,
    halt: &CancellationToken,
) -> Result<(), TransportError> {
    let _ = stream.set_nodelay(true);
    let (rd, wr) = stream.into_split();
    let writer: SharedWriter = Arc::new(Mutex::new(wr));

    let result = tokio::select! {
        r = read_loop(rd, cfg, &writer, on_command) => r,
        r = write_loop(&writer, cfg.write_timeout, outbound) => r,
        r = keepalive(&writer, cfg.ping_interval, cfg.ping_write_timeout) => r,
        _ = halt.cancelled() => Err(TransportError::Closed),
    };

    if matches!(result, Err(TransportError::Closed)) {
        let bye = Frame::Close("bye".into());
        let _ = send_frame(&writer, &bye, cfg.ping_write_timeout, "close").await;
    }
    result
}

async fn read_loop(
    mut rd: OwnedReadHalf,
    cfg: &TransportConfig,
    writer: &SharedWriter,
    on_command: &CommandHandler,
) -> Result<(), TransportError> {
    let deadline = cfg.read_deadline();
    loop {
        let frame = timeout(deadline, read_frame(&mut rd, cfg.max_frame_len))
            .await
            .map_err(|_| TransportError::Timeout("read"))??;
        match frame {
            Frame::Text(text) => on_command(text.into_bytes()),
            Frame::Binary(bytes) => on_command(bytes),
            Frame::Ping(payload) => {
                send_frame(writer, &Frame::Pong(payload), cfg.ping_write_timeout, "pong").await?
            }
            Frame::Pong(_) => {}
            Frame::Close(reason) => return Err(TransportError::PeerClosed(reason)),
        }
    }
}

async fn write_loop(
    writer: &SharedWriter,
    limit: Duration,
    outbound: &mut Outbound,
) -> Result<(), TransportError> {
    loop {
        if outbound.pending.is_none() {
            match outbound.rx.recv().await {
                Some(frame) => outbound.pending = Some(frame),
                None => {
                    send_frame(writer, &Frame::Close("bye".into()), limit, "close").await?;
                    return Ok(());
                }
            }
        }
        if let Some(frame) = &outbound.pending {
            send_frame(writer, frame, limit, "write").await?;
        }
        outbound.pending = None;
    }
}

async fn keepalive(writer: &SharedWriter, period: Duration, limit: Duration) -> Result<(), TransportError> {
    let mut ticker = interval_at(Instant::now() + period, period);
    loop {
        ticker.tick().await;
        send_frame(writer, &Frame::Ping(Vec::new()), limit, "ping").await?;
    }
}
