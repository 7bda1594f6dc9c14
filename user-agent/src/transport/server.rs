//! Collector side of the link.
//!
//! Every accepted agent gets its own task running a read loop and a
//! keepalive. Inbound binary frames must be exactly one canonical record;
//! text frames are JSON events. Decoded events go to one bounded inbound
//! queue. The registry holds the write half of every live connection so
//! commands can be broadcast; a connection whose write fails is removed and
//! closed without touching the others.

use std::{
    collections::HashMap,
    io,
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use log::Level;
use metrics::{counter, gauge};
use shared::{
    event::NormalizedEvent,
    framing::{Frame, read_frame},
    record::{RecordError, decode_record},
};
use tokio::{
    net::{TcpListener, TcpStream, tcp::OwnedReadHalf},
    sync::{Mutex, RwLock, mpsc},
    task::JoinSet,
    time::{Instant, interval_at, timeout},
};
use tokio_util::sync::CancellationToken;

use super::client::{SharedWriter, TransportError, send_frame};
use crate::{config::CollectorConfig, telemetry, warden_log};

pub const BAD_JSON_REPLY: &str = r#"{"error":"bad_json"}"#;

/// One event received from one agent.
#[derive(Debug, Clone)]
pub struct Inbound {
    pub agent: u64,
    pub peer: SocketAddr,
    pub event: NormalizedEvent,
}

struct AgentConn {
    peer: SocketAddr,
    writer: SharedWriter,
    closed: CancellationToken,
}

/// Live agent connections, keyed by a per-server id.
#[derive(Clone)]
pub struct AgentRegistry {
    agents: Arc<RwLock<HashMap<u64, AgentConn>>>,
    write_timeout: Duration,
}

impl AgentRegistry {
    fn new(write_timeout: Duration) -> Self {
        Self { agents: Arc::default(), write_timeout }
    }

    async fn insert(&self, id: u64, conn: AgentConn) {
        let mut agents = self.agents.write().await;
        agents.insert(id, conn);
        gauge!(telemetry::COLLECTOR_AGENTS).set(agents.len() as f64);
    }

    /// Drop `id` and close its connection. False if it was already gone.
    pub async fn remove(&self, id: u64) -> bool {
        let mut agents = self.agents.write().await;
        let removed = agents.remove(&id);
        gauge!(telemetry::COLLECTOR_AGENTS).set(agents.len() as f64);
        match removed {
            Some(conn) => {
                conn.closed.cancel();
                true
            }
            None => false,
        }
    }

    pub async fn len(&self) -> usize {
        self.agents.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn peers(&self) -> Vec<(u64, SocketAddr)> {
        self.agents.read().await.iter().map(|(id, c)| (*id, c.peer)).collect()
    }

    pub async fn send_to(&self, id: u64, frame: &Frame) -> Result<(), TransportError> {
        let writer = match self.agents.read().await.get(&id) {
            Some(conn) => Arc::clone(&conn.writer),
            None => return Err(TransportError::Closed),
        };
        let res = send_frame(&writer, frame, self.write_timeout, "command").await;
        if res.is_err() {
            self.remove(id).await;
        }
        res
    }

    /// Send `command` as a text frame to every agent. Returns how many
    /// agents it reached.
    pub async fn broadcast(&self, command: &str) -> usize {
        let targets: Vec<(u64, SharedWriter)> = self
            .agents
            .read()
            .await
            .iter()
            .map(|(id, c)| (*id, Arc::clone(&c.writer)))
            .collect();

        let frame = Frame::Text(command.to_owned());
        let mut delivered = 0;
        for (id, writer) in targets {
            match send_frame(&writer, &frame, self.write_timeout, "command").await {
                Ok(()) => delivered += 1,
                Err(e) => {
                    warden_log!(Level::Warn, "collector", "agent {} dropped on write: {}", id, e);
                    self.remove(id).await;
                }
            }
        }
        delivered
    }
}

pub struct CollectorServer {
    listener: TcpListener,
    cfg: Arc<CollectorConfig>,
    registry: AgentRegistry,
    inbound: mpsc::Sender<Inbound>,
    next_id: AtomicU64,
}

impl CollectorServer {
    pub async fn bind(cfg: CollectorConfig, inbound: mpsc::Sender<Inbound>) -> io::Result<Self> {
        let listener = TcpListener::bind(&cfg.listen).await?;
        let registry = AgentRegistry::new(cfg.write_timeout);
        Ok(Self { listener, cfg: Arc::new(cfg), registry, inbound, next_id: AtomicU64::new(1) })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn registry(&self) -> AgentRegistry {
        self.registry.clone()
    }

    /// Accept agents until `cancel` fires, then close every connection and
    /// wait for their tasks.
    pub async fn run(self, cancel: CancellationToken) {
        warden_log!(Level::Info, "collector", "listening on {}", self.cfg.listen);
        let mut conns = JoinSet::new();
        loop {
            tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                        conns.spawn(serve_agent(
                            id,
                            stream,
                            peer,
                            Arc::clone(&self.cfg),
                            self.registry.clone(),
                            self.inbound.clone(),
                            cancel.child_token(),
                        ));
                    }
                    Err(e) => warden_log!(Level::Warn, "collector", "accept failed: {}", e),
                },
                Some(_) = conns.join_next(), if !conns.is_empty() => {}
                _ = cancel.cancelled() => break,
            }
        }
        while conns.join_next().await.is_some() {}
        warden_log!(Level::Info, "collector", "listener stopped");
    }
}

async fn serve_agent(
    id: u64,
    stream: TcpStream,
    peer: SocketAddr,
    cfg: Arc<CollectorConfig>,
    registry: AgentRegistry,
    inbound: mpsc::Sender<Inbound>,
    closed: CancellationToken,
) {
    let _ = stream.set_nodelay(true);
    let (rd, wr) = stream.into_split();
    let writer: SharedWriter = Arc::new(Mutex::new(wr));
    registry
        .insert(id, AgentConn { peer, writer: Arc::clone(&writer), closed: closed.clone() })
        .await;
    warden_log!(Level::Info, "collector", "agent {} connected from {}", id, peer);

    let link = AgentLink { id, peer, cfg: &cfg, writer: &writer, inbound: &inbound };
    let result = tokio::select! {
        r = link.read_loop(rd) => r,
        r = link.keepalive() => r,
        _ = closed.cancelled() => Ok(()),
    };

    registry.remove(id).await;
    match result {
        Ok(()) | Err(TransportError::PeerClosed(_)) => {
            warden_log!(Level::Info, "collector", "agent {} ({}) disconnected", id, peer)
        }
        Err(e) => warden_log!(Level::Warn, "collector", "agent {} ({}) dropped: {}", id, peer, e),
    }
}

struct AgentLink<'a> {
    id: u64,
    peer: SocketAddr,
    cfg: &'a CollectorConfig,
    writer: &'a SharedWriter,
    inbound: &'a mpsc::Sender<Inbound>,
}

impl AgentLink<'_> {
    async fn read_loop(&self, mut rd: OwnedReadHalf) -> Result<(), TransportError> {
        loop {
            let frame = timeout(self.cfg.read_timeout, read_frame(&mut rd, self.cfg.max_frame_len))
                .await
                .map_err(|_| TransportError::Timeout("read"))??;
            match frame {
                Frame::Binary(bytes) => {
                    counter!(telemetry::FRAMES_RECEIVED).increment(1);
                    match decode_record(&bytes) {
                        Ok(ev) => self.forward(ev).await?,
                        Err(RecordError::Length { got }) => {
                            counter!(telemetry::FRAMES_DROPPED, "reason" => "record_length").increment(1);
                            warden_log!(Level::Debug, "collector", "agent {}: {}-byte binary frame dropped", self.id, got);
                        }
                        Err(e) => {
                            counter!(telemetry::FRAMES_DROPPED, "reason" => "record_invalid").increment(1);
                            warden_log!(Level::Warn, "collector", "agent {}: bad record: {}", self.id, e);
                        }
                    }
                }
                Frame::Text(text) => {
                    counter!(telemetry::FRAMES_RECEIVED).increment(1);
                    match NormalizedEvent::from_json(text.as_bytes()) {
                        Ok(ev) => self.forward(ev).await?,
                        Err(e) => {
                            counter!(telemetry::FRAMES_DROPPED, "reason" => "bad_json").increment(1);
                            warden_log!(Level::Debug, "collector", "agent {}: bad JSON: {}", self.id, e);
                            let reply = Frame::Text(BAD_JSON_REPLY.into());
                            send_frame(self.writer, &reply, self.cfg.write_timeout, "reply").await?;
                        }
                    }
                }
                Frame::Ping(payload) => {
                    send_frame(self.writer, &Frame::Pong(payload), self.cfg.write_timeout, "pong").await?
                }
                Frame::Pong(_) => {}
                Frame::Close(reason) => return Err(TransportError::PeerClosed(reason)),
            }
        }
    }

    async fn forward(&self, event: NormalizedEvent) -> Result<(), TransportError> {
        self.inbound
            .send(Inbound { agent: self.id, peer: self.peer, event })
            .await
            .map_err(|_| TransportError::Closed)
    }

    async fn keepalive(&self) -> Result<(), TransportError> {
        let period = self.cfg.ping_interval;
        let mut ticker = interval_at(Instant::now() + period, period);
        loop {
            ticker.tick().await;
            send_frame(self.writer, &Frame::Ping(Vec::new()), self.cfg.write_timeout, "ping").await?;
        }
    }
}
