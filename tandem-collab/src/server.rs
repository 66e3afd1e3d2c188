//! WebSocket sync server with room-based document routing.
//!
//! Architecture:
//! ```text
//! Client A ──┐  ws://host/file-42
//!            ├──► Session ──► Room "file-42" ── Document + AwarenessTable
//! Client B ──┘                    │
//!                                 ├── BroadcastGroup ──► every other session
//!                                 │
//!                                 └── PersistenceCoordinator (debounced)
//!                                          │
//!                                          ▼
//!                                    dyn FileStore (memory / RocksDB)
//! ```
//!
//! Each connection runs one task that multiplexes its socket and its room's
//! broadcast receiver. A background sweep expires operations stuck in the
//! pending buffers and triggers resyncs.
//!
//! Reference: Kleppmann, Designing Data-Intensive Applications, Chapters 5 & 8

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

use crate::broadcast::Frame;
use crate::persistence::{PersistenceCoordinator, SNAPSHOT_RETENTION};
use crate::protocol::{room_key_from_path, ProtocolError};
use crate::room::{RoomConfig, RoomManager};
use crate::session::{CloseReason, OpenedSession, Session, SessionLimits};
use crate::storage::{FileStore, MemoryStore, RocksStore, StoreConfig, StoreError};

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Maximum sessions per room
    pub max_sessions_per_room: usize,
    /// Outbound queue capacity per session (frames)
    pub queue_capacity: usize,
    /// Quiet period before a room's text is flushed
    pub debounce: Duration,
    /// Consecutive undecodable frames before a session is closed
    pub decode_failure_threshold: u32,
    /// Rejected operations before a session is closed
    pub rejected_ops_threshold: usize,
    /// How long an operation may wait for its predecessors
    pub pending_timeout: Duration,
    /// Bound on buffered operations per room
    pub max_pending: usize,
    /// Append binary snapshots on flush
    pub snapshots: bool,
    /// Snapshot records kept per file
    pub snapshot_retention: usize,
    /// RocksDB path (None = in-memory store)
    pub storage_path: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            max_sessions_per_room: 100,
            queue_capacity: 256,
            debounce: Duration::from_millis(2000),
            decode_failure_threshold: 5,
            rejected_ops_threshold: 16,
            pending_timeout: Duration::from_secs(5),
            max_pending: tandem_core::DEFAULT_MAX_PENDING,
            snapshots: true,
            snapshot_retention: SNAPSHOT_RETENTION,
            storage_path: None,
        }
    }
}

impl ServerConfig {
    /// Loopback on an ephemeral port with short timers.
    pub fn for_testing() -> Self {
        Self {
            bind_addr: "127.0.0.1:0".to_string(),
            max_sessions_per_room: 10,
            queue_capacity: 64,
            debounce: Duration::from_millis(50),
            pending_timeout: Duration::from_millis(500),
            ..Self::default()
        }
    }

    fn room_config(&self) -> RoomConfig {
        RoomConfig {
            max_sessions: self.max_sessions_per_room,
            queue_capacity: self.queue_capacity,
            max_pending: self.max_pending,
        }
    }

    fn session_limits(&self) -> SessionLimits {
        SessionLimits {
            decode_failure_threshold: self.decode_failure_threshold,
            rejected_ops_threshold: self.rejected_ops_threshold,
        }
    }
}

/// Lock-free server counters.
#[derive(Debug, Default)]
pub struct ServerCounters {
    pub total_connections: AtomicU64,
    pub active_connections: AtomicU64,
    pub total_messages: AtomicU64,
    pub total_bytes: AtomicU64,
    pub active_rooms: AtomicU64,
    pub flushes: AtomicU64,
    pub flush_failures: AtomicU64,
    pub snapshots_written: AtomicU64,
    pub rejected_operations: AtomicU64,
    pub lagged_sessions: AtomicU64,
}

impl ServerCounters {
    pub fn snapshot(&self) -> ServerStats {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        ServerStats {
            total_connections: load(&self.total_connections),
            active_connections: load(&self.active_connections),
            total_messages: load(&self.total_messages),
            total_bytes: load(&self.total_bytes),
            active_rooms: load(&self.active_rooms),
            flushes: load(&self.flushes),
            flush_failures: load(&self.flush_failures),
            snapshots_written: load(&self.snapshots_written),
            rejected_operations: load(&self.rejected_operations),
            lagged_sessions: load(&self.lagged_sessions),
        }
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
    pub active_rooms: u64,
    pub flushes: u64,
    pub flush_failures: u64,
    pub snapshots_written: u64,
    pub rejected_operations: u64,
    pub lagged_sessions: u64,
}

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("invalid room key: {0}")]
    InvalidRoom(String),
    #[error("room {room} is full ({max} sessions)")]
    RoomFull { room: String, max: usize },
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
}

type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;
type WsSource = SplitStream<WebSocketStream<TcpStream>>;

/// Everything one connection task needs.
#[derive(Clone)]
struct ConnectionContext {
    manager: Arc<RoomManager>,
    counters: Arc<ServerCounters>,
    limits: SessionLimits,
}

/// The sync server.
pub struct SyncServer {
    config: ServerConfig,
    manager: Arc<RoomManager>,
    counters: Arc<ServerCounters>,
}

impl SyncServer {
    pub fn new(config: ServerConfig, store: Arc<dyn FileStore>) -> Self {
        let counters = Arc::new(ServerCounters::default());
        let persistence =
            PersistenceCoordinator::new(store.clone(), config.debounce, config.snapshots, counters.clone())
                .with_retention(config.snapshot_retention);
        let manager = Arc::new(RoomManager::new(
            store,
            persistence,
            config.room_config(),
            counters.clone(),
        ));
        Self {
            config,
            manager,
            counters,
        }
    }

    /// Open the store named by `config.storage_path` (RocksDB), or an
    /// in-memory store when unset. Both create unknown files on first use.
    pub fn from_config(config: ServerConfig) -> Result<Self, ServerError> {
        let store: Arc<dyn FileStore> = match &config.storage_path {
            Some(path) => Arc::new(RocksStore::open(StoreConfig {
                path: path.clone(),
                create_missing_files: true,
                ..StoreConfig::default()
            })?),
            None => Arc::new(MemoryStore::new().create_missing(true)),
        };
        Ok(Self::new(config, store))
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    pub fn room_manager(&self) -> &Arc<RoomManager> {
        &self.manager
    }

    pub fn stats(&self) -> ServerStats {
        self.counters.snapshot()
    }

    /// Current text of a room, live or at rest.
    pub async fn text_snapshot(&self, room_key: &str) -> Result<String, ServerError> {
        self.manager.text_snapshot(room_key).await
    }

    /// Write every live room through to the store. Call before exiting.
    pub async fn shutdown(&self) -> usize {
        let flushed = self.manager.flush_all().await;
        log::info!("flushed {flushed} rooms on shutdown");
        flushed
    }

    /// Bind `config.bind_addr` and serve forever.
    pub async fn run(&self) -> Result<(), ServerError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        self.serve(listener).await
    }

    /// Serve connections from an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), ServerError> {
        log::info!("sync server listening on {}", listener.local_addr()?);
        let sweeper = self.spawn_pending_sweep();
        let ctx = ConnectionContext {
            manager: self.manager.clone(),
            counters: self.counters.clone(),
            limits: self.config.session_limits(),
        };

        let result = loop {
            let (stream, addr) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => break Err(ServerError::Io(e)),
            };
            log::debug!("new TCP connection from {addr}");
            let ctx = ctx.clone();
            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(ctx, stream, addr).await {
                    log::error!("connection error from {addr}: {e}");
                }
            });
        };
        sweeper.abort();
        result
    }

    fn spawn_pending_sweep(&self) -> tokio::task::JoinHandle<()> {
        let manager = self.manager.clone();
        let timeout = self.config.pending_timeout;
        let period = (timeout / 2).max(Duration::from_millis(50));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                ticker.tick().await;
                let resynced = manager.expire_pending(timeout).await;
                if resynced > 0 {
                    log::debug!("pending sweep requested {resynced} resyncs");
                }
            }
        })
    }

    async fn handle_connection(
        ctx: ConnectionContext,
        stream: TcpStream,
        addr: SocketAddr,
    ) -> Result<(), ServerError> {
        let mut room_key: Option<String> = None;
        let callback = |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
            match room_key_from_path(request.uri().path()) {
                Ok(key) => {
                    room_key = Some(key);
                    Ok(response)
                }
                Err(e) => {
                    let mut error = ErrorResponse::new(Some(e.to_string()));
                    *error.status_mut() = StatusCode::BAD_REQUEST;
                    Err(error)
                }
            }
        };
        let ws = match tokio_tungstenite::accept_hdr_async(stream, callback).await {
            Ok(ws) => ws,
            Err(e) => {
                log::warn!("WebSocket handshake with {addr} failed: {e}");
                return Ok(());
            }
        };
        let Some(room_key) = room_key else {
            return Ok(());
        };

        ctx.counters.total_connections.fetch_add(1, Ordering::Relaxed);
        ctx.counters.active_connections.fetch_add(1, Ordering::Relaxed);
        log::info!("WebSocket connection from {addr} for room {room_key}");

        let result = Self::drive(&ctx, ws, &room_key, addr).await;

        ctx.counters.active_connections.fetch_sub(1, Ordering::Relaxed);
        log::info!("connection from {addr} closed");
        result
    }

    async fn drive(
        ctx: &ConnectionContext,
        ws: WebSocketStream<TcpStream>,
        room_key: &str,
        addr: SocketAddr,
    ) -> Result<(), ServerError> {
        let (mut sink, mut source) = ws.split();
        let opened = Session::open(ctx.manager.clone(), room_key, ctx.limits, ctx.counters.clone()).await;
        let OpenedSession {
            mut session,
            mut outbound,
            initial_frames,
        } = match opened {
            Ok(opened) => opened,
            Err(e) => {
                log::warn!("refusing {addr} for room {room_key}: {e}");
                let frame = CloseFrame {
                    code: CloseCode::Policy,
                    reason: e.to_string().into(),
                };
                let _ = sink.send(Message::Close(Some(frame))).await;
                return Ok(());
            }
        };

        let result = Self::pump(ctx, &mut session, &mut sink, &mut source, &mut outbound, initial_frames).await;
        // Leave on every exit path, including transport errors.
        session.close().await;
        match result {
            Ok(Some(reason)) => {
                log::warn!("closing session {} from {addr}: {reason}", session.id());
                let frame = CloseFrame {
                    code: close_code(&reason),
                    reason: reason.to_string().into(),
                };
                let _ = sink.send(Message::Close(Some(frame))).await;
                Ok(())
            }
            Ok(None) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Shuttle frames until the peer goes away (`Ok(None)`) or the session
    /// must be closed (`Ok(Some(reason))`).
    async fn pump(
        ctx: &ConnectionContext,
        session: &mut Session,
        sink: &mut WsSink,
        source: &mut WsSource,
        outbound: &mut broadcast::Receiver<Frame>,
        initial_frames: Vec<Vec<u8>>,
    ) -> Result<Option<CloseReason>, ServerError> {
        for frame in initial_frames {
            sink.send(Message::Binary(frame.into())).await?;
        }

        loop {
            tokio::select! {
                incoming = source.next() => match incoming {
                    Some(Ok(Message::Binary(data))) => {
                        ctx.counters.total_messages.fetch_add(1, Ordering::Relaxed);
                        ctx.counters.total_bytes.fetch_add(data.len() as u64, Ordering::Relaxed);
                        match session.handle_frame(&data).await {
                            Ok(replies) => {
                                for reply in replies {
                                    sink.send(Message::Binary(reply.into())).await?;
                                }
                            }
                            Err(reason) => return Ok(Some(reason)),
                        }
                    }
                    Some(Ok(Message::Text(_))) => {
                        log::warn!("session {}: text frame ignored", session.id());
                        if let Err(reason) = session.record_decode_failure() {
                            return Ok(Some(reason));
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => return Ok(None),
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        log::error!("session {}: WebSocket error: {e}", session.id());
                        return Ok(None);
                    }
                },

                frame = outbound.recv() => match frame {
                    Ok(frame) => {
                        if session.wants(&frame) {
                            sink.send(Message::Binary(frame.bytes.to_vec().into())).await?;
                        }
                    }
                    Err(RecvError::Lagged(missed)) => {
                        session.room().broadcast_group().record_lagged();
                        ctx.counters.lagged_sessions.fetch_add(1, Ordering::Relaxed);
                        return Ok(Some(CloseReason::Lagged(missed)));
                    }
                    Err(RecvError::Closed) => return Ok(None),
                },
            }
        }
    }
}

fn close_code(reason: &CloseReason) -> CloseCode {
    match reason {
        CloseReason::DecodeFailures(_) => CloseCode::Protocol,
        CloseReason::RejectedOperations(_) => CloseCode::Policy,
        CloseReason::Lagged(_) => CloseCode::Again,
        CloseReason::Internal(_) => CloseCode::Error,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_config_default() {
        let config = ServerConfig::default();
        assert_eq!(config.bind_addr, "127.0.0.1:9090");
        assert_eq!(config.max_sessions_per_room, 100);
        assert_eq!(config.queue_capacity, 256);
        assert_eq!(config.debounce, Duration::from_millis(2000));
        assert_eq!(config.decode_failure_threshold, 5);
        assert_eq!(config.rejected_ops_threshold, 16);
        assert_eq!(config.pending_timeout, Duration::from_secs(5));
        assert_eq!(config.max_pending, 1024);
        assert!(config.snapshots);
        assert_eq!(config.snapshot_retention, SNAPSHOT_RETENTION);
        assert!(config.storage_path.is_none());
    }

    #[test]
    fn test_stats_initial() {
        let server = SyncServer::new(ServerConfig::default(), Arc::new(MemoryStore::new()));
        assert_eq!(server.stats(), ServerStats::default());
        assert_eq!(server.bind_addr(), "127.0.0.1:9090");
    }

    #[tokio::test]
    async fn test_from_config_with_storage() {
        let dir = tempfile::tempdir().unwrap();
        let config = ServerConfig {
            storage_path: Some(dir.path().join("db")),
            ..ServerConfig::for_testing()
        };
        let server = SyncServer::from_config(config).unwrap();
        // Unknown files are created on first read.
        assert_eq!(server.text_snapshot("file-new").await.unwrap(), "");
    }

    #[tokio::test]
    async fn test_text_snapshot_rejects_non_file_keys() {
        let server = SyncServer::from_config(ServerConfig::for_testing()).unwrap();
        assert!(matches!(
            server.text_snapshot("lobby").await,
            Err(ServerError::InvalidRoom(_))
        ));
    }

    #[test]
    fn test_close_codes() {
        assert_eq!(close_code(&CloseReason::Lagged(3)), CloseCode::Again);
        assert_eq!(close_code(&CloseReason::DecodeFailures(5)), CloseCode::Protocol);
    }
}
