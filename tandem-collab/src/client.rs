//! WebSocket sync client for connecting to the collaboration server.
//!
//! Provides:
//! - Connection lifecycle (connect, disconnect, reconnect)
//! - The two-step state handshake against a [`SharedDocument`]
//! - Streaming of local operations and remote changes
//! - Presence publishing and a local view of the room's awareness
//!
//! Edits made while disconnected stay in the document. The handshake on the
//! next `connect` delivers them, so no separate offline queue is kept.
//!
//! Reference: Kleppmann, Chapter 5, Replication

use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;

use tandem_core::binding::lock;
use tandem_core::{ClientId, DocError, Operation, SharedDocument, TextChange};

use crate::awareness::{AwarenessChange, AwarenessTable, UserPresence};
use crate::protocol::{ProtocolError, SyncMessage};

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Events emitted by the sync client.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    /// Connection established
    Connected,
    /// The server's state response has been integrated
    Synced,
    /// Remote operations changed the document text
    RemoteChanges(Vec<TextChange>),
    /// The room's presence table changed
    Presence(AwarenessChange),
    /// Connection lost
    Disconnected,
}

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("already connected")]
    AlreadyConnected,
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Document(#[from] DocError),
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
}

#[derive(Debug, Default)]
struct PresenceState {
    table: AwarenessTable,
    /// What this replica publishes; re-sent after every reconnect.
    local: Option<UserPresence>,
}

/// State shared between the client handle and its connection tasks.
struct Shared {
    client_id: ClientId,
    doc: SharedDocument,
    state: RwLock<ConnectionState>,
    presence: Mutex<PresenceState>,
    event_tx: mpsc::Sender<SyncEvent>,
}

impl Shared {
    /// Transition to `Disconnected` once, resetting remote presence.
    async fn go_offline(&self) {
        {
            let mut state = self.state.write().await;
            if *state == ConnectionState::Disconnected {
                return;
            }
            *state = ConnectionState::Disconnected;
        }
        let removed = {
            let mut presence = self.presence.lock().await;
            let dropped = presence.table.reset_remote(self.client_id);
            // The server removes our entry when the session ends; mirror that
            // so the next publish carries a newer clock.
            presence.table.remove(&[self.client_id]);
            dropped
        };
        if !removed.is_empty() {
            let change = AwarenessChange {
                removed,
                ..AwarenessChange::default()
            };
            let _ = self.event_tx.send(SyncEvent::Presence(change)).await;
        }
        let _ = self.event_tx.send(SyncEvent::Disconnected).await;
    }

    fn apply_operations(&self, operations: Vec<Operation>) -> Vec<TextChange> {
        let mut doc = lock(&self.doc);
        let mut changes = Vec::new();
        for op in operations {
            match doc.apply_remote(op) {
                Ok(outcome) => changes.extend(outcome.changes),
                Err(e) => log::warn!("client {}: rejected remote operation: {e}", self.client_id),
            }
        }
        changes
    }

    /// Handle one decoded server message, returning the reply to send (if any).
    async fn handle_message(&self, msg: SyncMessage, synced: &mut bool) -> Option<SyncMessage> {
        match msg {
            SyncMessage::StateRequest { state_vector } => {
                let doc = lock(&self.doc);
                Some(SyncMessage::StateResponse {
                    operations: doc.diff_since(&state_vector),
                    state_vector: doc.state_vector().clone(),
                })
            }
            SyncMessage::StateResponse { operations, .. } => {
                let changes = self.apply_operations(operations);
                if !*synced {
                    *synced = true;
                    let _ = self.event_tx.send(SyncEvent::Synced).await;
                }
                if !changes.is_empty() {
                    let _ = self.event_tx.send(SyncEvent::RemoteChanges(changes)).await;
                }
                None
            }
            SyncMessage::Update { operations } => {
                let changes = self.apply_operations(operations);
                if !changes.is_empty() {
                    let _ = self.event_tx.send(SyncEvent::RemoteChanges(changes)).await;
                }
                None
            }
            SyncMessage::Presence(update) => {
                let (change, _) = self.presence.lock().await.table.apply_remote(&update, None);
                if !change.is_empty() {
                    let _ = self.event_tx.send(SyncEvent::Presence(change)).await;
                }
                None
            }
        }
    }
}

/// The sync client.
///
/// Keeps one room's [`SharedDocument`] in sync with the server. The same
/// document can be bound to an editor through
/// [`LocalBinding`](tandem_core::LocalBinding).
pub struct SyncClient {
    server_url: String,
    room_key: String,
    shared: Arc<Shared>,
    /// Channel to the WebSocket writer task
    outgoing_tx: Option<mpsc::Sender<Vec<u8>>>,
    event_rx: Option<mpsc::Receiver<SyncEvent>>,
    reader: Option<JoinHandle<()>>,
    writer: Option<JoinHandle<()>>,
}

impl SyncClient {
    pub fn new(server_url: impl Into<String>, room_key: impl Into<String>, doc: SharedDocument) -> Self {
        let (event_tx, event_rx) = mpsc::channel(256);
        let client_id = lock(&doc).client_id();
        Self {
            server_url: server_url.into(),
            room_key: room_key.into(),
            shared: Arc::new(Shared {
                client_id,
                doc,
                state: RwLock::new(ConnectionState::Disconnected),
                presence: Mutex::new(PresenceState::default()),
                event_tx,
            }),
            outgoing_tx: None,
            event_rx: Some(event_rx),
            reader: None,
            writer: None,
        }
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<SyncEvent>> {
        self.event_rx.take()
    }

    pub fn url(&self) -> String {
        format!("{}/{}", self.server_url.trim_end_matches('/'), self.room_key)
    }

    pub fn room_key(&self) -> &str {
        &self.room_key
    }

    pub fn client_id(&self) -> ClientId {
        self.shared.client_id
    }

    pub fn document(&self) -> &SharedDocument {
        &self.shared.doc
    }

    pub async fn connection_state(&self) -> ConnectionState {
        *self.shared.state.read().await
    }

    /// Current presence entries of the room as seen by this client.
    pub async fn presence_of(&self, client: ClientId) -> Option<UserPresence> {
        self.shared.presence.lock().await.table.get(client).cloned()
    }

    /// Connect and start the handshake.
    ///
    /// Spawns a writer task fed by an mpsc channel and a reader task that
    /// answers the server and integrates what it sends.
    pub async fn connect(&mut self) -> Result<(), ClientError> {
        {
            let mut state = self.shared.state.write().await;
            if *state != ConnectionState::Disconnected {
                return Err(ClientError::AlreadyConnected);
            }
            *state = ConnectionState::Connecting;
        }
        self.stop_tasks().await;

        let opening = match self.opening_frames().await {
            Ok(frames) => frames,
            Err(e) => {
                *self.shared.state.write().await = ConnectionState::Disconnected;
                return Err(e);
            }
        };

        let url = self.url();
        let ws_stream = match tokio_tungstenite::connect_async(&url).await {
            Ok((ws_stream, _)) => ws_stream,
            Err(e) => {
                *self.shared.state.write().await = ConnectionState::Disconnected;
                log::warn!("connection to {url} failed: {e}");
                return Err(e.into());
            }
        };
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        let (out_tx, mut out_rx) = mpsc::channel::<Vec<u8>>(256);
        self.writer = Some(tokio::spawn(async move {
            while let Some(data) = out_rx.recv().await {
                if ws_writer.send(Message::Binary(data.into())).await.is_err() {
                    return;
                }
            }
            let _ = ws_writer.send(Message::Close(None)).await;
            let _ = ws_writer.close().await;
        }));

        for frame in opening {
            let _ = out_tx.send(frame).await;
        }

        *self.shared.state.write().await = ConnectionState::Connected;
        let _ = self.shared.event_tx.send(SyncEvent::Connected).await;
        log::info!("client {} connected to {url}", self.shared.client_id);

        let shared = self.shared.clone();
        let reply_tx = out_tx.clone();
        self.reader = Some(tokio::spawn(async move {
            let mut synced = false;
            while let Some(msg) = ws_reader.next().await {
                match msg {
                    Ok(Message::Binary(data)) => {
                        let sync_msg = match SyncMessage::decode(&data) {
                            Ok(m) => m,
                            Err(e) => {
                                log::warn!("client {}: undecodable frame: {e}", shared.client_id);
                                continue;
                            }
                        };
                        let Some(reply) = shared.handle_message(sync_msg, &mut synced).await else {
                            continue;
                        };
                        match reply.encode() {
                            Ok(encoded) => {
                                if reply_tx.send(encoded).await.is_err() {
                                    break;
                                }
                            }
                            Err(e) => log::warn!("client {}: failed to encode reply: {e}", shared.client_id),
                        }
                    }
                    Ok(Message::Close(frame)) => {
                        if let Some(frame) = frame {
                            log::info!("server closed connection: {} ({})", frame.reason, u16::from(frame.code));
                        }
                        break;
                    }
                    Err(e) => {
                        log::warn!("client {}: WebSocket error: {e}", shared.client_id);
                        break;
                    }
                    _ => {}
                }
            }
            shared.go_offline().await;
        }));
        self.outgoing_tx = Some(out_tx);
        Ok(())
    }

    /// Our half of the handshake, then our presence.
    async fn opening_frames(&self) -> Result<Vec<Vec<u8>>, ClientError> {
        let request = SyncMessage::StateRequest {
            state_vector: lock(&self.shared.doc).state_vector().clone(),
        };
        let mut frames = vec![request.encode()?];
        let mut presence = self.shared.presence.lock().await;
        if let Some(local) = presence.local.clone() {
            let update = presence.table.set_local(self.shared.client_id, local)?;
            frames.push(SyncMessage::Presence(update).encode()?);
        }
        Ok(frames)
    }

    /// Send locally generated operations.
    ///
    /// While disconnected this is a no-op: the operations are already in the
    /// document and the next handshake delivers them.
    pub async fn send_local_ops(&self, operations: Vec<Operation>) -> Result<(), ClientError> {
        if operations.is_empty() || self.connection_state().await != ConnectionState::Connected {
            return Ok(());
        }
        let encoded = SyncMessage::Update { operations }.encode()?;
        self.send(encoded).await;
        Ok(())
    }

    /// Publish this replica's presence. Kept and re-sent on reconnect.
    pub async fn set_presence(&self, presence: UserPresence) -> Result<(), ClientError> {
        let encoded = {
            let mut state = self.shared.presence.lock().await;
            state.local = Some(presence.clone());
            if self.connection_state().await != ConnectionState::Connected {
                return Ok(());
            }
            let update = state.table.set_local(self.shared.client_id, presence)?;
            SyncMessage::Presence(update).encode()?
        };
        self.send(encoded).await;
        Ok(())
    }

    async fn send(&self, frame: Vec<u8>) {
        if let Some(tx) = &self.outgoing_tx {
            if tx.send(frame).await.is_err() {
                log::debug!("client {}: writer gone, frame dropped", self.shared.client_id);
            }
        }
    }

    /// Close the connection. Safe to call when already disconnected.
    pub async fn disconnect(&mut self) {
        self.stop_tasks().await;
        self.shared.go_offline().await;
    }

    async fn stop_tasks(&mut self) {
        // The reader holds a sender clone; stop it first so the writer's
        // channel closes and it sends the close frame.
        if let Some(reader) = self.reader.take() {
            reader.abort();
            let _ = reader.await;
        }
        self.outgoing_tx = None;
        if let Some(writer) = self.writer.take() {
            let _ = writer.await;
        }
    }
}

impl Drop for SyncClient {
    fn drop(&mut self) {
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
    }
}
