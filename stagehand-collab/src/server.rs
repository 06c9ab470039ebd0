//! WebSocket relay with one room per document.
//!
//! ```text
//! Editor A ──┐                          ┌── SceneGraph (authoritative)
//!            ├── Room (doc_id) ─────────┼── change log (bounded)
//! Editor B ──┘        │                 └── last_seen per user
//!                     ▼
//!              BroadcastGroup ──► A, B, C ...
//! ```
//!
//! The relay keeps its own copy of each document so late joiners get a
//! current snapshot, and a bounded log of recent changes so reconnecting
//! editors only replay what they missed. It does not arbitrate conflicts:
//! a change that does not fit the relay's graph is still relayed.

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use stagehand_core::{DocumentId, DocumentSnapshot, GraphError, SceneGraph, UserId};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, RwLock};
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::broadcast::BroadcastGroup;
use crate::error::CollabError;
use crate::protocol::{ChangeKind, JoinSuccess, MessageType, PendingChange, SyncMessage, UserInfo};

#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Maximum simultaneous editors per document
    pub max_users_per_room: usize,
    /// Broadcast channel capacity per room
    pub broadcast_capacity: usize,
    /// Relay a change back to the editor that sent it
    pub echo_to_sender: bool,
    /// Changes kept per room for catch-up
    pub change_log_limit: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            max_users_per_room: 100,
            broadcast_capacity: 256,
            echo_to_sender: true,
            change_log_limit: 10_000,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
    pub active_rooms: usize,
    pub logged_changes: u64,
    /// Frames skipped by lagging connections, across all rooms.
    pub dropped_frames: u64,
}

/// A user's place in a room and the connection holding it.
struct Seat {
    user: UserInfo,
    connection_id: u64,
}

struct DocumentRoom {
    id: DocumentId,
    graph: SceneGraph,
    version: u64,
    log: VecDeque<PendingChange>,
    /// Newest logged timestamp when each user last left.
    last_seen: HashMap<UserId, u64>,
    seats: HashMap<UserId, Seat>,
    broadcast: Arc<BroadcastGroup>,
}

impl DocumentRoom {
    fn new(id: DocumentId, broadcast_capacity: usize) -> Self {
        Self {
            id,
            graph: SceneGraph::new(),
            version: 0,
            log: VecDeque::new(),
            last_seen: HashMap::new(),
            seats: HashMap::new(),
            broadcast: Arc::new(BroadcastGroup::new(broadcast_capacity)),
        }
    }

    fn document(&self) -> DocumentSnapshot {
        DocumentSnapshot::with_nodes(self.id, self.version, self.graph.top_level_snapshots())
    }

    /// Logged changes newer than `since` that `user` did not author.
    fn changes_since(&self, since: Option<u64>, user: UserId) -> Vec<PendingChange> {
        let Some(since) = since else {
            return Vec::new();
        };
        self.log
            .iter()
            .filter(|c| c.timestamp > since && c.from_user_id != user)
            .cloned()
            .collect()
    }

    /// Seat `user` on `connection_id`, replacing an older connection of
    /// the same user, and subscribe it to the room.
    fn seat(&mut self, user: UserInfo, connection_id: u64) -> broadcast::Receiver<Arc<Vec<u8>>> {
        self.seats.insert(user.user_id, Seat { user, connection_id });
        self.broadcast.subscribe()
    }

    /// Free the seat unless a newer connection already holds it.
    fn unseat(&mut self, user_id: UserId, connection_id: u64) -> bool {
        match self.seats.get(&user_id) {
            Some(seat) if seat.connection_id == connection_id => {
                self.seats.remove(&user_id);
                true
            }
            _ => false,
        }
    }

    fn present_users(&self) -> Vec<UserInfo> {
        self.seats.values().map(|seat| seat.user.clone()).collect()
    }

    fn newest_timestamp(&self) -> Option<u64> {
        self.log.iter().map(|c| c.timestamp).max()
    }

    /// Apply a change to the relay's graph and log it.
    fn record(&mut self, change: PendingChange, limit: usize) {
        let state = match change.kind {
            ChangeKind::Edit | ChangeKind::Redo => &change.change.after,
            ChangeKind::Undo => &change.change.before,
        };
        match self.graph.apply_state(state) {
            Ok(report) => log::trace!(
                "Room {}: {} upserted, {} removed",
                self.id,
                report.upserted.len(),
                report.removed.len()
            ),
            Err(e) => log::warn!(
                "Room {}: {:?} {} from {} does not fit the relay copy: {e}",
                self.id,
                change.kind,
                change.change.id,
                change.from_user_id
            ),
        }
        self.graph.take_dirty();
        self.version += 1;
        self.log.push_back(change);
        while self.log.len() > limit.max(1) {
            self.log.pop_front();
        }
    }
}

/// State for one accepted WebSocket after a successful join.
struct Joined {
    user: UserInfo,
    doc_id: DocumentId,
    rx: broadcast::Receiver<Arc<Vec<u8>>>,
}

#[derive(Clone)]
pub struct RelayServer {
    config: ServerConfig,
    rooms: Arc<RwLock<HashMap<DocumentId, DocumentRoom>>>,
    stats: Arc<RwLock<ServerStats>>,
    next_connection: Arc<AtomicU64>,
}

impl RelayServer {
    pub fn new(config: ServerConfig) -> Self {
        Self {
            config,
            rooms: Arc::new(RwLock::new(HashMap::new())),
            stats: Arc::new(RwLock::new(ServerStats::default())),
            next_connection: Arc::new(AtomicU64::new(1)),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(ServerConfig::default())
    }

    /// Preload a document so the first joiner receives it.
    ///
    /// Replaces whatever the room held; the change log is kept.
    pub async fn seed_document(&self, document: DocumentSnapshot) -> Result<(), GraphError> {
        let graph = SceneGraph::from_snapshots(&document.nodes)?;
        let mut rooms = self.rooms.write().await;
        let room = rooms
            .entry(document.id)
            .or_insert_with(|| DocumentRoom::new(document.id, self.config.broadcast_capacity));
        room.graph = graph;
        room.version = document.version;
        log::info!(
            "Seeded document {} v{} ({} nodes)",
            document.id,
            document.version,
            document.node_count()
        );
        Ok(())
    }

    /// Current relay copy of a document.
    pub async fn document(&self, doc_id: DocumentId) -> Option<DocumentSnapshot> {
        self.rooms.read().await.get(&doc_id).map(DocumentRoom::document)
    }

    pub async fn bind(&self) -> Result<TcpListener, CollabError> {
        Ok(TcpListener::bind(&self.config.bind_addr).await?)
    }

    /// Bind the configured address and serve until the listener fails.
    pub async fn run(&self) -> Result<(), CollabError> {
        let listener = self.bind().await?;
        self.serve(listener).await
    }

    pub async fn serve(&self, listener: TcpListener) -> Result<(), CollabError> {
        log::info!("Relay listening on {}", listener.local_addr()?);
        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let server = self.clone();
            tokio::spawn(async move {
                if let Err(e) = server.handle_connection(stream, addr).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    pub async fn stats(&self) -> ServerStats {
        let mut stats = self.stats.read().await.clone();
        stats.dropped_frames = self
            .rooms
            .read()
            .await
            .values()
            .map(|room| room.broadcast.dropped_frames())
            .sum();
        stats
    }

    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    async fn handle_connection(
        &self,
        stream: TcpStream,
        addr: SocketAddr,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();
        let connection_id = self.next_connection.fetch_add(1, Ordering::Relaxed);
        log::info!("WebSocket connection {connection_id} established from {addr}");

        {
            let mut s = self.stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }

        let mut joined: Option<Joined> = None;
        let result: Result<(), Box<dyn std::error::Error + Send + Sync>> = async {
            loop {
                tokio::select! {
                    msg = ws_receiver.next() => {
                        match msg {
                            Some(Ok(Message::Binary(data))) => {
                                let bytes: Vec<u8> = data.into();
                                {
                                    let mut s = self.stats.write().await;
                                    s.total_messages += 1;
                                    s.total_bytes += bytes.len() as u64;
                                }
                                let msg = match SyncMessage::decode(&bytes) {
                                    Ok(msg) => msg,
                                    Err(e) => {
                                        log::warn!("Failed to decode message from {addr}: {e}");
                                        continue;
                                    }
                                };

                                if msg.msg_type == MessageType::Join {
                                    if joined.is_some() {
                                        log::warn!("Ignoring second join from {addr}");
                                        continue;
                                    }
                                    let (reply, accepted) = self.handle_join(&msg, connection_id).await?;
                                    ws_sender.send(Message::Binary(reply.encode()?.into())).await?;
                                    if let Some(accepted) = accepted {
                                        let presence = SyncMessage::presence_joined(accepted.doc_id, &accepted.user)?;
                                        if let Some(group) = self.group(accepted.doc_id).await {
                                            group.broadcast(&presence)?;
                                        }
                                        joined = Some(accepted);
                                    }
                                    continue;
                                }

                                if msg.msg_type == MessageType::Ping {
                                    let pong = SyncMessage::pong(Uuid::nil());
                                    ws_sender.send(Message::Binary(pong.encode()?.into())).await?;
                                    continue;
                                }

                                let Some(session) = joined.as_ref() else {
                                    log::debug!("Dropping {:?} from {addr} before join", msg.msg_type);
                                    continue;
                                };
                                if msg.doc_id != session.doc_id {
                                    log::warn!(
                                        "Dropping {:?} for {} on connection joined to {}",
                                        msg.msg_type, msg.doc_id, session.doc_id
                                    );
                                    continue;
                                }
                                if let Some(reply) = self.handle_joined_message(&msg, bytes).await? {
                                    ws_sender.send(Message::Binary(reply.encode()?.into())).await?;
                                }
                            }

                            Some(Ok(Message::Close(_))) | None => {
                                log::info!("Connection closed from {addr}");
                                break;
                            }

                            Some(Ok(Message::Ping(data))) => {
                                ws_sender.send(Message::Pong(data)).await?;
                            }

                            Some(Err(e)) => {
                                log::error!("WebSocket error from {addr}: {e}");
                                break;
                            }

                            _ => {}
                        }
                    }

                    frame = async {
                        match joined.as_mut() {
                            Some(session) => session.rx.recv().await,
                            None => std::future::pending().await,
                        }
                    } => {
                        match frame {
                            Ok(data) => {
                                if !self.config.echo_to_sender && self.is_own_frame(&data, &joined) {
                                    continue;
                                }
                                ws_sender.send(Message::Binary(data.to_vec().into())).await?;
                            }
                            Err(broadcast::error::RecvError::Lagged(n)) => {
                                log::warn!("Connection {connection_id} lagged by {n} messages");
                                if let Some(session) = joined.as_ref() {
                                    if let Some(group) = self.group(session.doc_id).await {
                                        group.record_dropped(n);
                                    }
                                }
                            }
                            Err(_) => break,
                        }
                    }
                }
            }
            Ok(())
        }
        .await;

        if let Some(session) = joined {
            self.leave(session, connection_id).await;
        }
        {
            let mut s = self.stats.write().await;
            s.active_connections = s.active_connections.saturating_sub(1);
        }
        result
    }

    fn is_own_frame(&self, data: &[u8], joined: &Option<Joined>) -> bool {
        let Some(session) = joined else {
            return false;
        };
        SyncMessage::decode(data)
            .map(|m| m.from_user == session.user.user_id)
            .unwrap_or(false)
    }

    async fn group(&self, doc_id: DocumentId) -> Option<Arc<BroadcastGroup>> {
        self.rooms
            .read()
            .await
            .get(&doc_id)
            .map(|room| room.broadcast.clone())
    }

    /// Returns the direct reply and, when accepted, the joined state.
    async fn handle_join(
        &self,
        msg: &SyncMessage,
        connection_id: u64,
    ) -> Result<(SyncMessage, Option<Joined>), CollabError> {
        let doc_id = msg.doc_id;
        let request = match msg.join_request() {
            Ok(request) => request,
            Err(e) => {
                log::warn!("Rejecting malformed join for {doc_id}: {e}");
                let reply = SyncMessage::join_error(doc_id, format!("invalid join request: {e}"))?;
                return Ok((reply, None));
            }
        };
        let user = UserInfo {
            user_id: msg.from_user,
            ..request.user_info
        };

        let mut rooms = self.rooms.write().await;
        let room = rooms
            .entry(doc_id)
            .or_insert_with(|| DocumentRoom::new(doc_id, self.config.broadcast_capacity));

        let rejoining = room.seats.contains_key(&user.user_id);
        if !rejoining && room.seats.len() >= self.config.max_users_per_room {
            log::warn!("Room {doc_id} is full, rejecting {}", user.name);
            let reply = SyncMessage::join_error(doc_id, "document has reached its editor limit")?;
            return Ok((reply, None));
        }

        let since = request
            .since
            .or_else(|| room.last_seen.get(&user.user_id).copied());
        let pending_changes = room.changes_since(since, user.user_id);
        let rx = room.seat(user.clone(), connection_id);

        let success = JoinSuccess {
            document: room.document(),
            user_info: user.clone(),
            present_users: room.present_users(),
            pending_changes,
        };
        let room_count = rooms.len();
        drop(rooms);

        self.stats.write().await.active_rooms = room_count;
        log::info!(
            "{} ({}) joined doc {} (since {:?}, {} pending)",
            user.name,
            user.user_id,
            doc_id,
            since,
            success.pending_changes.len()
        );

        let reply = SyncMessage::join_success(doc_id, &success)?;
        Ok((reply, Some(Joined { user, doc_id, rx })))
    }

    /// Handle a message on a joined connection; returns a direct reply if any.
    async fn handle_joined_message(
        &self,
        msg: &SyncMessage,
        bytes: Vec<u8>,
    ) -> Result<Option<SyncMessage>, CollabError> {
        match msg.msg_type {
            MessageType::Edit | MessageType::UndoNotify | MessageType::RedoNotify => {
                let change = match msg.to_pending_change() {
                    Ok(change) => change,
                    Err(e) => {
                        log::warn!("Dropping malformed {:?}: {e}", msg.msg_type);
                        return Ok(None);
                    }
                };
                let group = {
                    let mut rooms = self.rooms.write().await;
                    let Some(room) = rooms.get_mut(&msg.doc_id) else {
                        return Ok(None);
                    };
                    room.record(change, self.config.change_log_limit);
                    room.broadcast.clone()
                };
                self.stats.write().await.logged_changes += 1;
                group.broadcast_raw(Arc::new(bytes));
                Ok(None)
            }
            MessageType::RequestPendingChanges => {
                let request = msg.pending_request()?;
                let changes = {
                    let rooms = self.rooms.read().await;
                    rooms
                        .get(&msg.doc_id)
                        .map(|room| room.changes_since(Some(request.since), msg.from_user))
                        .unwrap_or_default()
                };
                log::debug!(
                    "Sending {} pending changes since {} to {}",
                    changes.len(),
                    request.since,
                    msg.from_user
                );
                Ok(Some(SyncMessage::pending_changes(msg.doc_id, changes)?))
            }
            MessageType::AssetUploadStart
            | MessageType::AssetUploadComplete
            | MessageType::AssetUploadFailed
            | MessageType::PresenceJoined
            | MessageType::PresenceLeft => {
                if let Some(group) = self.group(msg.doc_id).await {
                    group.broadcast_raw(Arc::new(bytes));
                }
                Ok(None)
            }
            other => {
                log::debug!("Unhandled message type: {other:?}");
                Ok(None)
            }
        }
    }

    async fn leave(&self, session: Joined, connection_id: u64) {
        let Joined { user, doc_id, .. } = session;
        let mut rooms = self.rooms.write().await;
        let Some(room) = rooms.get_mut(&doc_id) else {
            return;
        };

        if !room.unseat(user.user_id, connection_id) {
            log::debug!("Stale connection {connection_id} for {} closed", user.name);
            return;
        }
        let newest = room.newest_timestamp().unwrap_or(0);
        room.last_seen.insert(user.user_id, newest);

        let presence = SyncMessage::presence_left(doc_id, &user)
            .and_then(|msg| room.broadcast.broadcast(&msg));
        if let Err(e) = presence {
            log::debug!("Presence-left for {} not relayed: {e}", user.name);
        }
        log::info!("{} ({}) left doc {}", user.name, user.user_id, doc_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::JoinRequest;
    use stagehand_core::{Action, ActionState, NodeSnapshot};

    fn join_msg(user: &UserInfo, doc_id: DocumentId) -> SyncMessage {
        let request = JoinRequest {
            user_info: user.clone(),
            since: None,
        };
        SyncMessage::join(user.user_id, doc_id, &request).unwrap()
    }

    async fn join(server: &RelayServer, user: &UserInfo, doc_id: DocumentId, connection_id: u64) -> Joined {
        let (reply, joined) = server
            .handle_join(&join_msg(user, doc_id), connection_id)
            .await
            .unwrap();
        assert_eq!(reply.msg_type, MessageType::JoinSuccess);
        joined.unwrap()
    }

    fn change(from: UserId, timestamp: u64) -> PendingChange {
        PendingChange {
            change: Action::new(ActionState::default(), ActionState::default()),
            from_user_id: from,
            timestamp,
            kind: ChangeKind::Edit,
        }
    }

    #[test]
    fn test_server_config_default() {
        let config = ServerConfig::default();
        assert_eq!(config.bind_addr, "127.0.0.1:9090");
        assert_eq!(config.max_users_per_room, 100);
        assert_eq!(config.broadcast_capacity, 256);
        assert!(config.echo_to_sender);
    }

    #[tokio::test]
    async fn test_server_stats_initial() {
        let server = RelayServer::with_defaults();
        assert_eq!(server.stats().await, ServerStats::default());
        assert_eq!(server.bind_addr(), "127.0.0.1:9090");
    }

    #[tokio::test]
    async fn test_seed_document() {
        let server = RelayServer::with_defaults();
        let rect = NodeSnapshot::rect(4.0, 4.0);
        let doc = DocumentSnapshot::with_nodes(Uuid::new_v4(), 12, vec![rect.clone()]);

        server.seed_document(doc.clone()).await.unwrap();
        let stored = server.document(doc.id).await.unwrap();
        assert_eq!(stored.version, 12);
        assert_eq!(stored.nodes, vec![rect]);
        assert!(server.document(Uuid::new_v4()).await.is_none());
    }

    #[tokio::test]
    async fn test_seed_rejects_invalid_document() {
        let server = RelayServer::with_defaults();
        let seat = NodeSnapshot::seat(5.0, "blue");
        let doc = DocumentSnapshot::with_nodes(Uuid::new_v4(), 1, vec![seat]);
        assert!(server.seed_document(doc).await.is_err());
    }

    #[test]
    fn test_changes_since_filters_time_and_author() {
        let mut room = DocumentRoom::new(Uuid::new_v4(), 8);
        let me = Uuid::new_v4();
        let peer = Uuid::new_v4();
        room.record(change(peer, 100), 10);
        room.record(change(me, 150), 10);
        room.record(change(peer, 200), 10);

        assert!(room.changes_since(None, me).is_empty());
        let pending = room.changes_since(Some(100), me);
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].timestamp, 200);
        assert_eq!(room.changes_since(Some(0), peer).len(), 1);
        assert_eq!(room.version, 3);
    }

    #[test]
    fn test_change_log_is_bounded() {
        let mut room = DocumentRoom::new(Uuid::new_v4(), 8);
        let peer = Uuid::new_v4();
        for ts in 1..=5 {
            room.record(change(peer, ts), 3);
        }
        assert_eq!(room.log.len(), 3);
        assert_eq!(room.log.front().map(|c| c.timestamp), Some(3));
        assert_eq!(room.newest_timestamp(), Some(5));
    }

    #[test]
    fn test_undo_applies_before_state() {
        let mut room = DocumentRoom::new(Uuid::new_v4(), 8);
        let rect = NodeSnapshot::rect(1.0, 1.0);
        let create = Action::new(
            ActionState {
                nodes: Some(Vec::new()),
                affected_ids: Some(vec![rect.id]),
                ..ActionState::default()
            },
            ActionState {
                nodes: Some(vec![rect.clone()]),
                affected_ids: Some(vec![rect.id]),
                ..ActionState::default()
            },
        );
        let peer = Uuid::new_v4();
        room.record(
            PendingChange {
                change: create.clone(),
                from_user_id: peer,
                timestamp: 1,
                kind: ChangeKind::Edit,
            },
            10,
        );
        assert!(room.graph.contains(rect.id));

        room.record(
            PendingChange {
                change: create,
                from_user_id: peer,
                timestamp: 2,
                kind: ChangeKind::Undo,
            },
            10,
        );
        assert!(!room.graph.contains(rect.id));
    }

    #[tokio::test]
    async fn test_leave_frees_seat_and_announces() {
        let server = RelayServer::with_defaults();
        let doc_id = Uuid::new_v4();
        let alice = UserInfo::new("Alice");
        let bob = UserInfo::new("Bob");
        let alice_joined = join(&server, &alice, doc_id, 1).await;
        let mut bob_joined = join(&server, &bob, doc_id, 2).await;

        server.leave(alice_joined, 1).await;
        let frame = bob_joined.rx.recv().await.unwrap();
        let msg = SyncMessage::decode(&frame).unwrap();
        assert_eq!(msg.msg_type, MessageType::PresenceLeft);
        assert_eq!(msg.presence().unwrap().user_info, alice);

        let rooms = server.rooms.read().await;
        let room = &rooms[&doc_id];
        assert_eq!(room.present_users(), vec![bob]);
        assert_eq!(room.last_seen.get(&alice.user_id), Some(&0));
    }

    #[tokio::test]
    async fn test_stale_connection_keeps_newer_seat() {
        let server = RelayServer::new(ServerConfig {
            max_users_per_room: 1,
            ..ServerConfig::default()
        });
        let doc_id = Uuid::new_v4();
        let alice = UserInfo::new("Alice");
        let first = join(&server, &alice, doc_id, 1).await;
        let _second = join(&server, &alice, doc_id, 2).await;

        server.leave(first, 1).await;
        let rooms = server.rooms.read().await;
        let room = &rooms[&doc_id];
        assert_eq!(room.present_users(), vec![alice.clone()]);
        assert!(!room.last_seen.contains_key(&alice.user_id));
    }

    #[tokio::test]
    async fn test_stats_sum_dropped_frames() {
        let server = RelayServer::with_defaults();
        let docs = [Uuid::new_v4(), Uuid::new_v4()];
        for doc_id in docs {
            server.seed_document(DocumentSnapshot::new(doc_id)).await.unwrap();
        }
        {
            let rooms = server.rooms.read().await;
            rooms[&docs[0]].broadcast.record_dropped(2);
            rooms[&docs[1]].broadcast.record_dropped(3);
        }
        assert_eq!(server.stats().await.dropped_frames, 5);
    }
}
