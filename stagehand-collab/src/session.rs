//! One editor's connection to a shared document.
//!
//! ```text
//! Disconnected ──► Connecting ──► Connected ──► Bootstrapping ──► Ready
//!      ▲               │ (retry, timeout,            │ (join timeout,
//!      │               │  cancel)                    │  rejected, cancel)
//!      └───────────────┴─────────────────────────────┘
//! ```
//!
//! The session never touches the graph itself: inbound changes go through
//! the [`Reconciler`], which drives [`Editor::apply_remote`]. Everything is
//! `&mut self`, so a second concurrent handshake on the same session cannot
//! be expressed.

use std::time::Duration;

use stagehand_core::{Action, DocumentId, Editor};
use tokio_util::sync::CancellationToken;

use crate::assets::{AssetStage, AssetStatus, AssetTracker};
use crate::error::{BootstrapError, CollabError, TransportError};
use crate::presence::PresenceRoster;
use crate::protocol::{
    AssetNotice, HistoryOperation, JoinRequest, JoinSuccess, MessageType, ProtocolError,
    SyncMessage, UserInfo,
};
use crate::reconcile::{BatchReport, Reconciler, RemoteOutcome};
use crate::transport::{Connection, Connector};

/// Session configuration.
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// Base url; the document id is appended as the last path segment
    pub server_url: String,
    /// Deadline for one transport connect attempt
    pub connect_timeout: Duration,
    /// Deadline for the join response once connected
    pub bootstrap_timeout: Duration,
    pub max_connect_attempts: u32,
    /// Pause between failed connect attempts
    pub reconnect_delay: Duration,
    /// Reconnect and resume when the transport drops while ready
    pub auto_reconnect: bool,
    /// Frames buffered in each direction of a connection
    pub channel_buffer: usize,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            server_url: "ws://127.0.0.1:9090".to_string(),
            connect_timeout: Duration::from_secs(10),
            bootstrap_timeout: Duration::from_secs(15),
            max_connect_attempts: 5,
            reconnect_delay: Duration::from_secs(1),
            auto_reconnect: true,
            channel_buffer: 256,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Disconnected,
    Connecting,
    Connected,
    Bootstrapping,
    Ready,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BroadcastKind {
    Edit,
    Undo,
    Redo,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BroadcastOutcome {
    Sent,
    /// Not ready, or the action must not be re-broadcast.
    Skipped,
}

/// What a completed join did.
#[derive(Debug, Clone, PartialEq)]
pub struct BootstrapReport {
    pub document_id: DocumentId,
    pub version: u64,
    /// Other users in the room.
    pub present_users: usize,
    pub pending: BatchReport,
    /// Resumed after a transport loss: the snapshot was not reloaded.
    pub resumed: bool,
}

/// Events surfaced by [`CollabSession::next_event`].
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    Remote(RemoteOutcome),
    PendingApplied(BatchReport),
    UserJoined(UserInfo),
    UserLeft(UserInfo),
    Asset {
        notice: AssetNotice,
        status: AssetStatus,
    },
    Pong,
    /// The transport dropped and the session re-joined.
    Reconnected(BootstrapReport),
    /// The transport dropped and the session stays offline.
    Disconnected,
}

pub struct CollabSession<C> {
    connector: C,
    config: ChannelConfig,
    user: UserInfo,
    document_id: Option<DocumentId>,
    state: ChannelState,
    connection: Option<Connection>,
    reconciler: Reconciler,
    roster: PresenceRoster,
    assets: AssetTracker,
    cancel: CancellationToken,
    last_bootstrap: Option<BootstrapReport>,
}

impl<C: Connector> CollabSession<C> {
    pub fn new(connector: C, user: UserInfo, config: ChannelConfig) -> Self {
        Self {
            connector,
            config,
            reconciler: Reconciler::new(user.user_id),
            roster: PresenceRoster::new(user.user_id),
            user,
            document_id: None,
            state: ChannelState::Disconnected,
            connection: None,
            assets: AssetTracker::new(),
            cancel: CancellationToken::new(),
            last_bootstrap: None,
        }
    }

    pub fn state(&self) -> ChannelState {
        self.state
    }

    pub fn is_ready(&self) -> bool {
        self.state == ChannelState::Ready
    }

    pub fn user(&self) -> &UserInfo {
        &self.user
    }

    pub fn document_id(&self) -> Option<DocumentId> {
        self.document_id
    }

    pub fn roster(&self) -> &PresenceRoster {
        &self.roster
    }

    pub fn assets(&self) -> &AssetTracker {
        &self.assets
    }

    pub fn config(&self) -> &ChannelConfig {
        &self.config
    }

    /// Token that aborts the in-flight connect, join or wait.
    ///
    /// A fresh token is installed on [`disconnect`](Self::disconnect).
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Connect to `document_id` and bootstrap `editor` from the server.
    ///
    /// Calling this again while ready for the same document returns the
    /// previous report without touching the transport. Switching to another
    /// document tears the current session down and clears local history.
    pub async fn initialize(
        &mut self,
        editor: &mut Editor,
        document_id: DocumentId,
    ) -> Result<BootstrapReport, CollabError> {
        if self.state == ChannelState::Ready && self.document_id == Some(document_id) {
            if let Some(report) = &self.last_bootstrap {
                log::debug!("Already joined {document_id}");
                return Ok(report.clone());
            }
        }

        if self.document_id.is_some_and(|current| current != document_id) {
            log::info!("Switching session to document {document_id}");
            self.disconnect();
            editor.reset_history();
        } else if self.connection.is_some() {
            self.disconnect();
        }
        if self.cancel.is_cancelled() {
            self.cancel = CancellationToken::new();
        }

        self.document_id = Some(document_id);
        self.establish(editor, false).await
    }

    /// Re-join the current document, replaying only what was missed.
    pub async fn reconnect(&mut self, editor: &mut Editor) -> Result<BootstrapReport, CollabError> {
        if self.document_id.is_none() {
            return Err(CollabError::NotReady);
        }
        self.drop_connection();
        if self.cancel.is_cancelled() {
            self.cancel = CancellationToken::new();
        }
        self.establish(editor, true).await
    }

    /// Send a recorded action to the other editors.
    ///
    /// Skipped (with a warning) when not ready. Edits that were themselves
    /// received from another editor are never sent again.
    pub async fn broadcast(
        &mut self,
        action: &Action,
        kind: BroadcastKind,
    ) -> Result<BroadcastOutcome, CollabError> {
        let Some(document_id) = self.ready_document() else {
            log::warn!(
                "Channel not ready ({:?}), dropping {:?} broadcast of {}",
                self.state,
                kind,
                action.id
            );
            return Ok(BroadcastOutcome::Skipped);
        };
        if kind == BroadcastKind::Edit && !action.is_local() {
            log::debug!("Not re-broadcasting remote action {}", action.id);
            return Ok(BroadcastOutcome::Skipped);
        }

        let user_id = self.user.user_id;
        let msg = match kind {
            BroadcastKind::Edit => SyncMessage::edit(user_id, document_id, action)?,
            BroadcastKind::Undo => {
                SyncMessage::history(user_id, document_id, action, HistoryOperation::Undo)?
            }
            BroadcastKind::Redo => {
                SyncMessage::history(user_id, document_id, action, HistoryOperation::Redo)?
            }
        };
        self.send(&msg).await?;
        Ok(BroadcastOutcome::Sent)
    }

    pub async fn broadcast_asset(
        &mut self,
        stage: AssetStage,
        notice: &AssetNotice,
    ) -> Result<BroadcastOutcome, CollabError> {
        let Some(document_id) = self.ready_document() else {
            log::warn!("Channel not ready, dropping asset notice {}", notice.asset_id);
            return Ok(BroadcastOutcome::Skipped);
        };
        self.assets.apply(stage, notice);
        let msg = SyncMessage::asset(stage.message_type(), self.user.user_id, document_id, notice)?;
        self.send(&msg).await?;
        Ok(BroadcastOutcome::Sent)
    }

    /// Ask for every change newer than the local history.
    pub async fn request_pending_changes(
        &mut self,
        editor: &Editor,
    ) -> Result<BroadcastOutcome, CollabError> {
        let Some(document_id) = self.ready_document() else {
            return Ok(BroadcastOutcome::Skipped);
        };
        let since = editor.history().max_timestamp().unwrap_or(0);
        let msg = SyncMessage::request_pending_changes(self.user.user_id, document_id, since)?;
        self.send(&msg).await?;
        Ok(BroadcastOutcome::Sent)
    }

    pub async fn ping(&mut self) -> Result<(), CollabError> {
        self.send(&SyncMessage::ping(self.user.user_id)).await
    }

    /// Wait for the next inbound frame and apply it.
    ///
    /// Frames that need no attention (pings, stray handshake messages,
    /// undecodable bytes) are handled internally and waiting continues.
    pub async fn next_event(&mut self, editor: &mut Editor) -> Result<SessionEvent, CollabError> {
        loop {
            let cancel = self.cancel.clone();
            let conn = self.connection.as_mut().ok_or(CollabError::NotReady)?;
            let frame = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(CollabError::Cancelled),
                frame = conn.incoming.recv() => frame,
            };

            match frame {
                Some(bytes) => {
                    if let Some(event) = self.dispatch(editor, &bytes).await? {
                        return Ok(event);
                    }
                }
                None => return self.handle_transport_loss(editor).await,
            }
        }
    }

    /// Drop the transport and reset to `Disconnected`.
    ///
    /// Cancels anything in flight and clears presence and asset state.
    /// Local graph and history are kept.
    pub fn disconnect(&mut self) {
        self.cancel.cancel();
        self.cancel = CancellationToken::new();
        self.drop_connection();
        self.assets.clear();
        self.last_bootstrap = None;
        log::info!("Session for {} disconnected", self.user.name);
    }

    fn drop_connection(&mut self) {
        self.connection = None;
        self.state = ChannelState::Disconnected;
        self.roster.clear();
    }

    fn ready_document(&self) -> Option<DocumentId> {
        if self.state == ChannelState::Ready {
            self.document_id
        } else {
            None
        }
    }

    async fn send(&mut self, msg: &SyncMessage) -> Result<(), CollabError> {
        let encoded = msg.encode()?;
        let conn = self.connection.as_ref().ok_or(CollabError::NotReady)?;
        conn.outgoing
            .send(encoded)
            .await
            .map_err(|_| TransportError::Closed)?;
        Ok(())
    }

    async fn establish(
        &mut self,
        editor: &mut Editor,
        resume: bool,
    ) -> Result<BootstrapReport, CollabError> {
        self.connect_with_retry().await?;
        self.state = ChannelState::Bootstrapping;
        match self.bootstrap(editor, resume).await {
            Ok(report) => {
                self.state = ChannelState::Ready;
                self.last_bootstrap = Some(report.clone());
                log::info!(
                    "Joined {} v{} ({} others present, {} changes replayed)",
                    report.document_id,
                    report.version,
                    report.present_users,
                    report.pending.applied.len()
                );
                Ok(report)
            }
            Err(e) => {
                log::warn!("Join failed: {e}");
                self.drop_connection();
                Err(e)
            }
        }
    }

    async fn connect_with_retry(&mut self) -> Result<(), CollabError> {
        let document_id = self.document_id.ok_or(CollabError::NotReady)?;
        let attempts = self.config.max_connect_attempts.max(1);
        let mut last_error = TransportError::Closed;

        for attempt in 1..=attempts {
            self.state = ChannelState::Connecting;
            let cancel = self.cancel.clone();
            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                result = tokio::time::timeout(
                    self.config.connect_timeout,
                    self.connector.connect(document_id),
                ) => Some(result),
            };

            match outcome {
                None => {
                    self.state = ChannelState::Disconnected;
                    return Err(CollabError::Cancelled);
                }
                Some(Ok(Ok(connection))) => {
                    self.connection = Some(connection);
                    self.state = ChannelState::Connected;
                    log::debug!("Connected for {document_id} on attempt {attempt}");
                    return Ok(());
                }
                Some(Ok(Err(e))) => {
                    log::warn!("Connect attempt {attempt}/{attempts} failed: {e}");
                    last_error = e;
                }
                Some(Err(_)) => {
                    log::warn!("Connect attempt {attempt}/{attempts} timed out");
                    last_error = TransportError::Timeout(self.config.connect_timeout);
                }
            }

            if attempt < attempts {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {
                        self.state = ChannelState::Disconnected;
                        return Err(CollabError::Cancelled);
                    }
                    _ = tokio::time::sleep(self.config.reconnect_delay) => {}
                }
            }
        }

        self.state = ChannelState::Disconnected;
        Err(last_error.into())
    }

    async fn bootstrap(
        &mut self,
        editor: &mut Editor,
        resume: bool,
    ) -> Result<BootstrapReport, CollabError> {
        let document_id = self.document_id.ok_or(CollabError::NotReady)?;
        let since = if resume {
            editor.history().max_timestamp()
        } else {
            None
        };
        let request = JoinRequest {
            user_info: self.user.clone(),
            since,
        };
        self.send(&SyncMessage::join(self.user.user_id, document_id, &request)?)
            .await?;

        let deadline = tokio::time::Instant::now() + self.config.bootstrap_timeout;
        loop {
            let cancel = self.cancel.clone();
            let conn = self.connection.as_mut().ok_or(TransportError::Closed)?;
            let frame = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(CollabError::Cancelled),
                frame = tokio::time::timeout_at(deadline, conn.incoming.recv()) => frame,
            };
            let bytes = match frame {
                Err(_) => {
                    return Err(BootstrapError::Timeout(self.config.bootstrap_timeout).into())
                }
                Ok(None) => return Err(TransportError::Closed.into()),
                Ok(Some(bytes)) => bytes,
            };

            let msg = match SyncMessage::decode(&bytes) {
                Ok(msg) => msg,
                Err(e) => {
                    log::warn!("Dropping undecodable frame during join: {e}");
                    continue;
                }
            };
            match msg.msg_type {
                MessageType::JoinSuccess => {
                    let success = msg
                        .join_success_payload()
                        .map_err(BootstrapError::Protocol)?;
                    return self.finish_bootstrap(editor, success, resume);
                }
                MessageType::JoinError => {
                    let rejection = msg.join_error_payload().map_err(BootstrapError::Protocol)?;
                    return Err(BootstrapError::Rejected(rejection.message).into());
                }
                MessageType::Ping => {
                    self.send(&SyncMessage::pong(self.user.user_id)).await?;
                }
                other => log::debug!("Ignoring {other:?} while joining"),
            }
        }
    }

    fn finish_bootstrap(
        &mut self,
        editor: &mut Editor,
        success: JoinSuccess,
        resume: bool,
    ) -> Result<BootstrapReport, CollabError> {
        if !resume {
            editor
                .load_document(&success.document)
                .map_err(BootstrapError::Document)?;
        }
        self.roster.replace(success.present_users);
        let pending = self
            .reconciler
            .apply_pending(editor, success.pending_changes);
        Ok(BootstrapReport {
            document_id: success.document.id,
            version: success.document.version,
            present_users: self.roster.len(),
            pending,
            resumed: resume,
        })
    }

    async fn dispatch(
        &mut self,
        editor: &mut Editor,
        bytes: &[u8],
    ) -> Result<Option<SessionEvent>, CollabError> {
        let msg = match SyncMessage::decode(bytes) {
            Ok(msg) => msg,
            Err(e) => {
                log::warn!("Dropping undecodable frame: {e}");
                return Ok(None);
            }
        };
        let for_this_document = Some(msg.doc_id) == self.document_id;

        match msg.msg_type {
            MessageType::Ping => {
                self.send(&SyncMessage::pong(self.user.user_id)).await?;
                Ok(None)
            }
            MessageType::Pong => Ok(Some(SessionEvent::Pong)),
            _ if !for_this_document => {
                log::debug!("Ignoring {:?} for document {}", msg.msg_type, msg.doc_id);
                Ok(None)
            }
            _ => match self.apply_inbound(editor, &msg) {
                Ok(event) => Ok(event),
                Err(e) => {
                    log::warn!(
                        "Dropping {:?} from {} with bad payload: {e}",
                        msg.msg_type,
                        msg.from_user
                    );
                    Ok(None)
                }
            },
        }
    }

    /// Apply a frame addressed to the current document.
    fn apply_inbound(
        &mut self,
        editor: &mut Editor,
        msg: &SyncMessage,
    ) -> Result<Option<SessionEvent>, ProtocolError> {
        match msg.msg_type {
            MessageType::Edit | MessageType::UndoNotify | MessageType::RedoNotify => {
                let change = msg.to_pending_change()?;
                let outcome = self.reconciler.apply_change(editor, &change);
                Ok(Some(SessionEvent::Remote(outcome)))
            }
            MessageType::PendingChanges => {
                let payload = msg.pending_changes_payload()?;
                let report = self.reconciler.apply_pending(editor, payload.changes);
                Ok(Some(SessionEvent::PendingApplied(report)))
            }
            MessageType::PresenceJoined => {
                let user = msg.presence()?.user_info;
                if self.roster.join(user.clone()) {
                    Ok(Some(SessionEvent::UserJoined(user)))
                } else {
                    Ok(None)
                }
            }
            MessageType::PresenceLeft => {
                let user = msg.presence()?.user_info;
                Ok(self.roster.leave(user.user_id).map(SessionEvent::UserLeft))
            }
            MessageType::AssetUploadStart
            | MessageType::AssetUploadComplete
            | MessageType::AssetUploadFailed => {
                let notice = msg.asset_notice()?;
                let stage = AssetStage::from_message_type(msg.msg_type)?;
                let status = self.assets.apply(stage, &notice);
                Ok(Some(SessionEvent::Asset { notice, status }))
            }
            MessageType::Ping
            | MessageType::Pong
            | MessageType::Join
            | MessageType::JoinSuccess
            | MessageType::JoinError
            | MessageType::RequestPendingChanges => {
                log::debug!("Ignoring stray {:?}", msg.msg_type);
                Ok(None)
            }
        }
    }

    async fn handle_transport_loss(
        &mut self,
        editor: &mut Editor,
    ) -> Result<SessionEvent, CollabError> {
        log::warn!("Connection lost while {:?}", self.state);
        let was_ready = self.state == ChannelState::Ready;
        self.drop_connection();
        self.last_bootstrap = None;

        if !(was_ready && self.config.auto_reconnect) {
            return Ok(SessionEvent::Disconnected);
        }
        let report = self.establish(editor, true).await?;
        Ok(SessionEvent::Reconnected(report))
    }
}
