//! Binary protocol for action replication.
//!
//! Wire format (bincode-encoded):
//! ```text
//! ┌──────────┬───────────┬──────────┬───────────┬──────────┐
//! │ msg_type │ from_user │ doc_id   │ timestamp │ payload  │
//! │ 1 byte   │ 16 bytes  │ 16 bytes │ varint    │ variable │
//! └──────────┴───────────┴──────────┴───────────┴──────────┘
//! ```
//!
//! The payload is itself a bincode-encoded struct whose type is fixed by
//! `msg_type`; the typed accessors refuse to decode a payload as the wrong
//! type.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use stagehand_core::{now_millis, Action, DocumentId, DocumentSnapshot, NodeId, UserId};
use thiserror::Error;
use uuid::Uuid;

use crate::presence::color_for;

/// Message types for the sync protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageType {
    /// Client asks to join a document
    Join = 1,
    /// Server accepts a join with the current document
    JoinSuccess = 2,
    JoinError = 3,
    /// A recorded action
    Edit = 4,
    UndoNotify = 5,
    RedoNotify = 6,
    /// Catch-up request carrying the client's newest timestamp
    RequestPendingChanges = 7,
    PendingChanges = 8,
    PresenceJoined = 9,
    PresenceLeft = 10,
    AssetUploadStart = 11,
    AssetUploadComplete = 12,
    AssetUploadFailed = 13,
    Ping = 14,
    Pong = 15,
}

/// Connected user with display metadata.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UserInfo {
    pub user_id: UserId,
    pub name: String,
    /// `#rrggbb`, stable per user id
    pub color: String,
}

impl UserInfo {
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_id(Uuid::new_v4(), name)
    }

    /// Create with an id handed out by the identity provider.
    pub fn with_id(user_id: UserId, name: impl Into<String>) -> Self {
        Self {
            user_id,
            name: name.into(),
            color: color_for(user_id),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JoinRequest {
    pub user_info: UserInfo,
    /// Newest local history timestamp when resuming; `None` on a fresh join.
    pub since: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JoinSuccess {
    pub document: DocumentSnapshot,
    pub user_info: UserInfo,
    /// Everyone in the room, the joining user included.
    pub present_users: Vec<UserInfo>,
    pub pending_changes: Vec<PendingChange>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JoinError {
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EditPayload {
    pub change: Action,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum HistoryOperation {
    Undo,
    Redo,
}

/// Undo/redo notification. Carries the whole action because the receiver
/// has no access to the sender's history.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HistoryNotify {
    pub action: Action,
    pub operation: HistoryOperation,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PendingChangesRequest {
    pub since: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PendingChangesPayload {
    pub changes: Vec<PendingChange>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PresencePayload {
    pub user_info: UserInfo,
}

/// Asset upload lifecycle notice.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AssetNotice {
    pub asset_id: Uuid,
    /// Image node waiting for the asset, if any.
    pub node_id: Option<NodeId>,
    /// Final URL, present on completion.
    pub url: Option<String>,
    /// Failure reason, present on failure.
    pub error: Option<String>,
}

impl AssetNotice {
    pub fn new(asset_id: Uuid) -> Self {
        Self {
            asset_id,
            node_id: None,
            url: None,
            error: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ChangeKind {
    Edit,
    Undo,
    Redo,
}

/// A logged change as replayed during catch-up.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PendingChange {
    pub change: Action,
    pub from_user_id: UserId,
    /// Timestamp of the message that carried the change.
    pub timestamp: u64,
    pub kind: ChangeKind,
}

/// Top-level protocol message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SyncMessage {
    pub msg_type: MessageType,
    pub from_user: UserId,
    pub doc_id: DocumentId,
    /// Wall-clock milliseconds at send time
    pub timestamp: u64,
    pub payload: Vec<u8>,
}

fn encode_payload<T: Serialize>(value: &T) -> Result<Vec<u8>, ProtocolError> {
    bincode::serde::encode_to_vec(value, bincode::config::standard())
        .map_err(|e| ProtocolError::Serialization(e.to_string()))
}

impl SyncMessage {
    /// Message with an already-encoded payload.
    pub fn raw(msg_type: MessageType, from_user: UserId, doc_id: DocumentId, payload: Vec<u8>) -> Self {
        Self {
            msg_type,
            from_user,
            doc_id,
            timestamp: now_millis(),
            payload,
        }
    }

    /// Message with a typed payload.
    pub fn with_payload<T: Serialize>(
        msg_type: MessageType,
        from_user: UserId,
        doc_id: DocumentId,
        payload: &T,
    ) -> Result<Self, ProtocolError> {
        Ok(Self::raw(msg_type, from_user, doc_id, encode_payload(payload)?))
    }

    pub fn with_timestamp(mut self, timestamp: u64) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn join(from_user: UserId, doc_id: DocumentId, request: &JoinRequest) -> Result<Self, ProtocolError> {
        Self::with_payload(MessageType::Join, from_user, doc_id, request)
    }

    pub fn join_success(doc_id: DocumentId, success: &JoinSuccess) -> Result<Self, ProtocolError> {
        Self::with_payload(MessageType::JoinSuccess, Uuid::nil(), doc_id, success)
    }

    pub fn join_error(doc_id: DocumentId, message: impl Into<String>) -> Result<Self, ProtocolError> {
        let payload = JoinError {
            message: message.into(),
        };
        Self::with_payload(MessageType::JoinError, Uuid::nil(), doc_id, &payload)
    }

    pub fn edit(from_user: UserId, doc_id: DocumentId, change: &Action) -> Result<Self, ProtocolError> {
        let payload = EditPayload {
            change: change.clone(),
        };
        Self::with_payload(MessageType::Edit, from_user, doc_id, &payload)
    }

    /// Undo or redo notification, depending on `operation`.
    pub fn history(
        from_user: UserId,
        doc_id: DocumentId,
        action: &Action,
        operation: HistoryOperation,
    ) -> Result<Self, ProtocolError> {
        let msg_type = match operation {
            HistoryOperation::Undo => MessageType::UndoNotify,
            HistoryOperation::Redo => MessageType::RedoNotify,
        };
        let payload = HistoryNotify {
            action: action.clone(),
            operation,
        };
        Self::with_payload(msg_type, from_user, doc_id, &payload)
    }

    pub fn request_pending_changes(from_user: UserId, doc_id: DocumentId, since: u64) -> Result<Self, ProtocolError> {
        Self::with_payload(
            MessageType::RequestPendingChanges,
            from_user,
            doc_id,
            &PendingChangesRequest { since },
        )
    }

    pub fn pending_changes(doc_id: DocumentId, changes: Vec<PendingChange>) -> Result<Self, ProtocolError> {
        Self::with_payload(
            MessageType::PendingChanges,
            Uuid::nil(),
            doc_id,
            &PendingChangesPayload { changes },
        )
    }

    pub fn presence_joined(doc_id: DocumentId, user_info: &UserInfo) -> Result<Self, ProtocolError> {
        let payload = PresencePayload {
            user_info: user_info.clone(),
        };
        Self::with_payload(MessageType::PresenceJoined, user_info.user_id, doc_id, &payload)
    }

    pub fn presence_left(doc_id: DocumentId, user_info: &UserInfo) -> Result<Self, ProtocolError> {
        let payload = PresencePayload {
            user_info: user_info.clone(),
        };
        Self::with_payload(MessageType::PresenceLeft, user_info.user_id, doc_id, &payload)
    }

    /// Asset lifecycle notice; `msg_type` must be one of the asset types.
    pub fn asset(
        msg_type: MessageType,
        from_user: UserId,
        doc_id: DocumentId,
        notice: &AssetNotice,
    ) -> Result<Self, ProtocolError> {
        if !msg_type.is_asset() {
            return Err(ProtocolError::UnexpectedType(msg_type));
        }
        Self::with_payload(msg_type, from_user, doc_id, notice)
    }

    pub fn ping(from_user: UserId) -> Self {
        Self::raw(MessageType::Ping, from_user, Uuid::nil(), Vec::new())
    }

    pub fn pong(from_user: UserId) -> Self {
        Self::raw(MessageType::Pong, from_user, Uuid::nil(), Vec::new())
    }

    /// Serialize to binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        encode_payload(self)
    }

    /// Deserialize from binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (msg, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
        Ok(msg)
    }

    fn payload_as<T: DeserializeOwned>(&self, accepted: &[MessageType]) -> Result<T, ProtocolError> {
        if !accepted.contains(&self.msg_type) {
            return Err(ProtocolError::WrongType {
                expected: accepted[0],
                actual: self.msg_type,
            });
        }
        let (value, _) = bincode::serde::decode_from_slice(&self.payload, bincode::config::standard())
            .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
        Ok(value)
    }

    pub fn join_request(&self) -> Result<JoinRequest, ProtocolError> {
        self.payload_as(&[MessageType::Join])
    }

    pub fn join_success_payload(&self) -> Result<JoinSuccess, ProtocolError> {
        self.payload_as(&[MessageType::JoinSuccess])
    }

    pub fn join_error_payload(&self) -> Result<JoinError, ProtocolError> {
        self.payload_as(&[MessageType::JoinError])
    }

    pub fn edit_payload(&self) -> Result<EditPayload, ProtocolError> {
        self.payload_as(&[MessageType::Edit])
    }

    pub fn history_notify(&self) -> Result<HistoryNotify, ProtocolError> {
        self.payload_as(&[MessageType::UndoNotify, MessageType::RedoNotify])
    }

    pub fn pending_request(&self) -> Result<PendingChangesRequest, ProtocolError> {
        self.payload_as(&[MessageType::RequestPendingChanges])
    }

    pub fn pending_changes_payload(&self) -> Result<PendingChangesPayload, ProtocolError> {
        self.payload_as(&[MessageType::PendingChanges])
    }

    pub fn presence(&self) -> Result<PresencePayload, ProtocolError> {
        self.payload_as(&[MessageType::PresenceJoined, MessageType::PresenceLeft])
    }

    pub fn asset_notice(&self) -> Result<AssetNotice, ProtocolError> {
        self.payload_as(&[
            MessageType::AssetUploadStart,
            MessageType::AssetUploadComplete,
            MessageType::AssetUploadFailed,
        ])
    }

    /// The change carried by an edit or undo/redo message, as it would be
    /// logged for catch-up.
    pub fn to_pending_change(&self) -> Result<PendingChange, ProtocolError> {
        let (change, kind) = match self.msg_type {
            MessageType::Edit => (self.edit_payload()?.change, ChangeKind::Edit),
            MessageType::UndoNotify | MessageType::RedoNotify => {
                let notify = self.history_notify()?;
                let kind = match notify.operation {
                    HistoryOperation::Undo => ChangeKind::Undo,
                    HistoryOperation::Redo => ChangeKind::Redo,
                };
                (notify.action, kind)
            }
            other => return Err(ProtocolError::UnexpectedType(other)),
        };
        Ok(PendingChange {
            change,
            from_user_id: self.from_user,
            timestamp: self.timestamp,
            kind,
        })
    }
}

impl MessageType {
    pub fn is_asset(self) -> bool {
        matches!(
            self,
            MessageType::AssetUploadStart
                | MessageType::AssetUploadComplete
                | MessageType::AssetUploadFailed
        )
    }

    /// Edit, undo and redo: messages that carry an action.
    pub fn is_change(self) -> bool {
        matches!(
            self,
            MessageType::Edit | MessageType::UndoNotify | MessageType::RedoNotify
        )
    }
}

/// Protocol errors.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ProtocolError {
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("deserialization error: {0}")]
    Deserialization(String),
    #[error("expected a {expected:?} payload, got {actual:?}")]
    WrongType {
        expected: MessageType,
        actual: MessageType,
    },
    #[error("{0:?} is not valid here")]
    UnexpectedType(MessageType),
}

#[cfg(test)]
mod tests {
    use super::*;
    use stagehand_core::{ActionState, NodeSnapshot};

    fn sample_action() -> Action {
        let seat = NodeSnapshot::seat(8.0, "green");
        let row = NodeSnapshot::row().with_children(vec![seat]);
        Action::new(
            ActionState::default(),
            ActionState {
                nodes: Some(vec![row.clone()]),
                affected_ids: Some(vec![row.id]),
                ..ActionState::default()
            },
        )
    }

    #[test]
    fn test_edit_roundtrip() {
        let user = Uuid::new_v4();
        let doc = Uuid::new_v4();
        let action = sample_action();

        let msg = SyncMessage::edit(user, doc, &action).unwrap().with_timestamp(42);
        let decoded = SyncMessage::decode(&msg.encode().unwrap()).unwrap();

        assert_eq!(decoded.msg_type, MessageType::Edit);
        assert_eq!(decoded.from_user, user);
        assert_eq!(decoded.doc_id, doc);
        assert_eq!(decoded.timestamp, 42);
        assert_eq!(decoded.edit_payload().unwrap().change, action);
    }

    #[test]
    fn test_join_success_carries_document_and_changes() {
        let doc = DocumentSnapshot::with_nodes(Uuid::new_v4(), 7, vec![NodeSnapshot::text("Stage")]);
        let alice = UserInfo::new("Alice");
        let success = JoinSuccess {
            document: doc.clone(),
            user_info: alice.clone(),
            present_users: vec![alice.clone()],
            pending_changes: vec![PendingChange {
                change: sample_action(),
                from_user_id: Uuid::new_v4(),
                timestamp: 150,
                kind: ChangeKind::Edit,
            }],
        };
        let msg = SyncMessage::join_success(doc.id, &success).unwrap();
        let decoded = SyncMessage::decode(&msg.encode().unwrap()).unwrap();
        assert_eq!(decoded.join_success_payload().unwrap(), success);
    }

    #[test]
    fn test_history_notify_picks_message_type() {
        let user = Uuid::new_v4();
        let action = sample_action();
        let undo = SyncMessage::history(user, Uuid::new_v4(), &action, HistoryOperation::Undo).unwrap();
        let redo = SyncMessage::history(user, Uuid::new_v4(), &action, HistoryOperation::Redo).unwrap();
        assert_eq!(undo.msg_type, MessageType::UndoNotify);
        assert_eq!(redo.msg_type, MessageType::RedoNotify);
        assert_eq!(undo.history_notify().unwrap().operation, HistoryOperation::Undo);
    }

    #[test]
    fn test_wrong_payload_type_is_rejected() {
        let msg = SyncMessage::ping(Uuid::new_v4());
        assert_eq!(
            msg.edit_payload().unwrap_err(),
            ProtocolError::WrongType {
                expected: MessageType::Edit,
                actual: MessageType::Ping,
            }
        );
        assert!(msg.presence().is_err());
        assert!(msg.asset_notice().is_err());
    }

    #[test]
    fn test_asset_constructor_checks_type() {
        let notice = AssetNotice::new(Uuid::new_v4());
        let user = Uuid::new_v4();
        let doc = Uuid::new_v4();
        assert!(SyncMessage::asset(MessageType::AssetUploadStart, user, doc, &notice).is_ok());
        assert_eq!(
            SyncMessage::asset(MessageType::Edit, user, doc, &notice).unwrap_err(),
            ProtocolError::UnexpectedType(MessageType::Edit)
        );
    }

    #[test]
    fn test_to_pending_change() {
        let user = Uuid::new_v4();
        let action = sample_action();
        let msg = SyncMessage::history(user, Uuid::new_v4(), &action, HistoryOperation::Redo)
            .unwrap()
            .with_timestamp(900);
        let change = msg.to_pending_change().unwrap();
        assert_eq!(change.kind, ChangeKind::Redo);
        assert_eq!(change.from_user_id, user);
        assert_eq!(change.timestamp, 900);
        assert_eq!(change.change, action);

        assert!(SyncMessage::pong(user).to_pending_change().is_err());
    }

    #[test]
    fn test_decode_invalid_bytes() {
        let garbage = vec![0xFF, 0xFE, 0xFD];
        assert!(SyncMessage::decode(&garbage).is_err());
    }

    #[test]
    fn test_user_color_is_stable() {
        let id = Uuid::parse_str("550e8400-e29b-41d4-a716-446655440000").unwrap();
        let a = UserInfo::with_id(id, "Test");
        let b = UserInfo::with_id(id, "Other");
        assert_eq!(a.color, b.color);
        assert_eq!(a.color.len(), 7);
        assert!(a.color.starts_with('#'));
    }

    #[test]
    fn test_message_type_values() {
        assert_eq!(MessageType::Join as u8, 1);
        assert_eq!(MessageType::Edit as u8, 4);
        assert_eq!(MessageType::PendingChanges as u8, 8);
        assert_eq!(MessageType::Pong as u8, 15);
        assert!(MessageType::AssetUploadFailed.is_asset());
        assert!(MessageType::UndoNotify.is_change());
        assert!(!MessageType::Ping.is_change());
    }
}
