//! Asset upload lifecycle as seen through the channel.

use std::collections::HashMap;

use uuid::Uuid;

use crate::protocol::{AssetNotice, MessageType, ProtocolError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssetStage {
    Started,
    Completed,
    Failed,
}

impl AssetStage {
    pub fn message_type(self) -> MessageType {
        match self {
            AssetStage::Started => MessageType::AssetUploadStart,
            AssetStage::Completed => MessageType::AssetUploadComplete,
            AssetStage::Failed => MessageType::AssetUploadFailed,
        }
    }

    pub fn from_message_type(msg_type: MessageType) -> Result<Self, ProtocolError> {
        match msg_type {
            MessageType::AssetUploadStart => Ok(AssetStage::Started),
            MessageType::AssetUploadComplete => Ok(AssetStage::Completed),
            MessageType::AssetUploadFailed => Ok(AssetStage::Failed),
            other => Err(ProtocolError::UnexpectedType(other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AssetStatus {
    Uploading,
    Ready { url: String },
    Failed { reason: String },
}

/// Latest known status per asset id.
#[derive(Debug, Default)]
pub struct AssetTracker {
    assets: HashMap<Uuid, AssetStatus>,
}

impl AssetTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a lifecycle notice and return the resulting status.
    pub fn apply(&mut self, stage: AssetStage, notice: &AssetNotice) -> AssetStatus {
        let status = match stage {
            AssetStage::Started => AssetStatus::Uploading,
            AssetStage::Completed => AssetStatus::Ready {
                url: notice.url.clone().unwrap_or_default(),
            },
            AssetStage::Failed => AssetStatus::Failed {
                reason: notice
                    .error
                    .clone()
                    .unwrap_or_else(|| "unknown error".to_string()),
            },
        };
        if let AssetStatus::Failed { ref reason } = status {
            log::warn!("Asset {} failed: {}", notice.asset_id, reason);
        }
        self.assets.insert(notice.asset_id, status.clone());
        status
    }

    pub fn status(&self, asset_id: Uuid) -> Option<&AssetStatus> {
        self.assets.get(&asset_id)
    }

    /// Assets still uploading.
    pub fn in_flight(&self) -> Vec<Uuid> {
        self.assets
            .iter()
            .filter(|(_, s)| **s == AssetStatus::Uploading)
            .map(|(id, _)| *id)
            .collect()
    }

    pub fn clear(&mut self) {
        self.assets.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lifecycle() {
        let mut tracker = AssetTracker::new();
        let mut notice = AssetNotice::new(Uuid::new_v4());

        assert_eq!(tracker.apply(AssetStage::Started, &notice), AssetStatus::Uploading);
        assert_eq!(tracker.in_flight(), vec![notice.asset_id]);

        notice.url = Some("https://cdn.example/seat-map.png".into());
        tracker.apply(AssetStage::Completed, &notice);
        assert_eq!(
            tracker.status(notice.asset_id),
            Some(&AssetStatus::Ready {
                url: "https://cdn.example/seat-map.png".into()
            })
        );
        assert!(tracker.in_flight().is_empty());
    }

    #[test]
    fn test_failure_without_reason() {
        let mut tracker = AssetTracker::new();
        let notice = AssetNotice::new(Uuid::new_v4());
        assert_eq!(
            tracker.apply(AssetStage::Failed, &notice),
            AssetStatus::Failed {
                reason: "unknown error".into()
            }
        );
    }

    #[test]
    fn test_stage_message_types() {
        for stage in [AssetStage::Started, AssetStage::Completed, AssetStage::Failed] {
            assert_eq!(AssetStage::from_message_type(stage.message_type()), Ok(stage));
        }
        assert!(AssetStage::from_message_type(MessageType::Edit).is_err());
    }
}
