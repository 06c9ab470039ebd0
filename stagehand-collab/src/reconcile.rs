//! Applying changes received from other editors.
//!
//! Every inbound change becomes a [`PendingChange`] and goes through
//! [`Reconciler::apply_change`]:
//!
//! ```text
//! from local user? ── yes ──► EchoSuppressed (no graph or history change)
//!        │ no
//!        ▼
//! Edit: action as sent     Undo: action inverted     Redo: action as sent
//!        │                        │                         │
//!        └──────────► Editor::apply_remote (after state) ◄──┘
//!                              │
//!                    recorded with author = sender
//! ```
//!
//! Catch-up batches are sorted by timestamp and filtered against the local
//! history's newest timestamp, fixed at the start of the batch.

use stagehand_core::{Action, ActionId, ApplyError, Editor, UserId};
use uuid::Uuid;

use crate::protocol::{ChangeKind, PendingChange};

#[derive(Debug, Clone, PartialEq)]
pub enum RemoteOutcome {
    Applied {
        action_id: ActionId,
        from_user: UserId,
        kind: ChangeKind,
    },
    /// Our own change bounced back.
    EchoSuppressed { action_id: ActionId },
    /// Already in local history.
    Duplicate { action_id: ActionId },
    /// The change did not fit the local graph; nothing was recorded.
    Failed {
        action_id: ActionId,
        error: ApplyError,
    },
}

/// Result of a catch-up batch.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchReport {
    pub applied: Vec<ActionId>,
    /// Not newer than local history, or already present.
    pub stale: usize,
    /// Authored by the local user.
    pub own: usize,
    pub failed: Vec<(ActionId, ApplyError)>,
}

impl BatchReport {
    pub fn total(&self) -> usize {
        self.applied.len() + self.stale + self.own + self.failed.len()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Reconciler {
    local_user: UserId,
}

impl Reconciler {
    pub fn new(local_user: UserId) -> Self {
        Self { local_user }
    }

    pub fn local_user(&self) -> UserId {
        self.local_user
    }

    /// Apply one remote change and record it as a non-broadcast entry.
    pub fn apply_change(&self, editor: &mut Editor, change: &PendingChange) -> RemoteOutcome {
        let sent_id = change.change.id;
        if change.from_user_id == self.local_user {
            log::trace!("Suppressing echo of {sent_id}");
            return RemoteOutcome::EchoSuppressed { action_id: sent_id };
        }

        let action = match change.kind {
            ChangeKind::Edit => {
                if editor.history().contains(sent_id) {
                    log::debug!("Skipping already recorded change {sent_id}");
                    return RemoteOutcome::Duplicate { action_id: sent_id };
                }
                change.change.clone()
            }
            ChangeKind::Undo => change.change.inverted(),
            ChangeKind::Redo => Action {
                id: Uuid::new_v4(),
                ..change.change.clone()
            },
        }
        .with_timestamp(change.timestamp)
        .with_author(change.from_user_id);

        let action_id = action.id;
        match editor.apply_remote(action) {
            Ok(report) => {
                log::debug!(
                    "Applied {:?} {} from {}: {} upserted, {} removed",
                    change.kind,
                    sent_id,
                    change.from_user_id,
                    report.upserted.len(),
                    report.removed.len()
                );
                RemoteOutcome::Applied {
                    action_id,
                    from_user: change.from_user_id,
                    kind: change.kind,
                }
            }
            Err(error) => {
                log::warn!(
                    "Skipping {:?} {} from {}: {}",
                    change.kind,
                    sent_id,
                    change.from_user_id,
                    error
                );
                RemoteOutcome::Failed {
                    action_id: sent_id,
                    error,
                }
            }
        }
    }

    /// Apply a catch-up batch.
    ///
    /// Only changes that are newer than everything in local history and
    /// were authored by someone else are applied, oldest first. A change
    /// that fails to apply is logged and skipped; the rest still go in.
    pub fn apply_pending(&self, editor: &mut Editor, mut changes: Vec<PendingChange>) -> BatchReport {
        let watermark = editor.history().max_timestamp();
        changes.sort_by_key(|c| c.timestamp);

        let mut report = BatchReport::default();
        for change in &changes {
            if change.from_user_id == self.local_user {
                report.own += 1;
                continue;
            }
            if watermark.is_some_and(|w| change.timestamp <= w) {
                log::debug!(
                    "Discarding stale change {} at {} (local history at {:?})",
                    change.change.id,
                    change.timestamp,
                    watermark
                );
                report.stale += 1;
                continue;
            }
            match self.apply_change(editor, change) {
                RemoteOutcome::Applied { action_id, .. } => report.applied.push(action_id),
                RemoteOutcome::Failed { action_id, error } => report.failed.push((action_id, error)),
                RemoteOutcome::Duplicate { .. } => report.stale += 1,
                RemoteOutcome::EchoSuppressed { .. } => report.own += 1,
            }
        }

        if report.total() > 0 {
            log::info!(
                "Catch-up: {} applied, {} stale, {} own, {} failed",
                report.applied.len(),
                report.stale,
                report.own,
                report.failed.len()
            );
        }
        report
    }
}
