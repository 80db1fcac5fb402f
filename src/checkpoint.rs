use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::config::GitConfig;
use crate::error::ToolError;
use crate::workspace::Workspace;

pub const DEFAULT_CHECKPOINT_MESSAGE: &str = "reducto checkpoint";

/// A commit recorded as the session's rollback anchor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Checkpoint {
    pub commit: String,
    /// First 8 hex chars of `commit`.
    pub commit_hash: String,
    pub message: String,
    pub created_at: DateTime<Utc>,
}

impl Checkpoint {
    fn new(commit: String, message: String) -> Self {
        let commit_hash = commit.chars().take(8).collect();
        Self {
            commit,
            commit_hash,
            message,
            created_at: Utc::now(),
        }
    }
}

/// Holds at most one active checkpoint: the most recent one.
#[derive(Debug, Default)]
pub struct CheckpointManager {
    active: Option<Checkpoint>,
}

impl CheckpointManager {
    pub fn active(&self) -> Option<&Checkpoint> {
        self.active.as_ref()
    }

    /// Commit the whole working tree and make that commit the rollback anchor.
    ///
    /// A clean tree still produces a (empty) commit: the point is marking a safe
    /// state, not recording a delta.
    pub fn checkpoint(
        &mut self,
        ws: &Workspace,
        identity: &GitConfig,
        message: &str,
    ) -> Result<&Checkpoint, ToolError> {
        let message = match message.trim() {
            "" => DEFAULT_CHECKPOINT_MESSAGE,
            m => m,
        };

        let commit = ws.commit_all(message, identity)?;
        let cp = Checkpoint::new(commit, message.to_string());
        tracing::info!(commit = %cp.commit_hash, message = %cp.message, "checkpoint created");

        if let Some(prev) = &self.active {
            tracing::debug!(previous = %prev.commit_hash, "replacing rollback anchor");
        }
        let cp = self.active.insert(cp);
        Ok(&*cp)
    }
}
