use crate::checkpoint::CheckpointManager;
use crate::config::Config;
use crate::workspace::Workspace;

/// Everything a tool handler may touch. One per process, created in `main`
/// and handed to the dispatcher by `&mut`.
pub struct Session {
    pub workspace: Workspace,
    pub checkpoints: CheckpointManager,
    pub config: Config,
    integrity_lost: Option<String>,
}

impl Session {
    pub fn new(workspace: Workspace, config: Config) -> Self {
        if !workspace.is_repo() {
            tracing::warn!(root = %workspace.root().display(), "workspace is not a git repository; checkpoint and rollback will fail");
        } else if let Some(top) = workspace.repo_toplevel() {
            if top != workspace.root() {
                tracing::warn!(
                    root = %workspace.root().display(),
                    toplevel = %top.display(),
                    "workspace root is not the repository top level; checkpoints cover the whole repository"
                );
            }
        }

        Self {
            workspace,
            checkpoints: CheckpointManager::default(),
            config,
            integrity_lost: None,
        }
    }

    /// Reason mutating tools are refused, if a rollback ever failed.
    pub fn integrity_lost(&self) -> Option<&str> {
        self.integrity_lost.as_deref()
    }

    pub fn mark_integrity_lost(&mut self, reason: impl Into<String>) {
        let reason = reason.into();
        tracing::error!(%reason, "workspace integrity lost; refusing further mutations");
        self.integrity_lost.get_or_insert(reason);
    }
}
