use crate::checkpoint::Checkpoint;
use crate::error::ToolError;
use crate::workspace::Workspace;

/// Restore the working tree to exactly the checkpoint commit.
///
/// Tracked files are reset and untracked, non-ignored files removed. Once the
/// checkpoint has been looked up, any git failure means the tree may be half
/// restored, so it is reported as [`ToolError::WorkspaceIntegrity`].
pub fn rollback(ws: &Workspace, checkpoint: Option<&Checkpoint>) -> Result<String, ToolError> {
    let Some(cp) = checkpoint else {
        return Err(ToolError::Git(
            "no checkpoint to roll back to; call git_checkpoint first".to_string(),
        ));
    };

    let lost = |step: &str, e: ToolError| {
        tracing::error!(commit = %cp.commit_hash, step, error = %e, "rollback failed");
        ToolError::WorkspaceIntegrity(format!(
            "rollback to {} failed during {step}: {e}",
            cp.commit_hash
        ))
    };

    ws.reset_hard(&cp.commit).map_err(|e| lost("reset", e))?;
    ws.clean_untracked().map_err(|e| lost("clean", e))?;

    tracing::info!(commit = %cp.commit_hash, "rolled back");
    Ok(cp.commit_hash.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::CheckpointManager;
    use crate::config::GitConfig;
    use crate::runner::TokioRunner;
    use tempfile::TempDir;

    #[test]
    fn restores_tracked_and_removes_untracked() {
        let tmp = TempDir::new().unwrap();
        let ws = Workspace::open(tmp.path(), Box::new(TokioRunner::new().unwrap())).unwrap();
        std::process::Command::new("git")
            .args(["init", "-q"])
            .current_dir(tmp.path())
            .status()
            .unwrap();
        std::fs::write(tmp.path().join("a.py"), "x = 1\n").unwrap();
        std::fs::write(tmp.path().join(".gitignore"), "*.log\n").unwrap();

        let mut mgr = CheckpointManager::default();
        let cp = mgr.checkpoint(&ws, &GitConfig::default(), "base").unwrap().clone();

        std::fs::write(tmp.path().join("a.py"), "x = 2\n").unwrap();
        std::fs::create_dir_all(tmp.path().join("new")).unwrap();
        std::fs::write(tmp.path().join("new/b.py"), "y = 1\n").unwrap();
        std::fs::write(tmp.path().join("run.log"), "kept\n").unwrap();

        let hash = rollback(&ws, Some(&cp)).unwrap();
        assert_eq!(hash, cp.commit_hash);
        assert_eq!(std::fs::read_to_string(tmp.path().join("a.py")).unwrap(), "x = 1\n");
        assert!(!tmp.path().join("new").exists());
        assert!(tmp.path().join("run.log").exists());
        assert_eq!(ws.head().unwrap(), cp.commit);
    }

    #[test]
    fn without_checkpoint_is_a_git_error() {
        let tmp = TempDir::new().unwrap();
        let ws = Workspace::open(tmp.path(), Box::new(TokioRunner::new().unwrap())).unwrap();
        let err = rollback(&ws, None).unwrap_err();
        assert!(matches!(err, ToolError::Git(ref m) if m.contains("no checkpoint")));
    }
}
