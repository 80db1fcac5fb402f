//! apply -> verify -> roll back on failure.
//!
//! ```text
//! Clean --apply ok--> Mutated --tests pass / not requested--> Verified
//!   |                    |
//!   | apply fails        +--tests fail / time out / cannot start--> RolledBack
//!   v
//! Clean (nothing written)
//! ```

use serde::Serialize;

use crate::checkpoint::{Checkpoint, CheckpointManager};
use crate::config::Config;
use crate::diff;
use crate::error::ToolError;
use crate::rollback;
use crate::runner::{tail, CommandSpec};
use crate::workspace::{Workspace, WorkspacePath};

const IMPLICIT_CHECKPOINT_MESSAGE: &str = "reducto: checkpoint before apply_diff_safe";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GateState {
    Clean,
    Mutated,
    Verified,
    RolledBack,
}

/// What the file looked like before the gate touched it.
#[derive(Debug, Clone)]
pub struct PendingMutation {
    pub path: WorkspacePath,
    /// `None` when the diff created the file.
    pub pre_image: Option<Vec<u8>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct GateOutcome {
    pub success: bool,
    pub state: GateState,
    pub path: String,
    pub hunks_applied: usize,
    pub tests_run: bool,
    pub tests_passed: bool,
    pub rolled_back: bool,
    pub verified: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub checkpoint: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    pub timed_out: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl GateOutcome {
    fn base(path: &str, state: GateState) -> Self {
        Self {
            success: false,
            state,
            path: path.to_string(),
            hunks_applied: 0,
            tests_run: false,
            tests_passed: false,
            rolled_back: false,
            verified: false,
            checkpoint: None,
            exit_code: None,
            timed_out: false,
            output: None,
            error: None,
        }
    }
}

/// Why verification did not pass.
struct TestFailure {
    exit_code: Option<i32>,
    timed_out: bool,
    output: String,
}

pub struct SafetyGate<'a> {
    ws: &'a Workspace,
    checkpoints: &'a mut CheckpointManager,
    config: &'a Config,
}

impl<'a> SafetyGate<'a> {
    pub fn new(ws: &'a Workspace, checkpoints: &'a mut CheckpointManager, config: &'a Config) -> Self {
        Self {
            ws,
            checkpoints,
            config,
        }
    }

    /// Returns `Err` only when nothing was attempted (no checkpoint to protect
    /// a verified run) or when a rollback could not complete.
    pub fn run(mut self, path: &str, diff_text: &str, run_tests: bool) -> Result<GateOutcome, ToolError> {
        let anchor = if run_tests { Some(self.require_checkpoint()?) } else { None };

        let applied = match diff::apply_diff(self.ws, path, diff_text) {
            Ok(a) => a,
            Err(e) => {
                tracing::info!(path, error = %e, "gated diff did not apply");
                let mut out = GateOutcome::base(path, GateState::Clean);
                out.error = Some(e.to_string());
                return Ok(out);
            }
        };
        let pending = PendingMutation {
            path: applied.path.clone(),
            pre_image: applied.pre_image,
        };

        let mut out = GateOutcome::base(&pending.path.rel, GateState::Mutated);
        out.hunks_applied = applied.hunks_applied;

        let Some(anchor) = anchor else {
            out.success = true;
            out.tests_passed = true;
            out.state = GateState::Verified;
            return Ok(out);
        };
        out.checkpoint = Some(anchor.commit_hash.clone());
        out.tests_run = true;

        match self.verify() {
            Ok(()) => {
                tracing::info!(path = %pending.path.rel, "gated diff verified");
                out.success = true;
                out.tests_passed = true;
                out.verified = true;
                out.state = GateState::Verified;
            }
            Err(failure) => {
                tracing::warn!(
                    path = %pending.path.rel,
                    exit_code = ?failure.exit_code,
                    timed_out = failure.timed_out,
                    "verification failed; rolling back"
                );
                self.roll_back(&anchor, &pending)?;
                out.rolled_back = true;
                out.state = GateState::RolledBack;
                out.exit_code = failure.exit_code;
                out.timed_out = failure.timed_out;
                out.output = Some(tail(&failure.output, self.config.output.max_output_chars));
            }
        }
        Ok(out)
    }

    fn require_checkpoint(&mut self) -> Result<Checkpoint, ToolError> {
        if let Some(cp) = self.checkpoints.active() {
            return Ok(cp.clone());
        }
        if !self.config.safety.implicit_checkpoint {
            return Err(ToolError::Git(
                "no checkpoint to roll back to; call git_checkpoint first".to_string(),
            ));
        }
        let cp = self
            .checkpoints
            .checkpoint(self.ws, &self.config.git, IMPLICIT_CHECKPOINT_MESSAGE)?;
        Ok(cp.clone())
    }

    fn verify(&self) -> Result<(), TestFailure> {
        let Some(command) = self.config.test.command.as_deref() else {
            let e = ToolError::TestExecution("no test command configured".to_string());
            return Err(TestFailure {
                exit_code: None,
                timed_out: false,
                output: e.to_string(),
            });
        };

        let spec = CommandSpec::shell(command, self.ws.root()).timeout(self.config.test_timeout());
        match self.ws.runner().run(&spec) {
            Ok(result) if result.success() => Ok(()),
            Ok(result) => Err(TestFailure {
                exit_code: result.exit_code,
                timed_out: result.timed_out,
                output: result.combined(),
            }),
            Err(e) => {
                let e = ToolError::TestExecution(format!("could not start `{command}`: {e}"));
                Err(TestFailure {
                    exit_code: None,
                    timed_out: false,
                    output: e.to_string(),
                })
            }
        }
    }

    fn roll_back(&self, anchor: &Checkpoint, pending: &PendingMutation) -> Result<(), ToolError> {
        rollback::rollback(self.ws, Some(anchor))?;

        // Ignored files are invisible to reset/clean; put those back by hand.
        let lost = |e: ToolError| {
            ToolError::WorkspaceIntegrity(format!("could not restore {}: {e}", pending.path.rel))
        };
        if self.ws.exists_at(&anchor.commit, &pending.path.rel).map_err(lost)? {
            return Ok(());
        }
        tracing::debug!(path = %pending.path.rel, "restoring pre-image outside the checkpoint tree");
        let restored = match &pending.pre_image {
            Some(bytes) => self.ws.write_atomic(&pending.path, bytes),
            None => self.ws.remove_file(&pending.path),
        };
        restored.map_err(|e| lost(e.into()))
    }
}
