//! Tool handlers and the registry the dispatcher resolves methods against.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::path::Path;

use crate::checkpoint::Checkpoint;
use crate::complexity;
use crate::diff;
use crate::error::{FileError, ToolError};
use crate::gate::SafetyGate;
use crate::inspector;
use crate::rollback;
use crate::scanner::{scan_workspace, ScanOptions};
use crate::session::Session;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    ReadOnly,
    Mutating,
}

pub trait ToolHandler: Send + Sync {
    fn name(&self) -> &'static str;
    fn description(&self) -> &'static str;
    fn capability(&self) -> Capability;
    /// JSON schema of the params object, for `tools/list`.
    fn input_schema(&self) -> Value;
    fn call(&self, session: &mut Session, params: Value) -> Result<Value, ToolError>;
}

/// Absent or `null` params count as `{}`.
fn parse_params<T: DeserializeOwned>(params: Value) -> Result<T, ToolError> {
    let params = if params.is_null() { json!({}) } else { params };
    serde_json::from_value(params).map_err(|e| ToolError::InvalidParams(e.to_string()))
}

fn path_schema() -> Value {
    json!({
        "type": "object",
        "properties": { "path": { "type": "string", "description": "File path, relative to the workspace root." } },
        "required": ["path"]
    })
}

fn empty_schema() -> Value {
    json!({ "type": "object", "properties": {} })
}

#[derive(Debug, Deserialize)]
struct PathParams {
    path: String,
}

#[derive(Debug, Deserialize)]
struct DiffParams {
    path: String,
    diff: String,
}

fn default_run_tests() -> bool {
    true
}

#[derive(Debug, Deserialize)]
struct SafeDiffParams {
    path: String,
    diff: String,
    #[serde(default = "default_run_tests")]
    run_tests: bool,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct CheckpointParams {
    message: String,
}

/// Read a workspace file for analysis, refusing languages no driver handles.
fn read_source(
    session: &Session,
    path: &str,
) -> Result<(String, &'static dyn inspector::LanguageDriver, String), ToolError> {
    let target = session.workspace.resolve(path)?;
    let driver = inspector::driver_for_path(Path::new(&target.rel))
        .ok_or_else(|| FileError::Unsupported(target.rel.clone()))?;
    let source = session.workspace.read_text(&target)?;
    Ok((target.rel, driver, source))
}

// ── read-only ──

struct ListFiles;
impl ToolHandler for ListFiles {
    fn name(&self) -> &'static str {
        "list_files"
    }
    fn description(&self) -> &'static str {
        "List workspace files (gitignore-aware) with language, size and content hash."
    }
    fn capability(&self) -> Capability {
        Capability::ReadOnly
    }
    fn input_schema(&self) -> Value {
        empty_schema()
    }
    fn call(&self, session: &mut Session, _params: Value) -> Result<Value, ToolError> {
        let opts = ScanOptions::from_config(session.workspace.root(), &session.config.scan);
        let files = scan_workspace(&opts).map_err(|e| FileError::Scan(format!("{e:#}")))?;
        Ok(json!({ "files": files }))
    }
}

struct GetSymbols;
impl ToolHandler for GetSymbols {
    fn name(&self) -> &'static str {
        "get_symbols"
    }
    fn description(&self) -> &'static str {
        "Functions, classes and types declared in a file, with 1-based line ranges."
    }
    fn capability(&self) -> Capability {
        Capability::ReadOnly
    }
    fn input_schema(&self) -> Value {
        path_schema()
    }
    fn call(&self, session: &mut Session, params: Value) -> Result<Value, ToolError> {
        let p: PathParams = parse_params(params)?;
        let (rel, driver, source) = read_source(session, &p.path)?;
        let path = Path::new(&rel);
        let symbols = inspector::extract_symbols(driver, path, &source)
            .map_err(|e| FileError::Unsupported(format!("{rel}: {e:#}")))?;
        Ok(json!({
            "path": rel,
            "language": driver.language_name(path),
            "symbols": symbols,
        }))
    }
}

struct ReadFile;
impl ToolHandler for ReadFile {
    fn name(&self) -> &'static str {
        "read_file"
    }
    fn description(&self) -> &'static str {
        "Full UTF-8 content of a workspace file."
    }
    fn capability(&self) -> Capability {
        Capability::ReadOnly
    }
    fn input_schema(&self) -> Value {
        path_schema()
    }
    fn call(&self, session: &mut Session, params: Value) -> Result<Value, ToolError> {
        let p: PathParams = parse_params(params)?;
        let target = session.workspace.resolve(&p.path)?;
        let content = session.workspace.read_text(&target)?;
        Ok(json!({ "path": target.rel, "content": content }))
    }
}

struct GetComplexity;
impl ToolHandler for GetComplexity {
    fn name(&self) -> &'static str {
        "get_complexity"
    }
    fn description(&self) -> &'static str {
        "Cyclomatic and cognitive complexity for a file and each function in it."
    }
    fn capability(&self) -> Capability {
        Capability::ReadOnly
    }
    fn input_schema(&self) -> Value {
        path_schema()
    }
    fn call(&self, session: &mut Session, params: Value) -> Result<Value, ToolError> {
        let p: PathParams = parse_params(params)?;
        let (rel, driver, source) = read_source(session, &p.path)?;
        let metrics = complexity::analyze_source(driver, Path::new(&rel), &source)
            .map_err(|e| FileError::Unsupported(format!("{rel}: {e:#}")))?;
        Ok(json!(metrics))
    }
}

struct GitStatus;
impl ToolHandler for GitStatus {
    fn name(&self) -> &'static str {
        "git_status"
    }
    fn description(&self) -> &'static str {
        "Repository state: branch, HEAD, uncommitted files and the active checkpoint."
    }
    fn capability(&self) -> Capability {
        Capability::ReadOnly
    }
    fn input_schema(&self) -> Value {
        empty_schema()
    }
    fn call(&self, session: &mut Session, _params: Value) -> Result<Value, ToolError> {
        let ws = &session.workspace;
        let checkpoint: Option<&Checkpoint> = session.checkpoints.active();
        if !ws.is_repo() {
            return Ok(json!({
                "is_repo": false,
                "branch": null,
                "head": null,
                "clean": null,
                "changed_files": [],
                "checkpoint": checkpoint,
            }));
        }

        let changed = ws.changed_files()?;
        Ok(json!({
            "is_repo": true,
            "branch": ws.current_branch(),
            // An unborn branch has no HEAD yet.
            "head": ws.head().ok(),
            "clean": changed.is_empty(),
            "changed_files": changed,
            "checkpoint": checkpoint,
        }))
    }
}

// ── mutating ──

struct ApplyDiff;
impl ToolHandler for ApplyDiff {
    fn name(&self) -> &'static str {
        "apply_diff"
    }
    fn description(&self) -> &'static str {
        "Apply a single-file unified diff, all hunks or none. No checkpoint, no tests."
    }
    fn capability(&self) -> Capability {
        Capability::Mutating
    }
    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": { "type": "string" },
                "diff": { "type": "string", "description": "Unified diff for this one file." }
            },
            "required": ["path", "diff"]
        })
    }
    fn call(&self, session: &mut Session, params: Value) -> Result<Value, ToolError> {
        let p: DiffParams = parse_params(params)?;
        let applied = diff::apply_diff(&session.workspace, &p.path, &p.diff)?;
        Ok(json!({
            "success": true,
            "path": applied.path.rel,
            "hunks_applied": applied.hunks_applied,
        }))
    }
}

struct ApplyDiffSafe;
impl ToolHandler for ApplyDiffSafe {
    fn name(&self) -> &'static str {
        "apply_diff_safe"
    }
    fn description(&self) -> &'static str {
        "Apply a diff, run the workspace tests and roll back to the active checkpoint if they fail."
    }
    fn capability(&self) -> Capability {
        Capability::Mutating
    }
    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": { "type": "string" },
                "diff": { "type": "string" },
                "run_tests": { "type": "boolean", "default": true }
            },
            "required": ["path", "diff"]
        })
    }
    fn call(&self, session: &mut Session, params: Value) -> Result<Value, ToolError> {
        let p: SafeDiffParams = parse_params(params)?;
        let gate = SafetyGate::new(&session.workspace, &mut session.checkpoints, &session.config);
        let outcome = gate.run(&p.path, &p.diff, p.run_tests)?;
        Ok(json!(outcome))
    }
}

struct GitCheckpoint;
impl ToolHandler for GitCheckpoint {
    fn name(&self) -> &'static str {
        "git_checkpoint"
    }
    fn description(&self) -> &'static str {
        "Commit the whole working tree and make it the rollback anchor."
    }
    fn capability(&self) -> Capability {
        Capability::Mutating
    }
    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": { "message": { "type": "string" } }
        })
    }
    fn call(&self, session: &mut Session, params: Value) -> Result<Value, ToolError> {
        let p: CheckpointParams = parse_params(params)?;
        let cp = session
            .checkpoints
            .checkpoint(&session.workspace, &session.config.git, &p.message)?;
        Ok(json!({
            "success": true,
            "commit_hash": cp.commit_hash,
            "commit": cp.commit,
            "message": cp.message,
        }))
    }
}

struct GitRollback;
impl ToolHandler for GitRollback {
    fn name(&self) -> &'static str {
        "git_rollback"
    }
    fn description(&self) -> &'static str {
        "Restore the working tree to the active checkpoint, removing new untracked files."
    }
    fn capability(&self) -> Capability {
        Capability::Mutating
    }
    fn input_schema(&self) -> Value {
        empty_schema()
    }
    fn call(&self, session: &mut Session, _params: Value) -> Result<Value, ToolError> {
        let hash = rollback::rollback(&session.workspace, session.checkpoints.active())?;
        Ok(json!({ "success": true, "commit_hash": hash }))
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

pub struct ToolRegistry {
    tools: Vec<Box<dyn ToolHandler>>,
    by_name: HashMap<&'static str, usize>,
}

impl ToolRegistry {
    pub fn standard() -> Self {
        let tools: Vec<Box<dyn ToolHandler>> = vec![
            Box::new(ListFiles),
            Box::new(GetSymbols),
            Box::new(ReadFile),
            Box::new(GetComplexity),
            Box::new(ApplyDiff),
            Box::new(ApplyDiffSafe),
            Box::new(GitCheckpoint),
            Box::new(GitRollback),
            Box::new(GitStatus),
        ];
        let by_name = tools.iter().enumerate().map(|(i, t)| (t.name(), i)).collect();
        Self { tools, by_name }
    }

    pub fn get(&self, name: &str) -> Option<&dyn ToolHandler> {
        let idx = *self.by_name.get(name)?;
        self.tools.get(idx).map(|t| t.as_ref())
    }

    /// Tool names in registration order.
    pub fn names(&self) -> Vec<&'static str> {
        self.tools.iter().map(|t| t.name()).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &dyn ToolHandler> {
        self.tools.iter().map(|t| t.as_ref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::runner::TokioRunner;
    use crate::workspace::Workspace;
    use tempfile::TempDir;

    fn session(tmp: &TempDir) -> Session {
        let ws = Workspace::open(tmp.path(), Box::new(TokioRunner::new().unwrap())).unwrap();
        Session::new(ws, Config::default())
    }

    #[test]
    fn registry_order_is_stable() {
        let reg = ToolRegistry::standard();
        assert_eq!(
            reg.names(),
            vec![
                "list_files",
                "get_symbols",
                "read_file",
                "get_complexity",
                "apply_diff",
                "apply_diff_safe",
                "git_checkpoint",
                "git_rollback",
                "git_status"
            ]
        );
        assert_eq!(reg.get("apply_diff_safe").unwrap().capability(), Capability::Mutating);
        assert_eq!(reg.get("read_file").unwrap().capability(), Capability::ReadOnly);
        assert!(reg.get("nonexistent_method").is_none());
    }

    #[test]
    fn params_are_validated() {
        let tmp = TempDir::new().unwrap();
        let mut s = session(&tmp);
        let reg = ToolRegistry::standard();

        let err = reg.get("read_file").unwrap().call(&mut s, json!({})).unwrap_err();
        assert!(matches!(err, ToolError::InvalidParams(ref m) if m.contains("path")));

        let err = reg
            .get("apply_diff")
            .unwrap()
            .call(&mut s, json!({"path": 3, "diff": ""}))
            .unwrap_err();
        assert!(matches!(err, ToolError::InvalidParams(_)));

        let p: SafeDiffParams = parse_params(json!({"path": "a", "diff": "d"})).unwrap();
        assert!(p.run_tests);
        let p: CheckpointParams = parse_params(Value::Null).unwrap();
        assert_eq!(p.message, "");
    }

    #[test]
    fn read_only_tools_on_a_plain_directory() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(tmp.path().join("calc.py"), "def add(a, b):\n    if a:\n        return a + b\n    return b\n").unwrap();
        std::fs::write(tmp.path().join("notes.txt"), "hello\n").unwrap();
        let mut s = session(&tmp);
        let reg = ToolRegistry::standard();

        let read = reg.get("read_file").unwrap().call(&mut s, json!({"path": "notes.txt"})).unwrap();
        assert_eq!(read["content"], "hello\n");

        let err = reg.get("read_file").unwrap().call(&mut s, json!({"path": "missing.py"})).unwrap_err();
        assert!(matches!(err, ToolError::File(FileError::NotFound(_))));

        let syms = reg.get("get_symbols").unwrap().call(&mut s, json!({"path": "calc.py"})).unwrap();
        assert_eq!(syms["language"], "python");
        assert_eq!(syms["symbols"][0]["name"], "add");
        assert_eq!(syms["symbols"][0]["type"], "function");
        assert_eq!(syms["symbols"][0]["start_line"], 1);

        let cx = reg.get("get_complexity").unwrap().call(&mut s, json!({"path": "calc.py"})).unwrap();
        assert_eq!(cx["cyclomatic_complexity"], 2);
        assert_eq!(cx["functions"][0]["name"], "add");

        let err = reg.get("get_symbols").unwrap().call(&mut s, json!({"path": "notes.txt"})).unwrap_err();
        assert!(matches!(err, ToolError::File(FileError::Unsupported(_))));

        let files = reg.get("list_files").unwrap().call(&mut s, Value::Null).unwrap();
        assert_eq!(files["files"].as_array().unwrap().len(), 2);

        let status = reg.get("git_status").unwrap().call(&mut s, json!({})).unwrap();
        assert_eq!(status["is_repo"], false);
        assert!(status["checkpoint"].is_null());
    }
}
