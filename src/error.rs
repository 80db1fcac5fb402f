use serde_json::{json, Value};
use thiserror::Error;

pub const PARSE_ERROR: i64 = -32700;
pub const INVALID_REQUEST: i64 = -32600;
pub const METHOD_NOT_FOUND: i64 = -32601;
pub const INVALID_PARAMS: i64 = -32602;
pub const FILE_ERROR: i64 = -32001;
pub const DIFF_ERROR: i64 = -32002;
pub const GIT_ERROR: i64 = -32003;
pub const TEST_EXECUTION_ERROR: i64 = -32004;
pub const WORKSPACE_INTEGRITY: i64 = -32005;

/// Every failure a tool call can report back over the wire.
///
/// All variants except [`ToolError::WorkspaceIntegrity`] leave the session usable.
#[derive(Debug, Error)]
pub enum ToolError {
    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Invalid Request: {0}")]
    InvalidRequest(String),

    #[error("Method not found: {0}")]
    MethodNotFound(String),

    #[error("Invalid params: {0}")]
    InvalidParams(String),

    #[error("{0}")]
    File(#[from] FileError),

    #[error("{0}")]
    Diff(#[from] DiffError),

    #[error("git error: {0}")]
    Git(String),

    #[error("test execution error: {0}")]
    TestExecution(String),

    #[error("workspace integrity lost: {0}")]
    WorkspaceIntegrity(String),
}

impl ToolError {
    pub fn code(&self) -> i64 {
        match self {
            ToolError::Parse(_) => PARSE_ERROR,
            ToolError::InvalidRequest(_) => INVALID_REQUEST,
            ToolError::MethodNotFound(_) => METHOD_NOT_FOUND,
            ToolError::InvalidParams(_) => INVALID_PARAMS,
            ToolError::File(_) => FILE_ERROR,
            ToolError::Diff(_) => DIFF_ERROR,
            ToolError::Git(_) => GIT_ERROR,
            ToolError::TestExecution(_) => TEST_EXECUTION_ERROR,
            ToolError::WorkspaceIntegrity(_) => WORKSPACE_INTEGRITY,
        }
    }

    pub fn to_json(&self) -> Value {
        json!({ "code": self.code(), "message": self.to_string() })
    }
}

#[derive(Debug, Error)]
pub enum FileError {
    #[error("file not found: {0}")]
    NotFound(String),

    #[error("path escapes the workspace root: {0}")]
    OutsideRoot(String),

    #[error("not a UTF-8 text file: {0}")]
    NotText(String),

    #[error("unsupported file type: {0}")]
    Unsupported(String),

    #[error("workspace scan failed: {0}")]
    Scan(String),

    #[error("i/o error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DiffError {
    #[error("diff contains no hunks")]
    NoHunks,

    #[error("malformed hunk header: {0}")]
    BadHeader(String),

    #[error("diff touches more than one file; send one diff per file")]
    MultipleFiles,

    #[error("diff creates {0}, which already exists")]
    TargetExists(String),

    #[error("hunk {index} ({header}) does not apply: context not found near line {hint}")]
    HunkMismatch {
        index: usize,
        header: String,
        hint: usize,
    },
}
