use anyhow::Result;
use serde::Deserialize;
use serde_json::{json, Value};
use std::io::{BufRead, Write};

use crate::error::ToolError;
use crate::session::Session;
use crate::tools::{Capability, ToolRegistry};

pub const SERVER_NAME: &str = "reducto";
const DEFAULT_PROTOCOL_VERSION: &str = "2024-11-05";

fn reply(id: Value, result: Result<Value, ToolError>) -> Value {
    match result {
        Ok(result) => json!({ "jsonrpc": "2.0", "id": id, "result": result }),
        Err(e) => json!({ "jsonrpc": "2.0", "id": id, "error": e.to_json() }),
    }
}

fn initialize(session: &Session, registry: &ToolRegistry, params: &Value) -> Value {
    json!({
        "protocolVersion": params.get("protocolVersion").cloned().unwrap_or(json!(DEFAULT_PROTOCOL_VERSION)),
        "capabilities": { "tools": { "listChanged": false } },
        "serverInfo": { "name": SERVER_NAME, "version": env!("CARGO_PKG_VERSION") },
        "workspace": session.workspace.root().to_string_lossy(),
        "tools": registry.names(),
    })
}

fn tool_list(registry: &ToolRegistry) -> Value {
    let tools: Vec<Value> = registry
        .iter()
        .map(|t| {
            json!({
                "name": t.name(),
                "description": t.description(),
                "capability": t.capability(),
                "inputSchema": t.input_schema(),
            })
        })
        .collect();
    json!({ "tools": tools })
}

#[derive(Debug, Deserialize)]
struct ToolCallParams {
    name: String,
    #[serde(default)]
    arguments: Value,
}

/// MCP-style envelope: tool failures become `isError` content, not protocol errors.
fn tool_call(session: &mut Session, registry: &ToolRegistry, params: Value) -> Result<Value, ToolError> {
    let params = if params.is_null() { json!({}) } else { params };
    let p: ToolCallParams = serde_json::from_value(params).map_err(|e| ToolError::InvalidParams(e.to_string()))?;

    Ok(match call_tool(session, registry, &p.name, p.arguments) {
        Ok(v) => json!({ "content": [{ "type": "text", "text": v.to_string() }], "isError": false }),
        Err(ToolError::MethodNotFound(name)) => return Err(ToolError::MethodNotFound(name)),
        Err(e) => json!({ "content": [{ "type": "text", "text": e.to_string() }], "isError": true }),
    })
}

fn call_tool(session: &mut Session, registry: &ToolRegistry, name: &str, params: Value) -> Result<Value, ToolError> {
    let tool = registry
        .get(name)
        .ok_or_else(|| ToolError::MethodNotFound(name.to_string()))?;

    if tool.capability() == Capability::Mutating {
        if let Some(reason) = session.integrity_lost() {
            return Err(ToolError::WorkspaceIntegrity(format!("{reason}; refusing {name}")));
        }
    }

    let result = tool.call(session, params);
    match &result {
        Ok(_) => tracing::debug!(tool = name, "ok"),
        Err(ToolError::WorkspaceIntegrity(reason)) => session.mark_integrity_lost(reason.clone()),
        Err(e) => tracing::debug!(tool = name, code = e.code(), error = %e, "failed"),
    }
    result
}

pub fn dispatch(session: &mut Session, registry: &ToolRegistry, method: &str, params: Value) -> Result<Value, ToolError> {
    match method {
        "initialize" => Ok(initialize(session, registry, &params)),
        "ping" => Ok(json!({})),
        "tools/list" => Ok(tool_list(registry)),
        "tools/call" => tool_call(session, registry, params),
        name => call_tool(session, registry, name, params),
    }
}

/// One request line in, one response out. `None` for blank lines.
pub fn handle_line(session: &mut Session, registry: &ToolRegistry, line: &str) -> Option<Value> {
    if line.trim().is_empty() {
        return None;
    }

    let msg: Value = match serde_json::from_str(line) {
        Ok(v) => v,
        Err(e) => return Some(reply(Value::Null, Err(ToolError::Parse(e.to_string())))),
    };

    // Requests without an id still get an answer, addressed to `null`.
    let id = msg.get("id").cloned().unwrap_or(Value::Null);
    let Some(method) = msg.get("method").and_then(|m| m.as_str()) else {
        return Some(reply(
            id,
            Err(ToolError::InvalidRequest("expected an object with a string `method`".to_string())),
        ));
    };
    let params = msg.get("params").cloned().unwrap_or(Value::Null);

    tracing::debug!(method, id = %id, "request");
    Some(reply(id, dispatch(session, registry, method, params)))
}

/// Serve requests from `reader` until EOF, strictly in order.
pub fn serve<R: BufRead, W: Write>(
    session: &mut Session,
    registry: &ToolRegistry,
    reader: R,
    mut writer: W,
) -> Result<()> {
    for line in reader.lines() {
        let response = match line {
            Ok(line) => handle_line(session, registry, &line),
            Err(e) if e.kind() == std::io::ErrorKind::InvalidData => Some(reply(
                Value::Null,
                Err(ToolError::Parse("request is not valid UTF-8".to_string())),
            )),
            Err(e) => return Err(e.into()),
        };
        let Some(response) = response else { continue };

        writeln!(writer, "{}", response)?;
        writer.flush()?;
    }

    tracing::info!("stdin closed; shutting down");
    Ok(())
}

pub fn run_stdio_server(session: &mut Session, registry: &ToolRegistry) -> Result<()> {
    let stdin = std::io::stdin();
    let stdout = std::io::stdout();
    serve(session, registry, stdin.lock(), stdout.lock())
}
