#![cfg(unix)]

use serde_json::{json, Value};
use std::io::{BufRead, BufReader, Write};
use std::path::Path;
use std::process::{Command, Stdio};
use tempfile::TempDir;

const MAIN_PY: &str = "\ndef add(a: int, b: int) -> int:\n    \"\"\"Add two numbers.\"\"\"\n    return a + b\n\ndef multiply(a: int, b: int) -> int:\n    \"\"\"Multiply two numbers.\"\"\"\n    return a * b\n";

const CALC_PY: &str = "def divide(a, b):\n    if b == 0:\n        raise ValueError(\"division by zero\")\n    return a / b\n";

fn git(root: &Path, args: &[&str]) {
    let status = Command::new("git")
        .args(args)
        .current_dir(root)
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .expect("run git");
    assert!(status.success(), "git {args:?} failed");
}

fn repo_with(files: &[(&str, &str)]) -> TempDir {
    let tmp = TempDir::new().unwrap();
    git(tmp.path(), &["init", "-q"]);
    for (rel, content) in files {
        std::fs::write(tmp.path().join(rel), content).unwrap();
    }
    tmp
}

/// Run one server session over `requests` and return the replies in order.
fn session(root: &Path, test_command: &str, requests: &[Value]) -> Vec<Value> {
    // `cargo test` sets this for integration tests.
    let bin = env!("CARGO_BIN_EXE_reducto");

    let mut child = Command::new(bin)
        .arg("mcp")
        .arg(root)
        .args(["--test-command", test_command, "--test-timeout-secs", "30"])
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn reducto mcp");

    {
        let stdin = child.stdin.as_mut().expect("child stdin");
        for req in requests {
            // One JSON document per line.
            writeln!(stdin, "{}", req).unwrap();
        }
    }
    // Close stdin so the server loop can exit.
    drop(child.stdin.take());

    let stdout = child.stdout.take().expect("child stdout");
    let replies: Vec<Value> = BufReader::new(stdout)
        .lines()
        .map(|l| l.expect("read stdout line"))
        .filter(|l| !l.trim().is_empty())
        .map(|l| serde_json::from_str(&l).expect("stdout is json"))
        .collect();

    let status = child.wait().expect("wait child");
    assert!(status.success(), "mcp process should exit cleanly");
    assert_eq!(replies.len(), requests.len(), "one reply per request");
    replies
}

fn call(id: i64, method: &str, params: Value) -> Value {
    json!({ "jsonrpc": "2.0", "id": id, "method": method, "params": params })
}

fn read(root: &Path, rel: &str) -> String {
    std::fs::read_to_string(root.join(rel)).unwrap()
}

#[test]
fn passing_tests_keep_the_diff() {
    let repo = repo_with(&[("main.py", MAIN_PY)]);
    // Header start line is off by one and the trailer is not part of the diff.
    let diff = "--- a/main.py\n+++ b/main.py\n@@ -1,5 +1,5 @@\n def add(a: int, b: int) -> int:\n     \"\"\"Add two numbers.\"\"\"\n-    return a + b\n+    return a + b  # simple addition\n# End of file\n";

    let replies = session(
        repo.path(),
        "grep -q 'def add' main.py",
        &[
            call(1, "git_checkpoint", json!({ "message": "before refactor" })),
            call(2, "apply_diff_safe", json!({ "path": "main.py", "diff": diff, "run_tests": true })),
        ],
    );

    let cp = &replies[0]["result"];
    assert_eq!(cp["success"], true);
    assert_eq!(cp["commit_hash"].as_str().unwrap().len(), 8);

    let r = &replies[1]["result"];
    assert_eq!(r["success"], true);
    assert_eq!(r["tests_run"], true);
    assert_eq!(r["tests_passed"], true);
    assert_eq!(r["rolled_back"], false);
    assert!(read(repo.path(), "main.py").contains("# simple addition"));
}

#[test]
fn failing_tests_roll_back() {
    let repo = repo_with(&[("calc.py", CALC_PY)]);
    let diff = "@@ -1,4 +1,2 @@\n def divide(a, b):\n-    if b == 0:\n-        raise ValueError(\"division by zero\")\n     return a / b\n";

    let replies = session(
        repo.path(),
        "grep -q 'raise ValueError' calc.py",
        &[
            call(1, "git_checkpoint", json!({})),
            call(2, "apply_diff_safe", json!({ "path": "calc.py", "diff": diff })),
            call(3, "git_status", json!({})),
        ],
    );

    let r = &replies[1]["result"];
    assert_eq!(r["success"], false);
    assert_eq!(r["tests_run"], true);
    assert_eq!(r["tests_passed"], false);
    assert_eq!(r["rolled_back"], true);
    assert_eq!(r["exit_code"], 1);
    assert_eq!(read(repo.path(), "calc.py"), CALC_PY);

    let status = &replies[2]["result"];
    assert_eq!(status["clean"], true);
    assert_eq!(status["checkpoint"]["commit_hash"], replies[0]["result"]["commit_hash"]);
}

#[test]
fn unsafe_apply_then_manual_rollback() {
    let repo = repo_with(&[("main.py", MAIN_PY)]);
    let diff = "@@ -8 +8 @@\n-    return a * b\n+    return b * a\n";

    let replies = session(
        repo.path(),
        "true",
        &[
            call(1, "git_checkpoint", json!({ "message": "snapshot" })),
            call(2, "apply_diff", json!({ "path": "main.py", "diff": diff })),
            call(3, "read_file", json!({ "path": "main.py" })),
            call(4, "git_rollback", json!({})),
        ],
    );

    assert_eq!(replies[1]["result"]["hunks_applied"], 1);
    assert!(replies[2]["result"]["content"].as_str().unwrap().contains("return b * a"));
    assert_eq!(replies[3]["result"]["success"], true);
    assert_eq!(replies[3]["result"]["commit_hash"], replies[0]["result"]["commit_hash"]);
    assert_eq!(read(repo.path(), "main.py"), MAIN_PY);
}

#[test]
fn protocol_contract() {
    let repo = repo_with(&[("main.py", MAIN_PY)]);
    let bad_diff = "@@ -1,1 +1,1 @@\n-this line is not there\n+x\n";

    let replies = session(
        repo.path(),
        "true",
        &[
            call(1, "initialize", json!({})),
            json!({ "method": "nonexistent_method" }),
            call(3, "git_rollback", json!({})),
            call(4, "read_file", json!({ "path": "does/not/exist.py" })),
            call(5, "apply_diff", json!({ "path": "main.py", "diff": bad_diff })),
            call(6, "get_symbols", json!({ "path": "main.py" })),
            call(7, "read_file", json!({ "path": "../outside.txt" })),
            call(8, "initialize", json!({})),
        ],
    );

    let tools: Vec<&str> = replies[0]["result"]["tools"]
        .as_array()
        .unwrap()
        .iter()
        .filter_map(|t| t.as_str())
        .collect();
    for required in [
        "list_files",
        "get_symbols",
        "read_file",
        "apply_diff",
        "apply_diff_safe",
        "git_checkpoint",
        "git_rollback",
        "get_complexity",
    ] {
        assert!(tools.contains(&required), "missing tool: {required}");
    }
    assert_eq!(replies[0]["result"]["tools"], replies[7]["result"]["tools"]);

    assert!(replies[1]["id"].is_null());
    assert!(replies[1]["error"]["message"]
        .as_str()
        .unwrap()
        .contains("Method not found"));

    assert_eq!(replies[2]["error"]["code"], -32003);
    assert_eq!(replies[3]["error"]["code"], -32001);
    assert_eq!(replies[4]["error"]["code"], -32002);
    assert_eq!(read(repo.path(), "main.py"), MAIN_PY);

    let symbols = replies[5]["result"]["symbols"].as_array().unwrap();
    let names: Vec<&str> = symbols.iter().filter_map(|s| s["name"].as_str()).collect();
    assert_eq!(names, vec!["add", "multiply"]);

    assert_eq!(replies[6]["error"]["code"], -32001);
}

#[test]
fn failed_read_keeps_the_checkpoint() {
    let repo = repo_with(&[("main.py", MAIN_PY)]);

    let replies = session(
        repo.path(),
        "true",
        &[
            call(1, "git_checkpoint", json!({ "message": "anchor" })),
            call(2, "git_status", json!({})),
            call(3, "read_file", json!({ "path": "nope/missing.py" })),
            call(4, "git_status", json!({})),
        ],
    );

    let anchor = &replies[0]["result"]["commit_hash"];
    assert_eq!(replies[2]["error"]["code"], -32001);

    let (before, after) = (&replies[1]["result"], &replies[3]["result"]);
    assert_eq!(before["checkpoint"]["commit_hash"], *anchor);
    assert_eq!(after["checkpoint"]["commit_hash"], *anchor);
    assert_eq!(after["checkpoint"], before["checkpoint"]);
    assert_eq!(after["head"], before["head"]);
    assert_eq!(after["clean"], true);
    assert!(!repo.path().join("nope").exists());
}
