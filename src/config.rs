use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

pub const CONFIG_FILE_NAME: &str = ".reducto.json";

/// Hard safety ceiling: files larger than this are **always** skipped by `list_files`,
/// regardless of config.
pub const ABSOLUTE_MAX_FILE_BYTES: u64 = 4_000_000;

/// Controls workspace scanning behavior (what to skip).
///
/// Note: `.gitignore` is always respected by the scanner; these are additional
/// hard skips for noisy directories.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanConfig {
    /// Directory *names* to skip anywhere in the tree (e.g. "generated", "tmp").
    pub exclude_dir_names: Vec<String>,
    pub max_file_bytes: u64,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            exclude_dir_names: vec![],
            // 1 MB: enough for any real source file, blocks log/generated bloat.
            max_file_bytes: 1_000_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TestConfig {
    /// Command line run through the shell from the workspace root.
    /// When unset, a default is derived from the project manifests.
    pub command: Option<String>,
    pub timeout_secs: u64,
}

impl Default for TestConfig {
    fn default() -> Self {
        Self {
            command: None,
            timeout_secs: 300,
        }
    }
}

/// Identity used for checkpoint commits when the repository has none configured.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GitConfig {
    pub author_name: String,
    pub author_email: String,
}

impl Default for GitConfig {
    fn default() -> Self {
        Self {
            author_name: "reducto".to_string(),
            author_email: "reducto@localhost".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SafetyConfig {
    /// Let `apply_diff_safe` create its own checkpoint when none is active.
    /// Off by default: callers are expected to checkpoint explicitly.
    pub implicit_checkpoint: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    /// Tail of test output echoed back in a failed `apply_diff_safe` result.
    pub max_output_chars: usize,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            max_output_chars: 4_000,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub scan: ScanConfig,
    pub test: TestConfig,
    pub git: GitConfig,
    pub safety: SafetyConfig,
    pub output: OutputConfig,
}

impl Config {
    pub fn test_timeout(&self) -> Duration {
        Duration::from_secs(self.test.timeout_secs.max(1))
    }

    /// Fill `test.command` from the manifests when nothing was configured.
    /// Called once at startup so the runner only ever sees explicit configuration.
    pub fn resolve_test_command(&mut self, repo_root: &Path) {
        let configured = self
            .test
            .command
            .as_deref()
            .map(str::trim)
            .filter(|c| !c.is_empty())
            .map(str::to_string);

        self.test.command = configured.or_else(|| detect_test_command(repo_root));
        match &self.test.command {
            Some(cmd) => tracing::info!(command = %cmd, "test command"),
            None => tracing::warn!("no test command configured or detected; gated runs will roll back"),
        }
    }
}

pub fn load_config(repo_root: &Path) -> Config {
    let primary = repo_root.join(CONFIG_FILE_NAME);

    let text = std::fs::read_to_string(&primary);
    let Ok(text) = text else { return Config::default() };

    match serde_json::from_str::<Config>(&text) {
        Ok(cfg) => cfg,
        Err(e) => {
            tracing::warn!(file = %primary.display(), error = %e, "ignoring invalid config");
            Config::default()
        }
    }
}

/// Default test command for the project kind found at `repo_root`.
pub fn detect_test_command(repo_root: &Path) -> Option<String> {
    let has = |name: &str| repo_root.join(name).exists();

    if has("go.mod") {
        return Some("go test ./...".to_string());
    }
    if has("Cargo.toml") {
        return Some("cargo test".to_string());
    }
    if has("pyproject.toml") || has("setup.py") || has("requirements.txt") {
        let requirements = std::fs::read_to_string(repo_root.join("requirements.txt")).unwrap_or_default();
        if has("pytest.ini")
            || pyproject_mentions_pytest(&repo_root.join("pyproject.toml"))
            || requirements.lines().any(|l| l.trim_start().starts_with("pytest"))
        {
            return Some("python -m pytest -x -q".to_string());
        }
        return Some("python -m unittest discover -v".to_string());
    }
    if has("package.json") {
        return Some("npm test".to_string());
    }
    None
}

fn pyproject_mentions_pytest(pyproject: &Path) -> bool {
    let Ok(text) = std::fs::read_to_string(pyproject) else { return false };
    let Ok(val) = text.parse::<toml::Value>() else { return false };

    let in_tool = val
        .get("tool")
        .and_then(|t| t.get("pytest"))
        .is_some();
    let in_deps = |deps: Option<&toml::Value>| {
        deps.and_then(|d| d.as_array())
            .map(|arr| arr.iter().filter_map(|v| v.as_str()).any(|s| s.trim_start().starts_with("pytest")))
            .unwrap_or(false)
    };
    let project = val.get("project");
    let optional = project
        .and_then(|p| p.get("optional-dependencies"))
        .and_then(|o| o.as_table())
        .map(|t| t.values().any(|v| in_deps(Some(v))))
        .unwrap_or(false);

    in_tool || in_deps(project.and_then(|p| p.get("dependencies"))) || optional
}
