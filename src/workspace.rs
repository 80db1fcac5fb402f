//! The workspace: one root directory bound to one git repository.
//!
//! All file access by tools goes through [`Workspace::resolve`], which keeps every
//! path inside the root (no `..` escapes, no symlinks pointing out, no writes into
//! `.git`). Git is driven through the session's [`ProcessRunner`].

use std::ffi::OsString;
use std::fs;
use std::path::{Component, Path, PathBuf};

use crate::config::GitConfig;
use crate::error::{FileError, ToolError};
use crate::runner::{CommandSpec, ProcessOutput, ProcessRunner};

/// A path parameter that has been checked to live inside the workspace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkspacePath {
    pub abs: PathBuf,
    /// Root-relative, `/`-separated.
    pub rel: String,
}

pub struct Workspace {
    root: PathBuf,
    runner: Box<dyn ProcessRunner>,
}

impl Workspace {
    pub fn open(root: &Path, runner: Box<dyn ProcessRunner>) -> Result<Self, FileError> {
        let root = root.canonicalize().map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => FileError::NotFound(root.display().to_string()),
            _ => FileError::Io {
                path: root.display().to_string(),
                source: e,
            },
        })?;
        if !root.is_dir() {
            return Err(FileError::NotFound(format!("{} is not a directory", root.display())));
        }
        Ok(Self { root, runner })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn runner(&self) -> &dyn ProcessRunner {
        self.runner.as_ref()
    }

    /// Resolve a tool's `path` parameter (relative to the root, or absolute) and
    /// reject anything that would land outside the root.
    pub fn resolve(&self, p: &str) -> Result<WorkspacePath, FileError> {
        let p = p.trim();
        if p.is_empty() {
            return Err(FileError::NotFound("(empty path)".to_string()));
        }

        let candidate = Path::new(p);
        let joined = if candidate.is_absolute() {
            candidate.to_path_buf()
        } else {
            self.root.join(candidate)
        };

        let Some(normalized) = normalize_lexically(&joined) else {
            return Err(FileError::OutsideRoot(p.to_string()));
        };
        let physical = canonicalize_existing_prefix(&normalized);
        if !physical.starts_with(&self.root) {
            return Err(FileError::OutsideRoot(p.to_string()));
        }

        let rel_path = physical
            .strip_prefix(&self.root)
            .map_err(|_| FileError::OutsideRoot(p.to_string()))?;
        let rel = rel_path.to_string_lossy().replace('\\', "/");
        if rel.is_empty() {
            return Err(FileError::NotFound(format!("{p} is the workspace root, not a file")));
        }
        if rel == ".git" || rel.starts_with(".git/") {
            return Err(FileError::OutsideRoot(format!("{p} (repository metadata)")));
        }

        Ok(WorkspacePath { abs: physical, rel })
    }

    /// Current bytes of a file, `None` when it does not exist.
    pub fn read_bytes(&self, path: &WorkspacePath) -> Result<Option<Vec<u8>>, FileError> {
        match fs::read(&path.abs) {
            Ok(b) => Ok(Some(b)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(FileError::Io {
                path: path.rel.clone(),
                source: e,
            }),
        }
    }

    pub fn read_text(&self, path: &WorkspacePath) -> Result<String, FileError> {
        let bytes = self
            .read_bytes(path)?
            .ok_or_else(|| FileError::NotFound(path.rel.clone()))?;
        String::from_utf8(bytes).map_err(|_| FileError::NotText(path.rel.clone()))
    }

    /// Write via a sibling temp file + rename, so readers see either the old
    /// content or the new content, never a prefix of it.
    pub fn write_atomic(&self, path: &WorkspacePath, bytes: &[u8]) -> Result<(), FileError> {
        let io_err = |source: std::io::Error| FileError::Io {
            path: path.rel.clone(),
            source,
        };

        let dir = path
            .abs
            .parent()
            .ok_or_else(|| FileError::OutsideRoot(path.rel.clone()))?;
        fs::create_dir_all(dir).map_err(io_err)?;

        let file_name = path
            .abs
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "file".to_string());
        let tmp_path = dir.join(format!(".{file_name}.reducto-{}.tmp", std::process::id()));

        if let Err(e) = fs::write(&tmp_path, bytes) {
            let _ = fs::remove_file(&tmp_path);
            return Err(io_err(e));
        }
        if let Ok(meta) = fs::metadata(&path.abs) {
            let _ = fs::set_permissions(&tmp_path, meta.permissions());
        }
        if let Err(e) = fs::rename(&tmp_path, &path.abs) {
            let _ = fs::remove_file(&tmp_path);
            return Err(io_err(e));
        }
        Ok(())
    }

    pub fn remove_file(&self, path: &WorkspacePath) -> Result<(), FileError> {
        match fs::remove_file(&path.abs) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(FileError::Io {
                path: path.rel.clone(),
                source: e,
            }),
        }
    }

    // ---------------------------------------------------------------------------
    // git
    // ---------------------------------------------------------------------------

    fn git_spec(&self, args: &[&str]) -> CommandSpec {
        CommandSpec::new("git", &self.root)
            .args(args.iter().copied())
            .env("GIT_TERMINAL_PROMPT", "0")
    }

    /// Run git and insist on exit 0.
    fn git(&self, args: &[&str]) -> Result<ProcessOutput, ToolError> {
        let out = self.git_unchecked(args)?;
        if !out.success() {
            let detail = if out.stderr.trim().is_empty() {
                out.stdout.trim().to_string()
            } else {
                out.stderr.trim().to_string()
            };
            return Err(ToolError::Git(format!("`git {}` failed: {detail}", args.join(" "))));
        }
        Ok(out)
    }

    fn git_unchecked(&self, args: &[&str]) -> Result<ProcessOutput, ToolError> {
        self.runner
            .run(&self.git_spec(args))
            .map_err(|e| ToolError::Git(format!("failed to run git: {e}")))
    }

    pub fn is_repo(&self) -> bool {
        self.git_unchecked(&["rev-parse", "--is-inside-work-tree"])
            .map(|out| out.success() && out.stdout.trim() == "true")
            .unwrap_or(false)
    }

    /// Top level of the enclosing repository, if any.
    pub fn repo_toplevel(&self) -> Option<PathBuf> {
        let out = self.git(&["rev-parse", "--show-toplevel"]).ok()?;
        let top = PathBuf::from(out.stdout.trim());
        Some(top.canonicalize().unwrap_or(top))
    }

    pub fn head(&self) -> Result<String, ToolError> {
        let out = self.git(&["rev-parse", "HEAD"])?;
        Ok(out.stdout.trim().to_string())
    }

    pub fn current_branch(&self) -> Option<String> {
        let out = self.git(&["symbolic-ref", "--short", "-q", "HEAD"]).ok()?;
        let b = out.stdout.trim();
        (!b.is_empty()).then(|| b.to_string())
    }

    /// Paths with uncommitted changes (staged, unstaged or untracked), root-relative.
    pub fn changed_files(&self) -> Result<Vec<String>, ToolError> {
        let out = self.git(&["status", "--porcelain", "--untracked-files=all"])?;
        let mut files: Vec<String> = out
            .stdout
            .lines()
            .filter(|l| l.len() > 3)
            .map(|l| {
                let path = &l[3..];
                let path = path.rsplit(" -> ").next().unwrap_or(path);
                path.trim_matches('"').to_string()
            })
            .collect();
        files.sort();
        files.dedup();
        Ok(files)
    }

    pub fn is_clean(&self) -> Result<bool, ToolError> {
        Ok(self.changed_files()?.is_empty())
    }

    /// Stage everything and commit it, even when there is nothing to commit.
    /// Returns the new HEAD.
    pub fn commit_all(&self, message: &str, identity: &GitConfig) -> Result<String, ToolError> {
        self.git(&["add", "-A"])?;

        let has_identity = self
            .git_unchecked(&["config", "user.email"])
            .map(|out| out.success() && !out.stdout.trim().is_empty())
            .unwrap_or(false);

        let name_cfg = format!("user.name={}", identity.author_name);
        let email_cfg = format!("user.email={}", identity.author_email);
        let mut args: Vec<&str> = Vec::new();
        if !has_identity {
            args.extend(["-c", name_cfg.as_str(), "-c", email_cfg.as_str()]);
        }
        args.extend([
            "-c",
            "commit.gpgsign=false",
            "commit",
            "--allow-empty",
            "--no-verify",
            "-q",
            "-m",
            message,
        ]);
        self.git(&args)?;
        self.head()
    }

    pub fn reset_hard(&self, rev: &str) -> Result<(), ToolError> {
        self.git(&["reset", "--hard", "-q", rev]).map(|_| ())
    }

    /// Remove untracked, non-ignored files and directories.
    pub fn clean_untracked(&self) -> Result<(), ToolError> {
        self.git(&["clean", "-fdq"]).map(|_| ())
    }

    /// Whether `rel` exists in the tree of `rev`.
    pub fn exists_at(&self, rev: &str, rel: &str) -> Result<bool, ToolError> {
        let object = format!("{rev}:{rel}");
        let out = self.git_unchecked(&["cat-file", "-e", object.as_str()])?;
        Ok(out.success())
    }
}

/// Resolve `.` and `..` without touching the filesystem.
/// Returns `None` when `..` would climb above the filesystem root.
fn normalize_lexically(path: &Path) -> Option<PathBuf> {
    let mut out = PathBuf::new();
    for comp in path.components() {
        match comp {
            Component::Prefix(p) => out.push(p.as_os_str()),
            Component::RootDir => out.push(comp.as_os_str()),
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    return None;
                }
            }
            Component::Normal(c) => out.push(c),
        }
    }
    Some(out)
}

/// Canonicalize the longest existing ancestor of `path` and re-append the rest,
/// so symlinks are followed for the part that exists.
fn canonicalize_existing_prefix(path: &Path) -> PathBuf {
    let mut existing = path.to_path_buf();
    let mut rest: Vec<OsString> = Vec::new();
    loop {
        if let Ok(canon) = existing.canonicalize() {
            let mut out = canon;
            for c in rest.iter().rev() {
                out.push(c);
            }
            return out;
        }
        match existing.file_name() {
            Some(name) => {
                rest.push(name.to_os_string());
                existing.pop();
            }
            None => return path.to_path_buf(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::TokioRunner;
    use tempfile::TempDir;

    fn open(tmp: &TempDir) -> Workspace {
        Workspace::open(tmp.path(), Box::new(TokioRunner::new().unwrap())).unwrap()
    }

    #[test]
    fn resolve_keeps_paths_inside_root() {
        let tmp = TempDir::new().unwrap();
        std::fs::create_dir_all(tmp.path().join("src")).unwrap();
        let ws = open(&tmp);

        let p = ws.resolve("src/../src/lib.rs").unwrap();
        assert_eq!(p.rel, "src/lib.rs");
        assert!(p.abs.starts_with(ws.root()));

        let abs = ws.root().join("src/main.rs");
        assert_eq!(ws.resolve(abs.to_str().unwrap()).unwrap().rel, "src/main.rs");

        assert!(matches!(ws.resolve("../etc/passwd"), Err(FileError::OutsideRoot(_))));
        assert!(matches!(ws.resolve("/etc/passwd"), Err(FileError::OutsideRoot(_))));
        assert!(matches!(ws.resolve(".git/config"), Err(FileError::OutsideRoot(_))));
        assert!(matches!(ws.resolve(""), Err(FileError::NotFound(_))));
    }

    #[cfg(unix)]
    #[test]
    fn resolve_rejects_symlink_escape() {
        let outside = TempDir::new().unwrap();
        let tmp = TempDir::new().unwrap();
        std::os::unix::fs::symlink(outside.path(), tmp.path().join("link")).unwrap();
        let ws = open(&tmp);
        assert!(matches!(ws.resolve("link/secret.txt"), Err(FileError::OutsideRoot(_))));
    }

    #[test]
    fn atomic_write_replaces_content_and_leaves_no_temp() {
        let tmp = TempDir::new().unwrap();
        let ws = open(&tmp);
        let p = ws.resolve("nested/dir/a.txt").unwrap();

        assert_eq!(ws.read_bytes(&p).unwrap(), None);
        ws.write_atomic(&p, b"one\n").unwrap();
        ws.write_atomic(&p, b"two\n").unwrap();
        assert_eq!(ws.read_text(&p).unwrap(), "two\n");

        let leftovers: Vec<_> = std::fs::read_dir(tmp.path().join("nested/dir"))
            .unwrap()
            .flatten()
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn read_text_rejects_binary() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(tmp.path().join("blob.bin"), [0xff, 0xfe, 0x00]).unwrap();
        let ws = open(&tmp);
        let p = ws.resolve("blob.bin").unwrap();
        assert!(matches!(ws.read_text(&p), Err(FileError::NotText(_))));
    }

    #[test]
    fn git_queries_outside_a_repo_fail_cleanly() {
        let tmp = TempDir::new().unwrap();
        let ws = open(&tmp);
        assert!(!ws.is_repo());
        assert!(matches!(ws.head(), Err(ToolError::Git(_))));
        assert!(matches!(
            ws.commit_all("x", &GitConfig::default()),
            Err(ToolError::Git(_))
        ));
    }

    #[test]
    fn commit_all_includes_untracked_and_allows_empty() {
        let tmp = TempDir::new().unwrap();
        let ws = open(&tmp);
        ws.git(&["init", "-q"]).unwrap();
        std::fs::write(tmp.path().join("a.txt"), "a\n").unwrap();

        let first = ws.commit_all("first", &GitConfig::default()).unwrap();
        assert!(ws.is_clean().unwrap());
        assert!(ws.exists_at(&first, "a.txt").unwrap());
        assert!(!ws.exists_at(&first, "missing.txt").unwrap());

        let second = ws.commit_all("nothing new", &GitConfig::default()).unwrap();
        assert_ne!(first, second);
        assert_eq!(ws.head().unwrap(), second);
    }
}
