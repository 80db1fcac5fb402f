use anyhow::{Context, Result};
use ignore::overrides::{Override, OverrideBuilder};
use ignore::WalkBuilder;
use rayon::prelude::*;
use serde::Serialize;
use std::path::{Path, PathBuf};
use xxhash_rust::xxh3::xxh3_64;

use crate::config::ABSOLUTE_MAX_FILE_BYTES;
use crate::inspector::language_of;

fn default_overrides(root: &Path, exclude_dir_names: &[String]) -> Result<Override> {
    let mut ob = OverrideBuilder::new(root);

    // Overrides are whitelist-by-default; `!` turns each pattern into an ignore.
    // Directories need both the entry and its descendants or the walker still descends.

    // Lockfiles
    ob.add("!**/*.lock")?;
    ob.add("!**/package-lock.json")?;
    ob.add("!**/pnpm-lock.yaml")?;
    ob.add("!**/yarn.lock")?;
    ob.add("!**/Cargo.lock")?;
    ob.add("!**/go.sum")?;

    // Sourcemaps + images/icons
    for ext in ["map", "svg", "png", "ico", "jpg", "jpeg", "gif", "pyc"] {
        ob.add(&format!("!**/*.{ext}"))?;
    }

    // Build outputs, caches, VCS metadata
    for d in [
        ".git",
        "node_modules",
        "target",
        "dist",
        "build",
        "coverage",
        ".next",
        ".nuxt",
        ".venv",
        "venv",
        "__pycache__",
        ".pytest_cache",
        ".mypy_cache",
        "vendor",
        "out",
    ] {
        ob.add(&format!("!**/{d}"))?;
        ob.add(&format!("!**/{d}/**"))?;
    }

    for d in exclude_dir_names {
        let d = d.trim().trim_matches('/');
        if d.is_empty() {
            continue;
        }
        ob.add(&format!("!**/{d}"))?;
        ob.add(&format!("!**/{d}/**"))?;
    }

    Ok(ob.build()?)
}

#[derive(Debug, Clone, Serialize)]
pub struct FileEntry {
    #[serde(skip)]
    pub abs_path: PathBuf,
    /// Root-relative, `/`-separated.
    pub path: String,
    pub language: Option<&'static str>,
    pub bytes: u64,
    /// xxh3-64 of the contents, lowercase hex.
    pub hash: String,
}

#[derive(Debug, Clone)]
pub struct ScanOptions {
    pub root: PathBuf,
    pub max_file_bytes: u64,
    pub exclude_dir_names: Vec<String>,
}

impl ScanOptions {
    pub fn from_config(root: &Path, scan: &crate::config::ScanConfig) -> Self {
        Self {
            root: root.to_path_buf(),
            max_file_bytes: scan.max_file_bytes.min(ABSOLUTE_MAX_FILE_BYTES),
            exclude_dir_names: scan.exclude_dir_names.clone(),
        }
    }
}

/// Walk the workspace (gitignore-aware) and hash every kept file. Sorted by path.
pub fn scan_workspace(opts: &ScanOptions) -> Result<Vec<FileEntry>> {
    let overrides = default_overrides(&opts.root, &opts.exclude_dir_names)?;
    let walker = WalkBuilder::new(&opts.root)
        .standard_filters(true) // .gitignore, .ignore, hidden, etc.
        .hidden(false)
        .require_git(false)
        .overrides(overrides)
        .build();

    let mut candidates: Vec<(PathBuf, String, u64)> = Vec::new();
    for item in walker {
        let dent = match item {
            Ok(d) => d,
            Err(e) => {
                tracing::debug!(error = %e, "skipping unreadable entry");
                continue;
            }
        };
        if !dent.file_type().map(|ft| ft.is_file()).unwrap_or(false) {
            continue;
        }

        let abs_path = dent.into_path();
        let bytes = match std::fs::metadata(&abs_path).map(|m| m.len()) {
            Ok(b) => b,
            Err(_) => continue,
        };
        if bytes > opts.max_file_bytes {
            tracing::debug!(path = %abs_path.display(), bytes, "skipping oversized file");
            continue;
        }

        let rel = abs_path
            .strip_prefix(&opts.root)
            .with_context(|| format!("{} is not under {}", abs_path.display(), opts.root.display()))?
            .to_string_lossy()
            .replace('\\', "/");
        candidates.push((abs_path, rel, bytes));
    }

    let mut entries: Vec<FileEntry> = candidates
        .into_par_iter()
        .filter_map(|(abs_path, path, bytes)| {
            // Files can vanish between walk and read; drop them.
            let content = std::fs::read(&abs_path).ok()?;
            Some(FileEntry {
                language: language_of(Path::new(&path)),
                hash: format!("{:016x}", xxh3_64(&content)),
                abs_path,
                path,
                bytes,
            })
        })
        .collect();

    entries.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(entries)
}
