use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use reducto::complexity;
use reducto::config::load_config;
use reducto::inspector::analyze_file;
use reducto::runner::TokioRunner;
use reducto::server::run_stdio_server;
use reducto::session::Session;
use reducto::tools::ToolRegistry;
use reducto::workspace::Workspace;
use std::path::{Path, PathBuf};
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "reducto")]
#[command(version)]
#[command(about = "Checkpoint, apply, verify and roll back code changes over a JSON-RPC stdio server")]
struct Cli {
    /// Debug logging on stderr (RUST_LOG overrides)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    cmd: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Serve tool requests on stdin/stdout for one workspace
    Mcp {
        /// Workspace root (a git repository); defaults to the current directory
        #[arg(value_name = "ROOT")]
        root: Option<PathBuf>,

        /// Shell command used to verify gated diffs
        #[arg(long, value_name = "CMD")]
        test_command: Option<String>,

        /// Kill the test command after this many seconds
        #[arg(long, value_name = "SECS")]
        test_timeout_secs: Option<u64>,
    },

    /// Print the symbols of one file as JSON
    Symbols {
        #[arg(value_name = "FILE_PATH")]
        file: PathBuf,
    },

    /// Print complexity metrics of one file as JSON
    Complexity {
        #[arg(value_name = "FILE_PATH")]
        file: PathBuf,
    },
}

fn init_logging(verbose: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if verbose {
            EnvFilter::new("debug")
        } else {
            EnvFilter::new("info")
        }
    });

    // stdout carries the protocol.
    fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();
}

fn serve(root: Option<PathBuf>, test_command: Option<String>, test_timeout_secs: Option<u64>) -> Result<()> {
    let root = match root {
        Some(r) => r,
        None => std::env::current_dir().context("Failed to get current dir")?,
    };

    let runner = TokioRunner::new().context("Failed to start process runtime")?;
    let workspace = Workspace::open(&root, Box::new(runner))
        .with_context(|| format!("Invalid workspace root: {}", root.display()))?;

    let mut cfg = load_config(workspace.root());
    if let Some(cmd) = test_command {
        cfg.test.command = Some(cmd);
    }
    if let Some(secs) = test_timeout_secs {
        cfg.test.timeout_secs = secs;
    }
    cfg.resolve_test_command(workspace.root());

    tracing::info!(root = %workspace.root().display(), "serving");
    let mut session = Session::new(workspace, cfg);
    run_stdio_server(&mut session, &ToolRegistry::standard())
}

fn absolute(p: PathBuf) -> Result<PathBuf> {
    if p.is_absolute() {
        return Ok(p);
    }
    Ok(std::env::current_dir().context("Failed to get current dir")?.join(p))
}

fn display_path(abs: &Path) -> String {
    let rel = std::env::current_dir()
        .ok()
        .and_then(|cwd| abs.strip_prefix(cwd).ok().map(Path::to_path_buf));
    rel.as_deref().unwrap_or(abs).to_string_lossy().replace('\\', "/")
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match cli.cmd {
        Command::Mcp {
            root,
            test_command,
            test_timeout_secs,
        } => serve(root, test_command, test_timeout_secs),
        Command::Symbols { file } => {
            let abs = absolute(file)?;
            let mut out = analyze_file(&abs)?;
            out.path = display_path(&abs);
            println!("{}", serde_json::to_string_pretty(&out)?);
            Ok(())
        }
        Command::Complexity { file } => {
            let abs = absolute(file)?;
            let mut out = complexity::analyze_file(&abs)?;
            out.path = display_path(&abs);
            println!("{}", serde_json::to_string_pretty(&out)?);
            Ok(())
        }
    }
}
