//! External command execution.
//!
//! Everything that leaves the process (git plumbing, the workspace's test
//! command) goes through [`ProcessRunner`], so the safety gate can be driven by
//! a scripted runner in tests and never cares how children are spawned.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::runtime::Runtime;

#[derive(Debug, Clone)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: PathBuf,
    /// `None` waits forever; git plumbing runs unbounded, tests never do.
    pub timeout: Option<Duration>,
    pub env: Vec<(String, String)>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>, cwd: &Path) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: cwd.to_path_buf(),
            timeout: None,
            env: Vec::new(),
        }
    }

    /// Run a free-form command line through the platform shell.
    pub fn shell(command_line: &str, cwd: &Path) -> Self {
        if cfg!(windows) {
            Self::new("cmd", cwd).args(["/C", command_line])
        } else {
            Self::new("sh", cwd).args(["-c", command_line])
        }
    }

    pub fn arg(mut self, a: impl Into<String>) -> Self {
        self.args.push(a.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn timeout(mut self, limit: Duration) -> Self {
        self.timeout = Some(limit);
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn display(&self) -> String {
        let mut out = self.program.clone();
        for a in &self.args {
            out.push(' ');
            out.push_str(a);
        }
        out
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessOutput {
    pub stdout: String,
    pub stderr: String,
    /// `None` when the process was killed by a signal or by the timeout.
    pub exit_code: Option<i32>,
    pub timed_out: bool,
}

impl ProcessOutput {
    pub fn success(&self) -> bool {
        !self.timed_out && self.exit_code == Some(0)
    }

    /// stdout followed by stderr, the way a terminal would show them.
    pub fn combined(&self) -> String {
        let mut out = self.stdout.clone();
        if !self.stderr.is_empty() {
            if !out.is_empty() && !out.ends_with('\n') {
                out.push('\n');
            }
            out.push_str(&self.stderr);
        }
        out
    }

    fn timed_out(limit: Duration) -> Self {
        Self {
            stdout: String::new(),
            stderr: format!("timed out after {}s", limit.as_secs_f64()),
            exit_code: None,
            timed_out: true,
        }
    }
}

pub trait ProcessRunner: Send {
    /// `Err` means the command could not be spawned at all; a command that
    /// ran and failed is an `Ok` with a nonzero exit code.
    fn run(&self, spec: &CommandSpec) -> std::io::Result<ProcessOutput>;
}

/// Default runner: a private current-thread tokio runtime, so timeouts can kill
/// the child without the rest of the server being async.
///
/// A command with a timeout gets its own process group on unix. When it times
/// out or exits, the group is sent SIGKILL, so background work it forked
/// cannot outlive it.
pub struct TokioRunner {
    rt: Runtime,
}

impl TokioRunner {
    pub fn new() -> std::io::Result<Self> {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        Ok(Self { rt })
    }
}

impl ProcessRunner for TokioRunner {
    fn run(&self, spec: &CommandSpec) -> std::io::Result<ProcessOutput> {
        tracing::debug!(command = %spec.display(), cwd = %spec.cwd.display(), "spawning");

        self.rt.block_on(async {
            let mut cmd = tokio::process::Command::new(&spec.program);
            cmd.args(&spec.args)
                .current_dir(&spec.cwd)
                .stdin(Stdio::null())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .kill_on_drop(true);
            for (k, v) in &spec.env {
                cmd.env(k, v);
            }
            // Timed commands lead their own group so the timeout reaches grandchildren.
            #[cfg(unix)]
            {
                if spec.timeout.is_some() {
                    cmd.process_group(0);
                }
            }

            let mut child = cmd.spawn()?;
            let group = spec.timeout.and(child.id());
            let stdout = child.stdout.take();
            let stderr = child.stderr.take();

            let collect = async {
                let (status, out, err) = tokio::join!(child.wait(), read_pipe(stdout), read_pipe(stderr));
                Ok::<_, std::io::Error>((status?, out?, err?))
            };
            let finished = match spec.timeout {
                Some(limit) => tokio::time::timeout(limit, collect).await.ok(),
                None => Some(collect.await),
            };

            // Whatever the command left running dies with its group.
            if let Some(pgid) = group {
                kill_group(pgid);
            }

            match finished {
                Some(result) => {
                    let (status, out, err) = result?;
                    Ok(ProcessOutput {
                        stdout: String::from_utf8_lossy(&out).into_owned(),
                        stderr: String::from_utf8_lossy(&err).into_owned(),
                        exit_code: status.code(),
                        timed_out: false,
                    })
                }
                None => {
                    let limit = spec.timeout.unwrap_or_default();
                    tracing::warn!(command = %spec.display(), secs = limit.as_secs(), "command timed out");
                    let _ = child.start_kill();
                    let _ = child.wait().await;
                    Ok(ProcessOutput::timed_out(limit))
                }
            }
        })
    }
}

async fn read_pipe<R: AsyncRead + Unpin>(pipe: Option<R>) -> std::io::Result<Vec<u8>> {
    let mut buf = Vec::new();
    if let Some(mut pipe) = pipe {
        pipe.read_to_end(&mut buf).await?;
    }
    Ok(buf)
}

#[cfg(unix)]
fn kill_group(pgid: u32) {
    let Ok(pgid) = libc::pid_t::try_from(pgid) else { return };
    // ESRCH just means the group is already gone.
    unsafe {
        libc::killpg(pgid, libc::SIGKILL);
    }
}

#[cfg(not(unix))]
fn kill_group(_pgid: u32) {}

/// Keep the last `max_chars` characters of command output.
pub fn tail(text: &str, max_chars: usize) -> String {
    let count = text.chars().count();
    if count <= max_chars {
        return text.to_string();
    }
    let skip = count - max_chars;
    let mut out = String::from("...");
    out.extend(text.chars().skip(skip));
    out
}
