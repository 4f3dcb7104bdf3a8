//! Subprocess execution for git commands.
//!
//! Every call blocks with an idle-output timeout: a command that keeps printing
//! progress may run for as long as it needs, one that goes silent for longer than
//! the timeout is killed. Cancellation is polled while the process runs.

use std::io::{Read, Write};
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{RecvTimeoutError, Sender, unbounded};
use thiserror::Error;

/// How often a running command checks cancellation and its idle timer.
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Errors returned by git command execution.
#[derive(Error, Debug)]
pub enum GitError {
    /// The command ran and exited unsuccessfully.
    #[error("'{command}' failed in {}: {}", .dir.display(), failure_message(.stdout, .stderr, .exit_code))]
    Failed {
        command: String,
        dir: PathBuf,
        exit_code: Option<i32>,
        stdout: String,
        stderr: String,
    },
    /// The command produced no output for longer than its idle timeout.
    #[error("'{command}' timed out: no output for {}s (process timeout)", .timeout.as_secs())]
    Timeout { command: String, timeout: Duration },
    /// The build was interrupted.
    #[error("checkout was cancelled")]
    Cancelled,
    /// Underlying IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    /// Invalid inputs were provided.
    #[error("invalid input: {0}")]
    InvalidInput(String),
}

/// The `fatal:`/`error:` lines of git output, falling back to the last non-empty line.
fn summarize(output: &str) -> String {
    let lines: Vec<&str> = output
        .lines()
        .map(str::trim)
        .filter(|l| l.starts_with("fatal:") || l.starts_with("error:"))
        .collect();
    if lines.is_empty() {
        output
            .lines()
            .map(str::trim)
            .rfind(|l| !l.is_empty())
            .unwrap_or_default()
            .to_string()
    } else {
        lines.join("\n")
    }
}

fn failure_message(stdout: &str, stderr: &str, exit_code: &Option<i32>) -> String {
    if !stderr.trim().is_empty() {
        summarize(stderr)
    } else if !stdout.trim().is_empty() {
        summarize(stdout)
    } else {
        match exit_code {
            Some(code) => format!("exit code {code}"),
            None => "terminated by signal".to_string(),
        }
    }
}

impl GitError {
    /// Stderr of a failed command, empty for other errors.
    pub fn stderr(&self) -> &str {
        match self {
            GitError::Failed { stderr, .. } => stderr,
            _ => "",
        }
    }
}

/// Cooperative cancellation flag shared between a build and the commands it runs.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Clear the flag so the token can be reused for the next build.
    pub fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// A fully described command to run.
#[derive(Debug, Clone)]
pub struct Invocation {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: PathBuf,
    pub env: Vec<(String, String)>,
    /// Written to the process stdin; stdin is null when absent.
    pub stdin: Option<String>,
    pub idle_timeout: Duration,
    pub cancel: CancelToken,
}

impl Invocation {
    /// Arguments after the leading `-c key=value` pairs.
    pub fn subcommand_args(&self) -> &[String] {
        let mut idx = 0;
        while idx + 1 < self.args.len() && self.args[idx] == "-c" {
            idx += 2;
        }
        &self.args[idx..]
    }

    /// Printable command line without the hardening options.
    pub fn command_line(&self) -> String {
        let mut line = self.program.clone();
        for arg in self.subcommand_args() {
            line.push(' ');
            line.push_str(arg);
        }
        line
    }
}

/// Output of a finished command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecResult {
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl ExecResult {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// Runs external commands. The engine only ever talks to git through this trait.
pub trait CommandRunner: Send + Sync {
    /// Run the command to completion. Non-zero exit is not an error at this level.
    fn run(&self, invocation: &Invocation) -> Result<ExecResult, GitError>;
}

/// Runs commands as real child processes.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessRunner;

enum Chunk {
    Stdout(Vec<u8>),
    Stderr(Vec<u8>),
    Closed,
}

fn pump(mut reader: impl Read, tx: Sender<Chunk>, wrap: fn(Vec<u8>) -> Chunk) {
    let mut buf = [0u8; 8192];
    loop {
        match reader.read(&mut buf) {
            Ok(0) | Err(_) => {
                let _ = tx.send(Chunk::Closed);
                return;
            }
            Ok(n) => {
                if tx.send(wrap(buf[..n].to_vec())).is_err() {
                    return;
                }
            }
        }
    }
}

fn kill(child: &mut Child) {
    let _ = child.kill();
    let _ = child.wait();
}

impl CommandRunner for ProcessRunner {
    fn run(&self, invocation: &Invocation) -> Result<ExecResult, GitError> {
        if invocation.cancel.is_cancelled() {
            return Err(GitError::Cancelled);
        }

        let mut cmd = Command::new(&invocation.program);
        cmd.args(&invocation.args)
            .current_dir(&invocation.cwd)
            .envs(invocation.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if invocation.stdin.is_some() {
            cmd.stdin(Stdio::piped());
        } else {
            cmd.stdin(Stdio::null());
        }

        let mut child = cmd.spawn()?;

        if let (Some(input), Some(mut stdin)) = (invocation.stdin.clone(), child.stdin.take()) {
            thread::spawn(move || {
                let _ = stdin.write_all(input.as_bytes());
            });
        }

        let (tx, rx) = unbounded();
        let mut open_streams = 0;
        if let Some(out) = child.stdout.take() {
            let tx = tx.clone();
            thread::spawn(move || pump(out, tx, Chunk::Stdout));
            open_streams += 1;
        }
        if let Some(err) = child.stderr.take() {
            let tx = tx.clone();
            thread::spawn(move || pump(err, tx, Chunk::Stderr));
            open_streams += 1;
        }
        drop(tx);

        let timed_out = || GitError::Timeout {
            command: invocation.command_line(),
            timeout: invocation.idle_timeout,
        };

        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        let mut last_output = Instant::now();

        while open_streams > 0 {
            if invocation.cancel.is_cancelled() {
                kill(&mut child);
                return Err(GitError::Cancelled);
            }
            match rx.recv_timeout(POLL_INTERVAL) {
                Ok(Chunk::Stdout(bytes)) => {
                    stdout.extend_from_slice(&bytes);
                    last_output = Instant::now();
                }
                Ok(Chunk::Stderr(bytes)) => {
                    stderr.extend_from_slice(&bytes);
                    last_output = Instant::now();
                }
                Ok(Chunk::Closed) => open_streams -= 1,
                Err(RecvTimeoutError::Timeout) => {
                    if last_output.elapsed() >= invocation.idle_timeout {
                        kill(&mut child);
                        return Err(timed_out());
                    }
                }
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }

        let status = loop {
            if let Some(status) = child.try_wait()? {
                break status;
            }
            if invocation.cancel.is_cancelled() {
                kill(&mut child);
                return Err(GitError::Cancelled);
            }
            if last_output.elapsed() >= invocation.idle_timeout {
                kill(&mut child);
                return Err(timed_out());
            }
            thread::sleep(POLL_INTERVAL);
        };

        Ok(ExecResult {
            exit_code: status.code(),
            stdout: String::from_utf8_lossy(&stdout).into_owned(),
            stderr: String::from_utf8_lossy(&stderr).into_owned(),
        })
    }
}
