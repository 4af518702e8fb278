// --- OS process plumbing -----------------------------------------------------
//
// Two small seams sit between the supervisor and the OS:
//   - `ProcessTable`: find / signal processes by executable name (sysinfo)
//   - `CommandRunner`: spawn a program, then wait for it (optionally
//     time-bounded) and hand back its combined output (tokio::process)
//
// Everything above this module talks to these traits so it can be exercised
// without mpv or amixer installed.

use std::{ffi::OsStr, path::Path, process::Stdio, time::Duration};

use async_trait::async_trait;
use sysinfo::{ProcessesToUpdate, Signal, System};
use thiserror::Error;
use tokio::process::Command;

#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("failed to signal {failed} of {matched} '{name}' process(es)")]
    Signal {
        name: String,
        matched: usize,
        failed: usize,
    },
    #[error("{0}")]
    Io(#[from] std::io::Error),
}

#[async_trait]
pub trait ProcessTable: Send + Sync {
    /// True if any process with this exact executable name exists.
    async fn is_running(&self, name: &str) -> Result<bool, ProcessError>;

    /// Ask every process with this executable name to terminate.
    /// Returns how many were signalled; zero matches is not an error.
    async fn terminate(&self, name: &str) -> Result<usize, ProcessError>;
}

/// The name a program shows up under in the process table: the file name of
/// `program`, so "/usr/bin/mpv" and "mpv" both look for "mpv".
pub fn executable_name(program: &str) -> &str {
    Path::new(program)
        .file_name()
        .and_then(OsStr::to_str)
        .unwrap_or(program)
}

/// Process table backed by `sysinfo`.
pub struct SysinfoProcessTable {
    sys: tokio::sync::Mutex<System>,
}

impl SysinfoProcessTable {
    pub fn new() -> Self {
        Self {
            sys: tokio::sync::Mutex::new(System::new()),
        }
    }
}

impl Default for SysinfoProcessTable {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ProcessTable for SysinfoProcessTable {
    async fn is_running(&self, name: &str) -> Result<bool, ProcessError> {
        let mut sys = self.sys.lock().await;
        sys.refresh_processes(ProcessesToUpdate::All, true);
        let found = sys.processes_by_exact_name(OsStr::new(name)).next().is_some();
        Ok(found)
    }

    async fn terminate(&self, name: &str) -> Result<usize, ProcessError> {
        let mut sys = self.sys.lock().await;
        sys.refresh_processes(ProcessesToUpdate::All, true);

        let mut matched = 0;
        let mut failed = 0;
        for process in sys.processes_by_exact_name(OsStr::new(name)) {
            matched += 1;
            // SIGTERM where supported, hard kill otherwise.
            let sent = process
                .kill_with(Signal::Term)
                .unwrap_or_else(|| process.kill());
            if !sent {
                failed += 1;
            }
        }

        if failed > 0 {
            return Err(ProcessError::Signal {
                name: name.to_string(),
                matched,
                failed,
            });
        }
        Ok(matched)
    }
}

/// A program invocation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
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
}

impl std::fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.program)?;
        for a in &self.args {
            write!(f, " {a}")?;
        }
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RunOutput {
    /// The program exited on its own. `code` is None when it died from a signal.
    Exited { code: Option<i32>, output: String },
    /// The time bound elapsed and the program was killed.
    TimedOut,
}

impl RunOutput {
    pub fn success(&self) -> bool {
        matches!(self, RunOutput::Exited { code: Some(0), .. })
    }
}

#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Start the program. Returns once it is in the process table.
    fn spawn(&self, cmd: &CommandSpec) -> std::io::Result<Box<dyn RunningCommand>>;

    /// Spawn and wait in one go.
    async fn run(&self, cmd: &CommandSpec, limit: Option<Duration>) -> std::io::Result<RunOutput> {
        self.spawn(cmd)?.wait(limit).await
    }
}

/// A spawned program whose output is being captured.
#[async_trait]
pub trait RunningCommand: Send {
    /// Wait for exit, killing the program if `limit` elapses first.
    async fn wait(self: Box<Self>, limit: Option<Duration>) -> std::io::Result<RunOutput>;
}

/// Runs commands with `tokio::process`.
#[derive(Clone, Copy, Debug, Default)]
pub struct TokioCommandRunner;

impl CommandRunner for TokioCommandRunner {
    fn spawn(&self, cmd: &CommandSpec) -> std::io::Result<Box<dyn RunningCommand>> {
        let mut command = Command::new(&cmd.program);
        command.args(&cmd.args);
        command.stdin(Stdio::null());
        command.stdout(Stdio::piped());
        command.stderr(Stdio::piped());
        // Dropping the wait future on timeout drops the child, which kills it.
        command.kill_on_drop(true);

        Ok(Box::new(TokioChild(command.spawn()?)))
    }
}

struct TokioChild(tokio::process::Child);

#[async_trait]
impl RunningCommand for TokioChild {
    async fn wait(self: Box<Self>, limit: Option<Duration>) -> std::io::Result<RunOutput> {
        let waiting = self.0.wait_with_output();

        let out = match limit {
            Some(limit) => match tokio::time::timeout(limit, waiting).await {
                Ok(res) => res?,
                Err(_) => return Ok(RunOutput::TimedOut),
            },
            None => waiting.await?,
        };

        let mut output = String::from_utf8_lossy(&out.stdout).into_owned();
        output.push_str(&String::from_utf8_lossy(&out.stderr));

        Ok(RunOutput::Exited {
            code: out.status.code(),
            output,
        })
    }
}
