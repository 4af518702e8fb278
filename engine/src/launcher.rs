// --- Player launcher ---------------------------------------------------------
//
// One launch:
//   1) terminate any player already running (at most one audio output)
//   2) build the stream URL for the station
//   3) spawn the player, unless a stop has landed since the caller asked
//   4) wait for it, bounded by the connection timeout, capturing its output
//   5) classify what happened
//
// Spawning and stopping both go through `spawn_gate`, which also holds a stop
// generation. A stop bumps it; a launch that sees a different generation than
// the one it started with gives up without spawning. A stop that comes after
// the spawn finds the new player in the process table and terminates it.
//
// Classification order is fixed: timeout first, then the output markers
// (404, 403, name resolution), then any other non-zero exit. The first rule that
// matches wins.

use std::{sync::Arc, time::Duration};

use thiserror::Error;
use tracing::{error, info, warn};

use crate::process::{executable_name, CommandRunner, CommandSpec, ProcessError, ProcessTable, RunOutput};

/// How long to wait for terminated players to leave the process table.
const SETTLE_POLL: Duration = Duration::from_millis(100);
const SETTLE_ATTEMPTS: u32 = 10;

/// Why a launch did not succeed.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum LaunchError {
    #[error("Connection timeout")]
    Timeout,
    #[error("Stream not found (404)")]
    NotFound,
    #[error("Access denied (403)")]
    AccessDenied,
    #[error("Failed to resolve hostname")]
    ResolutionFailure,
    #[error("Start cancelled by stop")]
    Cancelled,
    #[error("{summary}")]
    Unknown { summary: String, diagnostics: String },
}

impl LaunchError {
    /// Longer text for operators; the raw player output when there is one.
    pub fn details(&self) -> String {
        match self {
            LaunchError::Unknown { summary, diagnostics } if diagnostics.trim().is_empty() => {
                format!("Error: {summary}")
            }
            LaunchError::Unknown { diagnostics, .. } => diagnostics.trim().to_string(),
            other => format!("Error: {other}"),
        }
    }
}

/// Map a finished (or timed out) player run onto a launch result.
pub fn classify(run: &RunOutput) -> Result<(), LaunchError> {
    let (code, output) = match run {
        RunOutput::TimedOut => return Err(LaunchError::Timeout),
        RunOutput::Exited { code: Some(0), .. } => return Ok(()),
        RunOutput::Exited { code, output } => (code, output),
    };

    if output.contains("404") {
        return Err(LaunchError::NotFound);
    }
    if output.contains("403") {
        return Err(LaunchError::AccessDenied);
    }
    if output.contains("Failed to resolve") {
        return Err(LaunchError::ResolutionFailure);
    }

    let summary = match code {
        Some(c) => format!("Player exited with status {c}"),
        None => "Player was terminated by a signal".to_string(),
    };
    Err(LaunchError::Unknown {
        summary,
        diagnostics: output.clone(),
    })
}

/// `base` + "/" + `station`, with exactly one slash between them.
///
/// Trailing slashes on the base and leading slashes on the station are
/// dropped, and slash runs inside the station collapse to one. The scheme
/// separator of the base is left alone.
pub fn stream_url(base: &str, station: &str) -> String {
    let base = base.trim().trim_end_matches('/');
    let station = station
        .trim()
        .split('/')
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("/");
    format!("{base}/{station}")
}

#[derive(Clone, Debug)]
pub struct PlayerCommand {
    pub program: String,
    pub args: Vec<String>,
}

pub struct Launcher {
    table: Arc<dyn ProcessTable>,
    runner: Arc<dyn CommandRunner>,
    player: PlayerCommand,
    base_url: String,
    /// Stop generation.
    spawn_gate: tokio::sync::Mutex<u64>,
}

impl Launcher {
    pub fn new(
        table: Arc<dyn ProcessTable>,
        runner: Arc<dyn CommandRunner>,
        player: PlayerCommand,
        base_url: impl Into<String>,
    ) -> Self {
        Self {
            table,
            runner,
            player,
            base_url: base_url.into(),
            spawn_gate: tokio::sync::Mutex::new(0),
        }
    }

    /// Name of the player in the process table.
    pub fn player_name(&self) -> &str {
        executable_name(&self.player.program)
    }

    /// Current stop generation, to be handed back to [`Launcher::launch`].
    pub async fn generation(&self) -> u64 {
        *self.spawn_gate.lock().await
    }

    pub fn url_for(&self, station: &str) -> String {
        stream_url(&self.base_url, station)
    }

    /// Start the player for `station` and wait for it, at most `timeout`.
    /// Returns the stream URL on success.
    ///
    /// `generation` comes from [`Launcher::generation`]. If [`Launcher::stop`]
    /// ran since, nothing is spawned and the launch fails with `Cancelled`.
    pub async fn launch(&self, station: &str, timeout: Duration, generation: u64) -> Result<String, LaunchError> {
        self.terminate_existing().await;

        let url = self.url_for(station);
        let cmd = CommandSpec::new(&self.player.program)
            .args(self.player.args.iter().cloned())
            .arg(url.clone());

        let child = {
            let gate = self.spawn_gate.lock().await;
            if *gate != generation {
                info!("stop requested, not launching {url}");
                return Err(LaunchError::Cancelled);
            }
            info!("launching player: {cmd}");
            self.runner.spawn(&cmd)
        };

        let run = match child {
            Ok(child) => child.wait(Some(timeout)).await,
            Err(e) => Err(e),
        };
        let run = match run {
            Ok(run) => run,
            Err(e) => {
                error!("failed to run {}: {e}", self.player.program);
                return Err(LaunchError::Unknown {
                    summary: format!("Failed to run {}", self.player.program),
                    diagnostics: e.to_string(),
                });
            }
        };

        match classify(&run) {
            Ok(()) => {
                info!("stream started: {url}");
                Ok(url)
            }
            Err(LaunchError::Timeout) => {
                error!("stream connection timed out after {}s: {url}", timeout.as_secs());
                Err(LaunchError::Timeout)
            }
            Err(e) => {
                error!("error starting stream {url}: {e}");
                if let RunOutput::Exited { output, .. } = &run {
                    if !output.trim().is_empty() {
                        error!("player output: {}", output.trim());
                    }
                }
                Err(e)
            }
        }
    }

    /// Terminate every player and cancel launches that have not spawned yet.
    /// Returns how many processes were signalled.
    pub async fn stop(&self) -> Result<usize, ProcessError> {
        let mut gate = self.spawn_gate.lock().await;
        *gate += 1;
        self.table.terminate(self.player_name()).await
    }

    /// Best effort: errors are logged, never returned.
    async fn terminate_existing(&self) {
        let name = self.player_name();
        match self.table.terminate(name).await {
            Ok(0) => {}
            Ok(n) => {
                info!("terminated {n} running '{name}' process(es) before launch");
                self.wait_until_gone().await;
            }
            Err(e) => warn!("could not terminate running '{name}': {e}"),
        }
    }

    async fn wait_until_gone(&self) {
        for _ in 0..SETTLE_ATTEMPTS {
            match self.table.is_running(self.player_name()).await {
                Ok(true) => tokio::time::sleep(SETTLE_POLL).await,
                _ => return,
            }
        }
        warn!("'{}' still present after termination, launching anyway", self.player_name());
    }
}
