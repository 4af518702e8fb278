// --- Stream supervisor -------------------------------------------------------
//
// The one object the HTTP layer talks to. It owns the launcher, the probe and
// the volume controller, and adds two things on top:
//
//   - Launches are serialised by `launch_lock`, so concurrent start requests
//     (including the boot-time auto-start) never interleave their
//     kill-then-spawn sequences.
//   - A stop does not queue behind that lock. It cancels every start that
//     has not spawned its player yet, queued ones included, and terminates
//     the rest (see the launcher's stop generation).
//   - In-flight starts/stops are counted so status can say "starting" while
//     the player is still connecting.
//
// Whether a player is actually running is never cached: it is always read
// from the process table.

use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use serde::Serialize;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::{
    config::Config,
    launcher::{LaunchError, Launcher, PlayerCommand},
    probe::Probe,
    process::{executable_name, CommandRunner, ProcessError, ProcessTable},
    volume::{VolumeController, VolumeError},
};

#[derive(Debug, Error)]
pub enum StopError {
    #[error("Failed to stop stream")]
    Terminate(#[from] ProcessError),
}

/// What the supervisor reports to pollers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SupervisorState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct StreamStatus {
    pub playing: bool,
    pub state: SupervisorState,
}

/// Boot-time auto-start settings.
#[derive(Clone, Copy, Debug)]
pub struct AutoStartPolicy {
    pub enabled: bool,
    /// Attempts allowed after the first one fails.
    pub max_retries: u32,
    pub interval: Duration,
}

impl AutoStartPolicy {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            enabled: cfg.auto_start,
            max_retries: cfg.network_settings.max_retries,
            interval: cfg.network_settings.retry_interval(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AutoStartState {
    Init,
    Attempting { attempts_remaining: u32 },
    /// Terminal: a player was already running, an attempt succeeded, or a
    /// stop cancelled the attempt.
    Idle,
    /// Terminal: every attempt failed.
    Exhausted,
}

/// Holds an in-flight counter up for as long as it lives.
struct InFlight<'a>(&'a AtomicUsize);

impl<'a> InFlight<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

pub struct StreamSupervisor {
    launcher: Launcher,
    probe: Probe,
    volume: VolumeController,
    default_station: String,
    timeout: Duration,
    launch_lock: tokio::sync::Mutex<()>,
    starting: AtomicUsize,
    stopping: AtomicUsize,
}

impl StreamSupervisor {
    pub fn new(table: Arc<dyn ProcessTable>, runner: Arc<dyn CommandRunner>, cfg: &Config) -> Self {
        let player = PlayerCommand {
            program: cfg.player.program.clone(),
            args: cfg.player.args.clone(),
        };
        Self {
            launcher: Launcher::new(table.clone(), runner.clone(), player, cfg.stream_base_url.clone()),
            probe: Probe::new(table.clone(), executable_name(&cfg.player.program)),
            volume: VolumeController::new(runner, cfg.mixer.program.clone(), cfg.mixer.control.clone()),
            default_station: cfg.default_station_id.clone(),
            timeout: cfg.network_settings.stream_timeout(),
            launch_lock: tokio::sync::Mutex::new(()),
            starting: AtomicUsize::new(0),
            stopping: AtomicUsize::new(0),
        }
    }

    pub async fn status(&self) -> StreamStatus {
        let playing = self.probe.is_playing().await;
        let state = if self.stopping.load(Ordering::SeqCst) > 0 {
            SupervisorState::Stopping
        } else if self.starting.load(Ordering::SeqCst) > 0 {
            SupervisorState::Starting
        } else if playing {
            SupervisorState::Running
        } else {
            SupervisorState::Stopped
        };
        StreamStatus { playing, state }
    }

    /// Launch the player for `station` (or the default station when empty).
    ///
    /// Runs on its own task so that a caller giving up (e.g. an HTTP client
    /// disconnecting) does not kill a player that is mid-connect.
    pub async fn start(self: &Arc<Self>, station: Option<String>) -> Result<String, LaunchError> {
        let this = Arc::clone(self);
        let task = tokio::spawn(async move { this.start_serialized(station).await });
        match task.await {
            Ok(res) => res,
            Err(e) => {
                error!("launch task failed: {e}");
                Err(LaunchError::Unknown {
                    summary: "Launch task failed".into(),
                    diagnostics: e.to_string(),
                })
            }
        }
    }

    async fn start_serialized(&self, station: Option<String>) -> Result<String, LaunchError> {
        let station = station
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .unwrap_or(self.default_station.as_str());

        let _starting = InFlight::enter(&self.starting);
        // Taken before queueing, so a stop also cancels starts still waiting.
        let generation = self.launcher.generation().await;
        let _launch = self.launch_lock.lock().await;
        self.launcher.launch(station, self.timeout, generation).await
    }

    /// Terminate the player. Nothing to terminate counts as success.
    ///
    /// Never waits for an in-flight launch: one that has not spawned yet is
    /// cancelled, one that has is terminated here.
    pub async fn stop(&self) -> Result<usize, StopError> {
        let _stopping = InFlight::enter(&self.stopping);
        match self.launcher.stop().await {
            Ok(n) => {
                info!("stream stopped ({n} player process(es) terminated)");
                Ok(n)
            }
            Err(e) => {
                error!("error stopping stream: {e}");
                Err(e.into())
            }
        }
    }

    pub async fn set_volume(&self, level: i64) -> Result<u8, VolumeError> {
        self.volume.set_volume(level).await
    }

    /// Run auto-start in the background if the policy enables it.
    pub fn spawn_auto_start(self: &Arc<Self>, policy: AutoStartPolicy) -> Option<JoinHandle<AutoStartState>> {
        if !policy.enabled {
            info!("auto-start disabled");
            return None;
        }
        let this = Arc::clone(self);
        Some(tokio::spawn(async move { this.auto_start(policy).await }))
    }

    /// Drive the auto-start state machine to a terminal state.
    pub async fn auto_start(self: &Arc<Self>, policy: AutoStartPolicy) -> AutoStartState {
        let mut state = AutoStartState::Init;
        loop {
            state = match state {
                AutoStartState::Init => {
                    if self.probe.is_playing().await {
                        info!("stream already playing, skipping auto-start");
                        AutoStartState::Idle
                    } else {
                        info!("auto-starting stream on boot");
                        AutoStartState::Attempting {
                            attempts_remaining: policy.max_retries,
                        }
                    }
                }
                AutoStartState::Attempting { attempts_remaining } => match self.start(None).await {
                    Ok(_) => {
                        info!("auto-start successful");
                        AutoStartState::Idle
                    }
                    Err(LaunchError::Cancelled) => {
                        info!("auto-start cancelled by stop");
                        AutoStartState::Idle
                    }
                    Err(e) => {
                        error!("auto-start failed: {e}");
                        if attempts_remaining > 0 {
                            info!(
                                "retrying in {:.1} seconds... ({attempts_remaining} attempts remaining)",
                                policy.interval.as_secs_f64()
                            );
                            tokio::time::sleep(policy.interval).await;
                            AutoStartState::Attempting {
                                attempts_remaining: attempts_remaining - 1,
                            }
                        } else {
                            error!("auto-start failed after all retry attempts");
                            AutoStartState::Exhausted
                        }
                    }
                },
                AutoStartState::Idle | AutoStartState::Exhausted => return state,
            };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::{
        fake::{exited, FakeProcessTable, FakeRunner},
        RunOutput,
    };

    fn config() -> Config {
        let mut cfg = Config::default();
        cfg.stream_base_url = "http://radio.example.net/listen/".into();
        cfg.default_station_id = "main".into();
        cfg
    }

    fn supervisor(table: &FakeProcessTable, runner: &FakeRunner) -> Arc<StreamSupervisor> {
        Arc::new(StreamSupervisor::new(
            Arc::new(table.clone()),
            Arc::new(runner.clone()),
            &config(),
        ))
    }

    fn policy(max_retries: u32) -> AutoStartPolicy {
        AutoStartPolicy {
            enabled: true,
            max_retries,
            interval: Duration::from_secs(10),
        }
    }

    #[tokio::test]
    async fn start_uses_default_station_when_blank() {
        let runner = FakeRunner::always(exited(0, ""));
        let sup = supervisor(&FakeProcessTable::default(), &runner);

        assert_eq!(
            sup.start(Some("  ".into())).await.unwrap(),
            "http://radio.example.net/listen/main"
        );
        assert_eq!(
            sup.start(Some("jazz".into())).await.unwrap(),
            "http://radio.example.net/listen/jazz"
        );
        assert_eq!(runner.calls()[0].1, Some(Duration::from_secs(15)));
    }

    #[tokio::test]
    async fn stop_without_player_is_success() {
        let table = FakeProcessTable::default();
        let sup = supervisor(&table, &FakeRunner::default());
        assert_eq!(sup.stop().await.unwrap(), 0);
        assert_eq!(sup.stop().await.unwrap(), 0);
        assert_eq!(sup.status().await.state, SupervisorState::Stopped);
    }

    #[tokio::test]
    async fn stop_reports_signal_failure() {
        let table = FakeProcessTable::with_running(true);
        *table.terminate_fails.lock().unwrap() = true;
        let sup = supervisor(&table, &FakeRunner::default());
        assert!(matches!(sup.stop().await, Err(StopError::Terminate(_))));
    }

    #[tokio::test]
    async fn status_follows_process_table() {
        let table = FakeProcessTable::with_running(true);
        let sup = supervisor(&table, &FakeRunner::default());
        assert_eq!(
            sup.status().await,
            StreamStatus {
                playing: true,
                state: SupervisorState::Running
            }
        );
        sup.stop().await.unwrap();
        assert_eq!(
            sup.status().await,
            StreamStatus {
                playing: false,
                state: SupervisorState::Stopped
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_starts_are_serialized() {
        let mut runner = FakeRunner::always(RunOutput::TimedOut);
        runner.sleep_on_timeout = true;
        let sup = supervisor(&FakeProcessTable::default(), &runner);

        let t0 = tokio::time::Instant::now();
        let a = tokio::spawn({
            let sup = sup.clone();
            async move { sup.start(None).await }
        });
        let b = tokio::spawn({
            let sup = sup.clone();
            async move { sup.start(Some("jazz".into())).await }
        });

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(sup.status().await.state, SupervisorState::Starting);
        assert_eq!(runner.calls().len(), 1);

        assert_eq!(a.await.unwrap(), Err(LaunchError::Timeout));
        assert_eq!(b.await.unwrap(), Err(LaunchError::Timeout));
        assert!(t0.elapsed() >= Duration::from_secs(30));
        assert_eq!(runner.calls().len(), 2);
        assert_eq!(sup.status().await.state, SupervisorState::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn auto_start_skips_when_already_playing() {
        let runner = FakeRunner::default();
        let sup = supervisor(&FakeProcessTable::with_running(true), &runner);
        assert_eq!(sup.auto_start(policy(5)).await, AutoStartState::Idle);
        assert!(runner.calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn auto_start_exhausts_retry_budget() {
        let runner = FakeRunner::always(exited(2, "HTTP error 404 Not Found"));
        let sup = supervisor(&FakeProcessTable::default(), &runner);

        let t0 = tokio::time::Instant::now();
        assert_eq!(sup.auto_start(policy(3)).await, AutoStartState::Exhausted);
        // First attempt plus three retries, ten seconds apart.
        assert_eq!(runner.calls().len(), 4);
        assert!(t0.elapsed() >= Duration::from_secs(30));

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(runner.calls().len(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn auto_start_retries_once_then_succeeds() {
        let runner = FakeRunner::scripted([exited(2, "Failed to resolve hostname"), exited(0, "")]);
        let sup = supervisor(&FakeProcessTable::default(), &runner);

        let t0 = tokio::time::Instant::now();
        assert_eq!(sup.auto_start(policy(5)).await, AutoStartState::Idle);
        assert_eq!(runner.calls().len(), 2);
        assert!(t0.elapsed() >= Duration::from_secs(10));
        assert!(t0.elapsed() < Duration::from_secs(20));
    }

    #[tokio::test(start_paused = true)]
    async fn auto_start_with_zero_retries_tries_once() {
        let runner = FakeRunner::always(RunOutput::TimedOut);
        let sup = supervisor(&FakeProcessTable::default(), &runner);
        assert_eq!(sup.auto_start(policy(0)).await, AutoStartState::Exhausted);
        assert_eq!(runner.calls().len(), 1);
    }

    #[tokio::test]
    async fn disabled_auto_start_spawns_nothing() {
        let runner = FakeRunner::default();
        let sup = supervisor(&FakeProcessTable::default(), &runner);
        let mut p = policy(5);
        p.enabled = false;
        assert!(sup.spawn_auto_start(p).is_none());
        assert!(runner.calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn auto_start_does_not_block_status() {
        let mut runner = FakeRunner::always(RunOutput::TimedOut);
        runner.sleep_on_timeout = true;
        let sup = supervisor(&FakeProcessTable::default(), &runner);

        let handle = sup.spawn_auto_start(policy(1)).unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(sup.status().await.state, SupervisorState::Starting);
        assert_eq!(sup.stop().await.unwrap(), 0);

        assert_eq!(handle.await.unwrap(), AutoStartState::Exhausted);
        assert_eq!(runner.calls().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_during_kill_cancels_the_pending_launch() {
        // The old player ignores SIGTERM for a while, so the launch sits in
        // its settle loop when the stop lands.
        let table = FakeProcessTable::with_running(true);
        *table.lingering.lock().unwrap() = true;
        let runner = FakeRunner::always(exited(0, ""));
        let sup = supervisor(&table, &runner);

        let start = tokio::spawn({
            let sup = sup.clone();
            async move { sup.start(None).await }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(sup.status().await.state, SupervisorState::Starting);

        assert_eq!(sup.stop().await.unwrap(), 1);
        assert_eq!(start.await.unwrap(), Err(LaunchError::Cancelled));
        assert!(runner.calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn stop_cancels_queued_starts() {
        let mut runner = FakeRunner::always(RunOutput::TimedOut);
        runner.sleep_on_timeout = true;
        let sup = supervisor(&FakeProcessTable::default(), &runner);

        let first = tokio::spawn({
            let sup = sup.clone();
            async move { sup.start(None).await }
        });
        tokio::time::sleep(Duration::from_secs(1)).await;
        let queued = tokio::spawn({
            let sup = sup.clone();
            async move { sup.start(Some("jazz".into())).await }
        });
        tokio::time::sleep(Duration::from_secs(1)).await;

        sup.stop().await.unwrap();
        assert_eq!(first.await.unwrap(), Err(LaunchError::Timeout));
        assert_eq!(queued.await.unwrap(), Err(LaunchError::Cancelled));
        assert_eq!(runner.calls().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_ends_auto_start_retries() {
        let table = FakeProcessTable::default();
        *table.lingering.lock().unwrap() = true;
        let runner = FakeRunner::always(exited(2, "HTTP error 404 Not Found"));
        let sup = supervisor(&table, &runner);

        let handle = sup.spawn_auto_start(policy(5)).unwrap();
        // First attempt fails at once; stop while waiting for the retry, with
        // a lingering player so the retry is still settling when it lands.
        tokio::time::sleep(Duration::from_secs(5)).await;
        *table.running.lock().unwrap() = true;
        tokio::time::sleep(Duration::from_secs(5) + Duration::from_millis(50)).await;
        sup.stop().await.unwrap();

        assert_eq!(handle.await.unwrap(), AutoStartState::Idle);
        assert_eq!(runner.calls().len(), 1);
    }
}
