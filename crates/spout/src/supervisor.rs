//! Process supervisor - owns the child process and its schedule.
//!
//! Two modes:
//! - Scheduled: spawn on every interval tick, kill a run that outlives its
//!   interval, never overlap runs.
//! - Streaming: spawn once, optionally respawn after a delay whenever the
//!   child exits.
//!
//! Output streams are handed to an [`OutputSink`] per run. State is published
//! on a watch channel; only the supervisor writes it.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, sleep_until, timeout, timeout_at};
use tokio_util::sync::CancellationToken;

use crate::process::{ChildProcess, CommandSpec, OutputReader, Spawner};
use crate::stats::SourceStats;

/// How long a tick waits for a finishing run before declaring it still active.
pub const REAP_GRACE: Duration = Duration::from_millis(100);

pub const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ProcessState {
    NotStarted,
    Running {
        pid: Option<u32>,
        started_at: DateTime<Utc>,
    },
    Exited {
        code: Option<i32>,
        at: DateTime<Utc>,
    },
    Failed {
        error: String,
    },
    Terminated,
}

impl ProcessState {
    pub fn is_running(&self) -> bool {
        matches!(self, Self::Running { .. })
    }

    pub fn is_terminated(&self) -> bool {
        matches!(self, Self::Terminated)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorMode {
    Scheduled {
        interval: Duration,
    },
    Streaming {
        respawn_on_exit: bool,
        respawn_interval: Duration,
    },
}

/// Outcome of one run, or a condition raised at a tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunReport {
    Exited { pid: Option<u32>, code: Option<i32> },
    /// Killed at the end of its interval; output is incomplete.
    TimedOut { pid: Option<u32> },
    SpawnFailed { error: String },
    /// A tick found the previous run still going and was skipped.
    StillActive,
    /// Terminated by shutdown.
    Stopped { pid: Option<u32> },
}

/// One run's output streams.
pub struct ProcessOutput {
    pub pid: Option<u32>,
    pub stdout: Option<OutputReader>,
    pub stderr: Option<OutputReader>,
}

/// Consumer of each run's output.
pub trait OutputSink: Send + Sync {
    /// Start reading. The handle resolves once every stream has reached EOF
    /// and its buffered data has been processed.
    fn attach(&self, output: ProcessOutput) -> JoinHandle<()>;
}

pub struct Supervisor {
    spec: CommandSpec,
    command: String,
    mode: SupervisorMode,
    drain_timeout: Duration,
    spawner: Arc<dyn Spawner>,
    sink: Arc<dyn OutputSink>,
    state: watch::Sender<ProcessState>,
    stats: Arc<SourceStats>,
    reports: Option<mpsc::UnboundedSender<RunReport>>,
    cancel: CancellationToken,
}

impl Supervisor {
    pub fn new(
        spec: CommandSpec,
        mode: SupervisorMode,
        spawner: Arc<dyn Spawner>,
        sink: Arc<dyn OutputSink>,
    ) -> Self {
        let (state, _) = watch::channel(ProcessState::NotStarted);
        Self {
            command: spec.display(),
            spec,
            mode,
            drain_timeout: DEFAULT_DRAIN_TIMEOUT,
            spawner,
            sink,
            state,
            stats: Arc::new(SourceStats::new()),
            reports: None,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_drain_timeout(mut self, drain_timeout: Duration) -> Self {
        self.drain_timeout = drain_timeout;
        self
    }

    pub fn with_stats(mut self, stats: Arc<SourceStats>) -> Self {
        self.stats = stats;
        self
    }

    pub fn with_reports(mut self, reports: mpsc::UnboundedSender<RunReport>) -> Self {
        self.reports = Some(reports);
        self
    }

    /// Publish on a channel the caller already holds receivers for.
    pub fn with_state(mut self, state: watch::Sender<ProcessState>) -> Self {
        state.send_replace(ProcessState::NotStarted);
        self.state = state;
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Observe state changes. Receivers never affect the supervisor.
    pub fn subscribe(&self) -> watch::Receiver<ProcessState> {
        self.state.subscribe()
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Run until cancelled, or until a streaming child exits with respawn disabled.
    pub async fn run(self) {
        let this = Arc::new(self);
        tracing::info!(command = %this.command, mode = ?this.mode, "Supervisor starting");

        match this.mode {
            SupervisorMode::Scheduled { interval } => this.clone().run_scheduled(interval).await,
            SupervisorMode::Streaming {
                respawn_on_exit,
                respawn_interval,
            } => this.run_streaming(respawn_on_exit, respawn_interval).await,
        }

        this.state.send_replace(ProcessState::Terminated);
        tracing::info!(command = %this.command, "Supervisor terminated");
    }

    async fn run_scheduled(self: Arc<Self>, interval: Duration) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut active: Option<JoinHandle<()>> = None;

        loop {
            let tick = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                tick = ticker.tick() => tick,
            };

            if let Some(handle) = active.as_mut()
                && !handle.is_finished()
                && timeout(REAP_GRACE, handle).await.is_err()
            {
                self.stats.add_run_skipped();
                tracing::warn!(
                    command = %self.command,
                    interval_secs = interval.as_secs(),
                    "Previous run still active, skipping tick"
                );
                self.report(RunReport::StillActive);
                continue;
            }

            let this = self.clone();
            let deadline = tick + interval;
            active = Some(tokio::spawn(async move {
                let report = this.execute(Some(deadline)).await;
                if !this.cancel.is_cancelled() {
                    this.state.send_replace(ProcessState::NotStarted);
                }
                this.report(report);
            }));
        }

        if let Some(handle) = active
            && let Err(e) = handle.await
        {
            tracing::error!(error = %e, "Scheduled run task failed");
        }
    }

    async fn run_streaming(&self, respawn_on_exit: bool, respawn_interval: Duration) {
        loop {
            let report = self.execute(None).await;
            let stopped = matches!(report, RunReport::Stopped { .. });
            self.report(report);
            if stopped || self.cancel.is_cancelled() {
                break;
            }
            if !respawn_on_exit {
                tracing::info!(command = %self.command, "Command finished, respawn disabled");
                break;
            }

            tracing::info!(
                command = %self.command,
                delay_secs = respawn_interval.as_secs(),
                "Respawning command after delay"
            );
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(respawn_interval) => {}
            }
        }
    }

    /// Spawn, hand output to the sink, wait for exit, deadline or shutdown.
    async fn execute(&self, deadline: Option<Instant>) -> RunReport {
        let mut child = match self.spawner.spawn(&self.spec) {
            Ok(child) => child,
            Err(e) => {
                self.stats.add_spawn_failure();
                tracing::warn!(command = %self.command, error = %e, "Failed to spawn command");
                self.state.send_replace(ProcessState::Failed {
                    error: e.to_string(),
                });
                return RunReport::SpawnFailed {
                    error: e.to_string(),
                };
            }
        };

        let pid = child.id();
        self.stats.add_spawn();
        self.state.send_replace(ProcessState::Running {
            pid,
            started_at: Utc::now(),
        });
        tracing::info!(command = %self.command, ?pid, "Spawned command");

        let output = ProcessOutput {
            pid,
            stdout: child.take_stdout(),
            stderr: if self.spec.capture_stderr {
                child.take_stderr()
            } else {
                None
            },
        };
        let mut readers = self.sink.attach(output);

        let expiry = async {
            match deadline {
                Some(deadline) => sleep_until(deadline).await,
                None => std::future::pending().await,
            }
        };

        let report = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => {
                let drain_deadline = Instant::now() + self.drain_timeout;
                self.shutdown_child(child.as_mut(), pid, drain_deadline).await;
                RunReport::Stopped { pid }
            }
            status = child.wait() => {
                let code = match status {
                    Ok(code) => code,
                    Err(e) => {
                        tracing::warn!(?pid, error = %e, "Failed to wait for command");
                        None
                    }
                };
                self.stats.add_exit();
                tracing::info!(command = %self.command, ?pid, ?code, "Command exited");
                self.state.send_replace(ProcessState::Exited {
                    code,
                    at: Utc::now(),
                });
                RunReport::Exited { pid, code }
            }
            _ = expiry => {
                self.stats.add_timeout();
                tracing::warn!(
                    command = %self.command,
                    ?pid,
                    "Command still running at end of interval, killing; run is incomplete"
                );
                if let Err(e) = child.kill().await {
                    tracing::warn!(?pid, error = %e, "Failed to kill command");
                }
                RunReport::TimedOut { pid }
            }
        };

        if timeout(self.drain_timeout, &mut readers).await.is_err() {
            tracing::warn!(
                ?pid,
                drain_timeout_secs = self.drain_timeout.as_secs(),
                "Output still pending after drain timeout, abandoning it"
            );
            readers.abort();
            let _ = readers.await;
        }
        report
    }

    /// SIGTERM, then kill once the drain deadline passes.
    async fn shutdown_child(&self, child: &mut dyn ChildProcess, pid: Option<u32>, deadline: Instant) {
        if let Err(e) = child.terminate() {
            tracing::warn!(?pid, error = %e, "Failed to signal command");
        }
        match timeout_at(deadline, child.wait()).await {
            Ok(Ok(code)) => {
                tracing::info!(command = %self.command, ?pid, ?code, "Command exited on shutdown")
            }
            Ok(Err(e)) => tracing::warn!(?pid, error = %e, "Failed to wait for command"),
            Err(_) => {
                tracing::warn!(?pid, "Command ignored SIGTERM, killing");
                if let Err(e) = child.kill().await {
                    tracing::warn!(?pid, error = %e, "Failed to kill command");
                }
            }
        }
    }

    fn report(&self, report: RunReport) {
        if let Some(reports) = &self.reports {
            let _ = reports.send(report);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use tokio::io::AsyncReadExt;

    use super::*;
    use crate::event::SourceTag;
    use crate::process::fake::{FakeRun, FakeSpawner};

    #[derive(Default)]
    struct RecordingSink {
        captured: Arc<Mutex<Vec<(SourceTag, Vec<u8>)>>>,
        linger: Duration,
    }

    impl RecordingSink {
        fn captured(&self) -> Vec<(SourceTag, Vec<u8>)> {
            self.captured.lock().unwrap().clone()
        }
    }

    impl OutputSink for RecordingSink {
        fn attach(&self, output: ProcessOutput) -> JoinHandle<()> {
            let captured = self.captured.clone();
            let linger = self.linger;
            tokio::spawn(async move {
                let mut tasks = Vec::new();
                for (tag, reader) in [
                    (SourceTag::Stdout, output.stdout),
                    (SourceTag::Stderr, output.stderr),
                ] {
                    let Some(mut reader) = reader else { continue };
                    let captured = captured.clone();
                    tasks.push(tokio::spawn(async move {
                        let mut buf = Vec::new();
                        let _ = reader.read_to_end(&mut buf).await;
                        captured.lock().unwrap().push((tag, buf));
                    }));
                }
                for task in tasks {
                    let _ = task.await;
                }
                if !linger.is_zero() {
                    tokio::time::sleep(linger).await;
                }
            })
        }
    }

    struct Harness {
        spawner: Arc<FakeSpawner>,
        sink: Arc<RecordingSink>,
        stats: Arc<SourceStats>,
        cancel: CancellationToken,
        reports: mpsc::UnboundedReceiver<RunReport>,
        state: watch::Receiver<ProcessState>,
        task: JoinHandle<()>,
        started: Instant,
    }

    impl Harness {
        fn start(mode: SupervisorMode, runs: Vec<FakeRun>, sink: RecordingSink) -> Self {
            Self::start_with(mode, runs, sink, CommandSpec::new("fake"))
        }

        fn start_with(
            mode: SupervisorMode,
            runs: Vec<FakeRun>,
            sink: RecordingSink,
            spec: CommandSpec,
        ) -> Self {
            let spawner = Arc::new(FakeSpawner::new(runs));
            let sink = Arc::new(sink);
            let stats = Arc::new(SourceStats::new());
            let (tx, reports) = mpsc::unbounded_channel();
            let supervisor = Supervisor::new(spec, mode, spawner.clone(), sink.clone())
                .with_stats(stats.clone())
                .with_reports(tx)
                .with_drain_timeout(Duration::from_secs(5));
            let cancel = supervisor.cancellation_token();
            let state = supervisor.subscribe();
            let started = Instant::now();
            let task = tokio::spawn(supervisor.run());
            Self {
                spawner,
                sink,
                stats,
                cancel,
                reports,
                state,
                task,
                started,
            }
        }

        fn spawn_offsets(&self) -> Vec<u64> {
            self.spawner
                .spawn_times()
                .into_iter()
                .map(|at| (at - self.started).as_secs())
                .collect()
        }

        async fn stop(mut self) -> Vec<RunReport> {
            self.cancel.cancel();
            self.task.await.unwrap();
            let mut reports = Vec::new();
            while let Ok(report) = self.reports.try_recv() {
                reports.push(report);
            }
            reports
        }
    }

    fn scheduled(secs: u64) -> SupervisorMode {
        SupervisorMode::Scheduled {
            interval: Duration::from_secs(secs),
        }
    }

    fn streaming(respawn_on_exit: bool, secs: u64) -> SupervisorMode {
        SupervisorMode::Streaming {
            respawn_on_exit,
            respawn_interval: Duration::from_secs(secs),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn scheduled_run_outliving_interval_is_killed_and_schedule_kept() {
        let run = FakeRun::exits_after(Duration::from_secs(65))
            .stdout(Duration::from_secs(1), b"partial\n");
        let harness = Harness::start(scheduled(60), vec![run], RecordingSink::default());

        tokio::time::sleep(Duration::from_secs(90)).await;
        assert_eq!(harness.spawn_offsets(), vec![0, 60]);
        assert_eq!(harness.stats.snapshot().timeouts, 1);

        let sink = harness.sink.clone();
        let reports = harness.stop().await;
        assert_eq!(
            reports,
            vec![
                RunReport::TimedOut { pid: Some(1000) },
                RunReport::Stopped { pid: Some(1001) },
            ]
        );
        assert!(sink
            .captured()
            .contains(&(SourceTag::Stdout, b"partial\n".to_vec())));
    }

    #[tokio::test(start_paused = true)]
    async fn scheduled_runs_fire_on_every_tick() {
        let run = FakeRun::exits_after(Duration::from_secs(2)).stdout(Duration::ZERO, b"tick\n");
        let harness = Harness::start(scheduled(10), vec![run], RecordingSink::default());

        tokio::time::sleep(Duration::from_secs(25)).await;
        assert_eq!(harness.spawn_offsets(), vec![0, 10, 20]);
        assert_eq!(*harness.state.borrow(), ProcessState::NotStarted);

        let stats = harness.stats.clone();
        let reports = harness.stop().await;
        assert_eq!(reports.len(), 3);
        assert!(reports
            .iter()
            .all(|r| matches!(r, RunReport::Exited { code: Some(0), .. })));
        assert_eq!(stats.snapshot().exits, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn tick_is_skipped_while_previous_run_is_active() {
        // Output processing outlasts the tick at 10s but not the drain timeout.
        let sink = RecordingSink {
            linger: Duration::from_secs(4),
            ..Default::default()
        };
        let run = FakeRun::exits_after(Duration::from_secs(8));
        let harness = Harness::start(scheduled(10), vec![run], sink);

        tokio::time::sleep(Duration::from_secs(25)).await;
        assert_eq!(harness.spawn_offsets(), vec![0, 20]);
        assert_eq!(harness.stats.snapshot().runs_skipped, 1);

        let reports = harness.stop().await;
        assert_eq!(reports[0], RunReport::StillActive);
    }

    #[tokio::test(start_paused = true)]
    async fn scheduled_spawn_failure_retries_next_tick() {
        let runs = vec![
            FakeRun::spawn_failure(),
            FakeRun::exits_after(Duration::from_secs(1)),
        ];
        let harness = Harness::start(scheduled(5), runs, RecordingSink::default());

        tokio::time::sleep(Duration::from_secs(7)).await;
        assert_eq!(harness.spawn_offsets(), vec![0, 5]);
        let stats = harness.stats.clone();
        let reports = harness.stop().await;
        assert!(matches!(reports[0], RunReport::SpawnFailed { .. }));
        assert_eq!(stats.snapshot().spawn_failures, 1);
        assert_eq!(stats.snapshot().spawns, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn streaming_respawns_after_interval() {
        let run = FakeRun::exits_after(Duration::from_secs(2)).code(3);
        let harness = Harness::start(streaming(true, 5), vec![run], RecordingSink::default());

        tokio::time::sleep(Duration::from_secs(15)).await;
        assert_eq!(harness.spawn_offsets(), vec![0, 7, 14]);

        let reports = harness.stop().await;
        assert_eq!(reports[0], RunReport::Exited { pid: Some(1000), code: Some(3) });
        assert_eq!(reports[1], RunReport::Exited { pid: Some(1001), code: Some(3) });
        assert_eq!(reports[2], RunReport::Stopped { pid: Some(1002) });
    }

    #[tokio::test(start_paused = true)]
    async fn streaming_without_respawn_terminates_after_first_exit() {
        let run = FakeRun::exits_after(Duration::from_secs(1));
        let mut harness = Harness::start(streaming(false, 5), vec![run], RecordingSink::default());

        timeout(Duration::from_secs(100), &mut harness.task)
            .await
            .expect("supervisor should stop on its own")
            .unwrap();
        assert_eq!(harness.spawner.spawn_count(), 1);
        assert_eq!(*harness.state.borrow(), ProcessState::Terminated);

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(harness.spawner.spawn_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn streaming_spawn_failure_follows_respawn_policy() {
        let runs = vec![
            FakeRun::spawn_failure(),
            FakeRun::exits_after(Duration::from_secs(100)),
        ];
        let harness = Harness::start(streaming(true, 3), runs, RecordingSink::default());

        tokio::time::sleep(Duration::from_secs(4)).await;
        assert_eq!(harness.spawn_offsets(), vec![0, 3]);
        assert!(harness.state.borrow().is_running());
        harness.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn stop_kills_child_that_ignores_sigterm_after_drain_timeout() {
        let run = FakeRun::exits_after(Duration::from_secs(1000)).ignoring_sigterm();
        let harness = Harness::start(streaming(true, 1), vec![run], RecordingSink::default());
        tokio::time::sleep(Duration::from_secs(1)).await;

        let stopping = Instant::now();
        let mut state = harness.state.clone();
        let reports = harness.stop().await;
        assert_eq!(stopping.elapsed(), Duration::from_secs(5));
        assert_eq!(reports, vec![RunReport::Stopped { pid: Some(1000) }]);
        assert!(state.borrow_and_update().is_terminated());
    }

    #[tokio::test(start_paused = true)]
    async fn stop_returns_promptly_when_child_honours_sigterm() {
        let run = FakeRun::exits_after(Duration::from_secs(1000));
        let harness = Harness::start(streaming(true, 1), vec![run], RecordingSink::default());
        tokio::time::sleep(Duration::from_secs(1)).await;

        let stopping = Instant::now();
        harness.stop().await;
        assert_eq!(stopping.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn stderr_is_attached_only_when_captured() {
        let run = FakeRun::exits_after(Duration::from_secs(1))
            .stdout(Duration::ZERO, b"out")
            .stderr(Duration::ZERO, b"err");

        let harness = Harness::start(streaming(false, 1), vec![run.clone()], RecordingSink::default());
        tokio::time::sleep(Duration::from_secs(2)).await;
        let mut captured = harness.sink.captured();
        captured.sort();
        assert_eq!(
            captured,
            vec![
                (SourceTag::Stdout, b"out".to_vec()),
                (SourceTag::Stderr, b"err".to_vec()),
            ]
        );
        harness.stop().await;

        let harness = Harness::start_with(
            streaming(false, 1),
            vec![run],
            RecordingSink::default(),
            CommandSpec::new("fake").with_capture_stderr(false),
        );
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(
            harness.sink.captured(),
            vec![(SourceTag::Stdout, b"out".to_vec())]
        );
        assert!(!harness.spawner.last_spec().unwrap().capture_stderr);
        harness.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn running_state_carries_pid() {
        let run = FakeRun::exits_after(Duration::from_secs(30));
        let harness = Harness::start(streaming(true, 1), vec![run], RecordingSink::default());
        tokio::time::sleep(Duration::from_secs(1)).await;

        match &*harness.state.borrow() {
            ProcessState::Running { pid, .. } => assert_eq!(*pid, Some(1000)),
            other => panic!("expected running, got {other:?}"),
        }
        harness.stop().await;
    }
}
