//! OS process seam.
//!
//! The supervisor only talks to [`Spawner`] and [`ChildProcess`], so tests can
//! substitute scripted children driven by tokio's clock.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::AsyncRead;
use tokio::process::Command;

use crate::error::SpawnError;

pub type OutputReader = Box<dyn AsyncRead + Send + Unpin>;

/// Everything applied at spawn time. Later changes never reach a running child.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub working_directory: Option<PathBuf>,
    pub environment: BTreeMap<String, String>,
    pub clear_environment: bool,
    pub capture_stderr: bool,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            working_directory: None,
            environment: BTreeMap::new(),
            clear_environment: false,
            capture_stderr: true,
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_working_directory(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_directory = Some(dir.into());
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.environment.insert(key.into(), value.into());
        self
    }

    pub fn with_clear_environment(mut self, clear: bool) -> Self {
        self.clear_environment = clear;
        self
    }

    pub fn with_capture_stderr(mut self, capture: bool) -> Self {
        self.capture_stderr = capture;
        self
    }

    /// Program and arguments joined for logs and the `command` field.
    pub fn display(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// A running child as the supervisor sees it.
#[async_trait]
pub trait ChildProcess: Send {
    fn id(&self) -> Option<u32>;

    fn take_stdout(&mut self) -> Option<OutputReader>;

    fn take_stderr(&mut self) -> Option<OutputReader>;

    /// Exit code, `None` when ended by a signal. Cancel safe.
    async fn wait(&mut self) -> std::io::Result<Option<i32>>;

    /// Forcibly kill and reap.
    async fn kill(&mut self) -> std::io::Result<()>;

    /// Ask the child to exit (SIGTERM on unix).
    fn terminate(&mut self) -> std::io::Result<()>;
}

/// Extension point for different spawn strategies.
pub trait Spawner: Send + Sync {
    fn spawn(&self, spec: &CommandSpec) -> Result<Box<dyn ChildProcess>, SpawnError>;
}

/// Spawns real processes through `tokio::process`.
pub struct TokioSpawner;

impl Spawner for TokioSpawner {
    fn spawn(&self, spec: &CommandSpec) -> Result<Box<dyn ChildProcess>, SpawnError> {
        let mut command = Command::new(&spec.program);
        command
            .args(&spec.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(if spec.capture_stderr {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .kill_on_drop(true);
        if spec.clear_environment {
            command.env_clear();
        }
        command.envs(&spec.environment);
        if let Some(dir) = &spec.working_directory {
            command.current_dir(dir);
        }

        let child = command.spawn()?;
        Ok(Box::new(TokioChild(child)))
    }
}

struct TokioChild(tokio::process::Child);

#[async_trait]
impl ChildProcess for TokioChild {
    fn id(&self) -> Option<u32> {
        self.0.id()
    }

    fn take_stdout(&mut self) -> Option<OutputReader> {
        self.0
            .stdout
            .take()
            .map(|stdout| Box::new(stdout) as OutputReader)
    }

    fn take_stderr(&mut self) -> Option<OutputReader> {
        self.0
            .stderr
            .take()
            .map(|stderr| Box::new(stderr) as OutputReader)
    }

    async fn wait(&mut self) -> std::io::Result<Option<i32>> {
        Ok(self.0.wait().await?.code())
    }

    async fn kill(&mut self) -> std::io::Result<()> {
        self.0.kill().await
    }

    #[cfg(unix)]
    fn terminate(&mut self) -> std::io::Result<()> {
        use nix::sys::signal::{Signal, kill};
        use nix::unistd::Pid;

        // Already reaped.
        let Some(pid) = self.0.id() else {
            return Ok(());
        };
        kill(Pid::from_raw(pid as i32), Signal::SIGTERM).map_err(std::io::Error::from)
    }

    #[cfg(not(unix))]
    fn terminate(&mut self) -> std::io::Result<()> {
        self.0.start_kill()
    }
}
