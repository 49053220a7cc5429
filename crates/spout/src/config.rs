//! Source configuration.
//!
//! [`ExecConfig`] is the serde surface. [`ExecConfig::build`] validates it
//! once and produces the immutable [`SourceSettings`] the coordinator runs on.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::decoding::CodecConfig;
use crate::error::ConfigError;
use crate::framing::FramingConfig;
use crate::policy::DropPolicy;
use crate::process::CommandSpec;
use crate::supervisor::SupervisorMode;

pub const DEFAULT_EXEC_INTERVAL_SECS: u64 = 60;
pub const DEFAULT_RESPAWN_INTERVAL_SECS: u64 = 5;
pub const DEFAULT_MAXIMUM_BUFFER_SIZE_BYTES: usize = 1_000_000;
pub const DEFAULT_DRAIN_TIMEOUT_SECS: u64 = 5;

fn default_name() -> String {
    "exec".to_string()
}

fn default_true() -> bool {
    true
}

fn default_exec_interval_secs() -> u64 {
    DEFAULT_EXEC_INTERVAL_SECS
}

fn default_respawn_interval_secs() -> u64 {
    DEFAULT_RESPAWN_INTERVAL_SECS
}

fn default_maximum_buffer_size_bytes() -> usize {
    DEFAULT_MAXIMUM_BUFFER_SIZE_BYTES
}

fn default_drain_timeout_secs() -> u64 {
    DEFAULT_DRAIN_TIMEOUT_SECS
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduledConfig {
    #[serde(default = "default_exec_interval_secs")]
    pub exec_interval_secs: u64,
}

impl Default for ScheduledConfig {
    fn default() -> Self {
        Self {
            exec_interval_secs: DEFAULT_EXEC_INTERVAL_SECS,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamingConfig {
    #[serde(default = "default_true")]
    pub respawn_on_exit: bool,
    #[serde(default = "default_respawn_interval_secs")]
    pub respawn_interval_secs: u64,
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            respawn_on_exit: true,
            respawn_interval_secs: DEFAULT_RESPAWN_INTERVAL_SECS,
        }
    }
}

/// Supervisor mode with only its own options.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum ModeConfig {
    Scheduled {
        #[serde(default)]
        scheduled: ScheduledConfig,
    },
    Streaming {
        #[serde(default)]
        streaming: StreamingConfig,
    },
}

impl Default for ModeConfig {
    fn default() -> Self {
        Self::Scheduled {
            scheduled: ScheduledConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecConfig {
    /// Component name used in logs and dropped-record annotations.
    #[serde(default = "default_name")]
    pub name: String,
    /// Program followed by its arguments.
    pub command: Vec<String>,
    #[serde(flatten)]
    pub mode: ModeConfig,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_directory: Option<PathBuf>,
    #[serde(default = "default_true")]
    pub include_stderr: bool,
    #[serde(default = "default_maximum_buffer_size_bytes")]
    pub maximum_buffer_size_bytes: usize,
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
    #[serde(default)]
    pub clear_environment: bool,
    #[serde(default = "default_drain_timeout_secs")]
    pub drain_timeout_secs: u64,
    /// Defaults by codec when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub framing: Option<FramingConfig>,
    #[serde(default)]
    pub decoding: CodecConfig,
    #[serde(flatten)]
    pub drop_policy: DropPolicy,
}

impl ExecConfig {
    pub fn new<I, S>(command: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: default_name(),
            command: command.into_iter().map(Into::into).collect(),
            mode: ModeConfig::default(),
            working_directory: None,
            include_stderr: true,
            maximum_buffer_size_bytes: DEFAULT_MAXIMUM_BUFFER_SIZE_BYTES,
            environment: BTreeMap::new(),
            clear_environment: false,
            drain_timeout_secs: DEFAULT_DRAIN_TIMEOUT_SECS,
            framing: None,
            decoding: CodecConfig::default(),
            drop_policy: DropPolicy::default(),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_scheduled(mut self, exec_interval_secs: u64) -> Self {
        self.mode = ModeConfig::Scheduled {
            scheduled: ScheduledConfig { exec_interval_secs },
        };
        self
    }

    pub fn with_streaming(mut self, respawn_on_exit: bool, respawn_interval_secs: u64) -> Self {
        self.mode = ModeConfig::Streaming {
            streaming: StreamingConfig {
                respawn_on_exit,
                respawn_interval_secs,
            },
        };
        self
    }

    pub fn with_working_directory(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_directory = Some(dir.into());
        self
    }

    pub fn with_include_stderr(mut self, include: bool) -> Self {
        self.include_stderr = include;
        self
    }

    pub fn with_maximum_buffer_size_bytes(mut self, bytes: usize) -> Self {
        self.maximum_buffer_size_bytes = bytes;
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

    pub fn with_drain_timeout_secs(mut self, secs: u64) -> Self {
        self.drain_timeout_secs = secs;
        self
    }

    pub fn with_framing(mut self, framing: FramingConfig) -> Self {
        self.framing = Some(framing);
        self
    }

    pub fn with_decoding(mut self, decoding: CodecConfig) -> Self {
        self.decoding = decoding;
        self
    }

    pub fn with_drop_policy(mut self, policy: DropPolicy) -> Self {
        self.drop_policy = policy;
        self
    }

    /// Validate everything up front. Any error here prevents the source from starting.
    pub fn build(&self) -> Result<SourceSettings, ConfigError> {
        let (program, args) = match self.command.split_first() {
            Some((program, args)) if !program.trim().is_empty() => (program, args),
            _ => return Err(ConfigError::EmptyCommand),
        };

        let mode = match self.mode {
            ModeConfig::Scheduled { scheduled } => {
                if scheduled.exec_interval_secs == 0 {
                    return Err(ConfigError::Zero {
                        field: "exec_interval_secs",
                    });
                }
                SupervisorMode::Scheduled {
                    interval: Duration::from_secs(scheduled.exec_interval_secs),
                }
            }
            ModeConfig::Streaming { streaming } => {
                if streaming.respawn_interval_secs == 0 {
                    return Err(ConfigError::Zero {
                        field: "respawn_interval_secs",
                    });
                }
                SupervisorMode::Streaming {
                    respawn_on_exit: streaming.respawn_on_exit,
                    respawn_interval: Duration::from_secs(streaming.respawn_interval_secs),
                }
            }
        };

        if self.maximum_buffer_size_bytes == 0 {
            return Err(ConfigError::Zero {
                field: "maximum_buffer_size_bytes",
            });
        }

        if let Some(dir) = &self.working_directory
            && !dir.is_dir()
        {
            return Err(ConfigError::WorkingDirectory(dir.clone()));
        }

        let framing = self
            .framing
            .clone()
            .unwrap_or_else(|| self.decoding.default_framing());
        // Surface bad framing options now rather than on first read.
        framing.build()?;

        let mut command = CommandSpec::new(program.as_str())
            .with_args(args.iter().cloned())
            .with_clear_environment(self.clear_environment)
            .with_capture_stderr(self.include_stderr);
        command.environment = self.environment.clone();
        command.working_directory = self.working_directory.clone();

        Ok(SourceSettings {
            name: self.name.clone(),
            command,
            mode,
            framing,
            decoding: self.decoding,
            maximum_buffer_size_bytes: self.maximum_buffer_size_bytes,
            drain_timeout: Duration::from_secs(self.drain_timeout_secs),
            drop_policy: self.drop_policy,
        })
    }
}

/// Validated, immutable settings for one source.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceSettings {
    pub name: String,
    pub command: CommandSpec,
    pub mode: SupervisorMode,
    pub framing: FramingConfig,
    pub decoding: CodecConfig,
    pub maximum_buffer_size_bytes: usize,
    pub drain_timeout: Duration,
    pub drop_policy: DropPolicy,
}
