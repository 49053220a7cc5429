//! spout: exec and stream ingestion core.
//!
//! A supervised child process (or any chunk stream) feeds a frame splitter,
//! each frame goes through a payload codec, and the resulting records pass a
//! per-record drop policy on their way to the output channels.

mod budget;
mod stats;

pub mod config;
pub mod decoding;
pub mod error;
pub mod event;
pub mod framing;
pub mod pipeline;
pub mod policy;
pub mod process;
pub mod supervisor;

pub use budget::BufferBudget;
pub use config::{ExecConfig, ModeConfig, ScheduledConfig, SourceSettings, StreamingConfig};
pub use decoding::{CodecConfig, CodecKind, PayloadDecoder, Records};
pub use error::{ConfigError, DecodeError, FramingError, SourceError, SpawnError};
pub use event::{DecodedRecord, DropAnnotation, DroppedRecord, Frame, RawChunk, SourceTag};
pub use framing::{FramingConfig, SplitEvent, StreamSplitter};
pub use pipeline::{ChunkPipeline, DrainReport, ExecSource, PipelineHandle};
pub use policy::{DropPolicy, RecordTransform, TransformOutcome};
pub use process::{ChildProcess, CommandSpec, Spawner, TokioSpawner};
pub use stats::{SourceStats, StatsSnapshot};
pub use supervisor::{ProcessState, RunReport, Supervisor, SupervisorMode};
