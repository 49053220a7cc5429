//! Pipeline coordinator: bytes from a child process (or a transport) through
//! splitting, decoding and the drop policy into the output channels.
//!
//! Each byte stream gets its own [`StreamProcessor`]; all processors of one
//! source share a [`BufferBudget`]. Within a stream, split order, decode order
//! and emission order are the same.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use futures::future::OptionFuture;
use futures::{Stream, StreamExt};
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::io::ReaderStream;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::budget::BufferBudget;
use crate::config::{ExecConfig, SourceSettings};
use crate::decoding::{CodecConfig, PayloadDecoder};
use crate::error::{ConfigError, SourceError};
use crate::event::{DecodedRecord, DroppedRecord, Frame, RawChunk, SourceTag};
use crate::framing::{Framer, FramingConfig, SplitEvent, StreamSplitter};
use crate::policy::{Disposition, DropPolicy, RecordTransform};
use crate::process::{OutputReader, Spawner, TokioSpawner};
use crate::stats::{SourceStats, StatsSnapshot};
use crate::supervisor::{
    DEFAULT_DRAIN_TIMEOUT, OutputSink, ProcessOutput, ProcessState, RunReport, Supervisor,
};

/// Capacity of each output channel. A full channel holds up reading.
pub const OUTPUT_CHANNEL_CAPACITY: usize = 1024;

/// `source_type` value stamped on records from a child process.
pub const EXEC_SOURCE_TYPE: &str = "exec";

const READ_CAPACITY: usize = 8 * 1024;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| {
        tracing::error!("Source mutex poisoned, recovering");
        poisoned.into_inner()
    })
}

/// Returned by `stop()` once draining is over.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DrainReport {
    /// Bytes discarded without being decoded, including overflow discards.
    pub lost_bytes: u64,
    pub stats: StatsSnapshot,
}

impl DrainReport {
    fn from_stats(stats: &SourceStats) -> Self {
        let stats = stats.snapshot();
        Self {
            lost_bytes: stats.lost_bytes,
            stats,
        }
    }
}

struct Outputs {
    records: mpsc::Sender<DecodedRecord>,
    dropped: mpsc::Sender<DroppedRecord>,
}

fn outputs() -> (
    Outputs,
    mpsc::Receiver<DecodedRecord>,
    mpsc::Receiver<DroppedRecord>,
) {
    let (records, records_rx) = mpsc::channel(OUTPUT_CHANNEL_CAPACITY);
    let (dropped, dropped_rx) = mpsc::channel(OUTPUT_CHANNEL_CAPACITY);
    (Outputs { records, dropped }, records_rx, dropped_rx)
}

/// Everything the stream processors of one source have in common.
struct Shared {
    name: String,
    framer: Framer,
    decoder: PayloadDecoder,
    policy: DropPolicy,
    transform: Option<Arc<dyn RecordTransform>>,
    budget: Arc<BufferBudget>,
    stats: Arc<SourceStats>,
    outputs: Outputs,
}

/// Provenance fields added to records unless the payload set them.
#[derive(Debug, Clone, Default)]
struct Enrichment {
    source_type: Option<&'static str>,
    pid: Option<u32>,
    command: Option<String>,
}

impl Enrichment {
    fn apply(&self, record: &mut DecodedRecord, received_at: DateTime<Utc>) {
        if let Some(source_type) = self.source_type {
            record.insert_if_absent("source_type", source_type);
        }
        if let Some(pid) = self.pid {
            record.insert_if_absent("pid", pid);
        }
        if let Some(command) = &self.command {
            record.insert_if_absent("command", command.as_str());
        }
        record.insert_if_absent(
            "timestamp",
            received_at.to_rfc3339_opts(SecondsFormat::AutoSi, true),
        );
    }
}

/// Split, decode and dispatch for one byte stream.
///
/// Dropping a processor that has not finished counts its buffered bytes as lost.
struct StreamProcessor {
    shared: Arc<Shared>,
    splitter: StreamSplitter,
    enrichment: Enrichment,
    events: Vec<SplitEvent>,
    finished: bool,
}

impl StreamProcessor {
    fn new(shared: Arc<Shared>, source: SourceTag, enrichment: Enrichment) -> Self {
        let splitter = StreamSplitter::new(shared.framer.clone(), source, shared.budget.clone());
        Self {
            shared,
            splitter,
            enrichment,
            events: Vec::new(),
            finished: false,
        }
    }

    fn source(&self) -> SourceTag {
        self.splitter.source()
    }

    async fn push(&mut self, chunk: RawChunk) {
        self.shared.stats.add_bytes_read(chunk.bytes.len());
        self.splitter.push_chunk(&chunk, &mut self.events);
        self.flush(chunk.received_at).await;
    }

    /// End of stream: an incomplete tail is reported, not emitted.
    async fn finish(&mut self) {
        self.splitter.finish(&mut self.events);
        self.flush(Utc::now()).await;
        self.finished = true;
    }

    async fn flush(&mut self, received_at: DateTime<Utc>) {
        let mut events = std::mem::take(&mut self.events);
        for event in events.drain(..) {
            match event {
                SplitEvent::Frame(frame) => self.decode(frame, received_at).await,
                SplitEvent::Error(e) => {
                    self.shared.stats.add_framing_error(&e);
                    tracing::warn!(
                        source = %self.shared.name,
                        stream = %self.source(),
                        reason = e.reason(),
                        error = %e,
                        "Framing error"
                    );
                }
            }
        }
        self.events = events;
    }

    async fn decode(&mut self, frame: Frame, received_at: DateTime<Utc>) {
        self.shared.stats.add_frame();
        tracing::trace!(stream = %frame.source, frame_len = frame.len(), "Decoding frame");

        let shared = Arc::clone(&self.shared);
        match shared.decoder.decode(&frame, received_at) {
            Ok(records) => {
                for mut record in records {
                    self.enrichment.apply(&mut record, received_at);
                    let disposition =
                        shared
                            .policy
                            .apply(shared.transform.as_deref(), record, &shared.name);
                    self.dispatch(disposition).await;
                }
            }
            Err(e) => {
                shared.stats.add_decode_failure();
                tracing::warn!(
                    source = %shared.name,
                    stream = %frame.source,
                    frame_len = frame.len(),
                    reason = e.reason(),
                    error = %e,
                    "Failed to decode frame"
                );
                let disposition = shared.policy.decode_failure(
                    &frame,
                    shared.decoder.kind(),
                    &e,
                    received_at,
                    &shared.name,
                );
                self.dispatch(disposition).await;
            }
        }
    }

    async fn dispatch(&self, disposition: Disposition) {
        let stats = &self.shared.stats;
        match disposition {
            Disposition::Emit(record) => {
                stats.add_record();
                if self.shared.outputs.records.send(record).await.is_err() {
                    tracing::trace!("Records receiver gone, discarding record");
                }
            }
            Disposition::Reroute(dropped) => {
                stats.add_dropped_record();
                if self.shared.outputs.dropped.send(dropped).await.is_err() {
                    tracing::trace!("Dropped receiver gone, discarding record");
                }
            }
            Disposition::Discard => stats.add_dropped_record(),
        }
    }
}

impl Drop for StreamProcessor {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        let lost = self.splitter.buffered();
        if lost > 0 {
            self.shared.stats.add_lost_bytes(lost);
            tracing::warn!(
                source = %self.shared.name,
                stream = %self.source(),
                lost_bytes = lost,
                "Abandoning undecoded bytes"
            );
        }
    }
}

async fn read_output(mut processor: StreamProcessor, reader: OutputReader) {
    let source = processor.source();
    let mut reads = ReaderStream::with_capacity(reader, READ_CAPACITY);
    while let Some(read) = reads.next().await {
        match read {
            Ok(bytes) => processor.push(RawChunk::new(source, bytes)).await,
            Err(e) => {
                tracing::warn!(stream = %source, error = %e, "Failed to read command output");
                break;
            }
        }
    }
    processor.finish().await;
}

/// Feeds one run's stdout and stderr through the pipeline.
struct ExecSink {
    shared: Arc<Shared>,
    command: String,
}

impl OutputSink for ExecSink {
    fn attach(&self, output: ProcessOutput) -> JoinHandle<()> {
        let enrichment = Enrichment {
            source_type: Some(EXEC_SOURCE_TYPE),
            pid: output.pid,
            command: Some(self.command.clone()),
        };
        let processor = |source| StreamProcessor::new(self.shared.clone(), source, enrichment.clone());
        let stdout = output
            .stdout
            .map(|reader| read_output(processor(SourceTag::Stdout), reader));
        let stderr = output
            .stderr
            .map(|reader| read_output(processor(SourceTag::Stderr), reader));

        // One task for both streams so aborting it abandons both.
        tokio::spawn(async move {
            futures::future::join(OptionFuture::from(stdout), OptionFuture::from(stderr)).await;
        })
    }
}

struct Pending {
    outputs: Outputs,
    state: watch::Sender<ProcessState>,
}

/// One configured exec source: supervisor plus pipeline.
///
/// Records arrive on the channel from [`take_records`](Self::take_records);
/// both output channels close once the supervisor has terminated.
pub struct ExecSource {
    id: Uuid,
    settings: SourceSettings,
    spawner: Arc<dyn Spawner>,
    transform: Option<Arc<dyn RecordTransform>>,
    stats: Arc<SourceStats>,
    reports: Option<mpsc::UnboundedSender<RunReport>>,
    cancel: CancellationToken,
    state: watch::Receiver<ProcessState>,
    pending: Mutex<Option<Pending>>,
    records: Mutex<Option<mpsc::Receiver<DecodedRecord>>>,
    dropped: Mutex<Option<mpsc::Receiver<DroppedRecord>>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ExecSource {
    pub fn new(settings: SourceSettings) -> Self {
        let (outputs, records, dropped) = outputs();
        let (state_tx, state) = watch::channel(ProcessState::NotStarted);
        Self {
            id: Uuid::new_v4(),
            settings,
            spawner: Arc::new(TokioSpawner),
            transform: None,
            stats: Arc::new(SourceStats::new()),
            reports: None,
            cancel: CancellationToken::new(),
            state,
            pending: Mutex::new(Some(Pending {
                outputs,
                state: state_tx,
            })),
            records: Mutex::new(Some(records)),
            dropped: Mutex::new(Some(dropped)),
            task: Mutex::new(None),
        }
    }

    pub fn from_config(config: &ExecConfig) -> Result<Self, SourceError> {
        Ok(Self::new(config.build()?))
    }

    pub fn with_spawner(mut self, spawner: Arc<dyn Spawner>) -> Self {
        self.spawner = spawner;
        self
    }

    pub fn with_transform(mut self, transform: Arc<dyn RecordTransform>) -> Self {
        self.transform = Some(transform);
        self
    }

    pub fn with_reports(mut self, reports: mpsc::UnboundedSender<RunReport>) -> Self {
        self.reports = Some(reports);
        self
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn settings(&self) -> &SourceSettings {
        &self.settings
    }

    pub fn stats(&self) -> Arc<SourceStats> {
        self.stats.clone()
    }

    pub fn state(&self) -> watch::Receiver<ProcessState> {
        self.state.clone()
    }

    pub fn take_records(&self) -> Result<mpsc::Receiver<DecodedRecord>, SourceError> {
        lock(&self.records)
            .take()
            .ok_or(SourceError::OutputTaken("records"))
    }

    pub fn take_dropped(&self) -> Result<mpsc::Receiver<DroppedRecord>, SourceError> {
        lock(&self.dropped)
            .take()
            .ok_or(SourceError::OutputTaken("dropped"))
    }

    /// Start supervising. Calling it again, or after `stop()`, does nothing.
    pub fn start(&self) -> Result<(), SourceError> {
        let Some(Pending { outputs, state }) = lock(&self.pending).take() else {
            return Ok(());
        };

        let framer = self.settings.framing.build()?;
        let shared = Arc::new(Shared {
            name: self.settings.name.clone(),
            framer,
            decoder: self.settings.decoding.build(),
            policy: self.settings.drop_policy,
            transform: self.transform.clone(),
            budget: Arc::new(BufferBudget::new(self.settings.maximum_buffer_size_bytes)),
            stats: self.stats.clone(),
            outputs,
        });
        let command = self.settings.command.display();
        let sink = Arc::new(ExecSink {
            shared,
            command: command.clone(),
        });

        let mut supervisor = Supervisor::new(
            self.settings.command.clone(),
            self.settings.mode,
            self.spawner.clone(),
            sink,
        )
        .with_drain_timeout(self.settings.drain_timeout)
        .with_stats(self.stats.clone())
        .with_state(state)
        .with_cancellation(self.cancel.clone());
        if let Some(reports) = &self.reports {
            supervisor = supervisor.with_reports(reports.clone());
        }

        tracing::info!(
            source = %self.settings.name,
            id = %self.id,
            %command,
            framing = self.settings.framing.name(),
            codec = %self.settings.decoding.kind(),
            "Starting exec source"
        );
        *lock(&self.task) = Some(tokio::spawn(supervisor.run()));
        Ok(())
    }

    /// Signal the child, drain in-flight output and wait for the supervisor.
    ///
    /// The child gets `drain_timeout` to exit after SIGTERM, and its output
    /// the same again to be processed; whatever is still buffered after that
    /// is discarded and counted as lost.
    pub async fn stop(&self) -> Result<DrainReport, SourceError> {
        self.cancel.cancel();
        // Never started: drop the senders so receivers see the end.
        lock(&self.pending).take();

        let task = lock(&self.task).take();
        if let Some(task) = task {
            task.await.map_err(|e| SourceError::Task(e.to_string()))?;
        }

        let report = DrainReport::from_stats(&self.stats);
        if report.lost_bytes > 0 {
            tracing::warn!(
                source = %self.settings.name,
                lost_bytes = report.lost_bytes,
                "Exec source stopped with lost bytes"
            );
        }
        tracing::info!(source = %self.settings.name, id = %self.id, "Exec source stopped");
        Ok(report)
    }
}

/// Splitter and decoder over chunks supplied by a transport collaborator.
pub struct ChunkPipeline {
    name: String,
    framer: Framer,
    decoder: PayloadDecoder,
    policy: DropPolicy,
    transform: Option<Arc<dyn RecordTransform>>,
    maximum_buffer_size_bytes: usize,
    drain_timeout: Duration,
    stats: Arc<SourceStats>,
}

impl ChunkPipeline {
    pub fn new(
        framing: &FramingConfig,
        decoding: CodecConfig,
        maximum_buffer_size_bytes: usize,
    ) -> Result<Self, ConfigError> {
        if maximum_buffer_size_bytes == 0 {
            return Err(ConfigError::Zero {
                field: "maximum_buffer_size_bytes",
            });
        }
        Ok(Self {
            name: "pipeline".to_string(),
            framer: framing.build()?,
            decoder: decoding.build(),
            policy: DropPolicy::default(),
            transform: None,
            maximum_buffer_size_bytes,
            drain_timeout: DEFAULT_DRAIN_TIMEOUT,
            stats: Arc::new(SourceStats::new()),
        })
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_drop_policy(mut self, policy: DropPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_transform(mut self, transform: Arc<dyn RecordTransform>) -> Self {
        self.transform = Some(transform);
        self
    }

    pub fn with_drain_timeout(mut self, drain_timeout: Duration) -> Self {
        self.drain_timeout = drain_timeout;
        self
    }

    pub fn with_stats(mut self, stats: Arc<SourceStats>) -> Self {
        self.stats = stats;
        self
    }

    /// Consume `chunks` on a new task until the stream ends or the handle is stopped.
    pub fn spawn<S>(self, chunks: S) -> PipelineHandle
    where
        S: Stream<Item = RawChunk> + Send + 'static,
    {
        let (outputs, records, dropped) = outputs();
        let shared = Arc::new(Shared {
            name: self.name,
            framer: self.framer,
            decoder: self.decoder,
            policy: self.policy,
            transform: self.transform,
            budget: Arc::new(BufferBudget::new(self.maximum_buffer_size_bytes)),
            stats: self.stats.clone(),
            outputs,
        });
        let cancel = CancellationToken::new();
        let task = tokio::spawn(pump_chunks(shared, chunks, cancel.clone()));

        PipelineHandle {
            records: Some(records),
            dropped: Some(dropped),
            stats: self.stats,
            drain_timeout: self.drain_timeout,
            cancel,
            task,
        }
    }
}

async fn pump_chunks<S>(shared: Arc<Shared>, chunks: S, cancel: CancellationToken)
where
    S: Stream<Item = RawChunk>,
{
    tokio::pin!(chunks);
    // Chunks with different tags never share a frame.
    let mut processors: BTreeMap<SourceTag, StreamProcessor> = BTreeMap::new();

    loop {
        let chunk = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                tracing::info!(source = %shared.name, "Pipeline stopped before end of input");
                return;
            }
            chunk = chunks.next() => chunk,
        };
        let Some(chunk) = chunk else { break };

        let source = chunk.source;
        processors
            .entry(source)
            .or_insert_with(|| StreamProcessor::new(shared.clone(), source, Enrichment::default()))
            .push(chunk)
            .await;
    }

    for processor in processors.values_mut() {
        processor.finish().await;
    }
    tracing::debug!(source = %shared.name, "Pipeline input ended");
}

/// A running [`ChunkPipeline`].
pub struct PipelineHandle {
    records: Option<mpsc::Receiver<DecodedRecord>>,
    dropped: Option<mpsc::Receiver<DroppedRecord>>,
    stats: Arc<SourceStats>,
    drain_timeout: Duration,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl PipelineHandle {
    pub fn take_records(&mut self) -> Result<mpsc::Receiver<DecodedRecord>, SourceError> {
        self.records.take().ok_or(SourceError::OutputTaken("records"))
    }

    pub fn take_dropped(&mut self) -> Result<mpsc::Receiver<DroppedRecord>, SourceError> {
        self.dropped.take().ok_or(SourceError::OutputTaken("dropped"))
    }

    pub fn stats(&self) -> Arc<SourceStats> {
        self.stats.clone()
    }

    /// Stop reading, let the in-flight chunk finish within the drain timeout.
    pub async fn stop(mut self) -> Result<DrainReport, SourceError> {
        self.cancel.cancel();
        match tokio::time::timeout(self.drain_timeout, &mut self.task).await {
            Ok(result) => result.map_err(|e| SourceError::Task(e.to_string()))?,
            Err(_) => {
                tracing::warn!(
                    drain_timeout_secs = self.drain_timeout.as_secs(),
                    "Pipeline still busy after drain timeout, abandoning it"
                );
                self.task.abort();
                let _ = (&mut self.task).await;
            }
        }
        Ok(DrainReport::from_stats(&self.stats))
    }
}
