//! Per-source counters.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

use crate::error::FramingError;

#[derive(Debug, Default)]
pub struct SourceStats {
    bytes_read: AtomicU64,
    frames: AtomicU64,
    records: AtomicU64,
    dropped_records: AtomicU64,
    frame_too_large: AtomicU64,
    truncated_frames: AtomicU64,
    malformed_framing: AtomicU64,
    buffer_overflows: AtomicU64,
    decode_failures: AtomicU64,
    spawns: AtomicU64,
    spawn_failures: AtomicU64,
    exits: AtomicU64,
    timeouts: AtomicU64,
    runs_skipped: AtomicU64,
    lost_bytes: AtomicU64,
}

fn bump(counter: &AtomicU64, n: u64) {
    counter.fetch_add(n, Ordering::Relaxed);
}

impl SourceStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_bytes_read(&self, n: usize) {
        bump(&self.bytes_read, n as u64);
    }

    pub fn add_frame(&self) {
        bump(&self.frames, 1);
    }

    pub fn add_record(&self) {
        bump(&self.records, 1);
    }

    pub fn add_dropped_record(&self) {
        bump(&self.dropped_records, 1);
    }

    pub fn add_framing_error(&self, error: &FramingError) {
        match error {
            FramingError::FrameTooLarge { .. } => bump(&self.frame_too_large, 1),
            FramingError::TruncatedFrame { .. } => bump(&self.truncated_frames, 1),
            FramingError::MalformedFraming { .. } => bump(&self.malformed_framing, 1),
            FramingError::BufferOverflow { discarded } => {
                bump(&self.buffer_overflows, 1);
                bump(&self.lost_bytes, *discarded as u64);
            }
            FramingError::Io(_) => {}
        }
    }

    pub fn add_decode_failure(&self) {
        bump(&self.decode_failures, 1);
    }

    pub fn add_spawn(&self) {
        bump(&self.spawns, 1);
    }

    pub fn add_spawn_failure(&self) {
        bump(&self.spawn_failures, 1);
    }

    pub fn add_exit(&self) {
        bump(&self.exits, 1);
    }

    pub fn add_timeout(&self) {
        bump(&self.timeouts, 1);
    }

    pub fn add_run_skipped(&self) {
        bump(&self.runs_skipped, 1);
    }

    pub fn add_lost_bytes(&self, n: usize) {
        bump(&self.lost_bytes, n as u64);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let get = |c: &AtomicU64| c.load(Ordering::Relaxed);
        StatsSnapshot {
            bytes_read: get(&self.bytes_read),
            frames: get(&self.frames),
            records: get(&self.records),
            dropped_records: get(&self.dropped_records),
            frame_too_large: get(&self.frame_too_large),
            truncated_frames: get(&self.truncated_frames),
            malformed_framing: get(&self.malformed_framing),
            buffer_overflows: get(&self.buffer_overflows),
            decode_failures: get(&self.decode_failures),
            spawns: get(&self.spawns),
            spawn_failures: get(&self.spawn_failures),
            exits: get(&self.exits),
            timeouts: get(&self.timeouts),
            runs_skipped: get(&self.runs_skipped),
            lost_bytes: get(&self.lost_bytes),
        }
    }
}

/// Point-in-time copy of [`SourceStats`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub bytes_read: u64,
    pub frames: u64,
    pub records: u64,
    pub dropped_records: u64,
    pub frame_too_large: u64,
    pub truncated_frames: u64,
    pub malformed_framing: u64,
    pub buffer_overflows: u64,
    pub decode_failures: u64,
    pub spawns: u64,
    pub spawn_failures: u64,
    pub exits: u64,
    pub timeouts: u64,
    pub runs_skipped: u64,
    /// Bytes discarded by overflow or abandoned at shutdown.
    pub lost_bytes: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn framing_errors_land_in_their_counters() {
        let stats = SourceStats::new();
        stats.add_framing_error(&FramingError::BufferOverflow { discarded: 12 });
        stats.add_framing_error(&FramingError::TruncatedFrame { buffered: 3 });
        stats.add_framing_error(&FramingError::FrameTooLarge {
            length: 9,
            max_length: 4,
        });
        stats.add_lost_bytes(5);

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.buffer_overflows, 1);
        assert_eq!(snapshot.truncated_frames, 1);
        assert_eq!(snapshot.frame_too_large, 1);
        assert_eq!(snapshot.lost_bytes, 17);
    }

    #[test]
    fn snapshot_serializes_every_counter() {
        let stats = SourceStats::new();
        stats.add_spawn();
        stats.add_frame();
        stats.add_record();
        stats.add_record();
        insta::assert_json_snapshot!(stats.snapshot(), @r#"
        {
          "bytes_read": 0,
          "frames": 1,
          "records": 2,
          "dropped_records": 0,
          "frame_too_large": 0,
          "truncated_frames": 0,
          "malformed_framing": 0,
          "buffer_overflows": 0,
          "decode_failures": 0,
          "spawns": 1,
          "spawn_failures": 0,
          "exits": 0,
          "timeouts": 0,
          "runs_skipped": 0,
          "lost_bytes": 0
        }
        "#);
    }
}
