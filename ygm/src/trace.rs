//! Optional per-rank event trace, for offline cross-rank timeline
//! reconstruction.
//!
//! Distinct from `tracing`-crate logging: `tracing` is for an operator
//! watching one process live; this sink is a self-describing,
//! length-delimited (one JSON object per line) record stream meant to be
//! collected from every rank after the fact and merged into a global
//! timeline, in the spirit of a Chrome-trace-style event log.

use std::{
    fs::{self, File},
    io::{BufWriter, Write},
    path::Path,
    time::{SystemTime, UNIX_EPOCH},
};

use serde::Serialize;

use crate::error::{EngineError, Result};

/// One traced occurrence. Field names are deliberately flat so the format
/// stays simple to parse from any language.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind")]
pub enum TraceEvent {
    AsyncSubmit { rank: i32, dest: i32, tag: u16, ts_micros: u64 },
    AsyncRecv { rank: i32, tag: u16, ts_micros: u64 },
    Isend { rank: i32, dest: i32, bytes: u32, ts_micros: u64 },
    Irecv { rank: i32, source: i32, bytes: u32, ts_micros: u64 },
    BarrierBegin { rank: i32, ts_micros: u64 },
    BarrierEnd { rank: i32, ts_micros: u64 },
}

fn now_micros() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}

impl TraceEvent {
    pub fn async_submit(rank: i32, dest: i32, tag: u16) -> Self {
        Self::AsyncSubmit { rank, dest, tag, ts_micros: now_micros() }
    }

    pub fn async_recv(rank: i32, tag: u16) -> Self {
        Self::AsyncRecv { rank, tag, ts_micros: now_micros() }
    }

    pub fn isend(rank: i32, dest: i32, bytes: u32) -> Self {
        Self::Isend { rank, dest, bytes, ts_micros: now_micros() }
    }

    pub fn irecv(rank: i32, source: i32, bytes: u32) -> Self {
        Self::Irecv { rank, source, bytes, ts_micros: now_micros() }
    }

    pub fn barrier_begin(rank: i32) -> Self {
        Self::BarrierBegin { rank, ts_micros: now_micros() }
    }

    pub fn barrier_end(rank: i32) -> Self {
        Self::BarrierEnd { rank, ts_micros: now_micros() }
    }
}

/// A per-rank append-only event log. Absent unless configured with a trace
/// path; `record` is then a no-op, so call sites never need to branch on
/// whether tracing is enabled.
pub struct Trace {
    writer: Option<BufWriter<File>>,
}

impl Trace {
    /// Opens `trace_path/trace_<rank>.jsonl` for appending, creating the
    /// directory if needed.
    pub fn open(trace_path: &Path, rank: i32) -> Result<Self> {
        fs::create_dir_all(trace_path).map_err(|e| {
            EngineError::InvalidConfig(format!("failed to create trace directory: {e}"))
        })?;
        let file_path = trace_path.join(format!("trace_{rank}.jsonl"));
        let file = File::create(&file_path).map_err(|e| {
            EngineError::InvalidConfig(format!("failed to open {}: {e}", file_path.display()))
        })?;
        Ok(Self {
            writer: Some(BufWriter::new(file)),
        })
    }

    /// A trace sink that discards every event; used when no trace path is
    /// configured.
    pub fn disabled() -> Self {
        Self { writer: None }
    }

    pub fn is_enabled(&self) -> bool {
        self.writer.is_some()
    }

    pub fn record(&mut self, event: &TraceEvent) {
        let Some(writer) = self.writer.as_mut() else {
            return;
        };
        if let Ok(line) = serde_json::to_string(event) {
            let _ = writeln!(writer, "{line}");
        }
    }

    pub fn flush(&mut self) {
        if let Some(writer) = self.writer.as_mut() {
            let _ = writer.flush();
        }
    }
}

impl Drop for Trace {
    fn drop(&mut self) {
        self.flush();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_trace_ignores_records() {
        let mut trace = Trace::disabled();
        assert!(!trace.is_enabled());
        trace.record(&TraceEvent::barrier_begin(0));
    }

    #[test]
    fn open_creates_file_and_writes_jsonl() {
        let dir = std::env::temp_dir().join(format!("ygm-trace-test-{}", std::process::id()));
        let mut trace = Trace::open(&dir, 0).unwrap();
        assert!(trace.is_enabled());
        trace.record(&TraceEvent::async_submit(0, 1, 7));
        trace.flush();

        let contents = std::fs::read_to_string(dir.join("trace_0.jsonl")).unwrap();
        assert!(contents.contains("AsyncSubmit"));
        let _ = std::fs::remove_dir_all(&dir);
    }
}
