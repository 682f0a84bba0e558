// THEORY:
// Training emits one scalar per loss term per clip, keyed by a global step. The
// sink is a trait so the trainer does not care where scalars end up: a JSON-lines
// file under the run's log directory, or memory when embedding or testing.

use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

pub const SCALAR_LOG_FILE: &str = "scalars.jsonl";

/// One logged scalar.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScalarEvent {
    pub tag: String,
    pub value: f32,
    pub step: u64,
    /// Seconds since the Unix epoch.
    pub wall_time: f64,
}

/// Accepts `(tag, value, step)` triples.
pub trait ScalarSink {
    fn add_scalar(&mut self, tag: &str, value: f32, step: u64) -> Result<()>;

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }
}

fn wall_time() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs_f64())
        .unwrap_or_default()
}

/// Appends scalars as JSON lines to `<log_dir>/scalars.jsonl`.
pub struct JsonlScalarLog {
    path: PathBuf,
    writer: BufWriter<File>,
}

impl JsonlScalarLog {
    pub fn open(log_dir: &Path) -> Result<Self> {
        let path = log_dir.join(SCALAR_LOG_FILE);
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            path,
            writer: BufWriter::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ScalarSink for JsonlScalarLog {
    fn add_scalar(&mut self, tag: &str, value: f32, step: u64) -> Result<()> {
        let event = ScalarEvent {
            tag: tag.to_string(),
            value,
            step,
            wall_time: wall_time(),
        };
        serde_json::to_writer(&mut self.writer, &event)?;
        self.writer.write_all(b"\n")?;
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.writer.flush()?;
        Ok(())
    }
}

/// Keeps every scalar in memory.
#[derive(Debug, Default, Clone)]
pub struct MemoryScalarLog {
    pub events: Vec<ScalarEvent>,
}

impl MemoryScalarLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Distinct steps, in first-seen order.
    pub fn steps(&self) -> Vec<u64> {
        let mut steps: Vec<u64> = Vec::new();
        for event in &self.events {
            if !steps.contains(&event.step) {
                steps.push(event.step);
            }
        }
        steps
    }

    pub fn series(&self, tag: &str) -> Vec<(u64, f32)> {
        self.events
            .iter()
            .filter(|event| event.tag == tag)
            .map(|event| (event.step, event.value))
            .collect()
    }
}

impl ScalarSink for MemoryScalarLog {
    fn add_scalar(&mut self, tag: &str, value: f32, step: u64) -> Result<()> {
        self.events.push(ScalarEvent {
            tag: tag.to_string(),
            value,
            step,
            wall_time: wall_time(),
        });
        Ok(())
    }
}
