//! # JSONL Telemetry Logger
//!
//! Writes telemetry records as JSON Lines into rotating files, keeping at most
//! `max_records_per_file` records per file and the newest `max_files_to_keep`
//! files.

use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::Serialize;
use tracing::{debug, warn};

use super::{TelemetryEvent, TelemetrySink};
use crate::dshot::protocol::TelemetryKind;
use crate::error::Result;

const FILE_PREFIX: &str = "telemetry_";
const FILE_SUFFIX: &str = ".jsonl";

/// One line of the telemetry log
#[derive(Debug, Serialize)]
struct TelemetryRecord {
    timestamp: String,
    motor: usize,
    kind: TelemetryKind,
    value: i32,
}

/// Rotating JSONL writer
#[derive(Debug)]
pub struct JsonlLogger {
    dir: PathBuf,
    max_records_per_file: usize,
    max_files_to_keep: usize,
    writer: Option<BufWriter<File>>,
    records_in_file: usize,
    sequence: u64,
}

impl JsonlLogger {
    /// Create a logger writing into `dir`, creating it if missing
    ///
    /// # Errors
    ///
    /// Returns error if the directory cannot be created
    pub fn new<P: AsRef<Path>>(
        dir: P,
        max_records_per_file: usize,
        max_files_to_keep: usize,
    ) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;

        Ok(Self {
            dir,
            max_records_per_file: max_records_per_file.max(1),
            max_files_to_keep: max_files_to_keep.max(1),
            writer: None,
            records_in_file: 0,
            sequence: 0,
        })
    }

    /// Append one record for a global motor id
    ///
    /// # Errors
    ///
    /// Returns error if the record cannot be serialized or written
    pub fn log(&mut self, motor: usize, kind: TelemetryKind, value: i32) -> Result<()> {
        if self.writer.is_none() || self.records_in_file >= self.max_records_per_file {
            self.rotate()?;
        }

        let record = TelemetryRecord {
            timestamp: Utc::now().to_rfc3339(),
            motor,
            kind,
            value,
        };

        if let Some(writer) = self.writer.as_mut() {
            serde_json::to_writer(&mut *writer, &record)?;
            writer.write_all(b"\n")?;
            self.records_in_file += 1;
        }

        Ok(())
    }

    /// Flush buffered records to disk
    pub fn flush(&mut self) -> Result<()> {
        if let Some(writer) = self.writer.as_mut() {
            writer.flush()?;
        }
        Ok(())
    }

    /// Log files currently in the directory, oldest first
    pub fn log_files(&self) -> Result<Vec<PathBuf>> {
        let mut files: Vec<PathBuf> = fs::read_dir(&self.dir)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| {
                path.file_name()
                    .and_then(|n| n.to_str())
                    .map(|n| n.starts_with(FILE_PREFIX) && n.ends_with(FILE_SUFFIX))
                    .unwrap_or(false)
            })
            .collect();
        files.sort();
        Ok(files)
    }

    fn rotate(&mut self) -> Result<()> {
        if let Some(mut writer) = self.writer.take() {
            writer.flush()?;
        }

        let name = format!(
            "{}{}_{:06}{}",
            FILE_PREFIX,
            Utc::now().format("%Y%m%d_%H%M%S"),
            self.sequence,
            FILE_SUFFIX
        );
        self.sequence += 1;

        let path = self.dir.join(name);
        debug!("Opening telemetry log {}", path.display());
        self.writer = Some(BufWriter::new(File::create(&path)?));
        self.records_in_file = 0;

        let files = self.log_files()?;
        if files.len() > self.max_files_to_keep {
            for old in &files[..files.len() - self.max_files_to_keep] {
                debug!("Removing old telemetry log {}", old.display());
                fs::remove_file(old)?;
            }
        }

        Ok(())
    }
}

impl TelemetrySink for JsonlLogger {
    fn on_telemetry(&mut self, event: TelemetryEvent) {
        if let Err(e) = self.log(event.channel, event.kind, event.value) {
            warn!("Failed to write telemetry record: {}", e);
        }
    }
}

impl Drop for JsonlLogger {
    fn drop(&mut self) {
        let _ = self.flush();
    }
}
