//! Newline-delimited JSON log of generation outcomes.
//!
//! Lines never carry the concept or interest text, only lengths and counts.

use std::fs;
use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use flate2::write::GzEncoder;
use flate2::Compression;

use crate::config::RotationConfig;

/// Size-based rotating writer. Backups replace the file extension with
/// `1` .. `keep` (`gen.log` -> `gen.1`); the newest may be gzipped to `gen.1.gz`.
pub struct RotatingWriter {
    path: PathBuf,
    file: fs::File,
    max_bytes: Option<u64>,
    keep: usize,
    compress: bool,
}

impl RotatingWriter {
    pub fn open(path: &str, rotation: &RotationConfig) -> std::io::Result<Self> {
        let file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)?;
        Ok(Self {
            path: PathBuf::from(path),
            file,
            max_bytes: rotation.max_bytes,
            keep: rotation.keep,
            compress: rotation.compress,
        })
    }

    pub fn write_line(&mut self, line: &str) -> std::io::Result<()> {
        if let Some(limit) = self.max_bytes {
            if self.current_size().unwrap_or(0) >= limit {
                self.rotate();
            }
        }
        writeln!(self.file, "{}", line)
    }

    pub fn current_size(&self) -> Option<u64> {
        self.path.metadata().ok().map(|m| m.len())
    }

    /// `gen.N`, or `gen.N.gz` when `gz` is set.
    fn backup_path(&self, idx: usize, gz: bool) -> PathBuf {
        let plain = self.path.with_extension(idx.to_string());
        if gz {
            let mut name = plain.into_os_string();
            name.push(".gz");
            PathBuf::from(name)
        } else {
            plain
        }
    }

    fn rotate(&mut self) {
        if self.keep > 0 {
            // Oldest first so nothing is overwritten before it moves; the
            // backup at `keep` is replaced by its younger neighbour.
            for idx in (1..self.keep).rev() {
                for gz in [false, true] {
                    let from = self.backup_path(idx, gz);
                    if from.exists() {
                        let _ = fs::rename(&from, self.backup_path(idx + 1, gz));
                    }
                }
            }
            if self.path.exists() {
                let _ = fs::rename(&self.path, self.backup_path(1, false));
            }
            if self.compress {
                self.compress_latest_backup();
            }
        }
        // Truncate: with keep == 0 the current contents are simply discarded.
        if let Ok(fresh) = fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&self.path)
        {
            self.file = fresh;
        }
    }

    fn compress_latest_backup(&self) {
        let rotated = self.backup_path(1, false);
        let Ok(data) = fs::read(&rotated) else {
            return;
        };
        let mut gz = GzEncoder::new(Vec::new(), Compression::default());
        if gz.write_all(&data).is_ok() {
            if let Ok(buf) = gz.finish() {
                if fs::write(self.backup_path(1, true), buf).is_ok() {
                    let _ = fs::remove_file(&rotated);
                }
            }
        }
    }
}

/// Fields mirrored to stdout when stdout logging is on.
pub struct GenerationLogFields<'a> {
    pub outcome: &'a str,
    pub status: u16,
    pub latency_ms: u128,
    pub images_returned: usize,
}

#[derive(Clone)]
pub struct TelemetrySink {
    writer: Option<Arc<Mutex<RotatingWriter>>>,
    log_stdout: bool,
    lines_total: Arc<AtomicU64>,
    write_errors_total: Arc<AtomicU64>,
}

impl TelemetrySink {
    pub fn new(writer: Option<RotatingWriter>, log_stdout: bool) -> Self {
        Self {
            writer: writer.map(|w| Arc::new(Mutex::new(w))),
            log_stdout,
            lines_total: Arc::new(AtomicU64::new(0)),
            write_errors_total: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn disabled() -> Self {
        Self::new(None, false)
    }

    /// Open `log_file` if configured. An unopenable file disables the sink
    /// with a warning instead of failing startup.
    pub fn from_config(log_file: Option<&str>, rotation: &RotationConfig, log_stdout: bool) -> Self {
        let writer = match log_file {
            Some(path) => match RotatingWriter::open(path, rotation) {
                Ok(w) => Some(w),
                Err(e) => {
                    tracing::warn!(path = %path, error = %e, "failed to open LOG_FILE; telemetry disabled");
                    None
                }
            },
            None => {
                tracing::debug!("telemetry file disabled: LOG_FILE not set");
                None
            }
        };
        Self::new(writer, log_stdout)
    }

    pub fn emit(&self, payload: &serde_json::Value, log: &GenerationLogFields<'_>) {
        let wrote = self.write_line(payload);
        if (wrote || self.writer.is_none()) && self.log_stdout {
            tracing::info!(
                target: "telemetry",
                outcome = log.outcome,
                status = log.status,
                latencyMs = log.latency_ms as u64,
                imagesReturned = log.images_returned,
                "generation"
            );
        }
    }

    pub fn lines_total(&self) -> u64 {
        self.lines_total.load(Ordering::Relaxed)
    }

    pub fn write_errors_total(&self) -> u64 {
        self.write_errors_total.load(Ordering::Relaxed)
    }

    fn write_line(&self, payload: &serde_json::Value) -> bool {
        let Some(target) = self.writer.as_ref() else {
            return false;
        };
        let Ok(mut guard) = target.lock() else {
            return false;
        };
        match guard.write_line(&payload.to_string()) {
            Ok(()) => {
                self.lines_total.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to write telemetry line");
                self.write_errors_total.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn fields() -> GenerationLogFields<'static> {
        GenerationLogFields {
            outcome: "ok",
            status: 200,
            latency_ms: 12,
            images_returned: 3,
        }
    }

    #[test]
    fn writes_one_json_line_per_event() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("telemetry.jsonl");
        let rotation = RotationConfig::default();
        let sink = TelemetrySink::from_config(path.to_str(), &rotation, false);
        sink.emit(&json!({"schemaVersion": 1, "outcome": "ok"}), &fields());
        sink.emit(&json!({"schemaVersion": 1, "outcome": "rate_limited"}), &fields());
        let content = fs::read_to_string(&path).unwrap();
        let lines: Vec<_> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        let v: serde_json::Value = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(v["outcome"], "rate_limited");
        assert_eq!(sink.lines_total(), 2);
    }

    #[test]
    fn rotates_and_compresses_backups() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gen.log");
        let rotation = RotationConfig {
            max_bytes: Some(64),
            keep: 2,
            compress: true,
        };
        let mut writer = RotatingWriter::open(path.to_str().unwrap(), &rotation).unwrap();
        let line = "x".repeat(80);
        for _ in 0..4 {
            writer.write_line(&line).unwrap();
        }
        assert!(path.with_extension("1.gz").exists());
        assert!(writer.current_size().unwrap() <= 81);
    }

    #[test]
    fn zero_keep_truncates_without_backups() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gen.log");
        let rotation = RotationConfig {
            max_bytes: Some(10),
            keep: 0,
            compress: false,
        };
        let mut writer = RotatingWriter::open(path.to_str().unwrap(), &rotation).unwrap();
        for _ in 0..3 {
            writer.write_line("0123456789abc").unwrap();
        }
        assert!(!path.with_extension("1").exists());
        assert_eq!(writer.current_size(), Some(14));
    }

    #[test]
    fn disabled_sink_counts_nothing() {
        let sink = TelemetrySink::disabled();
        sink.emit(&json!({"schemaVersion": 1}), &fields());
        assert_eq!(sink.lines_total(), 0);
        assert_eq!(sink.write_errors_total(), 0);
    }
}
