//! Aggregate progress for one domain's transfer phase.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Snapshot of a domain transfer.
#[derive(Debug, Clone, PartialEq)]
pub struct TransferSummary {
    pub files_total: u64,
    pub files_uploaded: u64,
    pub files_deduplicated: u64,
    pub files_failed: u64,
    pub bytes_uploaded: u64,
    pub elapsed: Duration,
}

impl TransferSummary {
    pub fn bytes_per_second(&self) -> u64 {
        let secs = self.elapsed.as_secs_f64();
        if secs > 0.0 {
            (self.bytes_uploaded as f64 / secs) as u64
        } else {
            0
        }
    }

    pub fn percent_complete(&self) -> f64 {
        if self.files_total == 0 {
            return 100.0;
        }
        let done = self.files_uploaded + self.files_deduplicated + self.files_failed;
        (done as f64 / self.files_total as f64) * 100.0
    }
}

/// Shared counters updated by the transfer workers.
pub struct TransferTracker {
    started: Instant,
    files_total: u64,
    uploaded: AtomicU64,
    deduplicated: AtomicU64,
    failed: AtomicU64,
    bytes: AtomicU64,
}

impl TransferTracker {
    pub fn new(files_total: u64) -> Self {
        Self {
            started: Instant::now(),
            files_total,
            uploaded: AtomicU64::new(0),
            deduplicated: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            bytes: AtomicU64::new(0),
        }
    }

    pub fn record_uploaded(&self, bytes: u64) {
        self.uploaded.fetch_add(1, Ordering::Relaxed);
        self.bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn record_deduplicated(&self) {
        self.deduplicated.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failed(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn summary(&self) -> TransferSummary {
        TransferSummary {
            files_total: self.files_total,
            files_uploaded: self.uploaded.load(Ordering::Relaxed),
            files_deduplicated: self.deduplicated.load(Ordering::Relaxed),
            files_failed: self.failed.load(Ordering::Relaxed),
            bytes_uploaded: self.bytes.load(Ordering::Relaxed),
            elapsed: self.started.elapsed(),
        }
    }
}

/// Format bytes as human-readable string
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit = 0;

    while size >= 1024.0 && unit < UNITS.len() - 1 {
        size /= 1024.0;
        unit += 1;
    }

    format!("{:.2} {}", size, UNITS[unit])
}

pub fn format_speed(bytes_per_second: u64) -> String {
    format!("{}/s", format_bytes(bytes_per_second))
}

pub fn format_duration(seconds: u64) -> String {
    match seconds {
        s if s < 60 => format!("{}s", s),
        s if s < 3600 => format!("{}m {}s", s / 60, s % 60),
        s => format!("{}h {}m", s / 3600, (s % 3600) / 60),
    }
}
