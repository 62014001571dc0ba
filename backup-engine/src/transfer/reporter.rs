//! Throttled byte-count reporting for uploads and downloads.

use std::sync::Arc;
use std::time::{Duration, Instant};

/// Callback for progress updates. Receives the cumulative byte count.
pub type ProgressCallback = Arc<dyn Fn(u64) + Send + Sync>;

const UPDATE_INTERVAL: Duration = Duration::from_millis(250);

/// Counts bytes as they move and forwards the running total to an optional
/// callback at most four times per second, plus once on completion.
pub struct ProgressReporter {
    callback: Option<ProgressCallback>,
    transferred: u64,
    last_update: Instant,
    interval: Duration,
}

impl ProgressReporter {
    pub fn new(callback: Option<ProgressCallback>) -> Self {
        Self {
            callback,
            transferred: 0,
            last_update: Instant::now(),
            interval: UPDATE_INTERVAL,
        }
    }

    #[cfg(test)]
    fn with_interval(callback: Option<ProgressCallback>, interval: Duration) -> Self {
        Self {
            interval,
            ..Self::new(callback)
        }
    }

    pub fn advance(&mut self, bytes: u64) {
        self.transferred += bytes;
        if let Some(cb) = &self.callback {
            let now = Instant::now();
            if now.duration_since(self.last_update) >= self.interval {
                cb(self.transferred);
                self.last_update = now;
            }
        }
    }

    /// Emit the final total and return it.
    pub fn finish(self) -> u64 {
        if let Some(cb) = &self.callback {
            cb(self.transferred);
        }
        self.transferred
    }

    pub fn transferred(&self) -> u64 {
        self.transferred
    }
}
