//! Transfer bookkeeping: per-object byte reporting and per-domain totals.

pub mod progress;
pub mod reporter;

pub use progress::{format_bytes, format_duration, format_speed, TransferSummary, TransferTracker};
pub use reporter::{ProgressCallback, ProgressReporter};
