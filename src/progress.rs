use std::sync::atomic::{AtomicU8, Ordering};

/// Receives progress of a long-running session.
pub trait ProgressSink: Send + Sync {
    /// `percent` is in `0..=100`.
    fn progress(&self, percent: u8, message: &str);

    /// Whether cancelling right now is allowed. The engine disables it around
    /// the install renames of each operation.
    fn cancel_enabled(&self, _enabled: bool) {}
}

/// Discards all progress.
pub struct NoProgress;

impl ProgressSink for NoProgress {
    fn progress(&self, _percent: u8, _message: &str) {}
}

/// Reports progress through `tracing`, once per percentage step.
#[derive(Default)]
pub struct LogProgress {
    last: AtomicU8,
}

impl ProgressSink for LogProgress {
    fn progress(&self, percent: u8, message: &str) {
        if self.last.swap(percent, Ordering::Relaxed) != percent {
            tracing::info!(percent, "{message}");
        } else {
            tracing::trace!(percent, "{message}");
        }
    }

    fn cancel_enabled(&self, enabled: bool) {
        tracing::trace!(enabled, "cancel toggled");
    }
}

pub(crate) fn percent(done: usize, total: usize) -> u8 {
    if total == 0 {
        return 100;
    }
    ((done.min(total) * 100) / total) as u8
}
