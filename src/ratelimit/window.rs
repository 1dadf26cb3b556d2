//! Fixed time windows for counting admissions.

/// A fixed window of `duration` milliseconds aligned to the Unix epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Window {
    start: u64,
    duration: u64,
}

impl Window {
    /// The window containing `now_ms`.
    ///
    /// `start = floor(now / duration) * duration`, so `start <= now < reset`.
    /// A zero duration is treated as one millisecond.
    pub fn containing(now_ms: u64, duration_ms: u64) -> Self {
        let duration = duration_ms.max(1);
        Self {
            start: (now_ms / duration) * duration,
            duration,
        }
    }

    /// Epoch milliseconds at which this window opened.
    pub fn start(&self) -> u64 {
        self.start
    }

    /// Epoch milliseconds at which the next window begins.
    pub fn reset(&self) -> u64 {
        self.start.saturating_add(self.duration)
    }
}
