//! Progress reporting seam.
//!
//! The pipeline reports row-level progress through this trait; the
//! actual display (terminal bar, telemetry, nothing at all) lives
//! with the caller.

/// Sink for progress updates from long-running pipeline stages.
pub trait Progress {
    /// A new unit of work with a total number of steps.
    fn begin(&mut self, label: &str, total: u64);

    /// Advance the current unit of work.
    fn advance(&mut self, amount: u64);

    /// The current unit of work is complete.
    fn finish(&mut self);
}

/// Progress sink that counts updates; useful for tests and as a
/// template for real sinks.
#[derive(Debug, Default)]
pub struct CountingProgress {
    pub begun: u64,
    pub advanced: u64,
    pub finished: u64,
}

impl Progress for CountingProgress {
    fn begin(&mut self, _label: &str, _total: u64) {
        self.begun += 1;
    }

    fn advance(&mut self, amount: u64) {
        self.advanced += amount;
    }

    fn finish(&mut self) {
        self.finished += 1;
    }
}
