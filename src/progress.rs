//! Optional progress reporting for long-running operations.

/// Receives coarse progress events from compaction and other streaming
/// passes. Implementations decide what (if anything) to show.
pub trait ProgressMonitor {
    /// A task with `total` expected work units begins (`None` when the
    /// total is unknown up front).
    fn begin(&mut self, task: &str, total: Option<u64>);

    /// `n` additional work units completed.
    fn update(&mut self, n: u64);

    fn end(&mut self);
}

/// Monitor that discards every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoProgress;

impl ProgressMonitor for NoProgress {
    fn begin(&mut self, _task: &str, _total: Option<u64>) {}
    fn update(&mut self, _n: u64) {}
    fn end(&mut self) {}
}
