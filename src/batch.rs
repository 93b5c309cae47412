//! Progress reporting, cooperative cancellation and per-item outcomes for
//! operations that touch many files.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::error::{IndexError, Result};

/// Per-file tag values read across an entity's images.
pub type TagValues = Vec<(PathBuf, Result<Option<String>>)>;

/// Receives progress from batch operations.
pub trait ProgressSink {
    fn progress(&mut self, max: usize, index: usize, message: &str);

    fn update(&mut self, index: usize);

    fn close(&mut self);

    /// Polled between items. Returning `true` stops the batch after the
    /// current item; completed items stay done.
    fn is_cancelled(&self) -> bool {
        false
    }
}

/// Discards progress and never cancels.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoProgress;

impl ProgressSink for NoProgress {
    fn progress(&mut self, _max: usize, _index: usize, _message: &str) {}

    fn update(&mut self, _index: usize) {}

    fn close(&mut self) {}
}

/// Shareable cancellation switch. Wrap a sink with [`CancelFlag::guard`] to
/// make a batch stop once the flag is raised from elsewhere.
#[derive(Debug, Default, Clone)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn guard<'a>(&self, sink: &'a mut dyn ProgressSink) -> Cancellable<'a> {
        Cancellable {
            flag: self.clone(),
            sink,
        }
    }
}

pub struct Cancellable<'a> {
    flag: CancelFlag,
    sink: &'a mut dyn ProgressSink,
}

impl ProgressSink for Cancellable<'_> {
    fn progress(&mut self, max: usize, index: usize, message: &str) {
        self.sink.progress(max, index, message);
    }

    fn update(&mut self, index: usize) {
        self.sink.update(index);
    }

    fn close(&mut self) {
        self.sink.close();
    }

    fn is_cancelled(&self) -> bool {
        self.flag.is_cancelled() || self.sink.is_cancelled()
    }
}

/// Outcome of a batch: which items worked, which failed and why.
#[derive(Debug, Default)]
pub struct BatchReport {
    /// Paths produced or updated by the batch, in processing order.
    pub succeeded: Vec<PathBuf>,
    /// Source paths that failed, with the error for each.
    pub failed: Vec<(PathBuf, IndexError)>,
    /// Set when the batch stopped early because of cancellation.
    pub cancelled: bool,
}

impl BatchReport {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty() && !self.cancelled
    }

    /// Fold another report into this one.
    pub fn merge(&mut self, other: BatchReport) {
        self.succeeded.extend(other.succeeded);
        self.failed.extend(other.failed);
        self.cancelled |= other.cancelled;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Recorder {
        updates: Vec<usize>,
        closed: bool,
    }

    impl ProgressSink for Recorder {
        fn progress(&mut self, _max: usize, index: usize, _message: &str) {
            self.updates.push(index);
        }

        fn update(&mut self, index: usize) {
            self.updates.push(index);
        }

        fn close(&mut self) {
            self.closed = true;
        }
    }

    #[test]
    fn cancel_flag_reaches_the_guarded_sink() {
        let flag = CancelFlag::new();
        let mut recorder = Recorder::default();
        {
            let mut guarded = flag.guard(&mut recorder);
            guarded.update(1);
            assert!(!guarded.is_cancelled());
            flag.clone().cancel();
            assert!(guarded.is_cancelled());
            guarded.close();
        }
        assert_eq!(recorder.updates, vec![1]);
        assert!(recorder.closed);
    }

    #[test]
    fn report_completeness() {
        let mut report = BatchReport::default();
        assert!(report.is_complete());
        report.merge(BatchReport {
            failed: vec![(PathBuf::from("/a"), IndexError::Unbound)],
            ..BatchReport::default()
        });
        assert!(!report.is_complete());
    }
}
