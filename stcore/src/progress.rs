//! Coarse progress reporting for long batch loops.
//!
//! Observers only watch; nothing an observer does feeds back into a computation.

use std::sync::atomic::{AtomicUsize, Ordering};

use log::info;

pub trait ProgressObserver: Sync {
    /// Called with the number of finished units out of `total` for the named stage.
    fn on_progress(&self, stage: &str, done: usize, total: usize);

    fn on_finish(&self, _stage: &str) {}
}

/// Discards all progress.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoProgress;

impl ProgressObserver for NoProgress {
    fn on_progress(&self, _stage: &str, _done: usize, _total: usize) {}
}

/// Logs at `info` every `every` percent.
#[derive(Debug)]
pub struct LogProgress {
    every: usize,
    last: AtomicUsize,
}

impl LogProgress {
    pub fn new(every_percent: usize) -> Self {
        LogProgress {
            every: every_percent.clamp(1, 100),
            last: AtomicUsize::new(0),
        }
    }
}

impl Default for LogProgress {
    fn default() -> Self {
        LogProgress::new(10)
    }
}

impl ProgressObserver for LogProgress {
    fn on_progress(&self, stage: &str, done: usize, total: usize) {
        if total == 0 {
            return;
        }
        let pct = done * 100 / total;
        let bucket = pct / self.every;
        if self.last.fetch_max(bucket, Ordering::Relaxed) < bucket {
            info!("{}: {}/{} ({}%)", stage, done, total, pct);
        }
    }

    fn on_finish(&self, stage: &str) {
        self.last.store(0, Ordering::Relaxed);
        info!("{}: done", stage);
    }
}

/// Shared counter that forwards to an observer as parallel workers finish units.
pub(crate) struct Tally<'a> {
    observer: &'a dyn ProgressObserver,
    stage: &'a str,
    total: usize,
    done: AtomicUsize,
}

impl<'a> Tally<'a> {
    pub(crate) fn new(observer: &'a dyn ProgressObserver, stage: &'a str, total: usize) -> Self {
        Tally {
            observer,
            stage,
            total,
            done: AtomicUsize::new(0),
        }
    }

    pub(crate) fn tick(&self) {
        let done = self.done.fetch_add(1, Ordering::Relaxed) + 1;
        self.observer.on_progress(self.stage, done, self.total);
    }

    pub(crate) fn finish(self) {
        self.observer.on_finish(self.stage);
    }
}
