use std::sync::Mutex;

use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use rustc_hash::FxHashMap;
use stcore::progress::ProgressObserver;

const TEMPLATE: &str = "{spinner:.green} [{elapsed_precise}] {msg:24} [{bar:40.cyan/blue}] {pos}/{len} ({eta})";

/// Terminal progress bars, one per stage.
pub struct BarProgress {
    multi: MultiProgress,
    bars: Mutex<FxHashMap<String, ProgressBar>>,
}

impl BarProgress {
    pub fn new() -> Self {
        BarProgress {
            multi: MultiProgress::new(),
            bars: Mutex::new(FxHashMap::default()),
        }
    }

    fn style() -> ProgressStyle {
        ProgressStyle::default_bar()
            .template(TEMPLATE)
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("#>-")
    }

    fn bar(&self, stage: &str, total: usize) -> Option<ProgressBar> {
        let mut bars = self.bars.lock().ok()?;
        let bar = bars.entry(stage.to_string()).or_insert_with(|| {
            let bar = self.multi.add(ProgressBar::new(total as u64));
            bar.set_style(Self::style());
            bar.set_message(stage.to_string());
            bar
        });
        Some(bar.clone())
    }
}

impl Default for BarProgress {
    fn default() -> Self {
        BarProgress::new()
    }
}

impl ProgressObserver for BarProgress {
    fn on_progress(&self, stage: &str, done: usize, total: usize) {
        if let Some(bar) = self.bar(stage, total) {
            bar.set_length(total as u64);
            bar.set_position(done as u64);
        }
    }

    fn on_finish(&self, stage: &str) {
        if let Some(bar) = self.bars.lock().ok().and_then(|mut bars| bars.remove(stage)) {
            bar.finish_with_message(format!("{} done", stage));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bars_are_created_and_removed_per_stage() {
        let p = BarProgress::new();
        p.on_progress("lr pairs", 1, 4);
        p.on_progress("lr pairs", 4, 4);
        assert_eq!(p.bars.lock().unwrap().len(), 1);
        p.on_finish("lr pairs");
        assert!(p.bars.lock().unwrap().is_empty());
        p.on_finish("never started");
    }
}
