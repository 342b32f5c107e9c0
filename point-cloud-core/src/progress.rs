//! Progress reporting with cooperative cancellation.
//!
//! A `Progress` owns an optional terminal bar and a shared interrupt flag.
//! Worker threads poll `interrupted()` at the top of each chunk and at
//! point-increment granularity; any thread may `interrupt()` on a hard error
//! so the outer loop stops scheduling new chunks.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use indicatif::{ProgressBar, ProgressStyle};

#[derive(Clone)]
pub struct Progress {
    bar: Option<ProgressBar>,
    counter: Arc<AtomicU64>,
    interrupt: Arc<AtomicBool>,
    total: u64,
}

impl Progress {
    /// A silent progress with a fresh interrupt flag.
    pub fn hidden(total: u64) -> Self {
        Self {
            bar: None,
            counter: Arc::new(AtomicU64::new(0)),
            interrupt: Arc::new(AtomicBool::new(false)),
            total,
        }
    }

    /// A visible terminal progress bar.
    pub fn new(total: u64, prefix: &str) -> Self {
        let bar = ProgressBar::new(total);
        bar.set_style(
            ProgressStyle::default_bar()
                .template("{msg} [{bar:40.cyan/blue}] {pos}/{len} ({percent}%)")
                .unwrap()
                .progress_chars("▉▊▋▌▍▎▏ "),
        );
        bar.set_message(prefix.to_string());
        Self {
            bar: Some(bar),
            counter: Arc::new(AtomicU64::new(0)),
            interrupt: Arc::new(AtomicBool::new(false)),
            total,
        }
    }

    /// A child progress sharing this one's interrupt flag. Used by stages
    /// that report their own sub-totals inside a chunk.
    pub fn subprocess(&self, total: u64, prefix: &str) -> Self {
        let mut child = if self.bar.is_some() {
            Progress::new(total, prefix)
        } else {
            Progress::hidden(total)
        };
        child.interrupt = Arc::clone(&self.interrupt);
        child
    }

    pub fn inc(&self, delta: u64) {
        self.counter.fetch_add(delta, Ordering::Relaxed);
        if let Some(bar) = &self.bar {
            bar.inc(delta);
        }
    }

    pub fn update(&self, pos: u64) {
        self.counter.store(pos, Ordering::Relaxed);
        if let Some(bar) = &self.bar {
            bar.set_position(pos);
        }
    }

    pub fn position(&self) -> u64 {
        self.counter.load(Ordering::Relaxed)
    }

    pub fn total(&self) -> u64 {
        self.total
    }

    pub fn done(&self) {
        if let Some(bar) = &self.bar {
            bar.finish_and_clear();
        }
    }

    /// Raise the shared cancellation flag.
    pub fn interrupt(&self) {
        self.interrupt.store(true, Ordering::Relaxed);
    }

    pub fn interrupted(&self) -> bool {
        self.interrupt.load(Ordering::Relaxed)
    }

    /// Handle to the shared flag, for wiring external signal handlers.
    pub fn interrupt_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.interrupt)
    }
}

impl Default for Progress {
    fn default() -> Self {
        Self::hidden(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subprocess_shares_interrupt_flag() {
        let parent = Progress::hidden(10);
        let child = parent.subprocess(100, "child");
        assert!(!parent.interrupted());
        child.interrupt();
        assert!(parent.interrupted());
    }

    #[test]
    fn counting() {
        let p = Progress::hidden(100);
        p.inc(3);
        p.inc(4);
        assert_eq!(p.position(), 7);
        p.update(50);
        assert_eq!(p.position(), 50);
    }
}
