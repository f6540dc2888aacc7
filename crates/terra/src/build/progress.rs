//! Progress display for builds
//!
//! This module provides progress bar functionality using indicatif,
//! integrated with tracing for clean log output.

use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

/// Progress manager for one pipeline run
pub struct BuildProgress {
    /// Multi-progress container for all progress bars
    multi: MultiProgress,
    /// Spinner of the stage currently running
    step: Mutex<Option<(String, ProgressBar)>>,
    /// Completed stages count
    completed: AtomicUsize,
    /// Total stages count
    total: usize,
    /// Main progress bar showing overall progress
    main_bar: ProgressBar,
}

impl BuildProgress {
    /// Create a progress display attached to an existing multi-progress
    /// (the one the tracing layer writes through).
    pub fn new(multi: MultiProgress, total: usize) -> Self {
        let main_bar = multi.add(ProgressBar::new(total as u64));
        main_bar.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.green} [{elapsed_precise}] [{bar:30.cyan/blue}] {pos}/{len} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("#>-"),
        );
        main_bar.enable_steady_tick(Duration::from_millis(100));

        Self {
            multi,
            step: Mutex::new(None),
            completed: AtomicUsize::new(0),
            total,
            main_bar,
        }
    }

    /// A display that draws nothing (tests, `--quiet`, non-terminal output)
    pub fn hidden(total: usize) -> Self {
        let multi = MultiProgress::with_draw_target(indicatif::ProgressDrawTarget::hidden());
        Self::new(multi, total)
    }

    /// Start a stage
    pub fn start_stage(&self, stage: &str, detail: &str) {
        let bar = self.multi.add(ProgressBar::new_spinner());
        bar.set_style(
            ProgressStyle::default_spinner()
                .template("  {spinner:.yellow} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner()),
        );
        bar.set_message(format!("{} ({})", stage, detail));
        bar.enable_steady_tick(Duration::from_millis(100));

        if let Ok(mut step) = self.step.lock()
            && let Some((_, previous)) = step.replace((stage.to_string(), bar))
        {
            previous.finish_and_clear();
        }
    }

    /// Show the latest output line of the running stage
    pub fn update(&self, line: &str) {
        if let Ok(step) = self.step.lock()
            && let Some((stage, bar)) = step.as_ref()
        {
            bar.set_message(format!("{}: {}", stage, line.trim()));
        }
    }

    /// Mark the running stage as completed
    pub fn finish_stage(&self) {
        if let Ok(mut step) = self.step.lock()
            && let Some((_, bar)) = step.take()
        {
            bar.finish_and_clear();
        }
        self.advance();
    }

    /// Mark a stage as skipped (cache hit, nothing to build)
    pub fn skip_stage(&self, _stage: &str) {
        // No spinner for skipped stages, just move the counter
        self.advance();
    }

    /// Mark the running stage as failed
    pub fn fail_stage(&self, error: &str) {
        if let Ok(mut step) = self.step.lock()
            && let Some((stage, bar)) = step.take()
        {
            bar.abandon_with_message(format!("{}: FAILED - {}", stage, error));
        }
    }

    fn advance(&self) {
        let completed = self.completed.fetch_add(1, Ordering::SeqCst) + 1;
        self.main_bar.set_position(completed as u64);
    }

    /// Number of stages completed or skipped so far
    pub fn completed(&self) -> usize {
        self.completed.load(Ordering::SeqCst)
    }

    /// Finish all progress bars
    pub fn finish(&self, message: &str) {
        self.main_bar.finish_with_message(format!(
            "{} ({}/{} stages)",
            message,
            self.completed(),
            self.total
        ));
    }

    /// Suspend progress bars during a closure (for clean output)
    pub fn suspend<F, R>(&self, f: F) -> R
    where
        F: FnOnce() -> R,
    {
        self.multi.suspend(f)
    }
}

impl Drop for BuildProgress {
    fn drop(&mut self) {
        if let Ok(mut step) = self.step.lock()
            && let Some((_, bar)) = step.take()
        {
            bar.finish_and_clear();
        }
        if !self.main_bar.is_finished() {
            self.main_bar.finish_and_clear();
        }
    }
}
