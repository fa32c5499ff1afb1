//! Progress reporting for long-running operations.
//!
//! Components never talk to a terminal directly; they emit stage changes
//! through an injected [`ProgressSink`]. The CLI wires up a spinner, tests
//! and library embedders pass [`NullSink`].

use std::time::Duration;

use indicatif::{ProgressBar, ProgressStyle};

pub trait ProgressSink: Send + Sync {
    /// Announce that the operation entered a new stage.
    fn stage(&self, msg: &str);

    /// Announce that the operation finished and any display can be cleared.
    fn completed(&self);
}

/// Discards all progress events.
pub struct NullSink;

impl ProgressSink for NullSink {
    fn stage(&self, _msg: &str) {}
    fn completed(&self) {}
}

/// Terminal spinner that rewrites its message on each stage change.
pub struct SpinnerSink {
    bar: ProgressBar,
}

impl SpinnerSink {
    pub fn new() -> Self {
        let bar = ProgressBar::new_spinner();
        bar.set_style(
            ProgressStyle::with_template("{spinner} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner()),
        );
        bar.enable_steady_tick(Duration::from_millis(100));
        Self { bar }
    }
}

impl Default for SpinnerSink {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressSink for SpinnerSink {
    fn stage(&self, msg: &str) {
        self.bar.set_message(msg.to_string());
    }

    fn completed(&self) {
        self.bar.finish_and_clear();
    }
}
