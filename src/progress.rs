//! Progress reporting for long running cage jobs

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info};

use crate::job::CancelToken;

/// Receives progress of a labelled operation
pub trait ProgressReporter: Send + Sync {
    /// A new operation starts
    fn start(&self, label: &str);

    /// Fraction of completion in [0, 1]
    fn set_value(&self, value: f64);

    /// The operation is over, successful or not
    fn end(&self);
}

/// Reporter that writes progress to the log
#[derive(Debug, Default)]
pub struct LogProgress {
    state: Mutex<LogState>,
}

#[derive(Debug, Default)]
struct LogState {
    label: String,
    last_decile: u32,
}

impl ProgressReporter for LogProgress {
    fn start(&self, label: &str) {
        let mut state = self.state.lock();
        state.label = label.to_string();
        state.last_decile = 0;
        info!("{}...", label);
    }

    fn set_value(&self, value: f64) {
        let mut state = self.state.lock();
        let decile = (value.clamp(0.0, 1.0) * 10.0) as u32;
        if decile > state.last_decile {
            state.last_decile = decile;
            debug!("{}: {}%", state.label, decile * 10);
        }
    }

    fn end(&self) {
        let state = self.state.lock();
        info!("{} finished", state.label);
    }
}

/// Progress of a single background job.
///
/// Values only move forward: a lower value than the current one is ignored.
/// Updates are forwarded to an outer reporter for display until the job is
/// cancelled; `end` is always forwarded so the outer lifecycle stays paired.
pub struct JobProgress {
    bits: AtomicU64,
    outer: Arc<dyn ProgressReporter>,
    cancel: CancelToken,
}

impl JobProgress {
    pub fn new(outer: Arc<dyn ProgressReporter>) -> Self {
        Self::with_cancel(outer, CancelToken::new())
    }

    pub fn with_cancel(outer: Arc<dyn ProgressReporter>, cancel: CancelToken) -> Self {
        Self {
            bits: AtomicU64::new(0f64.to_bits()),
            outer,
            cancel,
        }
    }

    /// Current fraction of completion
    pub fn value(&self) -> f64 {
        f64::from_bits(self.bits.load(Ordering::Acquire))
    }
}

impl ProgressReporter for JobProgress {
    fn start(&self, label: &str) {
        self.outer.start(label);
    }

    fn set_value(&self, value: f64) {
        if !value.is_finite() {
            return;
        }
        // Bit patterns of non-negative floats order the same way as their values
        let clamped = value.clamp(0.0, 1.0);
        let previous = self.bits.fetch_max(clamped.to_bits(), Ordering::AcqRel);
        if clamped > f64::from_bits(previous) && !self.cancel.is_cancelled() {
            self.outer.set_value(clamped);
        }
    }

    fn end(&self) {
        self.outer.end();
    }
}

/// Maps the progress of one stage of a multi-stage operation onto its
/// share of the whole: `value` becomes `offset + value * span`.
pub struct Stage<'a> {
    inner: &'a dyn ProgressReporter,
    offset: f64,
    span: f64,
}

impl<'a> Stage<'a> {
    pub fn new(inner: &'a dyn ProgressReporter, offset: f64, span: f64) -> Self {
        Self { inner, offset, span }
    }
}

impl ProgressReporter for Stage<'_> {
    fn start(&self, label: &str) {
        self.inner.start(label);
    }

    fn set_value(&self, value: f64) {
        self.inner.set_value(self.offset + value.clamp(0.0, 1.0) * self.span);
    }

    // The enclosing operation owns the end of the lifecycle
    fn end(&self) {}
}
