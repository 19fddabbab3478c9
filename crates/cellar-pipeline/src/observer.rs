//! Observer hooks for pipeline lifecycle events.
//!
//! Observers are called from the worker running the pipeline. A caller with
//! a single-threaded context (a UI loop) should use [`ChannelObserver`] and
//! drain the receiving end on its own thread.

use std::sync::mpsc;

use crate::{OutcomeSummary, PipelineState};

/// Lifecycle callbacks. Every hook defaults to a no-op.
pub trait PipelineObserver: Send + Sync {
    /// A step is about to run.
    fn on_step_start(&self, _label: &str) {}

    /// A step finished successfully.
    fn on_step_done(&self, _label: &str) {}

    /// A step returned an error. Not called for cancellation.
    fn on_step_failed(&self, _label: &str, _error: &(dyn std::error::Error + 'static)) {}

    /// Progress inside the running step, in `0.0..=1.0`.
    fn on_progress(&self, _label: &str, _fraction: f64) {}

    /// The pipeline moved to `state`: once per step, then once for the
    /// terminal state.
    fn on_state(&self, _state: &PipelineState) {}

    /// The pipeline reached a terminal state.
    fn on_result(&self, _outcome: &OutcomeSummary) {}
}

/// Ignores everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopObserver;

impl PipelineObserver for NoopObserver {}

/// Owned copy of an observer callback, for sending across threads.
#[derive(Debug, Clone, PartialEq)]
pub enum PipelineEvent {
    StepStarted(String),
    StepDone(String),
    StepFailed { label: String, message: String },
    Progress { label: String, fraction: f64 },
    Finished(OutcomeSummary),
}

/// Forwards every callback as a [`PipelineEvent`].
///
/// A disconnected receiver is not an error; events are dropped.
#[derive(Debug, Clone)]
pub struct ChannelObserver {
    tx: mpsc::Sender<PipelineEvent>,
}

impl ChannelObserver {
    pub fn new(tx: mpsc::Sender<PipelineEvent>) -> Self { Self { tx } }

    /// Observer plus the receiver to drain.
    pub fn channel() -> (Self, mpsc::Receiver<PipelineEvent>) {
        let (tx, rx) = mpsc::channel();
        (Self { tx }, rx)
    }

    fn send(&self, event: PipelineEvent) { let _ = self.tx.send(event); }
}

impl PipelineObserver for ChannelObserver {
    fn on_step_start(&self, label: &str) { self.send(PipelineEvent::StepStarted(label.to_string())); }

    fn on_step_done(&self, label: &str) { self.send(PipelineEvent::StepDone(label.to_string())); }

    fn on_step_failed(&self, label: &str, error: &(dyn std::error::Error + 'static)) {
        self.send(PipelineEvent::StepFailed {
            label:   label.to_string(),
            message: error.to_string(),
        });
    }

    fn on_progress(&self, label: &str, fraction: f64) {
        self.send(PipelineEvent::Progress {
            label: label.to_string(),
            fraction,
        });
    }

    fn on_result(&self, outcome: &OutcomeSummary) { self.send(PipelineEvent::Finished(outcome.clone())); }
}

impl<T: PipelineObserver + ?Sized> PipelineObserver for std::sync::Arc<T> {
    fn on_step_start(&self, label: &str) { (**self).on_step_start(label) }

    fn on_step_done(&self, label: &str) { (**self).on_step_done(label) }

    fn on_step_failed(&self, label: &str, error: &(dyn std::error::Error + 'static)) {
        (**self).on_step_failed(label, error)
    }

    fn on_progress(&self, label: &str, fraction: f64) { (**self).on_progress(label, fraction) }

    fn on_state(&self, state: &PipelineState) { (**self).on_state(state) }

    fn on_result(&self, outcome: &OutcomeSummary) { (**self).on_result(outcome) }
}
