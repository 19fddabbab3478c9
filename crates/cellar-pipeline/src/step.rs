use std::fmt;

use crate::{CancellationToken, PipelineObserver, StepError};

type Action = Box<dyn FnOnce(&StepContext<'_>) -> Result<(), StepError> + Send + 'static>;

/// A labelled unit of work. The action owns everything it needs.
pub struct Step {
    label:  String,
    action: Action,
}

impl Step {
    pub fn new<F>(label: impl Into<String>, action: F) -> Self
    where
        F: FnOnce(&StepContext<'_>) -> Result<(), StepError> + Send + 'static,
    {
        Self {
            label:  label.into(),
            action: Box::new(action),
        }
    }

    pub fn label(&self) -> &str { &self.label }

    pub(crate) fn into_parts(self) -> (String, Action) { (self.label, self.action) }
}

impl fmt::Debug for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Step").field("label", &self.label).finish_non_exhaustive()
    }
}

/// What a running step can see of its pipeline.
pub struct StepContext<'a> {
    label:    &'a str,
    token:    &'a CancellationToken,
    observer: &'a dyn PipelineObserver,
}

impl<'a> StepContext<'a> {
    pub(crate) fn new(
        label: &'a str,
        token: &'a CancellationToken,
        observer: &'a dyn PipelineObserver,
    ) -> Self {
        Self {
            label,
            token,
            observer,
        }
    }

    pub fn label(&self) -> &str { self.label }

    pub fn token(&self) -> &CancellationToken { self.token }

    pub fn is_cancelled(&self) -> bool { self.token.is_cancelled() }

    /// `Err(StepError::Cancelled)` once cancellation was requested.
    pub fn checkpoint(&self) -> Result<(), StepError> {
        if self.token.is_cancelled() {
            Err(StepError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Forward progress of the current step, clamped to `0.0..=1.0`.
    pub fn report_progress(&self, fraction: f64) {
        let fraction = if fraction.is_nan() { 0.0 } else { fraction.clamp(0.0, 1.0) };
        self.observer.on_progress(self.label, fraction);
    }
}
