//! Ordered step execution with a terminal outcome.
//!
//! Steps run strictly in order on the calling thread. Cancellation is checked
//! before each step; the first failure stops the pipeline.

use std::fmt;

use crate::{BoxError, CancellationToken, PipelineObserver, Step, StepContext, StepError};

/// Where a pipeline is in its lifecycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineState {
    Pending,
    Running { step: String },
    Done,
    Failed { label: String },
    Cancelled { label: String },
}

impl PipelineState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Failed { .. } | Self::Cancelled { .. })
    }
}

/// Terminal result of [`Pipeline::run`].
pub enum Outcome {
    Done,
    Failed { label: String, error: BoxError },
    Cancelled { label: String },
}

impl Outcome {
    pub fn is_done(&self) -> bool { matches!(self, Self::Done) }

    /// Label of the step that failed or was cancelled.
    pub fn label(&self) -> Option<&str> {
        match self {
            Self::Done => None,
            Self::Failed { label, .. } | Self::Cancelled { label } => Some(label),
        }
    }

    pub fn summary(&self) -> OutcomeSummary {
        match self {
            Self::Done => OutcomeSummary::Done,
            Self::Failed { label, error } => OutcomeSummary::Failed {
                label:   label.clone(),
                message: error.to_string(),
            },
            Self::Cancelled { label } => OutcomeSummary::Cancelled {
                label: label.clone(),
            },
        }
    }
}

impl fmt::Debug for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Done => f.write_str("Done"),
            Self::Failed { label, error } => f
                .debug_struct("Failed")
                .field("label", label)
                .field("error", error)
                .finish(),
            Self::Cancelled { label } => f.debug_struct("Cancelled").field("label", label).finish(),
        }
    }
}

/// Cloneable rendering of an [`Outcome`] for observers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutcomeSummary {
    Done,
    Failed { label: String, message: String },
    Cancelled { label: String },
}

/// An ordered list of steps and the state of their execution.
#[derive(Debug)]
pub struct Pipeline {
    steps: Vec<Step>,
    state: PipelineState,
}

impl Pipeline {
    pub fn new(steps: Vec<Step>) -> Self {
        Self {
            steps,
            state: PipelineState::Pending,
        }
    }

    /// Append a step.
    pub fn step(mut self, step: Step) -> Self {
        self.steps.push(step);
        self
    }

    pub fn labels(&self) -> Vec<&str> { self.steps.iter().map(Step::label).collect() }

    pub fn state(&self) -> &PipelineState { &self.state }

    /// Run every pending step.
    ///
    /// Steps are consumed; running the same pipeline twice runs nothing the
    /// second time.
    pub fn run(&mut self, observer: &dyn PipelineObserver, token: &CancellationToken) -> Outcome {
        let outcome = self.drive(observer, token);

        let state = match &outcome {
            Outcome::Done => PipelineState::Done,
            Outcome::Failed { label, .. } => PipelineState::Failed {
                label: label.clone(),
            },
            Outcome::Cancelled { label } => PipelineState::Cancelled {
                label: label.clone(),
            },
        };
        self.enter(state, observer);

        match &outcome {
            Outcome::Done => tracing::info!("pipeline finished"),
            Outcome::Failed { label, error } => {
                tracing::info!(step = %label, error = %error, "pipeline failed")
            }
            Outcome::Cancelled { label } => tracing::info!(step = %label, "pipeline cancelled"),
        }

        observer.on_result(&outcome.summary());
        outcome
    }

    fn drive(&mut self, observer: &dyn PipelineObserver, token: &CancellationToken) -> Outcome {
        for step in std::mem::take(&mut self.steps) {
            let (label, action) = step.into_parts();

            if token.is_cancelled() {
                return Outcome::Cancelled { label };
            }

            self.enter(
                PipelineState::Running {
                    step: label.clone(),
                },
                observer,
            );
            tracing::info!(step = %label, "step started");
            observer.on_step_start(&label);

            let ctx = StepContext::new(&label, token, observer);
            match action(&ctx) {
                Ok(()) => {
                    tracing::info!(step = %label, "step finished");
                    observer.on_step_done(&label);
                }
                Err(StepError::Cancelled) => return Outcome::Cancelled { label },
                Err(StepError::Failed(error)) => {
                    observer.on_step_failed(&label, error.as_ref());
                    return Outcome::Failed { label, error };
                }
            }
        }
        Outcome::Done
    }

    fn enter(&mut self, state: PipelineState, observer: &dyn PipelineObserver) {
        observer.on_state(&state);
        self.state = state;
    }
}
