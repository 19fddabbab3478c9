//! Sequential, cancellable, observable step pipelines.
//!
//! A [`Pipeline`] is an ordered list of labelled [`Step`]s. It runs them one
//! after another, checks a [`CancellationToken`] before each, and reports
//! lifecycle events to a [`PipelineObserver`]. [`PipelineHandle`] moves the
//! whole run onto a dedicated worker thread.

mod cancel;
mod error;
mod handle;
mod observer;
mod pipeline;
mod step;

pub use cancel::CancellationToken;
pub use error::{BoxError, Error, Result, StepError};
pub use handle::PipelineHandle;
pub use observer::{ChannelObserver, NoopObserver, PipelineEvent, PipelineObserver};
pub use pipeline::{Outcome, OutcomeSummary, Pipeline, PipelineState};
pub use step::{Step, StepContext};
