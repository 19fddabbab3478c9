use std::thread::JoinHandle;

use crate::{CancellationToken, Error, Result};

/// A pipeline running on its own named worker thread.
#[derive(Debug)]
pub struct PipelineHandle<T> {
    token:  CancellationToken,
    thread: JoinHandle<T>,
}

impl<T: Send + 'static> PipelineHandle<T> {
    /// Run `work` on a new thread, handing it the cancellation token.
    pub fn spawn<F>(name: impl Into<String>, work: F) -> Result<Self>
    where
        F: FnOnce(CancellationToken) -> T + Send + 'static,
    {
        let name = name.into();
        let token = CancellationToken::new();
        let worker_token = token.clone();
        let thread = std::thread::Builder::new()
            .name(name.clone())
            .spawn(move || work(worker_token))
            .map_err(|source| Error::Spawn { name, source })?;
        Ok(Self { token, thread })
    }
}

impl<T> PipelineHandle<T> {
    /// Request cooperative cancellation. Returns immediately.
    pub fn cancel(&self) { self.token.cancel(); }

    pub fn cancellation_token(&self) -> &CancellationToken { &self.token }

    pub fn is_finished(&self) -> bool { self.thread.is_finished() }

    /// Block until the worker returns. A panic on the worker is resumed here.
    pub fn join(self) -> T {
        match self.thread.join() {
            Ok(value) => value,
            Err(panic) => std::panic::resume_unwind(panic),
        }
    }
}
