use std::fmt;

pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Why a step stopped early.
///
/// Any error type converts into `StepError::Failed` with `?`. For that
/// blanket conversion to exist `StepError` itself cannot implement
/// `std::error::Error`.
pub enum StepError {
    Cancelled,
    Failed(BoxError),
}

impl StepError {
    /// A failure carrying only a message.
    pub fn msg(message: impl Into<String>) -> Self { Self::Failed(message.into().into()) }

    pub fn boxed(error: BoxError) -> Self { Self::Failed(error) }
}

impl<E> From<E> for StepError
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn from(error: E) -> Self { Self::Failed(Box::new(error)) }
}

impl fmt::Debug for StepError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cancelled => f.write_str("Cancelled"),
            Self::Failed(e) => f.debug_tuple("Failed").field(e).finish(),
        }
    }
}

impl fmt::Display for StepError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cancelled => f.write_str("cancelled"),
            Self::Failed(e) => write!(f, "{e}"),
        }
    }
}

/// Errors raised while setting up a pipeline worker.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("failed to spawn worker thread '{name}': {source}")]
    Spawn {
        name:   String,
        source: std::io::Error,
    },
}

pub type Result<T> = std::result::Result<T, Error>;
