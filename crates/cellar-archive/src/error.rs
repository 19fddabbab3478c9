use std::io;
use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("unsupported archive format: '{path}'")]
    UnsupportedFormat { path: PathBuf },

    #[error("{tool} exited with {}: {stderr}", exit_label(.code))]
    ToolFailed {
        tool:   String,
        code:   Option<i32>,
        stderr: String,
    },

    #[error("archive operation cancelled")]
    Cancelled,

    #[error("archive '{path}' has no entries")]
    EmptyArchive { path: PathBuf },

    #[error("archive entry '{entry}' cannot be used as a top-level directory")]
    InvalidEntry { entry: String },

    #[error("nothing to archive into '{output}'")]
    NoSources { output: PathBuf },

    #[error("failed to read '{path}': {source}")]
    Read { path: PathBuf, source: io::Error },

    #[error("failed to create '{path}': {source}")]
    CreateDir { path: PathBuf, source: io::Error },

    #[error("failed to supervise {tool}: {source}")]
    Supervise { tool: String, source: io::Error },

    #[error(transparent)]
    Process(#[from] cellar_platform::Error),

    #[error(transparent)]
    Fs(#[from] cellar_fs::Error),
}

fn exit_label(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("status {code}"),
        None => "a signal".to_string(),
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tool_failed_message() {
        let err = Error::ToolFailed {
            tool:   "tar".into(),
            code:   Some(2),
            stderr: "tar: game: Cannot stat".into(),
        };
        assert_eq!(err.to_string(), "tar exited with status 2: tar: game: Cannot stat");

        let err = Error::ToolFailed {
            tool:   "tar".into(),
            code:   None,
            stderr: String::new(),
        };
        assert!(err.to_string().contains("a signal"));
    }
}
