//! Process spawning and current-user environment discovery.

pub use error::{Error, Result};

pub mod command;
pub mod dir;
mod error;
pub mod user;

pub use command::{Command, find_program, has_program};
