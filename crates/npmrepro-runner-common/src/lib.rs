//! Process plumbing shared by the resolver (inside the sandbox) and the host pipeline.

pub mod command;
pub mod sandbox_backend;

#[cfg(any(test, feature = "testing"))]
pub mod scripted;

pub use command::{tail_truncate, CommandOutput, CommandRunner, CommandSpec, SystemRunner};
