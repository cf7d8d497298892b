//! Repository Build Resolver: clone, pick the release tag and package root, install,
//! build and pack, falling back through ordered candidate lists at each step.

pub mod candidates;
pub mod manifest;
pub mod outcome;
pub mod overrides;
pub mod package_manager;
pub mod resolve;
pub mod strategy;

pub use candidates::PackageName;
pub use outcome::{
    read_outcome, write_outcome, BuildFailure, BuildOutcome, BuildRequest, BuildSuccess,
};
pub use package_manager::PackageManager;
pub use resolve::{Resolver, StageFailure};
pub use strategy::BuildStrategy;
