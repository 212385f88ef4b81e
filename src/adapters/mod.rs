//! Concrete implementations of the `ports` traits.

pub mod git_cli;
pub mod github;
