//! Side-effecting collaborators: processes, filesystem, generators, config.

pub mod actions;
pub mod config;
pub mod generator;
pub mod iteration_log;
pub mod process;
pub mod prompt;
pub mod workspace;
