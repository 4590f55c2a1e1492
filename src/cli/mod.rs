//! Command line interface module
//!
//! Argument parsing and the runner that loads configuration and drives the
//! `sync` and `check` commands.

pub mod args;
pub mod runner;

pub use args::{Cli, Command};
pub use runner::Runner;
