//! Command line interface module
//!
//! Argument parsing and the runner that drives a listing or dump from them.

pub mod args;
pub mod runner;

pub use args::Args;
pub use runner::Runner;
