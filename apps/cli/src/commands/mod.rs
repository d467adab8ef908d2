//! Command implementations for the CipherScope CLI.

pub mod classify;
pub mod jobs;
pub mod models;
pub mod progress;
pub mod train;
pub mod types;

pub use types::{JobsCommand, ModelsCommand, SampleArg};
