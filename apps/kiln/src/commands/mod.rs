//! CLI command implementations.

pub mod jobs;
pub mod providers;
pub mod run;
pub mod types;
