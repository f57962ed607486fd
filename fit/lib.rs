#![deny(unused_variables)]
pub mod aggregate;
pub mod attempt;
pub mod config;
pub mod data;
pub mod memory;
pub mod model;
pub mod orchestrator;
pub mod output;
pub mod partition;
pub mod solver;
pub mod types;
pub mod validation;

pub use config::RunConfig;
pub use orchestrator::{RunError, execute, run, run_partitions};
