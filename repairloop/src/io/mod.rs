//! Side-effecting parts of the orchestrator: files, processes, collaborators.

pub mod atomic;
pub mod config;
pub mod generator;
pub mod harness;
pub mod process;
pub mod run_log;
pub mod state_store;
pub mod tools;
pub mod workspace;
