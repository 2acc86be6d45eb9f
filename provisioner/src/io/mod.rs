//! Side-effecting helpers: filesystem, configuration and child processes.

pub mod atomic;
pub mod config;
pub mod job_store;
pub mod outputs;
pub mod process;
pub mod workspace;
