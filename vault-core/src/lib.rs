pub mod config;
pub mod connection;
pub mod constants;
pub mod error;
pub mod hooks;
pub mod jobs;
pub mod orchestrator;
pub mod retention;
pub mod scheduler;
pub mod ssh;
pub mod storage;
pub mod web;

pub use error::{Result, VaultError};
