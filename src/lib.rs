//! TASKER library root.

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub mod cli;
pub mod commands;
pub mod core;
pub mod error;
pub type Result<T> = error::TaskerResult<T>;

pub mod services;
