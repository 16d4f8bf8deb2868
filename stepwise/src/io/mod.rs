//! I/O helpers for the runner and CLI commands.

pub mod audit;
pub mod backend;
pub mod capability;
pub mod config;
pub mod process;
pub mod prompt;
pub mod verify;
