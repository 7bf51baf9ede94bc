//! Side-effecting adapters: persistence, messenger, checks, config.

pub mod checks;
pub mod config;
pub mod document;
pub mod init;
pub mod messenger;
pub mod process;
pub mod prompt;
pub mod records;
pub mod store;
