//! CLI command modules.

pub mod client;
pub mod content;
pub mod directory;
