pub mod cache;
pub mod common;
pub mod completions;
pub mod config;
pub mod log;
pub mod sync;
