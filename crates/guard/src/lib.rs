pub mod config;
pub mod constants;
pub mod core;
pub mod errors;
pub mod execution;
pub mod loader;
pub mod logging;
pub mod types;
