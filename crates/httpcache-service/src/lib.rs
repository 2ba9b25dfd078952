#[macro_use]
pub mod metrics;

pub mod backend;
pub mod cache_error;
pub mod cache_key;
pub mod config;
pub mod coordinator;
pub mod logging;
pub mod types;
pub mod utils;
