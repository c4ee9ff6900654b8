pub mod app;
pub mod backoff;
pub mod cli;
pub mod config;
pub mod config_counts;
pub mod cost;
pub mod error;
pub mod extra;
pub mod git;
pub mod memory;
pub mod process;
pub mod speed;
pub mod stats;
pub mod stdin;
pub mod store;
pub mod transcript;
pub mod usage;
pub mod util;
