pub mod app;
pub mod archive;
pub mod bids;
pub mod command;
pub mod config;
pub mod domain;
pub mod error;
pub mod executor;
pub mod fs_util;
pub mod output;
pub mod performance;
pub mod platform;
pub mod run_level;
pub mod workspace;
