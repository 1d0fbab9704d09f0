//! Shipkit Shared Utilities
//!
//! This crate contains the database helpers, config store access, and id
//! generation shared across the Shipkit platform.

pub mod config;
pub mod db;
pub mod id;

pub use config::{get_all_configs, get_config_value, save_configs, Configs};
pub use db::*;
pub use id::SnowflakeGenerator;
