//! telux simulation configuration management
//!
//! This crate provides configuration loading and parsing for the simulation layer:
//! - TOML configuration file parsing
//! - Simulation configuration structures
//! - Shared mutable simulation state

pub mod sim_config;
pub mod toml_config;

pub use sim_config::*;
pub use toml_config::*;
