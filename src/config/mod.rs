//! Configuration module for Kherimoya.
//!
//! This module handles parsing, validation, and access to the settings that
//! shape how server instances are laid out on disk, launched, stopped, and
//! watched. It supports loading configurations from JSON or YAML files or
//! strings. Every field has a default, so an empty document (or no file at
//! all) is a valid configuration.
//!
//! # Examples
//!
//! Loading a configuration from a file:
//!
//! ```no_run
//! use kherimoya::config::Config;
//!
//! let config = Config::from_file("kherimoya.json").unwrap();
//! println!("Servers live under {}", config.servers_dir.display());
//! ```
//!
//! Adjusting a configuration programmatically:
//!
//! ```
//! use kherimoya::config::{Config, MultiplexerBackend};
//!
//! let mut config = Config::default();
//! config.session.backend = MultiplexerBackend::Process;
//! config.launch.ready_pattern = Some("Server started.".to_string());
//! kherimoya::config::validate_config(&config).unwrap();
//! ```
mod parser;
pub mod validator;

pub use parser::{
    Config, CrashPolicy, LaunchConfig, MonitorConfig, MultiplexerBackend, OrphanPolicy,
    PolicyConfig, SessionConfig, TimeoutConfig, CONFIG_FILE_NAMES,
};
pub use validator::validate_config;
