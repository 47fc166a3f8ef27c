//! # shoal-core
//!
//! Core types for shoal, an interactive shell that runs one command across a
//! whole set of SSH hosts at once.
//!
//! This crate holds the pieces every other crate agrees on:
//!
//! - [`ShoalError`] and the [`Result`] alias
//! - [`ShoalConfig`], loaded from `~/.shoal/config.toml`
//! - [`HostSpec`] / [`HostTarget`], the `[user[:password]@]host[:port]` grammar
//! - [`JobStatus`], the pending / cancelled / exited contract

mod config;
mod error;
mod types;

pub use config::{duration_from_secs, ShoalConfig, DEFAULT_CONFIG_PATH};
pub use error::{Result, ShoalError};
pub use types::*;
