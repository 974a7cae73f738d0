//! vbstore Common - Shared types and utilities
//!
//! This crate provides the vbucket identifiers and states, the closed set of
//! client-visible outcome codes, error definitions and engine configuration
//! used across all vbstore components.

pub mod config;
pub mod error;
pub mod types;

pub use config::EngineConfig;
pub use error::{Error, Result};
pub use types::*;
