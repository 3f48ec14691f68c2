//! `swarm` Core Library
//!
//! Shared functionality for `swarm` components:
//! - Remote API registry (`~/.swarm/config.json`) and endpoint resolution
//! - Tracing initialization
//! - Common error types

pub mod config;
pub mod error;
pub mod tracing_init;

pub use config::{ApiRegistry, Endpoint};
pub use error::{Error, Result};
