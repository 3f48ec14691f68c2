//! Remote daemon (Docker Engine-compatible API) integration.
//!
//! Provides a blocking reqwest-based client covering exec instances,
//! container lifecycle and the attach handshake the relay needs.

mod client;
pub mod types;
mod upgrade;


pub use client::EngineClient;
pub use types::{ContainerConfig, ContainerSummary, Created, ExecConfig, ExecInspect};
