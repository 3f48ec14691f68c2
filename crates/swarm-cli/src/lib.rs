//! `swarm` CLI Library
//!
//! Remote container management on top of a Docker Engine-compatible daemon,
//! with interactive sessions relayed through `swarm-relay`.

pub mod api_cmd;
pub mod container_cmd;
pub mod engine;
pub mod session_cmd;
