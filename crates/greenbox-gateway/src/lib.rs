//! greenbox-gateway — HTTP API for greenbox
//!
//! Clients post a GitHub repository URL plus per-run overrides; the gateway
//! downloads the code, runs it in the sandbox and answers with the measured
//! usage and energy estimate.

pub mod protocol;
pub mod server;

pub use server::GatewayServer;
