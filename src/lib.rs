//! AccelMCP Gateway Library
//!
//! Admin-managed MCP gateway exposing REST APIs and remote MCP servers as
//! permissioned MCP endpoints.
//!
//! # Features
//!
//! - **Three-tier permissions**: MCP Service, App and Capability each carry
//!   public/restricted access control with per-account grants
//! - **Backend relay**: REST calls, chained HTTP MCP servers (daisy-chain
//!   depth limited via `X-AccelMCP-Depth`) and stdio MCP servers
//! - **Variables**: `{{NAME}}` substitution from a stored table or the
//!   process environment, with numeric typing
//! - **Connection logging**: masked, truncated records written by a
//!   background worker pool, with retention pruning
//!
//! # Protocol Version
//!
//! Implements MCP protocol version 2025-03-26 over plain JSON-RPC POST.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod admin;
pub mod audit;
pub mod cli;
pub mod config;
pub mod error;
pub mod gateway;
pub mod model;
pub mod naming;
pub mod permission;
pub mod protocol;
pub mod relay;
pub mod store;
pub mod variables;

pub use error::{Error, Result};

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Setup tracing/logging
pub fn setup_tracing(level: &str, format: Option<&str>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::registry().with(filter);

    match format {
        Some("json") => subscriber
            .with(fmt::layer().json())
            .try_init()
            .map_err(|e| Error::Internal(e.to_string()))?,
        _ => subscriber
            .with(fmt::layer())
            .try_init()
            .map_err(|e| Error::Internal(e.to_string()))?,
    }

    Ok(())
}
