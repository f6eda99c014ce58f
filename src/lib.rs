//! MCP Session Runtime
//!
//! A session + authorization + staged-flow-invoker runtime for Model
//! Context Protocol servers: session lifecycle, three-mode authorization
//! (anonymous/forwarded/orchestrated) with an encrypted per-authorization
//! token vault, approval-gated tool access, and a staged pipeline invoker
//! that drives registered flows through pre/execute/post/finalize/error
//! stages.
//!
//! # Protocol Version
//!
//! Wire types track MCP protocol version 2024-11-05.

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod approval;
pub mod authz;
pub mod cli;
pub mod config;
pub mod crypto;
pub mod error;
pub mod flow;
pub mod flows;
pub mod invoker;
pub mod protocol;
pub mod runtime;
pub mod server;
pub mod session;
pub mod storage;
pub mod transport;
pub mod vault;

pub use error::{Error, Result};

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// MCP Protocol version supported by this gateway
pub const MCP_PROTOCOL_VERSION: &str = "2024-11-05";

/// Setup tracing/logging
pub fn setup_tracing(level: &str, format: Option<&str>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::registry().with(filter);

    match format {
        Some("json") => {
            subscriber.with(fmt::layer().json()).init();
        }
        _ => {
            subscriber.with(fmt::layer()).init();
        }
    }

    Ok(())
}
