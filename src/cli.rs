//! Command-line interface

use std::path::PathBuf;

use clap::Parser;

/// MCP session runtime — session, authorization, and staged-flow-invoker
/// server for Model Context Protocol backends.
#[derive(Parser, Debug)]
#[command(name = "mcp-session-runtime")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file (YAML)
    #[arg(short, long, env = "MCP_RUNTIME_CONFIG")]
    pub config: Option<PathBuf>,

    /// Port to listen on
    #[arg(short, long, env = "MCP_RUNTIME_PORT")]
    pub port: Option<u16>,

    /// Host to bind to
    #[arg(long, env = "MCP_RUNTIME_HOST")]
    pub host: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", env = "MCP_RUNTIME_LOG_LEVEL")]
    pub log_level: String,

    /// Log format (text, json)
    #[arg(long, env = "MCP_RUNTIME_LOG_FORMAT")]
    pub log_format: Option<String>,

    /// Authorization mode (public, forwarded, orchestrated)
    #[arg(long, env = "MCP_RUNTIME_AUTH_MODE")]
    pub auth_mode: Option<String>,

    /// Storage backend (memory, redis)
    #[arg(long, env = "MCP_RUNTIME_STORAGE_BACKEND")]
    pub storage_backend: Option<String>,
}
