//! MCP Session Runtime — binary entry point.
//!
//! Wires a minimal example tool/resource/prompt catalog into the runtime
//! and serves it over the Streamable-HTTP transport. Real deployments
//! supply their own [`mcp_session_runtime::flows::ToolCatalog`] and friends
//! instead of the demo catalog defined here.

use std::process::ExitCode;
use std::sync::Arc;

use async_trait::async_trait;
use clap::Parser;
use serde_json::{Value, json};
use tracing::{error, info};

use mcp_session_runtime::authz::{RefreshedTokens, TokenRefresher};
use mcp_session_runtime::cli::Cli;
use mcp_session_runtime::config::{AuthMode, Config, StorageBackend};
use mcp_session_runtime::flows::{PromptCatalog, ResourceCatalog, ToolCatalog};
use mcp_session_runtime::protocol::{Prompt, Resource, Tool};
use mcp_session_runtime::runtime::{Catalogs, Runtime};
use mcp_session_runtime::{Error, Result, server, setup_tracing};

/// A single `echo` tool, a single `readme` resource, a single `greeting`
/// prompt — enough to exercise the dispatcher without any external
/// collaborator.
struct ExampleCatalog;

#[async_trait]
impl ToolCatalog for ExampleCatalog {
    fn list_tools(&self) -> Vec<Tool> {
        vec![Tool {
            name: "echo".to_string(),
            title: Some("Echo".to_string()),
            description: Some("Returns its input unchanged".to_string()),
            input_schema: json!({"type": "object"}),
            output_schema: None,
            annotations: None,
        }]
    }

    async fn call_tool(&self, name: &str, arguments: Value) -> Result<Value> {
        if name != "echo" {
            return Err(Error::ToolNotAllowed(name.to_string()));
        }
        Ok(json!({ "content": [{ "type": "text", "text": arguments.to_string() }] }))
    }
}

#[async_trait]
impl ResourceCatalog for ExampleCatalog {
    fn list_resources(&self) -> Vec<Resource> {
        vec![Resource {
            uri: "example://readme".to_string(),
            name: "readme".to_string(),
            title: None,
            description: Some("Static example resource".to_string()),
            mime_type: Some("text/plain".to_string()),
            size: None,
        }]
    }

    async fn read_resource(&self, uri: &str) -> Result<Value> {
        if uri != "example://readme" {
            return Err(Error::ToolNotAllowed(uri.to_string()));
        }
        Ok(json!({ "contents": [{ "uri": uri, "text": "mcp-session-runtime example resource" }] }))
    }
}

#[async_trait]
impl PromptCatalog for ExampleCatalog {
    fn list_prompts(&self) -> Vec<Prompt> {
        vec![Prompt {
            name: "greeting".to_string(),
            title: None,
            description: Some("Greets the caller".to_string()),
            arguments: vec![],
        }]
    }

    async fn get_prompt(&self, name: &str, _arguments: Value) -> Result<Value> {
        if name != "greeting" {
            return Err(Error::ToolNotAllowed(name.to_string()));
        }
        Ok(json!({ "messages": [{ "role": "assistant", "content": { "type": "text", "text": "hello" } }] }))
    }
}

/// Stand-in for a federated OAuth provider. Any call to an orchestrated
/// authorization's `getToken` fails until a real provider is wired in.
struct UnconfiguredTokenRefresher;

#[async_trait]
impl TokenRefresher for UnconfiguredTokenRefresher {
    async fn refresh(&self, _provider_id: &str, _refresh_token: &str) -> Result<RefreshedTokens> {
        Err(Error::TokenNotAvailable)
    }
}

fn apply_cli_overrides(cli: &Cli, mut config: Config) -> Result<Config> {
    if let Some(port) = cli.port {
        config.server.port = port;
    }
    if let Some(host) = &cli.host {
        config.server.host = host.clone();
    }
    if let Some(mode) = &cli.auth_mode {
        config.auth.mode = match mode.to_lowercase().as_str() {
            "public" => AuthMode::Public,
            "forwarded" => AuthMode::Forwarded,
            "orchestrated" => AuthMode::Orchestrated,
            other => return Err(Error::Config(format!("unknown auth mode: {other}"))),
        };
    }
    if let Some(backend) = &cli.storage_backend {
        config.storage.backend = match backend.to_lowercase().as_str() {
            "memory" => StorageBackend::Memory,
            "redis" => StorageBackend::Redis,
            other => return Err(Error::Config(format!("unknown storage backend: {other}"))),
        };
    }
    Ok(config)
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = setup_tracing(&cli.log_level, cli.log_format.as_deref()) {
        eprintln!("failed to set up tracing: {e}");
        return ExitCode::FAILURE;
    }

    let config = match Config::load(cli.config.as_deref()).and_then(|c| apply_cli_overrides(&cli, c)) {
        Ok(config) => config,
        Err(e) => {
            error!("failed to load configuration: {e}");
            return ExitCode::FAILURE;
        }
    };

    info!(
        version = env!("CARGO_PKG_VERSION"),
        host = %config.server.host,
        port = config.server.port,
        auth_mode = ?config.auth.mode,
        "starting mcp-session-runtime"
    );

    let catalog = Arc::new(ExampleCatalog);
    let catalogs = Catalogs {
        tools: catalog.clone(),
        resources: catalog.clone(),
        prompts: catalog,
    };

    let token_refresher: Option<Arc<dyn TokenRefresher>> = if config.auth.mode == AuthMode::Orchestrated {
        Some(Arc::new(UnconfiguredTokenRefresher))
    } else {
        None
    };

    let runtime = match Runtime::new(config.clone(), token_refresher, catalogs) {
        Ok(runtime) => Arc::new(runtime),
        Err(e) => {
            error!("failed to build runtime: {e}");
            return ExitCode::FAILURE;
        }
    };

    if let Err(e) = server::run(&config, runtime).await {
        error!("server error: {e}");
        return ExitCode::FAILURE;
    }

    info!("mcp-session-runtime shutdown complete");
    ExitCode::SUCCESS
}
