//! End-to-end scenario tests (§8 S1, S2) driven entirely through the public
//! `Runtime` surface, without a live server process — the teacher's
//! `tests/integration_tests.rs` drives a running gateway over HTTP, but
//! nothing here needs the network to exercise the session/authorization/
//! invoker pipeline.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Value, json};

use mcp_session_runtime::authz::Authorization;
use mcp_session_runtime::config::{AuthConfig, AuthMode, Config};
use mcp_session_runtime::flows::{PromptCatalog, ResourceCatalog, ToolCatalog};
use mcp_session_runtime::protocol::{Prompt, Resource, Tool};
use mcp_session_runtime::runtime::{Catalogs, Runtime};
use mcp_session_runtime::session::ClientInfo;
use mcp_session_runtime::{Error, Result};

struct FixtureCatalog;

#[async_trait]
impl ToolCatalog for FixtureCatalog {
    fn list_tools(&self) -> Vec<Tool> {
        vec![Tool {
            name: "search".to_string(),
            title: None,
            description: None,
            input_schema: json!({"type": "object"}),
            output_schema: None,
            annotations: None,
        }]
    }

    async fn call_tool(&self, name: &str, arguments: Value) -> Result<Value> {
        if name != "search" {
            return Err(Error::ToolNotAllowed(name.to_string()));
        }
        Ok(json!({ "results": [], "query": arguments }))
    }
}

#[async_trait]
impl ResourceCatalog for FixtureCatalog {
    fn list_resources(&self) -> Vec<Resource> {
        vec![]
    }
    async fn read_resource(&self, uri: &str) -> Result<Value> {
        Err(Error::ToolNotAllowed(uri.to_string()))
    }
}

#[async_trait]
impl PromptCatalog for FixtureCatalog {
    fn list_prompts(&self) -> Vec<Prompt> {
        vec![]
    }
    async fn get_prompt(&self, name: &str, _arguments: Value) -> Result<Value> {
        Err(Error::ToolNotAllowed(name.to_string()))
    }
}

fn fixture_catalogs() -> Catalogs {
    let catalog = Arc::new(FixtureCatalog);
    Catalogs {
        tools: catalog.clone(),
        resources: catalog.clone(),
        prompts: catalog,
    }
}

/// S1 — anonymous public flow: initialize with no token creates a session,
/// `tools/list` returns the catalog, and `tools/call` succeeds.
#[tokio::test]
async fn anonymous_public_flow_allows_listing_and_calling_tools() {
    let config = Config {
        auth: AuthConfig {
            mode: AuthMode::Public,
            anonymous_scopes: vec!["anonymous".to_string()],
        },
        ..Config::default()
    };
    let runtime = Runtime::new(config, None, fixture_catalogs()).unwrap();

    let (session, authorization) = runtime
        .create_session(ClientInfo { name: "cli".to_string(), version: "1.0".to_string() }, Value::Null, None)
        .await
        .unwrap();
    assert!(matches!(authorization.as_ref(), Authorization::Anonymous(_)));
    assert_eq!(session.anonymous_scopes, vec!["anonymous".to_string()]);

    let listed = runtime.dispatch(json!({"method": "tools/list"}), &session.id, None).await.unwrap();
    assert_eq!(listed["tools"][0]["name"], "search");

    let called = runtime
        .dispatch(
            json!({"method": "tools/call", "params": {"name": "search", "arguments": {"q": "rust"}}}),
            &session.id,
            None,
        )
        .await
        .unwrap();
    assert_eq!(called["query"]["q"], "rust");
}

/// S2 (partial) — forwarded bearer: any non-empty token is accepted and
/// projected into an authorization id derived from the token, independent
/// of session identity.
#[tokio::test]
async fn forwarded_mode_requires_a_token() {
    let config = Config {
        auth: AuthConfig {
            mode: AuthMode::Forwarded,
            anonymous_scopes: vec![],
        },
        ..Config::default()
    };
    let runtime = Runtime::new(config, None, fixture_catalogs()).unwrap();

    let missing_token = runtime
        .create_session(ClientInfo { name: "cli".to_string(), version: "1.0".to_string() }, Value::Null, None)
        .await;
    assert!(matches!(missing_token, Err(Error::InvalidToken)));

    let (session, authorization) = runtime
        .create_session(
            ClientInfo { name: "cli".to_string(), version: "1.0".to_string() },
            Value::Null,
            Some("token-abc".to_string()),
        )
        .await
        .unwrap();
    assert!(matches!(authorization.as_ref(), Authorization::Forwarded(_)));
    assert_eq!(session.authorization_id, authorization.id());
}

/// Closing a session makes it unreachable for further dispatch.
#[tokio::test]
async fn closed_session_is_rejected_on_next_dispatch() {
    let config = Config::default();
    let runtime = Runtime::new(config, None, fixture_catalogs()).unwrap();

    let (session, _authorization) = runtime
        .create_session(ClientInfo { name: "cli".to_string(), version: "1.0".to_string() }, Value::Null, None)
        .await
        .unwrap();

    runtime.close_session(&session.id).await.unwrap();

    let result = runtime.dispatch(json!({"method": "tools/list"}), &session.id, None).await;
    assert!(matches!(result, Err(Error::SessionExpired)));
}

/// Unregistered methods are rejected with `FlowNotFound`, not routed to any
/// flow's default `execute` stage.
#[tokio::test]
async fn unknown_method_is_rejected() {
    let config = Config::default();
    let runtime = Runtime::new(config, None, fixture_catalogs()).unwrap();
    let (session, _authorization) = runtime
        .create_session(ClientInfo { name: "cli".to_string(), version: "1.0".to_string() }, Value::Null, None)
        .await
        .unwrap();

    let result = runtime.dispatch(json!({"method": "not/a/real/method"}), &session.id, None).await;
    assert!(matches!(result, Err(Error::FlowNotFound)));
}
