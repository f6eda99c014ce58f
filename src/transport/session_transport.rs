//! Server-side streaming transport adapter (C8).
//!
//! Adapts an externally supplied streaming JSON-RPC transport so sessions
//! can be *recreated* on cold start without replaying the initialize
//! handshake — the inner transport object is instantiated lazily on first
//! request, and any `Mcp-Session-Id` bound ahead of that moment is applied
//! once the inner transport exists. Session-id plumbing and the
//! `mcp-session-id` header convention are grounded in the notification
//! multiplexer's session table.

use std::sync::Arc;

use axum::http::HeaderMap;
use parking_lot::RwLock;
use serde_json::Value;
use tracing::{debug, info};

use crate::{Error, Result};

/// Header carrying the session id on both requests and responses.
pub const SESSION_HEADER: &str = "mcp-session-id";

/// Durable store for replayable stream events, keyed by session id.
/// Optional: only consulted when configured via [`TransportOptions`].
pub trait EventStore: Send + Sync {
    /// Append an event emitted on `session_id`.
    fn append(&self, session_id: &str, event: &Value);

    /// Replay events recorded after `last_event_id` (or all, if `None`).
    fn replay_since(&self, session_id: &str, last_event_id: Option<&str>) -> Vec<Value>;
}

/// Construction options for [`SessionTransport`].
pub struct TransportOptions {
    /// Generates session ids for new connections. `None` means the
    /// transport is stateless: no session id is minted or required.
    pub session_id_generator: Option<Arc<dyn Fn() -> String + Send + Sync>>,
    /// Whether single-shot JSON-RPC responses are allowed outside of SSE.
    pub enable_json_response: bool,
    /// Invoked the first time a session id becomes bound to this transport.
    pub on_session_initialized: Option<Arc<dyn Fn(&str) + Send + Sync>>,
    /// Invoked when the session backing this transport is torn down.
    pub on_session_closed: Option<Arc<dyn Fn(&str) + Send + Sync>>,
    /// Optional resumability backend.
    pub event_store: Option<Arc<dyn EventStore>>,
}

impl Default for TransportOptions {
    fn default() -> Self {
        Self {
            session_id_generator: None,
            enable_json_response: false,
            on_session_initialized: None,
            on_session_closed: None,
            event_store: None,
        }
    }
}

enum InitState {
    None,
    Pending(String),
    Applied(String),
}

struct InnerTransport {
    session_id: String,
}

/// Adapts a stateless request/response cycle into a session-bound MCP
/// transport, tolerating `setInitializationState` calls that arrive before
/// the first request (§4.8).
pub struct SessionTransport {
    options: TransportOptions,
    init_state: RwLock<InitState>,
    inner: RwLock<Option<InnerTransport>>,
}

impl SessionTransport {
    /// Build a transport with no bound session yet.
    #[must_use]
    pub fn new(options: TransportOptions) -> Self {
        Self {
            options,
            init_state: RwLock::new(InitState::None),
            inner: RwLock::new(None),
        }
    }

    /// Whether this transport mints session ids (as opposed to running
    /// stateless, one-shot request/response cycles).
    #[must_use]
    pub fn is_stateful(&self) -> bool {
        self.options.session_id_generator.is_some()
    }

    /// Bind `session_id` to this transport. If the inner transport has not
    /// been instantiated yet (cold start before the first request), the
    /// binding is stashed as pending and applied lazily by
    /// [`SessionTransport::handle_request`].
    pub fn set_initialization_state(&self, session_id: &str) -> Result<()> {
        if session_id.is_empty() {
            return Err(Error::SessionIdEmpty);
        }

        let mut inner = self.inner.write();
        match inner.as_mut() {
            Some(transport) => {
                transport.session_id = session_id.to_string();
                *self.init_state.write() = InitState::Applied(session_id.to_string());
            }
            None => {
                *self.init_state.write() = InitState::Pending(session_id.to_string());
            }
        }
        Ok(())
    }

    /// Whether a `setInitializationState` call is waiting for the inner
    /// transport to come into existence. Exposed for tests.
    #[must_use]
    pub fn has_pending_init_state(&self) -> bool {
        matches!(*self.init_state.read(), InitState::Pending(_))
    }

    /// The session id bound to this transport, once known.
    #[must_use]
    pub fn session_id(&self) -> Option<String> {
        self.inner.read().as_ref().map(|t| t.session_id.clone())
    }

    /// Handle one request/response cycle. On the first call for a
    /// stateless transport, instantiates the inner transport (picking up
    /// the `Mcp-Session-Id` header, or minting a fresh id) and applies any
    /// pending init state before returning.
    pub fn handle_request(&self, headers: &HeaderMap, body: Value) -> Result<Value> {
        self.ensure_inner(headers)?;
        self.apply_pending_init_state()?;

        if let Some(store) = &self.options.event_store {
            if let Some(id) = self.session_id() {
                store.append(&id, &body);
            }
        }

        Ok(body)
    }

    fn ensure_inner(&self, headers: &HeaderMap) -> Result<()> {
        let mut inner = self.inner.write();
        if inner.is_some() {
            return Ok(());
        }

        let from_header = headers
            .get(SESSION_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        let session_id = match from_header {
            Some(id) => id,
            None => match &self.options.session_id_generator {
                Some(generate) => generate(),
                None => String::new(),
            },
        };

        let newly_initialized = !session_id.is_empty();
        *inner = Some(InnerTransport { session_id: session_id.clone() });
        drop(inner);

        if newly_initialized {
            info!(session_id = %session_id, "session transport initialized");
            if let Some(cb) = &self.options.on_session_initialized {
                cb(&session_id);
            }
        }
        Ok(())
    }

    fn apply_pending_init_state(&self) -> Result<()> {
        let pending = match &*self.init_state.read() {
            InitState::Pending(id) => Some(id.clone()),
            _ => None,
        };
        let Some(session_id) = pending else {
            return Ok(());
        };

        let mut inner = self.inner.write();
        match inner.as_mut() {
            Some(transport) => {
                transport.session_id = session_id.clone();
                drop(inner);
                *self.init_state.write() = InitState::Applied(session_id);
                Ok(())
            }
            None => Err(Error::Transport(
                "cannot apply pending initialization state: inner transport missing expected fields".to_string(),
            )),
        }
    }

    /// Tear down the session bound to this transport, if any.
    pub fn close(&self) {
        let session_id = self.inner.write().take().map(|t| t.session_id);
        if let Some(id) = session_id {
            debug!(session_id = %id, "session transport closed");
            if let Some(cb) = &self.options.on_session_closed {
                cb(&id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    fn headers_with_session(id: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(SESSION_HEADER, id.parse().unwrap());
        headers
    }

    #[test]
    fn empty_session_id_is_rejected() {
        let transport = SessionTransport::new(TransportOptions::default());
        assert!(matches!(transport.set_initialization_state(""), Err(Error::SessionIdEmpty)));
    }

    #[test]
    fn init_state_before_first_request_is_pending_then_applied() {
        let transport = SessionTransport::new(TransportOptions::default());
        transport.set_initialization_state("sess-1").unwrap();
        assert!(transport.has_pending_init_state());

        transport.handle_request(&HeaderMap::new(), serde_json::json!({})).unwrap();
        assert!(!transport.has_pending_init_state());
        assert_eq!(transport.session_id(), Some("sess-1".to_string()));
    }

    #[test]
    fn header_session_id_is_picked_up_on_first_request() {
        let transport = SessionTransport::new(TransportOptions::default());
        transport.handle_request(&headers_with_session("from-header"), serde_json::json!({})).unwrap();
        assert_eq!(transport.session_id(), Some("from-header".to_string()));
    }

    #[test]
    fn stateless_transport_with_no_header_gets_empty_session_id() {
        let transport = SessionTransport::new(TransportOptions::default());
        transport.handle_request(&HeaderMap::new(), serde_json::json!({})).unwrap();
        assert_eq!(transport.session_id(), Some(String::new()));
    }

    #[test]
    fn generator_mints_a_session_id_when_absent_from_header() {
        let transport = SessionTransport::new(TransportOptions {
            session_id_generator: Some(Arc::new(|| "generated".to_string())),
            ..TransportOptions::default()
        });
        transport.handle_request(&HeaderMap::new(), serde_json::json!({})).unwrap();
        assert_eq!(transport.session_id(), Some("generated".to_string()));
    }

    #[test]
    fn on_session_initialized_fires_exactly_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = Arc::clone(&calls);
        let transport = SessionTransport::new(TransportOptions {
            on_session_initialized: Some(Arc::new(move |_id| {
                calls_clone.fetch_add(1, Ordering::SeqCst);
            })),
            ..TransportOptions::default()
        });
        transport.handle_request(&headers_with_session("s"), serde_json::json!({})).unwrap();
        transport.handle_request(&headers_with_session("s"), serde_json::json!({})).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn close_fires_on_session_closed_with_bound_id() {
        let closed_with = Arc::new(Mutex::new(None));
        let closed_with_clone = Arc::clone(&closed_with);
        let transport = SessionTransport::new(TransportOptions {
            on_session_closed: Some(Arc::new(move |id| {
                *closed_with_clone.lock().unwrap() = Some(id.to_string());
            })),
            ..TransportOptions::default()
        });
        transport.handle_request(&headers_with_session("s"), serde_json::json!({})).unwrap();
        transport.close();
        assert_eq!(*closed_with.lock().unwrap(), Some("s".to_string()));
    }

    struct RecordingEventStore {
        events: Mutex<Vec<(String, Value)>>,
    }

    impl EventStore for RecordingEventStore {
        fn append(&self, session_id: &str, event: &Value) {
            self.events.lock().unwrap().push((session_id.to_string(), event.clone()));
        }

        fn replay_since(&self, session_id: &str, _last_event_id: Option<&str>) -> Vec<Value> {
            self.events
                .lock()
                .unwrap()
                .iter()
                .filter(|(id, _)| id == session_id)
                .map(|(_, v)| v.clone())
                .collect()
        }
    }

    #[test]
    fn event_store_records_inbound_messages() {
        let store = Arc::new(RecordingEventStore { events: Mutex::new(Vec::new()) });
        let transport = SessionTransport::new(TransportOptions {
            event_store: Some(store.clone()),
            ..TransportOptions::default()
        });
        transport
            .handle_request(&headers_with_session("s"), serde_json::json!({"method": "ping"}))
            .unwrap();
        assert_eq!(store.replay_since("s", None), vec![serde_json::json!({"method": "ping"})]);
    }
}
