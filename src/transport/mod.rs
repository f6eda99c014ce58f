//! Transport Adapter (C8): server-side session-bound streaming transport.

mod session_transport;

pub use self::session_transport::{EventStore, SessionTransport, TransportOptions, SESSION_HEADER};
