//! Catalog wire types and the JSON-RPC response envelope. Request framing
//! and the rest of the MCP message catalog are external collaborators'
//! concern, not this crate's.

mod messages;
mod types;

pub use messages::*;
pub use types::*;
