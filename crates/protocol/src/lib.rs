//! PocketPing Protocol
//!
//! Shared types for communication between the PocketPing server, its
//! platform bridges and browser widgets. These types are serialized as
//! camelCase JSON over HTTP, WebSocket and SSE.

use uuid::Uuid;

pub mod client;
pub mod server;
pub mod types;

pub use client::ClientMessage;
pub use server::ServerEvent;
pub use types::*;

/// Generate a new unique ID
pub fn new_id() -> String {
    Uuid::new_v4().to_string()
}

/// Prefix used by widgets for optimistic messages that have no server ID yet.
pub const TEMP_ID_PREFIX: &str = "temp-";

/// Generate a client-side temporary message ID (`temp-<uuid>`).
pub fn new_temp_id() -> String {
    format!("{TEMP_ID_PREFIX}{}", Uuid::new_v4().simple())
}

/// Whether an ID was minted by [`new_temp_id`].
pub fn is_temp_id(id: &str) -> bool {
    id.starts_with(TEMP_ID_PREFIX)
}
