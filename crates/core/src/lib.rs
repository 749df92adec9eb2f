//! PocketPing Core
//!
//! Bidirectional message sync between browser widgets and operator
//! platforms: the message store, bridge registry and dispatcher, the
//! identity map and the realtime gateway, tied together by
//! [`ChatService`].

pub mod dispatcher;
pub mod error;
pub mod events;
pub mod gateway;
pub mod identity_map;
pub mod ip_filter;
mod operator;
pub mod registry;
pub mod service;
pub mod store;
pub mod ua_filter;
pub mod user_agent;
pub mod version;
pub mod webhook;

#[cfg(test)]
mod testing;

pub use dispatcher::{Dispatcher, Origin, ReplyTarget};
pub use error::{Error, Result, StorageError};
pub use events::{EventHandler, Subscription};
pub use gateway::{Gateway, Registration};
pub use identity_map::IdentityMap;
pub use ip_filter::{FilterDecision, FilterMode, IpFilter};
pub use registry::BridgeRegistry;
pub use service::{ChatService, ConnectOutcome, ServiceConfig};
pub use store::{MemoryStore, MessageStore, SessionUpdate};
pub use ua_filter::UaFilter;
pub use version::VersionCheck;
pub use webhook::{WebhookConfig, WebhookForwarder};
