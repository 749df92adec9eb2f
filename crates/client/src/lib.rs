//! PocketPing visitor client
//!
//! Connects a widget to a PocketPing server. Realtime updates try WebSocket,
//! then SSE, then polling; whatever arrives is merged into one ordered,
//! duplicate-free message list.

pub mod client;
pub mod config;
pub mod error;
pub mod listeners;
pub mod negotiator;
pub mod poller;
pub mod reconciler;
pub mod transport;

pub use client::{ChatClient, ClientEvent, ClientSnapshot};
pub use config::ClientConfig;
pub use error::{ClientError, Result};
pub use listeners::{Listeners, Subscription, WILDCARD};
pub use negotiator::{ConnectionStatus, Transport};
pub use poller::{PollDecision, Poller};
pub use reconciler::{Applied, Reconciler};
pub use transport::{Api, EventStream, HttpApi, PushTransport, RemoteTransport};
