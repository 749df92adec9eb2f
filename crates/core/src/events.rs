//! Server-side handlers for custom widget events.
//!
//! Handlers register under an event name or the wildcard `*`. Registration
//! returns a [`Subscription`]; dropping it (or calling `unsubscribe`)
//! removes exactly that handler.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, Weak};

use pocketping_protocol::{CustomEvent, Session};

pub const WILDCARD: &str = "*";

pub type EventHandler = Arc<dyn Fn(&CustomEvent, &Session) + Send + Sync>;

#[derive(Default)]
pub(crate) struct HandlerTable {
    next_id: AtomicU64,
    handlers: RwLock<HashMap<String, Vec<(u64, EventHandler)>>>,
}

impl HandlerTable {
    pub(crate) fn subscribe(self: &Arc<Self>, name: &str, handler: EventHandler) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.handlers
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .entry(name.to_string())
            .or_default()
            .push((id, handler));
        Subscription {
            table: Arc::downgrade(self),
            name: name.to_string(),
            id,
        }
    }

    fn remove(&self, name: &str, id: u64) {
        let mut handlers = self
            .handlers
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(list) = handlers.get_mut(name) {
            list.retain(|(hid, _)| *hid != id);
            if list.is_empty() {
                handlers.remove(name);
            }
        }
    }

    /// Handlers for `name` followed by wildcard handlers.
    fn matching(&self, name: &str) -> Vec<EventHandler> {
        let handlers = self
            .handlers
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let named = handlers.get(name).into_iter().flatten();
        let wildcard = handlers.get(WILDCARD).into_iter().flatten();
        named.chain(wildcard).map(|(_, h)| h.clone()).collect()
    }

    /// Run matching handlers outside the lock. Returns how many ran.
    pub(crate) fn dispatch(&self, event: &CustomEvent, session: &Session) -> usize {
        let handlers = self.matching(&event.name);
        for handler in &handlers {
            handler(event, session);
        }
        handlers.len()
    }
}

/// Registration token for an event handler.
#[must_use = "dropping a Subscription unregisters its handler"]
pub struct Subscription {
    table: Weak<HandlerTable>,
    name: String,
    id: u64,
}

impl Subscription {
    pub fn unsubscribe(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(table) = self.table.upgrade() {
            table.remove(&self.name, self.id);
        }
    }
}
