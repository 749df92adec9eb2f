//! Named pub-sub registry for client callbacks.
//!
//! Callbacks subscribe to an event name or the wildcard `*`. The returned
//! [`Subscription`] removes exactly that callback when dropped or
//! unsubscribed.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, Weak};

pub const WILDCARD: &str = "*";

type Callback<T> = Arc<dyn Fn(&T) + Send + Sync>;
type Table<T> = RwLock<HashMap<String, Vec<(u64, Callback<T>)>>>;

struct Inner<T> {
    next_id: AtomicU64,
    callbacks: Table<T>,
}

trait Unsubscribe: Send + Sync {
    fn remove(&self, name: &str, id: u64);
}

impl<T: 'static> Unsubscribe for Inner<T> {
    fn remove(&self, name: &str, id: u64) {
        let mut callbacks = self
            .callbacks
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(list) = callbacks.get_mut(name) {
            list.retain(|(cid, _)| *cid != id);
            if list.is_empty() {
                callbacks.remove(name);
            }
        }
    }
}

pub struct Listeners<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Default for Listeners<T> {
    fn default() -> Self {
        Self {
            inner: Arc::new(Inner {
                next_id: AtomicU64::new(0),
                callbacks: RwLock::new(HashMap::new()),
            }),
        }
    }
}

impl<T: 'static> Listeners<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on(&self, name: &str, callback: impl Fn(&T) + Send + Sync + 'static) -> Subscription {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner
            .callbacks
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .entry(name.to_string())
            .or_default()
            .push((id, Arc::new(callback)));

        let weak: Weak<dyn Unsubscribe> = Arc::downgrade(&self.inner) as Weak<dyn Unsubscribe>;
        Subscription {
            owner: weak,
            name: name.to_string(),
            id,
        }
    }

    /// Call every callback for `name`, then the wildcard ones. Returns how
    /// many ran. Callbacks run outside the lock and may subscribe freely.
    pub fn emit(&self, name: &str, value: &T) -> usize {
        let matching: Vec<Callback<T>> = {
            let callbacks = self
                .inner
                .callbacks
                .read()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            let named = callbacks.get(name).into_iter().flatten();
            let wildcard = callbacks.get(WILDCARD).into_iter().flatten();
            named.chain(wildcard).map(|(_, cb)| cb.clone()).collect()
        };
        for callback in &matching {
            callback(value);
        }
        matching.len()
    }

    pub fn len(&self) -> usize {
        self.inner
            .callbacks
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .values()
            .map(Vec::len)
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[must_use = "dropping a Subscription removes its callback"]
pub struct Subscription {
    owner: Weak<dyn Unsubscribe>,
    name: String,
    id: u64,
}

impl Subscription {
    pub fn unsubscribe(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(owner) = self.owner.upgrade() {
            owner.remove(&self.name, self.id);
        }
    }
}
