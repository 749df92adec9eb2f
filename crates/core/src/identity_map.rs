//! Identity Map, from internal message ID to per-platform native handle.
//!
//! A second write for the same `(message, platform)` overwrites the first
//! (last write wins). A reverse index resolves platform handles back to
//! internal IDs for operator edits, deletes and reply links.

use std::collections::HashMap;

use dashmap::DashMap;
use pocketping_bridge_core::NativeMessageId;

#[derive(Default)]
pub struct IdentityMap {
    forward: DashMap<String, HashMap<String, NativeMessageId>>,
    reverse: DashMap<(String, NativeMessageId), String>,
}

impl IdentityMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn save(&self, message_id: &str, platform: &str, native: NativeMessageId) {
        let previous = self
            .forward
            .entry(message_id.to_string())
            .or_default()
            .insert(platform.to_string(), native.clone());

        if let Some(previous) = previous {
            if previous != native {
                self.reverse.remove(&(platform.to_string(), previous));
            }
        }
        self.reverse
            .insert((platform.to_string(), native), message_id.to_string());
    }

    /// Every platform handle written so far for this message.
    pub fn get(&self, message_id: &str) -> HashMap<String, NativeMessageId> {
        self.forward
            .get(message_id)
            .map(|entry| entry.value().clone())
            .unwrap_or_default()
    }

    pub fn get_for(&self, message_id: &str, platform: &str) -> Option<NativeMessageId> {
        self.forward
            .get(message_id)
            .and_then(|entry| entry.get(platform).cloned())
    }

    /// Internal message ID for a platform's native handle.
    pub fn find_message(&self, platform: &str, native: &NativeMessageId) -> Option<String> {
        self.reverse
            .get(&(platform.to_string(), native.clone()))
            .map(|entry| entry.value().clone())
    }

    /// Drop every row for these messages (used by the retention sweep).
    pub fn forget<'a>(&self, message_ids: impl IntoIterator<Item = &'a str>) {
        for id in message_ids {
            if let Some((_, platforms)) = self.forward.remove(id) {
                for (platform, native) in platforms {
                    self.reverse.remove(&(platform, native));
                }
            }
        }
    }

    pub fn message_ids(&self) -> Vec<String> {
        self.forward.iter().map(|entry| entry.key().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.forward.len()
    }

    pub fn is_empty(&self) -> bool {
        self.forward.is_empty()
    }
}
