//! Message Store: authoritative sessions and messages.
//!
//! The store is inert: no notification logic lives here. `ChatService`
//! writes to it first and fans out afterwards, so any backend (memory,
//! SQL, KV) can sit behind [`MessageStore`].

use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use pocketping_protocol::{Message, Session};

use crate::error::{Error, Result, StorageError};

/// In-place change applied to a stored session. Must not touch `id` or
/// `visitor_id`.
pub type SessionUpdate<'a> = Box<dyn FnOnce(&mut Session) + Send + 'a>;

#[async_trait]
pub trait MessageStore: Send + Sync {
    async fn create_session(&self, session: Session) -> Result<()>;

    async fn get_session(&self, id: &str) -> Result<Option<Session>>;

    /// Most recently created session for this visitor.
    async fn get_session_by_visitor_id(&self, visitor_id: &str) -> Result<Option<Session>>;

    /// Fails with `SessionNotFound` when the session does not exist.
    async fn update_session(&self, session: Session) -> Result<()>;

    /// Apply `update` to the stored session atomically and return the
    /// result. Concurrent updates of different fields never overwrite each
    /// other. Fails with `SessionNotFound` when the session does not exist.
    async fn update_session_with(&self, id: &str, update: SessionUpdate<'_>) -> Result<Session>;

    /// Remove a session and every message it owns.
    async fn delete_session(&self, id: &str) -> Result<()>;

    /// Upsert by ID. A new message is appended to its session's history;
    /// an existing one keeps its position.
    async fn save_message(&self, message: Message) -> Result<()>;

    async fn get_message(&self, id: &str) -> Result<Option<Message>>;

    /// Messages strictly after `after_id` in creation order, at most `limit`.
    /// An `after_id` the session does not know returns from the start.
    async fn get_messages(
        &self,
        session_id: &str,
        after_id: Option<&str>,
        limit: usize,
    ) -> Result<Vec<Message>>;

    /// Delete sessions whose last activity is before `older_than`.
    /// Returns the IDs of the removed sessions.
    async fn cleanup_old_sessions(&self, older_than: DateTime<Utc>) -> Result<Vec<String>>;
}

#[derive(Default)]
struct SessionTable {
    by_id: HashMap<String, Session>,
    /// Session IDs per visitor, in creation order.
    by_visitor: HashMap<String, Vec<String>>,
}

impl SessionTable {
    fn unlink_visitor(&mut self, visitor_id: &str, session_id: &str) {
        if let Some(ids) = self.by_visitor.get_mut(visitor_id) {
            ids.retain(|id| id != session_id);
            if ids.is_empty() {
                self.by_visitor.remove(visitor_id);
            }
        }
    }
}

#[derive(Default)]
struct MessageTable {
    by_id: HashMap<String, Message>,
    /// Message IDs per session, in creation order.
    order: HashMap<String, Vec<String>>,
}

impl MessageTable {
    fn remove_session(&mut self, session_id: &str) {
        if let Some(ids) = self.order.remove(session_id) {
            for id in ids {
                self.by_id.remove(&id);
            }
        }
    }
}

/// In-memory reference store with one lock per collection.
///
/// Locks are never held across an await point. When both are needed the
/// session lock is taken first.
#[derive(Default)]
pub struct MemoryStore {
    sessions: RwLock<SessionTable>,
    messages: RwLock<MessageTable>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn sessions(&self) -> Result<RwLockReadGuard<'_, SessionTable>> {
        self.sessions
            .read()
            .map_err(|_| StorageError::Poisoned.into())
    }

    fn sessions_mut(&self) -> Result<RwLockWriteGuard<'_, SessionTable>> {
        self.sessions
            .write()
            .map_err(|_| StorageError::Poisoned.into())
    }

    fn messages(&self) -> Result<RwLockReadGuard<'_, MessageTable>> {
        self.messages
            .read()
            .map_err(|_| StorageError::Poisoned.into())
    }

    fn messages_mut(&self) -> Result<RwLockWriteGuard<'_, MessageTable>> {
        self.messages
            .write()
            .map_err(|_| StorageError::Poisoned.into())
    }
}

#[async_trait]
impl MessageStore for MemoryStore {
    async fn create_session(&self, session: Session) -> Result<()> {
        let mut table = self.sessions_mut()?;
        if let Some(previous) = table.by_id.get(&session.id).map(|s| s.visitor_id.clone()) {
            table.unlink_visitor(&previous, &session.id);
        }
        table
            .by_visitor
            .entry(session.visitor_id.clone())
            .or_default()
            .push(session.id.clone());
        table.by_id.insert(session.id.clone(), session);
        Ok(())
    }

    async fn get_session(&self, id: &str) -> Result<Option<Session>> {
        Ok(self.sessions()?.by_id.get(id).cloned())
    }

    async fn get_session_by_visitor_id(&self, visitor_id: &str) -> Result<Option<Session>> {
        let table = self.sessions()?;
        let latest = table
            .by_visitor
            .get(visitor_id)
            .and_then(|ids| ids.iter().rev().find_map(|id| table.by_id.get(id)))
            .cloned();
        Ok(latest)
    }

    async fn update_session(&self, session: Session) -> Result<()> {
        let mut table = self.sessions_mut()?;
        match table.by_id.get_mut(&session.id) {
            Some(slot) => {
                *slot = session;
                Ok(())
            }
            None => Err(Error::SessionNotFound(session.id)),
        }
    }

    async fn update_session_with(&self, id: &str, update: SessionUpdate<'_>) -> Result<Session> {
        let mut table = self.sessions_mut()?;
        let session = table
            .by_id
            .get_mut(id)
            .ok_or_else(|| Error::SessionNotFound(id.to_string()))?;
        update(session);
        Ok(session.clone())
    }

    async fn delete_session(&self, id: &str) -> Result<()> {
        {
            let mut table = self.sessions_mut()?;
            if let Some(session) = table.by_id.remove(id) {
                table.unlink_visitor(&session.visitor_id, id);
            }
        }
        self.messages_mut()?.remove_session(id);
        Ok(())
    }

    async fn save_message(&self, message: Message) -> Result<()> {
        // Held across the insert so a concurrent delete_session cannot
        // orphan the message.
        let sessions = self.sessions()?;
        let mut table = self.messages_mut()?;
        if let Some(existing) = table.by_id.get_mut(&message.id) {
            *existing = message;
            return Ok(());
        }
        if !sessions.by_id.contains_key(&message.session_id) {
            return Err(Error::SessionNotFound(message.session_id));
        }

        // `by_id` and `order` hold the same IDs, so a miss above means the
        // ID is new to the session too.
        table
            .order
            .entry(message.session_id.clone())
            .or_default()
            .push(message.id.clone());
        table.by_id.insert(message.id.clone(), message);
        Ok(())
    }

    async fn get_message(&self, id: &str) -> Result<Option<Message>> {
        Ok(self.messages()?.by_id.get(id).cloned())
    }

    async fn get_messages(
        &self,
        session_id: &str,
        after_id: Option<&str>,
        limit: usize,
    ) -> Result<Vec<Message>> {
        let table = self.messages()?;
        let Some(order) = table.order.get(session_id) else {
            return Ok(Vec::new());
        };

        let start = after_id
            .and_then(|after| order.iter().position(|id| id == after))
            .map(|idx| idx + 1)
            .unwrap_or(0);

        Ok(order
            .iter()
            .skip(start)
            .filter_map(|id| table.by_id.get(id))
            .take(limit)
            .cloned()
            .collect())
    }

    async fn cleanup_old_sessions(&self, older_than: DateTime<Utc>) -> Result<Vec<String>> {
        let removed: Vec<String> = {
            let mut table = self.sessions_mut()?;
            let stale: Vec<(String, String)> = table
                .by_id
                .values()
                .filter(|s| s.last_activity < older_than)
                .map(|s| (s.id.clone(), s.visitor_id.clone()))
                .collect();
            for (id, visitor_id) in &stale {
                table.by_id.remove(id);
                table.unlink_visitor(visitor_id, id);
            }
            stale.into_iter().map(|(id, _)| id).collect()
        };

        if !removed.is_empty() {
            let mut messages = self.messages_mut()?;
            for id in &removed {
                messages.remove_session(id);
            }
        }
        Ok(removed)
    }
}
