//! Widget-side message list.
//!
//! Every transport funnels into the same [`Reconciler`], so a message pushed
//! over WebSocket, replayed over SSE and fetched again by the poller shows up
//! once. Nothing here fails: an event that matches no entry becomes a new
//! entry.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use pocketping_protocol::client::SendMessageResponse;
use pocketping_protocol::server::{MessageDeletedData, MessageEditedData, ReadData};
use pocketping_protocol::{is_temp_id, new_temp_id, Message, MessageStatus, Sender, ServerEvent};
use tracing::debug;

/// What a single merge did to the list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Applied {
    Inserted { id: String },
    /// An optimistic entry took its server ID.
    Promoted { temp_id: String, id: String },
    Updated { id: String },
    /// Read receipts: how many entries changed, how many IDs were unknown
    /// and are held until their message shows up.
    Statuses { matched: usize, pending: usize },
    Ignored,
}

#[derive(Debug, Clone)]
struct StatusUpdate {
    status: MessageStatus,
    delivered_at: Option<DateTime<Utc>>,
    read_at: Option<DateTime<Utc>>,
}

impl StatusUpdate {
    fn apply_to(&self, message: &mut Message) -> bool {
        let mut changed = false;
        if self.status > message.status {
            message.status = self.status;
            changed = true;
        }
        if self.delivered_at.is_some() && message.delivered_at.is_none() {
            message.delivered_at = self.delivered_at;
            changed = true;
        }
        if self.read_at.is_some() && message.read_at.is_none() {
            message.read_at = self.read_at;
            changed = true;
        }
        changed
    }

    fn merge(&mut self, other: StatusUpdate) {
        self.status = self.status.max(other.status);
        self.delivered_at = self.delivered_at.or(other.delivered_at);
        self.read_at = self.read_at.or(other.read_at);
    }
}

#[derive(Debug)]
pub struct Reconciler {
    messages: Vec<Message>,
    /// Content of optimistic sends still waiting for confirmation.
    in_flight: HashMap<String, String>,
    pending_status: HashMap<String, StatusUpdate>,
    tolerance: chrono::Duration,
}

impl Reconciler {
    pub fn new(dedup_tolerance: Duration) -> Self {
        Self {
            messages: Vec::new(),
            in_flight: HashMap::new(),
            pending_status: HashMap::new(),
            tolerance: chrono::Duration::from_std(dedup_tolerance)
                .unwrap_or_else(|_| chrono::Duration::milliseconds(2000)),
        }
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    /// Last server-assigned ID, used as the `after` cursor when pulling.
    pub fn cursor(&self) -> Option<&str> {
        self.messages
            .iter()
            .rev()
            .find(|m| !is_temp_id(&m.id))
            .map(|m| m.id.as_str())
    }

    /// Drop everything, e.g. when switching sessions.
    pub fn reset(&mut self) {
        self.messages.clear();
        self.in_flight.clear();
        self.pending_status.clear();
    }

    /// Append a `temp-` visitor message in `sending` state.
    pub fn push_optimistic(
        &mut self,
        session_id: &str,
        content: &str,
        reply_to: Option<&str>,
        now: DateTime<Utc>,
    ) -> Message {
        let mut message = Message::new(
            new_temp_id(),
            session_id.to_string(),
            Sender::Visitor,
            content.to_string(),
            now,
        );
        message.status = MessageStatus::Sending;
        message.reply_to = reply_to.map(str::to_string);

        self.in_flight
            .insert(message.id.clone(), message.content.clone());
        self.messages.push(message.clone());
        message
    }

    /// The send request came back. The echo may already have promoted the
    /// entry, possibly a twin with the same content, so fall back to any
    /// optimistic entry with that content.
    pub fn confirm_send(&mut self, temp_id: &str, response: &SendMessageResponse) -> Applied {
        let content = self.in_flight.remove(temp_id);

        // The echo already promoted an entry to this ID.
        if self.position(&response.message_id).is_some() {
            return Applied::Ignored;
        }

        let idx = self.position(temp_id).or_else(|| {
            let content = content.as_deref()?;
            self.messages
                .iter()
                .position(|m| is_optimistic(m) && m.content == content)
        });
        let Some(idx) = idx else {
            return Applied::Ignored;
        };
        let promoted_from = self.messages[idx].id.clone();
        self.promote_at(idx, &promoted_from, &response.message_id, response.timestamp)
    }

    /// The send request failed; drop the optimistic entry and hand it back.
    pub fn fail_send(&mut self, temp_id: &str) -> Option<Message> {
        self.in_flight.remove(temp_id);
        let idx = self.position(temp_id)?;
        Some(self.messages.remove(idx))
    }

    pub fn apply(&mut self, event: &ServerEvent) -> Applied {
        match event {
            ServerEvent::Message(message) => self.upsert(message.clone()),
            ServerEvent::Read(data) => self.apply_read(data),
            ServerEvent::MessageEdited(data) => self.apply_edit(data),
            ServerEvent::MessageDeleted(data) => self.apply_delete(data),
            _ => Applied::Ignored,
        }
    }

    /// Merge a page from the pull endpoint.
    pub fn merge_poll(&mut self, messages: Vec<Message>) -> Vec<Applied> {
        messages.into_iter().map(|m| self.upsert(m)).collect()
    }

    fn upsert(&mut self, incoming: Message) -> Applied {
        // Exact ID wins over every heuristic.
        if let Some(idx) = self.position(&incoming.id) {
            let id = incoming.id.clone();
            merge_into(&mut self.messages[idx], incoming);
            return Applied::Updated { id };
        }

        if incoming.sender == Sender::Visitor {
            if let Some(idx) = self
                .messages
                .iter()
                .position(|m| is_optimistic(m) && m.content == incoming.content)
            {
                let temp_id = self.messages[idx].id.clone();
                let id = incoming.id.clone();
                let mut promoted = incoming;
                promoted.status = promoted.status.max(MessageStatus::Sent);
                self.messages[idx] = promoted;
                self.take_pending(idx);
                debug!(
                    component = "reconciler",
                    event = "reconciler.promoted_by_echo",
                    temp_id = %temp_id,
                    message_id = %id,
                    "Optimistic message matched server echo"
                );
                return Applied::Promoted { temp_id, id };
            }
        } else if let Some(idx) = self.messages.iter().position(|m| {
            !is_temp_id(&m.id)
                && m.sender == incoming.sender
                && m.content == incoming.content
                && (m.timestamp - incoming.timestamp).abs() <= self.tolerance
        }) {
            let id = self.messages[idx].id.clone();
            debug!(
                component = "reconciler",
                event = "reconciler.duplicate_suppressed",
                message_id = %id,
                duplicate_id = %incoming.id,
                "Same message seen twice"
            );
            let existing = &mut self.messages[idx];
            existing.status = existing.status.max(incoming.status);
            existing.edited_at = existing.edited_at.or(incoming.edited_at);
            existing.deleted_at = existing.deleted_at.or(incoming.deleted_at);
            return Applied::Updated { id };
        }

        let id = incoming.id.clone();
        let idx = self.insertion_point(&incoming);
        self.messages.insert(idx, incoming);
        self.take_pending(idx);
        Applied::Inserted { id }
    }

    fn apply_read(&mut self, data: &ReadData) -> Applied {
        let update = StatusUpdate {
            status: data.status,
            delivered_at: data.delivered_at,
            read_at: data.read_at,
        };
        let mut matched = 0;
        let mut pending = 0;
        for id in &data.message_ids {
            match self.position(id) {
                Some(idx) => {
                    if update.apply_to(&mut self.messages[idx]) {
                        matched += 1;
                    }
                }
                None => {
                    pending += 1;
                    match self.pending_status.get_mut(id) {
                        Some(existing) => existing.merge(update.clone()),
                        None => {
                            self.pending_status.insert(id.clone(), update.clone());
                        }
                    }
                }
            }
        }
        Applied::Statuses { matched, pending }
    }

    fn apply_edit(&mut self, data: &MessageEditedData) -> Applied {
        let Some(idx) = self.position(&data.message_id) else {
            return Applied::Ignored;
        };
        let message = &mut self.messages[idx];
        message.content = data.content.clone();
        message.edited_at = Some(data.edited_at);
        Applied::Updated {
            id: data.message_id.clone(),
        }
    }

    fn apply_delete(&mut self, data: &MessageDeletedData) -> Applied {
        let Some(idx) = self.position(&data.message_id) else {
            return Applied::Ignored;
        };
        let message = &mut self.messages[idx];
        message.content.clear();
        message.deleted_at = Some(data.deleted_at);
        Applied::Updated {
            id: data.message_id.clone(),
        }
    }

    fn promote_at(
        &mut self,
        idx: usize,
        temp_id: &str,
        id: &str,
        timestamp: DateTime<Utc>,
    ) -> Applied {
        let message = &mut self.messages[idx];
        message.id = id.to_string();
        message.status = message.status.max(MessageStatus::Sent);
        message.timestamp = timestamp;
        self.take_pending(idx);
        Applied::Promoted {
            temp_id: temp_id.to_string(),
            id: id.to_string(),
        }
    }

    fn take_pending(&mut self, idx: usize) {
        let Some(message) = self.messages.get_mut(idx) else {
            return;
        };
        if let Some(update) = self.pending_status.remove(&message.id) {
            update.apply_to(message);
        }
    }

    fn position(&self, id: &str) -> Option<usize> {
        self.messages.iter().position(|m| m.id == id)
    }

    /// After the last entry not newer than `message`. Optimistic entries
    /// stay at the tail.
    fn insertion_point(&self, message: &Message) -> usize {
        self.messages
            .iter()
            .rposition(|m| !is_temp_id(&m.id) && m.timestamp <= message.timestamp)
            .map(|i| i + 1)
            .unwrap_or_else(|| {
                // Older than every server entry.
                self.messages
                    .iter()
                    .position(|m| !is_temp_id(&m.id))
                    .unwrap_or(self.messages.len())
            })
    }
}

fn is_optimistic(message: &Message) -> bool {
    is_temp_id(&message.id) && message.status == MessageStatus::Sending
}

/// Server copy wins, except status never moves backwards.
fn merge_into(existing: &mut Message, incoming: Message) {
    let status = existing.status.max(incoming.status);
    let delivered_at = existing.delivered_at.or(incoming.delivered_at);
    let read_at = existing.read_at.or(incoming.read_at);
    *existing = incoming;
    existing.status = status;
    existing.delivered_at = existing.delivered_at.or(delivered_at);
    existing.read_at = existing.read_at.or(read_at);
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use pocketping_protocol::server::TypingData;

    use super::*;

    fn at(secs: i64, millis: u32) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, millis * 1_000_000)
            .single()
            .expect("valid timestamp")
    }

    fn reconciler() -> Reconciler {
        Reconciler::new(Duration::from_millis(2000))
    }

    fn server_message(id: &str, sender: Sender, content: &str, ts: DateTime<Utc>) -> Message {
        Message::new(id.into(), "s-1".into(), sender, content.into(), ts)
    }

    fn ids(r: &Reconciler) -> Vec<&str> {
        r.messages().iter().map(|m| m.id.as_str()).collect()
    }

    #[test]
    fn optimistic_send_promotes_on_confirmation() {
        let mut r = reconciler();
        let temp = r.push_optimistic("s-1", "hi", None, at(0, 0));
        assert!(is_temp_id(&temp.id));
        assert_eq!(r.messages()[0].status, MessageStatus::Sending);

        let applied = r.confirm_send(
            &temp.id,
            &SendMessageResponse {
                message_id: "m-1".into(),
                timestamp: at(0, 100),
            },
        );
        assert_eq!(
            applied,
            Applied::Promoted {
                temp_id: temp.id.clone(),
                id: "m-1".into()
            }
        );

        // Echo after confirmation: same entry, not a second one.
        let echo = server_message("m-1", Sender::Visitor, "hi", at(0, 100));
        assert_eq!(
            r.apply(&ServerEvent::Message(echo)),
            Applied::Updated { id: "m-1".into() }
        );
        assert_eq!(ids(&r), vec!["m-1"]);
        assert_eq!(r.messages()[0].status, MessageStatus::Sent);
    }

    #[test]
    fn echo_before_confirmation_promotes_once() {
        let mut r = reconciler();
        let temp = r.push_optimistic("s-1", "hi", None, at(0, 0));

        let echo = server_message("m-1", Sender::Visitor, "hi", at(0, 50));
        assert_eq!(
            r.apply(&ServerEvent::Message(echo)),
            Applied::Promoted {
                temp_id: temp.id.clone(),
                id: "m-1".into()
            }
        );
        let late = r.confirm_send(
            &temp.id,
            &SendMessageResponse {
                message_id: "m-1".into(),
                timestamp: at(0, 50),
            },
        );
        assert_eq!(late, Applied::Ignored);
        assert_eq!(ids(&r), vec!["m-1"]);
    }

    #[test]
    fn twin_sends_each_end_up_with_one_server_id() {
        let mut r = reconciler();
        let first = r.push_optimistic("s-1", "ok", None, at(0, 0));
        let second = r.push_optimistic("s-1", "ok", None, at(0, 10));

        // The second send's echo arrives first and lands on the first entry.
        let echo = server_message("m-2", Sender::Visitor, "ok", at(0, 60));
        r.apply(&ServerEvent::Message(echo));

        r.confirm_send(
            &first.id,
            &SendMessageResponse {
                message_id: "m-1".into(),
                timestamp: at(0, 50),
            },
        );
        r.confirm_send(
            &second.id,
            &SendMessageResponse {
                message_id: "m-2".into(),
                timestamp: at(0, 60),
            },
        );

        let mut seen = ids(&r);
        seen.sort_unstable();
        assert_eq!(seen, vec!["m-1", "m-2"]);
    }

    #[test]
    fn failed_send_is_removed() {
        let mut r = reconciler();
        let temp = r.push_optimistic("s-1", "lost", None, at(0, 0));
        let removed = r.fail_send(&temp.id).expect("entry");
        assert_eq!(removed.content, "lost");
        assert!(r.messages().is_empty());
        assert!(r.fail_send(&temp.id).is_none());
    }

    #[test]
    fn same_event_twice_is_one_entry() {
        let mut r = reconciler();
        let msg = server_message("m-1", Sender::Operator, "Hi there", at(1, 0));
        r.apply(&ServerEvent::Message(msg.clone()));
        r.apply(&ServerEvent::Message(msg));
        assert_eq!(r.messages().len(), 1);
    }

    #[test]
    fn operator_message_seen_by_push_and_poll_is_deduplicated() {
        let mut r = reconciler();
        let pushed = server_message("m-7", Sender::Operator, "Hi there", at(5, 0));
        r.apply(&ServerEvent::Message(pushed));

        let polled = server_message("m-7b", Sender::Operator, "Hi there", at(6, 500));
        let applied = r.merge_poll(vec![polled]);
        assert_eq!(applied, vec![Applied::Updated { id: "m-7".into() }]);
        assert_eq!(ids(&r), vec!["m-7"]);
    }

    #[test]
    fn identical_operator_text_outside_tolerance_is_a_new_message() {
        let mut r = reconciler();
        r.apply(&ServerEvent::Message(server_message(
            "m-1",
            Sender::Operator,
            "Thanks!",
            at(0, 0),
        )));
        r.apply(&ServerEvent::Message(server_message(
            "m-2",
            Sender::Operator,
            "Thanks!",
            at(2, 1),
        )));
        assert_eq!(ids(&r), vec!["m-1", "m-2"]);
    }

    #[test]
    fn ai_and_operator_with_same_text_are_distinct() {
        let mut r = reconciler();
        r.apply(&ServerEvent::Message(server_message(
            "m-1",
            Sender::Ai,
            "Hello",
            at(0, 0),
        )));
        r.apply(&ServerEvent::Message(server_message(
            "m-2",
            Sender::Operator,
            "Hello",
            at(0, 500),
        )));
        assert_eq!(r.messages().len(), 2);
    }

    #[test]
    fn read_receipt_before_promotion_is_held() {
        let mut r = reconciler();
        let temp = r.push_optimistic("s-1", "hi", None, at(0, 0));

        let read = ServerEvent::Read(ReadData {
            session_id: "s-1".into(),
            message_ids: vec!["m-1".into()],
            status: MessageStatus::Read,
            delivered_at: None,
            read_at: Some(at(1, 0)),
        });
        assert_eq!(
            r.apply(&read),
            Applied::Statuses {
                matched: 0,
                pending: 1
            }
        );
        assert_eq!(r.messages()[0].status, MessageStatus::Sending);

        r.confirm_send(
            &temp.id,
            &SendMessageResponse {
                message_id: "m-1".into(),
                timestamp: at(0, 10),
            },
        );
        assert_eq!(r.messages()[0].status, MessageStatus::Read);
        assert_eq!(r.messages()[0].read_at, Some(at(1, 0)));
    }

    #[test]
    fn status_never_regresses() {
        let mut r = reconciler();
        let mut msg = server_message("m-1", Sender::Visitor, "hi", at(0, 0));
        msg.status = MessageStatus::Read;
        r.apply(&ServerEvent::Message(msg.clone()));

        msg.status = MessageStatus::Delivered;
        r.apply(&ServerEvent::Message(msg));
        assert_eq!(r.messages()[0].status, MessageStatus::Read);
    }

    #[test]
    fn late_messages_insert_in_timestamp_order() {
        let mut r = reconciler();
        for (id, secs) in [("a", 0), ("c", 20)] {
            r.apply(&ServerEvent::Message(server_message(
                id,
                Sender::Operator,
                id,
                at(secs, 0),
            )));
        }
        r.push_optimistic("s-1", "pending", None, at(30, 0));
        r.apply(&ServerEvent::Message(server_message(
            "b",
            Sender::Operator,
            "b",
            at(10, 0),
        )));
        r.apply(&ServerEvent::Message(server_message(
            "z",
            Sender::Operator,
            "z",
            at(-10, 0),
        )));

        let order: Vec<_> = r.messages().iter().map(|m| m.content.as_str()).collect();
        assert_eq!(order, vec!["z", "a", "b", "c", "pending"]);
        assert_eq!(r.cursor(), Some("c"));
    }

    #[test]
    fn edits_and_deletes_apply_in_place() {
        let mut r = reconciler();
        r.apply(&ServerEvent::Message(server_message(
            "m-1",
            Sender::Visitor,
            "helo",
            at(0, 0),
        )));
        r.apply(&ServerEvent::MessageEdited(MessageEditedData {
            message_id: "m-1".into(),
            content: "hello".into(),
            edited_at: at(1, 0),
        }));
        assert_eq!(r.messages()[0].content, "hello");

        r.apply(&ServerEvent::MessageDeleted(MessageDeletedData {
            message_id: "m-1".into(),
            deleted_at: at(2, 0),
        }));
        assert_eq!(r.messages().len(), 1);
        assert!(r.messages()[0].is_deleted());
        assert!(r.messages()[0].content.is_empty());

        assert_eq!(
            r.apply(&ServerEvent::MessageDeleted(MessageDeletedData {
                message_id: "nope".into(),
                deleted_at: at(2, 0),
            })),
            Applied::Ignored
        );
    }

    #[test]
    fn non_message_events_are_ignored() {
        let mut r = reconciler();
        let typing = ServerEvent::Typing(TypingData {
            session_id: "s-1".into(),
            sender: Sender::Operator,
            is_typing: true,
        });
        assert_eq!(r.apply(&typing), Applied::Ignored);
        assert!(r.cursor().is_none());
    }
}
