//! Operator replies, edits and deletes arriving from a platform bridge.
//!
//! The source bridge is excluded from the resulting fan-out so a platform
//! never sees its own message echoed back.

use chrono::Utc;
use pocketping_bridge_core::NativeMessageId;
use pocketping_protocol::client::{
    OperatorDeleteRequest, OperatorEditRequest, OperatorMessageRequest,
};
use pocketping_protocol::server::{MessageDeletedData, MessageEditedData};
use pocketping_protocol::{new_id, Message, Sender, ServerEvent, Session};
use tracing::info;

use crate::dispatcher::Origin;
use crate::error::{Error, Result};
use crate::service::ChatService;

impl ChatService {
    /// Store an operator reply written on `source_bridge` and mirror it to
    /// the widget and every other bridge.
    pub async fn record_operator_message(&self, request: &OperatorMessageRequest) -> Result<Message> {
        self.validate_content(&request.content)?;
        self.require_session(&request.session_id).await?;

        let reply_to = request
            .reply_to_native_id
            .as_deref()
            .filter(|id| !id.is_empty())
            .and_then(|native| {
                self.identity
                    .find_message(&request.source_bridge, &NativeMessageId::new(native))
            });

        let now = Utc::now();
        let mut message = Message::new(
            new_id(),
            request.session_id.clone(),
            Sender::Operator,
            request.content.clone(),
            now,
        );
        message.reply_to = reply_to;
        self.store.save_message(message.clone()).await?;

        let session = self
            .store
            .update_session_with(
                &request.session_id,
                Box::new(move |session: &mut Session| {
                    session.last_activity = now;
                    session.ai_active = false;
                }),
            )
            .await?;

        if let Some(native) = request.native_message_id.as_deref().filter(|id| !id.is_empty()) {
            self.identity
                .save(&message.id, &request.source_bridge, NativeMessageId::new(native));
        }

        self.gateway
            .broadcast(&request.session_id, &ServerEvent::Message(message.clone()));
        self.dispatcher.notify_operator_message(
            &message,
            &session,
            &request.source_bridge,
            request.operator_name.as_deref(),
        );

        info!(
            component = "service",
            event = "operator.message",
            session_id = %request.session_id,
            message_id = %message.id,
            source_bridge = %request.source_bridge,
            "Operator reply recorded"
        );
        Ok(message)
    }

    pub async fn record_operator_edit(&self, request: &OperatorEditRequest) -> Result<Message> {
        self.validate_content(&request.content)?;
        self.require_session(&request.session_id).await?;
        let mut message = self
            .operator_message(
                &request.session_id,
                &request.source_bridge,
                &request.native_message_id,
            )
            .await?;

        let now = Utc::now();
        message.content = request.content.clone();
        message.edited_at = Some(now);
        self.store.save_message(message.clone()).await?;

        self.gateway.broadcast(
            &request.session_id,
            &ServerEvent::MessageEdited(MessageEditedData {
                message_id: message.id.clone(),
                content: message.content.clone(),
                edited_at: now,
            }),
        );
        self.dispatcher.notify_edit(
            &request.session_id,
            &message.id,
            &message.content,
            &Origin::bridge(&request.source_bridge),
        );
        Ok(message)
    }

    pub async fn record_operator_delete(&self, request: &OperatorDeleteRequest) -> Result<Message> {
        self.require_session(&request.session_id).await?;
        let mut message = self
            .operator_message(
                &request.session_id,
                &request.source_bridge,
                &request.native_message_id,
            )
            .await?;

        let now = Utc::now();
        message.content.clear();
        message.deleted_at = Some(now);
        self.store.save_message(message.clone()).await?;

        self.gateway.broadcast(
            &request.session_id,
            &ServerEvent::MessageDeleted(MessageDeletedData {
                message_id: message.id.clone(),
                deleted_at: now,
            }),
        );
        self.dispatcher.notify_delete(
            &request.session_id,
            &message.id,
            &Origin::bridge(&request.source_bridge),
        );
        Ok(message)
    }

    /// Resolve a platform handle to a live message of this session.
    async fn operator_message(
        &self,
        session_id: &str,
        source_bridge: &str,
        native: &str,
    ) -> Result<Message> {
        let not_found = || Error::MessageNotFound(format!("{source_bridge}:{native}"));

        let message_id = self
            .identity
            .find_message(source_bridge, &NativeMessageId::new(native))
            .ok_or_else(not_found)?;
        let message = self
            .store
            .get_message(&message_id)
            .await?
            .filter(|m| m.session_id == session_id)
            .ok_or_else(not_found)?;

        if message.is_deleted() {
            return Err(Error::InvalidState(format!("message {} is deleted", message.id)));
        }
        Ok(message)
    }
}

#[cfg(test)]
mod tests {
    use pocketping_protocol::client::GetMessagesQuery;

    use crate::service::tests::{connect, service_with};
    use crate::service::ServiceConfig;
    use crate::testing::Call;

    use super::*;

    fn reply(session_id: &str, bridge: &str, content: &str) -> OperatorMessageRequest {
        OperatorMessageRequest {
            session_id: session_id.into(),
            content: content.into(),
            source_bridge: bridge.into(),
            operator_name: None,
            native_message_id: None,
            reply_to_native_id: None,
        }
    }

    #[tokio::test]
    async fn reply_links_resolve_through_native_handles() {
        let (service, _) = service_with(ServiceConfig::default(), &["telegram", "slack"]).await;
        let session_id = connect(&service, "v1").await;
        let question = service
            .send_message(&session_id, "Is it in stock?", Sender::Visitor, None)
            .await
            .unwrap();
        service.dispatcher().drain().await;

        // Telegram assigned "telegram-1" to the visitor message.
        let answer = service
            .record_operator_message(&OperatorMessageRequest {
                reply_to_native_id: Some("telegram-1".into()),
                native_message_id: Some("9001".into()),
                ..reply(&session_id, "telegram", "Yes, ships today")
            })
            .await
            .unwrap();
        assert_eq!(answer.reply_to.as_deref(), Some(question.id.as_str()));
        assert_eq!(
            service.identity_map().get_for(&answer.id, "telegram"),
            Some(NativeMessageId::new("9001"))
        );

        // Slack got its own handle from the cross-bridge sync.
        service.dispatcher().drain().await;
        assert!(service.identity_map().get_for(&answer.id, "slack").is_some());
    }

    #[tokio::test]
    async fn operator_edit_updates_store_and_skips_source() {
        let (service, bridges) =
            service_with(ServiceConfig::default(), &["telegram", "discord"]).await;
        let session_id = connect(&service, "v1").await;
        let msg = service
            .record_operator_message(&OperatorMessageRequest {
                native_message_id: Some("777".into()),
                ..reply(&session_id, "telegram", "Price is 10")
            })
            .await
            .unwrap();
        service.dispatcher().drain().await;

        let edited = service
            .record_operator_edit(&OperatorEditRequest {
                session_id: session_id.clone(),
                source_bridge: "telegram".into(),
                native_message_id: "777".into(),
                content: "Price is 12".into(),
            })
            .await
            .unwrap();
        assert_eq!(edited.id, msg.id);
        assert_eq!(edited.sender, Sender::Operator);

        let page = service
            .list_messages(&GetMessagesQuery {
                session_id: session_id.clone(),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(page.messages[0].content, "Price is 12");

        service.dispatcher().drain().await;
        let edited_on = |i: usize| {
            bridges[i]
                .calls()
                .into_iter()
                .filter(|c| matches!(c, Call::Edited { .. }))
                .count()
        };
        assert_eq!(edited_on(0), 0);
        assert_eq!(edited_on(1), 1);
    }

    #[tokio::test]
    async fn operator_delete_requires_known_handle_in_session() {
        let (service, _) = service_with(ServiceConfig::default(), &[]).await;
        let session_id = connect(&service, "v1").await;
        let other = connect(&service, "v2").await;
        service
            .record_operator_message(&OperatorMessageRequest {
                native_message_id: Some("C1.42".into()),
                ..reply(&session_id, "slack", "Hello!")
            })
            .await
            .unwrap();

        let wrong_session = service
            .record_operator_delete(&OperatorDeleteRequest {
                session_id: other,
                source_bridge: "slack".into(),
                native_message_id: "C1.42".into(),
            })
            .await;
        assert!(matches!(wrong_session, Err(Error::MessageNotFound(_))));

        let request = OperatorDeleteRequest {
            session_id: session_id.clone(),
            source_bridge: "slack".into(),
            native_message_id: "C1.42".into(),
        };
        let deleted = service.record_operator_delete(&request).await.unwrap();
        assert!(deleted.is_deleted());
        assert!(deleted.content.is_empty());

        assert!(matches!(
            service.record_operator_delete(&request).await,
            Err(Error::InvalidState(_))
        ));
        assert!(matches!(
            service
                .record_operator_edit(&OperatorEditRequest {
                    session_id,
                    source_bridge: "slack".into(),
                    native_message_id: "C1.42".into(),
                    content: "again".into(),
                })
                .await,
            Err(Error::InvalidState(_))
        ));
    }
}
