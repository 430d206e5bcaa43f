//! Outbound dispatcher: sends recorded replies through the conversation's
//! channel with the owning workspace's credentials.

use anyhow::{Result, anyhow};
use chrono::{DateTime, Utc};
use inbox_channels::{ChannelRegistry, ProviderMessageId};
use inbox_store::{Conversation, ConversationId, Message, MessageId, NewMessage, SenderType, Store};
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Delivery {
    Delivered { provider_message_id: String },
    Failed { error: String },
}

impl Delivery {
    pub fn is_delivered(&self) -> bool {
        matches!(self, Self::Delivered { .. })
    }
}

#[derive(Clone)]
pub struct Dispatcher {
    store: Store,
    channels: ChannelRegistry,
}

impl Dispatcher {
    pub fn new(store: Store, channels: ChannelRegistry) -> Self {
        Self { store, channels }
    }

    /// Send an already-recorded outbound message and persist the result.
    ///
    /// Provider failures are recorded on the message and returned as
    /// [`Delivery::Failed`]; only storage errors surface as `Err`. There is no
    /// inline retry.
    #[tracing::instrument(
        level = "info",
        skip_all,
        fields(
            workspace_id = %conversation.workspace_id,
            conversation_id = %conversation.id,
            message_id = %message.id,
            channel = %conversation.channel,
        )
    )]
    pub async fn deliver(&self, conversation: &Conversation, message: &Message) -> Result<Delivery> {
        match self.send(conversation, &message.content).await {
            Ok(provider_message_id) => {
                self.store
                    .mark_delivered(message.id, provider_message_id.as_str())
                    .await?;
                tracing::info!(provider_message_id = %provider_message_id, "reply delivered");
                Ok(Delivery::Delivered {
                    provider_message_id: provider_message_id.into_inner(),
                })
            }
            Err(error) => {
                let error = format!("{error:#}");
                tracing::warn!(%error, "reply delivery failed");
                self.store.mark_failed(message.id, &error).await?;
                Ok(Delivery::Failed { error })
            }
        }
    }

    async fn send(&self, conversation: &Conversation, text: &str) -> Result<ProviderMessageId> {
        let integration = self
            .store
            .get_connected_integration(conversation.workspace_id, conversation.channel)
            .await?
            .ok_or_else(|| {
                anyhow!(
                    "workspace {} has no connected {} integration",
                    conversation.workspace_id,
                    conversation.channel
                )
            })?;
        let adapter = self.channels.get(conversation.channel)?;
        adapter
            .send(
                &conversation.external_customer_id,
                text,
                &integration.credentials,
            )
            .await
    }

    /// Human agent reply. Pending customer messages newer than
    /// `answer_since` are marked replied in the same commit, so the AI will
    /// not answer them a second time.
    pub async fn reply_as_agent(
        &self,
        conversation_id: ConversationId,
        text: &str,
        answer_since: DateTime<Utc>,
    ) -> Result<(Message, Delivery)> {
        let text = text.trim();
        if text.is_empty() {
            return Err(anyhow!("reply text is empty"));
        }
        let conversation = self.store.get_conversation(conversation_id).await?;
        let answered = self
            .store
            .unreplied_batch(conversation.id, answer_since)
            .await?
            .into_iter()
            .map(|message| message.id)
            .collect();
        let message = self
            .store
            .record_outbound(
                conversation.id,
                NewMessage::outbound(text, SenderType::Agent, Utc::now()),
                answered,
            )
            .await?;
        let delivery = self.deliver(&conversation, &message).await?;
        Ok((message, delivery))
    }

    /// Re-dispatch a failed outbound message on operator request. `None` when
    /// the message is not currently in the failed state.
    pub async fn retry_failed(&self, message_id: MessageId) -> Result<Option<Delivery>> {
        let message = self.store.get_message(message_id).await?;
        if !self.store.claim_failed_for_retry(message_id).await? {
            return Ok(None);
        }
        let conversation = self.store.get_conversation(message.conversation_id).await?;
        tracing::info!(
            workspace_id = %conversation.workspace_id,
            conversation_id = %conversation.id,
            message_id = %message.id,
            "retrying failed delivery"
        );
        Ok(Some(self.deliver(&conversation, &message).await?))
    }
}
