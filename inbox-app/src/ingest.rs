//! Webhook ingest: normalize, route to the receiving workspace(s), resolve the
//! conversation and dedup-insert. Name enrichment runs after the message is
//! persisted and is bounded by a timeout.

use anyhow::Result;
use futures_util::future::join_all;
use inbox_channels::{
    Channel, ChannelAdapter, ChannelRegistry, InboundMessage, suppress_echoes,
};
use inbox_store::{ChannelIntegration, Conversation, NewMessage, Store, WorkspaceId};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IngestReport {
    pub received: usize,
    pub stored: usize,
    pub duplicates: usize,
    pub echoes: usize,
    /// No connected integration owns the receiving account.
    pub unrouted: usize,
    pub failed: usize,
}

impl IngestReport {
    fn merge(&mut self, other: IngestReport) {
        self.stored += other.stored;
        self.duplicates += other.duplicates;
        self.echoes += other.echoes;
        self.unrouted += other.unrouted;
        self.failed += other.failed;
    }
}

#[derive(Clone)]
pub struct Ingestor {
    store: Store,
    channels: ChannelRegistry,
    profile_timeout: Duration,
}

impl Ingestor {
    pub fn new(store: Store, channels: ChannelRegistry, profile_timeout: Duration) -> Self {
        Self {
            store,
            channels,
            profile_timeout,
        }
    }

    /// Facebook, Instagram and WhatsApp: fan out to every connected
    /// integration whose external account id matches the payload.
    #[tracing::instrument(level = "info", skip_all, fields(%channel))]
    pub async fn ingest_meta(&self, channel: Channel, payload: &[u8]) -> Result<IngestReport> {
        let adapter = self.channels.get(channel)?;
        let messages = adapter.normalize(payload);
        let mut report = IngestReport {
            received: messages.len(),
            ..IngestReport::default()
        };

        let mut by_account: BTreeMap<String, Vec<InboundMessage>> = BTreeMap::new();
        for message in messages {
            match message.account_id.as_ref() {
                Some(account_id) => by_account
                    .entry(account_id.to_string())
                    .or_default()
                    .push(message),
                None => {
                    tracing::warn!(
                        provider_message_id = %message.provider_message_id,
                        "dropping message without a receiving account id"
                    );
                    report.unrouted += 1;
                }
            }
        }

        for (account_id, messages) in by_account {
            let integrations = self
                .store
                .find_integrations_by_account(channel, &account_id)
                .await?;
            if integrations.is_empty() {
                tracing::warn!(
                    %account_id,
                    count = messages.len(),
                    "no connected integration for receiving account"
                );
                report.unrouted += messages.len();
                continue;
            }
            let deliveries = integrations.iter().map(|integration| {
                self.store_for_integration(integration, &adapter, messages.clone())
            });
            for partial in join_all(deliveries).await {
                report.merge(partial);
            }
        }
        Ok(report)
    }

    /// Telegram updates carry no account id; the webhook path names the
    /// workspace.
    #[tracing::instrument(level = "info", skip_all, fields(%workspace_id))]
    pub async fn ingest_telegram(
        &self,
        workspace_id: WorkspaceId,
        payload: &[u8],
    ) -> Result<IngestReport> {
        let adapter = self.channels.get(Channel::Telegram)?;
        let messages = adapter.normalize(payload);
        let mut report = IngestReport {
            received: messages.len(),
            ..IngestReport::default()
        };
        if messages.is_empty() {
            return Ok(report);
        }
        let Some(integration) = self
            .store
            .get_connected_integration(workspace_id, Channel::Telegram)
            .await?
        else {
            tracing::warn!(count = messages.len(), "workspace has no connected telegram integration");
            report.unrouted = messages.len();
            return Ok(report);
        };
        report.merge(
            self.store_for_integration(&integration, &adapter, messages)
                .await,
        );
        Ok(report)
    }

    async fn store_for_integration(
        &self,
        integration: &ChannelIntegration,
        adapter: &Arc<dyn ChannelAdapter>,
        messages: Vec<InboundMessage>,
    ) -> IngestReport {
        let mut report = IngestReport::default();
        let before = messages.len();
        let messages = suppress_echoes(messages, integration.external_account_id.as_deref());
        report.echoes = before - messages.len();

        for message in messages {
            let provider_message_id = message.provider_message_id.clone();
            match self.store_one(integration, adapter.as_ref(), message).await {
                Ok(true) => report.stored += 1,
                Ok(false) => {
                    tracing::debug!(%provider_message_id, "duplicate delivery ignored");
                    report.duplicates += 1;
                }
                Err(error) => {
                    tracing::warn!(
                        workspace_id = %integration.workspace_id,
                        %provider_message_id,
                        error = %format!("{error:#}"),
                        "failed to store inbound message"
                    );
                    report.failed += 1;
                }
            }
        }
        report
    }

    async fn store_one(
        &self,
        integration: &ChannelIntegration,
        adapter: &dyn ChannelAdapter,
        message: InboundMessage,
    ) -> Result<bool> {
        let conversation = self
            .store
            .resolve_conversation(
                integration.workspace_id,
                message.channel,
                &message.customer_id,
                message.sender_name.as_deref(),
                message.sent_at,
            )
            .await?;
        let stored = self
            .store
            .insert_message(
                conversation.id,
                NewMessage::customer(
                    message.content,
                    message.provider_message_id.into_inner(),
                    message.sent_at,
                ),
            )
            .await?;
        if stored {
            tracing::info!(
                workspace_id = %conversation.workspace_id,
                conversation_id = %conversation.id,
                "inbound message stored"
            );
            if conversation.display_name_is_placeholder {
                self.enrich_display_name(&conversation, adapter, integration)
                    .await;
            }
        }
        Ok(stored)
    }

    async fn enrich_display_name(
        &self,
        conversation: &Conversation,
        adapter: &dyn ChannelAdapter,
        integration: &ChannelIntegration,
    ) {
        let lookup = adapter.fetch_profile(&conversation.external_customer_id, &integration.credentials);
        let profile = match tokio::time::timeout(self.profile_timeout, lookup).await {
            Ok(Ok(Some(profile))) => profile,
            Ok(Ok(None)) => return,
            Ok(Err(error)) => {
                tracing::debug!(conversation_id = %conversation.id, %error, "profile lookup failed");
                return;
            }
            Err(_) => {
                tracing::debug!(
                    conversation_id = %conversation.id,
                    timeout_ms = self.profile_timeout.as_millis() as u64,
                    "profile lookup timed out"
                );
                return;
            }
        };
        match self
            .store
            .upgrade_display_name(conversation.id, &profile.display_name)
            .await
        {
            Ok(true) => tracing::info!(conversation_id = %conversation.id, "customer display name enriched"),
            Ok(false) => {}
            Err(error) => {
                tracing::warn!(conversation_id = %conversation.id, %error, "display name upgrade failed")
            }
        }
    }
}
