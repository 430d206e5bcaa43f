//! History import for a freshly connected channel.

use anyhow::{Result, anyhow};
use chrono::{DateTime, Duration, Utc};
use inbox_channels::{Channel, ChannelRegistry, InboundMessage};
use inbox_store::{DeliveryStatus, ImportSummary, NewMessage, SenderType, Store, WorkspaceId};
use serde::Serialize;
use std::collections::BTreeMap;

#[derive(Debug, Clone, Default, Serialize)]
pub struct BackfillReport {
    pub fetched: usize,
    pub conversations: usize,
    pub first_import: bool,
    pub stored: usize,
    pub duplicates: usize,
    pub marked_replied: usize,
}

impl BackfillReport {
    fn from_summary(fetched: usize, conversations: usize, summary: ImportSummary) -> Self {
        Self {
            fetched,
            conversations,
            first_import: summary.first_import,
            stored: summary.stored,
            duplicates: summary.duplicates,
            marked_replied: summary.marked_replied,
        }
    }
}

/// Pull recent history through the channel adapter and import it. Messages
/// older than the reply lookback window (and everything on the workspace's
/// first import) are stored as already answered.
#[tracing::instrument(level = "info", skip_all, fields(%workspace_id, %channel))]
pub async fn import_channel_history(
    store: &Store,
    channels: &ChannelRegistry,
    workspace_id: WorkspaceId,
    channel: Channel,
    default_lookback_seconds: i64,
    now: DateTime<Utc>,
) -> Result<BackfillReport> {
    let workspace = store.get_workspace(workspace_id).await?;
    let integration = store
        .get_connected_integration(workspace_id, channel)
        .await?
        .ok_or_else(|| anyhow!("workspace {workspace_id} has no connected {channel} integration"))?;
    let adapter = channels.get(channel)?;
    let history = adapter.fetch_history(&integration.credentials).await?;
    let fetched = history.len();

    let mut by_customer: BTreeMap<String, Vec<InboundMessage>> = BTreeMap::new();
    for message in history {
        by_customer
            .entry(message.customer_id.to_string())
            .or_default()
            .push(message);
    }

    let mut threads = Vec::with_capacity(by_customer.len());
    for (customer_id, mut messages) in by_customer {
        messages.sort_by_key(|m| m.sent_at);
        let name_hint = messages
            .iter()
            .filter(|m| !m.from_business)
            .find_map(|m| m.sender_name.clone());
        let last_at = messages.last().map(|m| m.sent_at).unwrap_or(now);
        let conversation = store
            .resolve_conversation(workspace_id, channel, &customer_id, name_hint.as_deref(), last_at)
            .await?;
        let rows = messages.into_iter().map(history_row).collect();
        threads.push((conversation.id, rows));
    }

    let conversations = threads.len();
    let lookback = workspace
        .reply_lookback_seconds
        .unwrap_or(default_lookback_seconds);
    let summary = store
        .import_history(workspace_id, threads, now - Duration::seconds(lookback))
        .await?;
    let report = BackfillReport::from_summary(fetched, conversations, summary);
    tracing::info!(
        fetched = report.fetched,
        conversations = report.conversations,
        stored = report.stored,
        duplicates = report.duplicates,
        first_import = report.first_import,
        "history imported"
    );
    Ok(report)
}

fn history_row(message: InboundMessage) -> NewMessage {
    if message.from_business {
        return NewMessage {
            content: message.content,
            sender_type: SenderType::Agent,
            provider_message_id: Some(message.provider_message_id.into_inner()),
            created_at: message.sent_at,
            is_backfilled: false,
            reply_sent: true,
            delivery_status: Some(DeliveryStatus::Delivered),
        };
    }
    NewMessage::customer(
        message.content,
        message.provider_message_id.into_inner(),
        message.sent_at,
    )
}
