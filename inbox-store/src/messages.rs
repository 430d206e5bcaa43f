use crate::db::Store;
use crate::error::{Result, StoreError};
use crate::models::{
    ConversationId, DeliveryStatus, Message, MessageId, NewMessage, SenderType, WorkspaceId,
    from_millis, to_millis,
};
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Row, params};

/// Error recorded on deliveries abandoned mid-flight.
pub const INTERRUPTED_DELIVERY: &str = "delivery interrupted before completion";

const MESSAGE_COLUMNS: &str = "id, conversation_id, content, sender_type, provider_message_id, \
     created_at, is_backfilled, reply_sent, delivery_status, delivery_error";

fn message_from_row(row: &Row<'_>) -> rusqlite::Result<Message> {
    Ok(Message {
        id: row.get(0)?,
        conversation_id: row.get(1)?,
        content: row.get(2)?,
        sender_type: row.get(3)?,
        provider_message_id: row.get(4)?,
        created_at: from_millis(row.get(5)?)?,
        is_backfilled: row.get(6)?,
        reply_sent: row.get(7)?,
        delivery_status: row.get(8)?,
        delivery_error: row.get(9)?,
    })
}

/// Dedup insert. `None` when `(conversation_id, provider_message_id)` exists.
fn insert_row(
    conn: &Connection,
    conversation_id: ConversationId,
    message: &NewMessage,
) -> rusqlite::Result<Option<MessageId>> {
    let id = MessageId::new();
    let changed = conn.execute(
        "INSERT INTO messages (id, conversation_id, content, sender_type, provider_message_id,
             created_at, is_backfilled, reply_sent, delivery_status, delivery_attempt_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
         ON CONFLICT(conversation_id, provider_message_id) DO NOTHING",
        params![
            id,
            conversation_id,
            message.content,
            message.sender_type,
            message.provider_message_id,
            to_millis(message.created_at),
            message.is_backfilled,
            message.reply_sent,
            message.delivery_status,
            message.delivery_status.as_ref().map(|_| to_millis(message.created_at)),
        ],
    )?;
    Ok((changed == 1).then_some(id))
}

fn load_message(conn: &Connection, id: MessageId) -> Result<Message> {
    conn.query_row(
        &format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = ?1"),
        params![id],
        message_from_row,
    )
    .optional()?
    .ok_or_else(|| StoreError::not_found("message", id))
}

fn collect_messages(
    conn: &Connection,
    sql: &str,
    params: impl rusqlite::Params,
) -> Result<Vec<Message>> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt.query_map(params, message_from_row)?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row?);
    }
    Ok(out)
}

/// Outcome of a history import.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImportSummary {
    /// The workspace had no messages before this import.
    pub first_import: bool,
    pub stored: usize,
    pub duplicates: usize,
    /// Imported rows stored as backfilled and already replied.
    pub marked_replied: usize,
}

impl Store {
    /// Returns whether the row was stored (false on a replayed provider id).
    pub async fn insert_message(
        &self,
        conversation_id: ConversationId,
        message: NewMessage,
    ) -> Result<bool> {
        self.call(move |conn| Ok(insert_row(conn, conversation_id, &message)?.is_some()))
            .await
    }

    pub async fn get_message(&self, id: MessageId) -> Result<Message> {
        self.call(move |conn| load_message(conn, id)).await
    }

    /// Historical import for one workspace, one transaction.
    ///
    /// On the workspace's first import every row is stored backfilled and
    /// replied. Later imports flag only rows older than `stale_before`, so a
    /// recent customer message that arrives via import can still be answered.
    #[tracing::instrument(level = "debug", skip_all, fields(%workspace_id))]
    pub async fn import_history(
        &self,
        workspace_id: WorkspaceId,
        threads: Vec<(ConversationId, Vec<NewMessage>)>,
        stale_before: DateTime<Utc>,
    ) -> Result<ImportSummary> {
        self.call(move |conn| {
            let tx = conn.transaction()?;
            let has_messages: bool = tx.query_row(
                "SELECT EXISTS (
                     SELECT 1 FROM messages m
                     JOIN conversations c ON c.id = m.conversation_id
                     WHERE c.workspace_id = ?1
                 )",
                params![workspace_id],
                |row| row.get(0),
            )?;
            let mut summary = ImportSummary {
                first_import: !has_messages,
                ..ImportSummary::default()
            };

            for (conversation_id, messages) in threads {
                for mut message in messages {
                    let stale = summary.first_import || message.created_at < stale_before;
                    if stale || message.sender_type != SenderType::Customer {
                        message.reply_sent = true;
                    }
                    if stale {
                        message.is_backfilled = true;
                    }
                    if message.sender_type.is_outbound() && message.delivery_status.is_none() {
                        message.delivery_status = Some(DeliveryStatus::Delivered);
                    }
                    match insert_row(&tx, conversation_id, &message)? {
                        Some(_) => {
                            summary.stored += 1;
                            if stale {
                                summary.marked_replied += 1;
                            }
                        }
                        None => summary.duplicates += 1,
                    }
                }
            }
            tx.commit()?;
            Ok(summary)
        })
        .await
    }

    /// Last `limit` messages, oldest first.
    pub async fn recent_history(
        &self,
        conversation_id: ConversationId,
        limit: usize,
    ) -> Result<Vec<Message>> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        self.call(move |conn| {
            let mut messages = collect_messages(
                conn,
                &format!(
                    "SELECT {MESSAGE_COLUMNS} FROM messages
                     WHERE conversation_id = ?1
                     ORDER BY created_at DESC, rowid DESC
                     LIMIT ?2"
                ),
                params![conversation_id, limit],
            )?;
            messages.reverse();
            Ok(messages)
        })
        .await
    }

    /// Customer messages awaiting a reply, oldest first.
    pub async fn unreplied_batch(
        &self,
        conversation_id: ConversationId,
        since: DateTime<Utc>,
    ) -> Result<Vec<Message>> {
        let since_ms = to_millis(since);
        self.call(move |conn| {
            collect_messages(
                conn,
                &format!(
                    "SELECT {MESSAGE_COLUMNS} FROM messages
                     WHERE conversation_id = ?1
                       AND sender_type = 'customer'
                       AND reply_sent = 0
                       AND is_backfilled = 0
                       AND created_at >= ?2
                     ORDER BY created_at ASC, rowid ASC"
                ),
                params![conversation_id, since_ms],
            )
        })
        .await
    }

    /// Every customer message still awaiting a reply, oldest first, with no
    /// lookback cutoff.
    pub async fn unreplied_backlog(&self, conversation_id: ConversationId) -> Result<Vec<Message>> {
        self.call(move |conn| {
            collect_messages(
                conn,
                &format!(
                    "SELECT {MESSAGE_COLUMNS} FROM messages
                     WHERE conversation_id = ?1
                       AND sender_type = 'customer'
                       AND reply_sent = 0
                       AND is_backfilled = 0
                     ORDER BY created_at ASC, rowid ASC"
                ),
                params![conversation_id],
            )
        })
        .await
    }

    /// Commit point of a reply: flag the answered batch and record the
    /// outbound row (pending delivery) atomically.
    pub async fn record_outbound(
        &self,
        conversation_id: ConversationId,
        outbound: NewMessage,
        answered: Vec<MessageId>,
    ) -> Result<Message> {
        if !outbound.sender_type.is_outbound() {
            return Err(StoreError::InvalidInput(format!(
                "sender_type {} is not outbound",
                outbound.sender_type
            )));
        }
        self.call(move |conn| {
            let tx = conn.transaction()?;
            {
                let mut stmt = tx.prepare(
                    "UPDATE messages SET reply_sent = 1 WHERE id = ?1 AND conversation_id = ?2",
                )?;
                for id in &answered {
                    stmt.execute(params![id, conversation_id])?;
                }
            }
            let id = insert_row(&tx, conversation_id, &outbound)?.ok_or_else(|| {
                StoreError::InvalidInput("outbound message collided with an existing row".into())
            })?;
            tx.execute(
                "UPDATE conversations SET last_message_at = MAX(last_message_at, ?2) WHERE id = ?1",
                params![conversation_id, to_millis(outbound.created_at)],
            )?;
            let message = load_message(&tx, id)?;
            tx.commit()?;
            Ok(message)
        })
        .await
    }

    pub async fn mark_delivered(&self, id: MessageId, provider_message_id: &str) -> Result<()> {
        let provider_message_id = provider_message_id.to_string();
        self.call(move |conn| {
            let changed = conn.execute(
                "UPDATE messages
                 SET delivery_status = 'delivered', delivery_error = NULL, provider_message_id = ?2
                 WHERE id = ?1",
                params![id, provider_message_id],
            )?;
            if changed == 0 {
                return Err(StoreError::not_found("message", id));
            }
            Ok(())
        })
        .await
    }

    pub async fn mark_failed(&self, id: MessageId, error: &str) -> Result<()> {
        let error = error.to_string();
        self.call(move |conn| {
            let changed = conn.execute(
                "UPDATE messages SET delivery_status = 'failed', delivery_error = ?2 WHERE id = ?1",
                params![id, error],
            )?;
            if changed == 0 {
                return Err(StoreError::not_found("message", id));
            }
            Ok(())
        })
        .await
    }

    /// Flip a failed outbound row back to pending so exactly one retry owns it.
    /// Returns false when the row is not currently `failed`.
    pub async fn claim_failed_for_retry(&self, id: MessageId) -> Result<bool> {
        let attempt_ms = to_millis(Utc::now());
        self.call(move |conn| {
            let changed = conn.execute(
                "UPDATE messages
                 SET delivery_status = 'pending', delivery_error = NULL, delivery_attempt_at = ?2
                 WHERE id = ?1 AND delivery_status = 'failed'",
                params![id, attempt_ms],
            )?;
            Ok(changed == 1)
        })
        .await
    }

    /// Fail outbound rows whose delivery attempt started before
    /// `attempted_before` and never finished, so they become retryable.
    pub async fn fail_stale_deliveries(&self, attempted_before: DateTime<Utc>) -> Result<usize> {
        let before_ms = to_millis(attempted_before);
        self.call(move |conn| {
            Ok(conn.execute(
                "UPDATE messages
                 SET delivery_status = 'failed', delivery_error = ?2
                 WHERE delivery_status = 'pending'
                   AND COALESCE(delivery_attempt_at, created_at) < ?1",
                params![before_ms, INTERRUPTED_DELIVERY],
            )?)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Conversation, Workspace};
    use chrono::Duration;
    use inbox_channels::Channel;

    async fn setup() -> (Store, Workspace, Conversation) {
        let store = Store::open_in_memory().expect("store");
        let ws = Workspace::new("shop", Utc::now()).with_default_ai(true, None);
        store.upsert_workspace(&ws).await.expect("workspace");
        let conversation = store
            .resolve_conversation(ws.id, Channel::Facebook, "PSID1", None, Utc::now())
            .await
            .expect("conversation");
        (store, ws, conversation)
    }

    #[tokio::test]
    async fn replayed_provider_id_is_stored_once() {
        let (store, _, conversation) = setup().await;
        let now = Utc::now();
        let message = NewMessage::customer("hello", "m_1", now);
        assert!(store.insert_message(conversation.id, message.clone()).await.expect("first"));
        assert!(!store.insert_message(conversation.id, message.clone()).await.expect("replay"));
        assert!(!store.insert_message(conversation.id, message).await.expect("replay again"));
        let history = store.recent_history(conversation.id, 10).await.expect("history");
        assert_eq!(history.len(), 1);
    }

    #[tokio::test]
    async fn messages_without_provider_id_never_conflict() {
        let (store, _, conversation) = setup().await;
        let note = NewMessage {
            provider_message_id: None,
            sender_type: SenderType::System,
            ..NewMessage::customer("note", "ignored", Utc::now())
        };
        assert!(store.insert_message(conversation.id, note.clone()).await.expect("first"));
        assert!(store.insert_message(conversation.id, note).await.expect("second"));
    }

    #[tokio::test]
    async fn recent_history_is_bounded_and_oldest_first() {
        let (store, _, conversation) = setup().await;
        let base = Utc::now() - Duration::minutes(10);
        for i in 0..5 {
            store
                .insert_message(
                    conversation.id,
                    NewMessage::customer(format!("m{i}"), format!("id{i}"), base + Duration::seconds(i)),
                )
                .await
                .expect("insert");
        }
        let history = store.recent_history(conversation.id, 3).await.expect("history");
        let contents: Vec<_> = history.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["m2", "m3", "m4"]);
    }

    #[tokio::test]
    async fn record_outbound_marks_batch_and_tracks_delivery() {
        let (store, _, conversation) = setup().await;
        let now = Utc::now();
        for i in 0..3 {
            store
                .insert_message(
                    conversation.id,
                    NewMessage::customer("hi", format!("m{i}"), now - Duration::seconds(30 - i)),
                )
                .await
                .expect("insert");
        }
        let batch = store
            .unreplied_batch(conversation.id, now - Duration::minutes(5))
            .await
            .expect("batch");
        assert_eq!(batch.len(), 3);

        let outbound = store
            .record_outbound(
                conversation.id,
                NewMessage::outbound("thanks!", SenderType::Ai, now),
                batch.iter().map(|m| m.id).collect(),
            )
            .await
            .expect("record");
        assert_eq!(outbound.delivery_status, Some(DeliveryStatus::Pending));
        assert!(outbound.reply_sent);
        assert!(
            store
                .unreplied_batch(conversation.id, now - Duration::minutes(5))
                .await
                .expect("batch after")
                .is_empty()
        );

        store.mark_failed(outbound.id, "status=500").await.expect("fail");
        let failed = store.get_message(outbound.id).await.expect("get");
        assert_eq!(failed.delivery_status, Some(DeliveryStatus::Failed));
        assert_eq!(failed.delivery_error.as_deref(), Some("status=500"));

        assert!(store.claim_failed_for_retry(outbound.id).await.expect("claim"));
        assert!(!store.claim_failed_for_retry(outbound.id).await.expect("second claim"));

        store.mark_delivered(outbound.id, "mid.99").await.expect("deliver");
        let delivered = store.get_message(outbound.id).await.expect("get");
        assert_eq!(delivered.delivery_status, Some(DeliveryStatus::Delivered));
        assert_eq!(delivered.provider_message_id.as_deref(), Some("mid.99"));
        assert_eq!(delivered.delivery_error, None);
    }

    #[tokio::test]
    async fn customer_rows_cannot_be_recorded_as_outbound() {
        let (store, _, conversation) = setup().await;
        let err = store
            .record_outbound(
                conversation.id,
                NewMessage::customer("x", "m", Utc::now()),
                Vec::new(),
            )
            .await
            .expect_err("customer outbound");
        assert!(matches!(err, StoreError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn first_import_marks_everything_replied_later_imports_only_stale_rows() {
        let (store, ws, conversation) = setup().await;
        let now = Utc::now();
        let stale_before = now - Duration::seconds(300);

        let first = store
            .import_history(
                ws.id,
                vec![(
                    conversation.id,
                    vec![
                        NewMessage::customer("old", "h1", now - Duration::days(2)),
                        NewMessage::customer("recent", "h2", now - Duration::seconds(20)),
                    ],
                )],
                stale_before,
            )
            .await
            .expect("first import");
        assert!(first.first_import);
        assert_eq!(first.stored, 2);
        assert_eq!(first.marked_replied, 2);
        assert!(
            store
                .unreplied_batch(conversation.id, stale_before)
                .await
                .expect("batch")
                .is_empty()
        );

        let second = store
            .import_history(
                ws.id,
                vec![(
                    conversation.id,
                    vec![
                        NewMessage::customer("recent", "h2", now - Duration::seconds(20)),
                        NewMessage::customer("older", "h3", now - Duration::hours(1)),
                        NewMessage::customer("fresh", "h4", now - Duration::seconds(15)),
                    ],
                )],
                stale_before,
            )
            .await
            .expect("second import");
        assert!(!second.first_import);
        assert_eq!(second.duplicates, 1);
        assert_eq!(second.stored, 2);
        assert_eq!(second.marked_replied, 1);

        let batch = store
            .unreplied_batch(conversation.id, stale_before)
            .await
            .expect("batch");
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].content, "fresh");
    }

    #[tokio::test]
    async fn backlog_ignores_the_lookback_window() {
        let (store, _, conversation) = setup().await;
        let now = Utc::now();
        store
            .insert_message(
                conversation.id,
                NewMessage::customer("old", "b1", now - Duration::minutes(30)),
            )
            .await
            .expect("insert");
        store
            .insert_message(
                conversation.id,
                NewMessage::customer("new", "b2", now - Duration::seconds(20)),
            )
            .await
            .expect("insert");

        let batch = store
            .unreplied_batch(conversation.id, now - Duration::minutes(5))
            .await
            .expect("batch");
        assert_eq!(batch.len(), 1);
        let backlog = store
            .unreplied_backlog(conversation.id)
            .await
            .expect("backlog");
        let contents: Vec<_> = backlog.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["old", "new"]);
    }

    #[tokio::test]
    async fn stale_pending_deliveries_become_retryable() {
        let (store, _, conversation) = setup().await;
        let now = Utc::now();
        let stuck = store
            .record_outbound(
                conversation.id,
                NewMessage::outbound("stuck", SenderType::Ai, now - Duration::minutes(10)),
                Vec::new(),
            )
            .await
            .expect("record stuck");
        let live = store
            .record_outbound(
                conversation.id,
                NewMessage::outbound("live", SenderType::Agent, now),
                Vec::new(),
            )
            .await
            .expect("record live");

        let recovered = store
            .fail_stale_deliveries(now - Duration::minutes(2))
            .await
            .expect("recover");
        assert_eq!(recovered, 1);
        let stuck = store.get_message(stuck.id).await.expect("stuck");
        assert_eq!(stuck.delivery_status, Some(DeliveryStatus::Failed));
        assert_eq!(stuck.delivery_error.as_deref(), Some(INTERRUPTED_DELIVERY));
        let live = store.get_message(live.id).await.expect("live");
        assert_eq!(live.delivery_status, Some(DeliveryStatus::Pending));

        // A retry restarts the clock even though the row itself is old.
        assert!(store.claim_failed_for_retry(stuck.id).await.expect("claim"));
        let recovered = store
            .fail_stale_deliveries(now - Duration::minutes(2))
            .await
            .expect("recover again");
        assert_eq!(recovered, 0);
    }
}
