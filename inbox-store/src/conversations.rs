use crate::db::Store;
use crate::error::{Result, StoreError};
use crate::models::{
    Conversation, ConversationId, WorkspaceId, from_millis, parse_channel, to_millis,
};
use chrono::{DateTime, Utc};
use inbox_channels::{Channel, is_placeholder_display_name, placeholder_display_name};
use rusqlite::{OptionalExtension, Row, params};

pub(crate) const CONVERSATION_COLUMNS: &str = "c.id, c.workspace_id, c.channel, \
     c.external_customer_id, c.customer_display_name, c.display_name_is_placeholder, \
     c.ai_enabled, c.assigned_agent_id, c.last_message_at, c.created_at";

const RETURNING_COLUMNS: &str = "id, workspace_id, channel, external_customer_id, \
     customer_display_name, display_name_is_placeholder, ai_enabled, assigned_agent_id, \
     last_message_at, created_at";

pub(crate) fn conversation_from_row(row: &Row<'_>) -> rusqlite::Result<Conversation> {
    let channel: String = row.get(2)?;
    Ok(Conversation {
        id: row.get(0)?,
        workspace_id: row.get(1)?,
        channel: parse_channel(&channel)?,
        external_customer_id: row.get(3)?,
        customer_display_name: row.get(4)?,
        display_name_is_placeholder: row.get(5)?,
        ai_enabled: row.get(6)?,
        assigned_agent_id: row.get(7)?,
        last_message_at: from_millis(row.get(8)?)?,
        created_at: from_millis(row.get(9)?)?,
    })
}

/// A conversation with unreplied customer traffic inside its workspace's
/// lookback window, plus the workspace policy overrides that apply to it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplyCandidate {
    pub conversation: Conversation,
    pub lookback_seconds: i64,
    pub settle_seconds: Option<i64>,
}

impl Store {
    /// Find-or-create keyed on `(workspace, channel, external id)`.
    ///
    /// On conflict `last_message_at` only moves forward and a placeholder name
    /// is replaced by a real hint, never the other way round.
    #[tracing::instrument(level = "debug", skip_all, fields(%workspace_id, %channel))]
    pub async fn resolve_conversation(
        &self,
        workspace_id: WorkspaceId,
        channel: Channel,
        external_customer_id: &str,
        display_name_hint: Option<&str>,
        at: DateTime<Utc>,
    ) -> Result<Conversation> {
        let external_customer_id = external_customer_id.trim().to_string();
        if external_customer_id.is_empty() {
            return Err(StoreError::InvalidInput(
                "external_customer_id is required".to_string(),
            ));
        }
        let hint = display_name_hint
            .map(str::trim)
            .filter(|name| !is_placeholder_display_name(name, &external_customer_id))
            .map(str::to_string);
        let (display_name, is_placeholder) = match hint {
            Some(name) => (name, false),
            None => (placeholder_display_name(channel, &external_customer_id), true),
        };

        self.call(move |conn| {
            let tx = conn.transaction()?;
            let defaults = tx
                .query_row(
                    "SELECT default_ai_enabled, ai_agent_id FROM workspaces WHERE id = ?1",
                    params![workspace_id],
                    |row| Ok((row.get::<_, bool>(0)?, row.get::<_, Option<String>>(1)?)),
                )
                .optional()?;
            let Some((default_ai_enabled, ai_agent_id)) = defaults else {
                return Err(StoreError::not_found("workspace", workspace_id));
            };
            let assigned_agent_id = if default_ai_enabled { ai_agent_id } else { None };
            let at_ms = to_millis(at);

            let conversation = tx.query_row(
                &format!(
                    "INSERT INTO conversations (id, workspace_id, channel, external_customer_id,
                         customer_display_name, display_name_is_placeholder, ai_enabled,
                         assigned_agent_id, last_message_at, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?9)
                     ON CONFLICT(workspace_id, channel, external_customer_id) DO UPDATE SET
                         last_message_at = MAX(last_message_at, excluded.last_message_at),
                         customer_display_name = CASE
                             WHEN display_name_is_placeholder = 1
                                  AND excluded.display_name_is_placeholder = 0
                             THEN excluded.customer_display_name
                             ELSE customer_display_name END,
                         display_name_is_placeholder = CASE
                             WHEN display_name_is_placeholder = 1
                                  AND excluded.display_name_is_placeholder = 0
                             THEN 0
                             ELSE display_name_is_placeholder END
                     RETURNING {RETURNING_COLUMNS}"
                ),
                params![
                    ConversationId::new(),
                    workspace_id,
                    channel.as_str(),
                    external_customer_id,
                    display_name,
                    is_placeholder,
                    default_ai_enabled,
                    assigned_agent_id,
                    at_ms,
                ],
                conversation_from_row,
            )?;
            tx.commit()?;
            Ok(conversation)
        })
        .await
    }

    pub async fn get_conversation(&self, id: ConversationId) -> Result<Conversation> {
        self.call(move |conn| {
            conn.query_row(
                &format!("SELECT {CONVERSATION_COLUMNS} FROM conversations c WHERE c.id = ?1"),
                params![id],
                conversation_from_row,
            )
            .optional()?
            .ok_or_else(|| StoreError::not_found("conversation", id))
        })
        .await
    }

    /// Upgrade a placeholder name. Returns false when the stored name is
    /// already real or the candidate is itself a placeholder.
    pub async fn upgrade_display_name(&self, id: ConversationId, name: &str) -> Result<bool> {
        let name = name.trim().to_string();
        self.call(move |conn| {
            let external_id: Option<String> = conn
                .query_row(
                    "SELECT external_customer_id FROM conversations WHERE id = ?1",
                    params![id],
                    |row| row.get(0),
                )
                .optional()?;
            let Some(external_id) = external_id else {
                return Err(StoreError::not_found("conversation", id));
            };
            if is_placeholder_display_name(&name, &external_id) {
                return Ok(false);
            }
            let changed = conn.execute(
                "UPDATE conversations
                 SET customer_display_name = ?2, display_name_is_placeholder = 0
                 WHERE id = ?1 AND display_name_is_placeholder = 1",
                params![id, name],
            )?;
            Ok(changed == 1)
        })
        .await
    }

    pub async fn set_ai_enabled(&self, id: ConversationId, enabled: bool) -> Result<()> {
        self.call(move |conn| {
            let changed = conn.execute(
                "UPDATE conversations SET ai_enabled = ?2 WHERE id = ?1",
                params![id, enabled],
            )?;
            if changed == 0 {
                return Err(StoreError::not_found("conversation", id));
            }
            Ok(())
        })
        .await
    }

    /// AI-enabled conversations holding at least one customer message that is
    /// unreplied, not backfilled, and younger than the lookback window
    /// (workspace override, else `default_lookback_seconds`).
    pub async fn list_reply_candidates(
        &self,
        now: DateTime<Utc>,
        default_lookback_seconds: i64,
    ) -> Result<Vec<ReplyCandidate>> {
        let now_ms = to_millis(now);
        self.call(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {CONVERSATION_COLUMNS},
                        COALESCE(w.reply_lookback_seconds, ?2) AS lookback,
                        w.settle_seconds
                 FROM conversations c
                 JOIN workspaces w ON w.id = c.workspace_id
                 WHERE c.ai_enabled = 1
                   AND EXISTS (
                       SELECT 1 FROM messages m
                       WHERE m.conversation_id = c.id
                         AND m.sender_type = 'customer'
                         AND m.reply_sent = 0
                         AND m.is_backfilled = 0
                         AND m.created_at >= ?1 - COALESCE(w.reply_lookback_seconds, ?2) * 1000
                   )
                 ORDER BY c.last_message_at ASC"
            ))?;
            let rows = stmt.query_map(params![now_ms, default_lookback_seconds], |row| {
                Ok(ReplyCandidate {
                    conversation: conversation_from_row(row)?,
                    lookback_seconds: row.get(10)?,
                    settle_seconds: row.get(11)?,
                })
            })?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row?);
            }
            Ok(out)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{NewMessage, Workspace};
    use chrono::Duration;

    async fn store_with_workspace(default_ai: bool) -> (Store, Workspace) {
        let store = Store::open_in_memory().expect("store");
        let ws = Workspace::new("shop", Utc::now())
            .with_default_ai(default_ai, Some("agent-ai".to_string()));
        store.upsert_workspace(&ws).await.expect("workspace");
        (store, ws)
    }

    #[tokio::test]
    async fn resolve_is_idempotent_and_inherits_workspace_defaults() {
        let (store, ws) = store_with_workspace(true).await;
        let t0 = Utc::now();
        let first = store
            .resolve_conversation(ws.id, Channel::Telegram, "987654321", None, t0)
            .await
            .expect("resolve");
        assert!(first.ai_enabled);
        assert_eq!(first.assigned_agent_id.as_deref(), Some("agent-ai"));
        assert_eq!(first.customer_display_name, "Telegram User 54321");
        assert!(first.display_name_is_placeholder);

        let second = store
            .resolve_conversation(ws.id, Channel::Telegram, "987654321", None, t0 + Duration::seconds(5))
            .await
            .expect("resolve again");
        assert_eq!(second.id, first.id);
        assert_eq!(
            second.last_message_at.timestamp_millis(),
            (t0 + Duration::seconds(5)).timestamp_millis()
        );
        assert_eq!(second.created_at, first.created_at);

        let other_channel = store
            .resolve_conversation(ws.id, Channel::Whatsapp, "987654321", None, t0)
            .await
            .expect("resolve other channel");
        assert_ne!(other_channel.id, first.id);
    }

    #[tokio::test]
    async fn last_message_at_never_moves_backwards() {
        let (store, ws) = store_with_workspace(false).await;
        let t0 = Utc::now();
        store
            .resolve_conversation(ws.id, Channel::Facebook, "PSID1", None, t0)
            .await
            .expect("resolve");
        let late_replay = store
            .resolve_conversation(ws.id, Channel::Facebook, "PSID1", None, t0 - Duration::minutes(10))
            .await
            .expect("replay");
        assert_eq!(late_replay.last_message_at.timestamp_millis(), t0.timestamp_millis());
        assert!(!late_replay.ai_enabled);
        assert_eq!(late_replay.assigned_agent_id, None);
    }

    #[tokio::test]
    async fn placeholder_names_upgrade_but_never_downgrade() {
        let (store, ws) = store_with_workspace(false).await;
        let now = Utc::now();
        let placeholder = store
            .resolve_conversation(ws.id, Channel::Whatsapp, "970599000111", Some("970599000111"), now)
            .await
            .expect("resolve");
        assert!(placeholder.display_name_is_placeholder);

        let named = store
            .resolve_conversation(ws.id, Channel::Whatsapp, "970599000111", Some("أسامة عبدو"), now)
            .await
            .expect("resolve named");
        assert_eq!(named.customer_display_name, "أسامة عبدو");
        assert!(!named.display_name_is_placeholder);

        let downgraded = store
            .resolve_conversation(ws.id, Channel::Whatsapp, "970599000111", Some("Unknown"), now)
            .await
            .expect("resolve placeholder hint");
        assert_eq!(downgraded.customer_display_name, "أسامة عبدو");

        let renamed = store
            .resolve_conversation(ws.id, Channel::Whatsapp, "970599000111", Some("Someone Else"), now)
            .await
            .expect("resolve other real name");
        assert_eq!(renamed.customer_display_name, "أسامة عبدو");

        assert!(
            !store
                .upgrade_display_name(named.id, "Another Name")
                .await
                .expect("upgrade")
        );
    }

    #[tokio::test]
    async fn upgrade_display_name_replaces_placeholder_only_with_real_names() {
        let (store, ws) = store_with_workspace(false).await;
        let conversation = store
            .resolve_conversation(ws.id, Channel::Instagram, "IGSID77", None, Utc::now())
            .await
            .expect("resolve");
        assert!(
            !store
                .upgrade_display_name(conversation.id, "Instagram User 77")
                .await
                .expect("placeholder candidate")
        );
        assert!(
            store
                .upgrade_display_name(conversation.id, "Lina")
                .await
                .expect("real candidate")
        );
        let stored = store.get_conversation(conversation.id).await.expect("get");
        assert_eq!(stored.customer_display_name, "Lina");
        assert!(!stored.display_name_is_placeholder);
    }

    #[tokio::test]
    async fn resolve_for_unknown_workspace_is_not_found() {
        let store = Store::open_in_memory().expect("store");
        let err = store
            .resolve_conversation(WorkspaceId::new(), Channel::Telegram, "1", None, Utc::now())
            .await
            .expect_err("unknown workspace");
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn reply_candidates_respect_lookback_and_ai_flag() {
        let (store, ws) = store_with_workspace(true).await;
        let now = Utc::now();
        let fresh = store
            .resolve_conversation(ws.id, Channel::Telegram, "1", None, now)
            .await
            .expect("fresh");
        let stale = store
            .resolve_conversation(ws.id, Channel::Telegram, "2", None, now)
            .await
            .expect("stale");
        let disabled = store
            .resolve_conversation(ws.id, Channel::Telegram, "3", None, now)
            .await
            .expect("disabled");
        store.set_ai_enabled(disabled.id, false).await.expect("disable");

        for (conversation, age) in [(&fresh, 20), (&stale, 301), (&disabled, 20)] {
            store
                .insert_message(
                    conversation.id,
                    NewMessage::customer("hi", format!("m-{}", conversation.id), now - Duration::seconds(age)),
                )
                .await
                .expect("insert");
        }

        let candidates = store
            .list_reply_candidates(now, 300)
            .await
            .expect("candidates");
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].conversation.id, fresh.id);
        assert_eq!(candidates[0].lookback_seconds, 300);
        assert_eq!(candidates[0].settle_seconds, None);
    }
}
