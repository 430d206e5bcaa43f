//! Tenants and their channel integrations. Both are owned by the onboarding
//! and connect flows; the pipeline only reads them (`upsert_*` exist for
//! seeding and tests).

use crate::db::Store;
use crate::error::{Result, StoreError};
use crate::models::{ChannelIntegration, Workspace, WorkspaceId, from_millis, parse_channel, to_millis};
use inbox_channels::{Channel, ChannelCredentials};
use rusqlite::{OptionalExtension, Row, params};

const WORKSPACE_COLUMNS: &str = "id, name, default_ai_enabled, ai_agent_id, \
     reply_lookback_seconds, settle_seconds, created_at";

const INTEGRATION_COLUMNS: &str =
    "workspace_id, channel, is_connected, external_account_id, credentials, updated_at";

fn workspace_from_row(row: &Row<'_>) -> rusqlite::Result<Workspace> {
    Ok(Workspace {
        id: row.get(0)?,
        name: row.get(1)?,
        default_ai_enabled: row.get(2)?,
        ai_agent_id: row.get(3)?,
        reply_lookback_seconds: row.get(4)?,
        settle_seconds: row.get(5)?,
        created_at: from_millis(row.get(6)?)?,
    })
}

fn integration_from_row(row: &Row<'_>) -> rusqlite::Result<ChannelIntegration> {
    let channel: String = row.get(1)?;
    let credentials: String = row.get(4)?;
    let credentials: ChannelCredentials = serde_json::from_str(&credentials).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(4, rusqlite::types::Type::Text, Box::new(e))
    })?;
    Ok(ChannelIntegration {
        workspace_id: row.get(0)?,
        channel: parse_channel(&channel)?,
        is_connected: row.get(2)?,
        external_account_id: row.get(3)?,
        credentials,
        updated_at: from_millis(row.get(5)?)?,
    })
}

impl Store {
    pub async fn upsert_workspace(&self, workspace: &Workspace) -> Result<()> {
        let workspace = workspace.clone();
        self.call(move |conn| {
            conn.execute(
                "INSERT INTO workspaces (id, name, default_ai_enabled, ai_agent_id,
                     reply_lookback_seconds, settle_seconds, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                 ON CONFLICT(id) DO UPDATE SET
                     name = excluded.name,
                     default_ai_enabled = excluded.default_ai_enabled,
                     ai_agent_id = excluded.ai_agent_id,
                     reply_lookback_seconds = excluded.reply_lookback_seconds,
                     settle_seconds = excluded.settle_seconds",
                params![
                    workspace.id,
                    workspace.name,
                    workspace.default_ai_enabled,
                    workspace.ai_agent_id,
                    workspace.reply_lookback_seconds,
                    workspace.settle_seconds,
                    to_millis(workspace.created_at),
                ],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn get_workspace(&self, id: WorkspaceId) -> Result<Workspace> {
        self.call(move |conn| {
            conn.query_row(
                &format!("SELECT {WORKSPACE_COLUMNS} FROM workspaces WHERE id = ?1"),
                params![id],
                workspace_from_row,
            )
            .optional()?
            .ok_or_else(|| StoreError::not_found("workspace", id))
        })
        .await
    }

    pub async fn list_workspaces(&self) -> Result<Vec<Workspace>> {
        self.call(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {WORKSPACE_COLUMNS} FROM workspaces ORDER BY created_at ASC"
            ))?;
            let rows = stmt.query_map([], workspace_from_row)?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row?);
            }
            Ok(out)
        })
        .await
    }

    pub async fn upsert_integration(&self, integration: &ChannelIntegration) -> Result<()> {
        let integration = integration.clone();
        let credentials = serde_json::to_string(&integration.credentials)
            .map_err(|e| StoreError::InvalidInput(format!("credentials: {e}")))?;
        self.call(move |conn| {
            conn.execute(
                "INSERT INTO channel_integrations (workspace_id, channel, is_connected,
                     external_account_id, credentials, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(workspace_id, channel) DO UPDATE SET
                     is_connected = excluded.is_connected,
                     external_account_id = excluded.external_account_id,
                     credentials = excluded.credentials,
                     updated_at = excluded.updated_at",
                params![
                    integration.workspace_id,
                    integration.channel.as_str(),
                    integration.is_connected,
                    integration.external_account_id,
                    credentials,
                    to_millis(integration.updated_at),
                ],
            )?;
            Ok(())
        })
        .await
    }

    /// Credentials for sending on behalf of exactly this workspace.
    pub async fn get_connected_integration(
        &self,
        workspace_id: WorkspaceId,
        channel: Channel,
    ) -> Result<Option<ChannelIntegration>> {
        self.call(move |conn| {
            Ok(conn
                .query_row(
                    &format!(
                        "SELECT {INTEGRATION_COLUMNS} FROM channel_integrations
                         WHERE workspace_id = ?1 AND channel = ?2 AND is_connected = 1"
                    ),
                    params![workspace_id, channel.as_str()],
                    integration_from_row,
                )
                .optional()?)
        })
        .await
    }

    /// Every connected integration receiving traffic for `account_id`; several
    /// workspaces may share one page or number.
    pub async fn find_integrations_by_account(
        &self,
        channel: Channel,
        account_id: &str,
    ) -> Result<Vec<ChannelIntegration>> {
        let account_id = account_id.trim().to_string();
        self.call(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {INTEGRATION_COLUMNS} FROM channel_integrations
                 WHERE channel = ?1 AND external_account_id = ?2 AND is_connected = 1
                 ORDER BY workspace_id"
            ))?;
            let rows = stmt.query_map(params![channel.as_str(), account_id], integration_from_row)?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row?);
            }
            Ok(out)
        })
        .await
    }
}
