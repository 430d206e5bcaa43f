//! Connection management and schema.
//!
//! One SQLite connection behind a mutex. Every statement runs on the blocking
//! pool via [`Store::call`], so async callers never block a runtime worker.

use crate::error::{Result, StoreError};
use rusqlite::Connection;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS workspaces (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    default_ai_enabled INTEGER NOT NULL DEFAULT 0,
    ai_agent_id TEXT,
    reply_lookback_seconds INTEGER,
    settle_seconds INTEGER,
    created_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS channel_integrations (
    workspace_id TEXT NOT NULL REFERENCES workspaces(id),
    channel TEXT NOT NULL,
    is_connected INTEGER NOT NULL DEFAULT 0,
    external_account_id TEXT,
    credentials TEXT NOT NULL DEFAULT '{}',
    updated_at INTEGER NOT NULL,
    PRIMARY KEY (workspace_id, channel)
);
CREATE INDEX IF NOT EXISTS idx_integrations_account
    ON channel_integrations (channel, external_account_id);

CREATE TABLE IF NOT EXISTS products (
    id TEXT PRIMARY KEY,
    workspace_id TEXT NOT NULL REFERENCES workspaces(id),
    name TEXT NOT NULL,
    description TEXT NOT NULL DEFAULT '',
    price TEXT NOT NULL,
    stock INTEGER,
    is_active INTEGER NOT NULL DEFAULT 1
);
CREATE INDEX IF NOT EXISTS idx_products_workspace ON products (workspace_id, is_active);

CREATE TABLE IF NOT EXISTS conversations (
    id TEXT PRIMARY KEY,
    workspace_id TEXT NOT NULL REFERENCES workspaces(id),
    channel TEXT NOT NULL,
    external_customer_id TEXT NOT NULL,
    customer_display_name TEXT NOT NULL,
    display_name_is_placeholder INTEGER NOT NULL DEFAULT 1,
    ai_enabled INTEGER NOT NULL DEFAULT 0,
    assigned_agent_id TEXT,
    last_message_at INTEGER NOT NULL,
    created_at INTEGER NOT NULL,
    UNIQUE (workspace_id, channel, external_customer_id)
);

CREATE TABLE IF NOT EXISTS messages (
    id TEXT PRIMARY KEY,
    conversation_id TEXT NOT NULL REFERENCES conversations(id),
    content TEXT NOT NULL,
    sender_type TEXT NOT NULL,
    provider_message_id TEXT,
    created_at INTEGER NOT NULL,
    is_backfilled INTEGER NOT NULL DEFAULT 0,
    reply_sent INTEGER NOT NULL DEFAULT 0,
    delivery_status TEXT,
    delivery_error TEXT,
    delivery_attempt_at INTEGER,
    UNIQUE (conversation_id, provider_message_id)
);
CREATE INDEX IF NOT EXISTS idx_messages_conversation_created
    ON messages (conversation_id, created_at);
CREATE INDEX IF NOT EXISTS idx_messages_unreplied
    ON messages (reply_sent, is_backfilled, sender_type, created_at);

CREATE TABLE IF NOT EXISTS processing_locks (
    conversation_id TEXT PRIMARY KEY,
    holder TEXT NOT NULL,
    acquired_at INTEGER NOT NULL,
    expires_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS orders (
    id TEXT PRIMARY KEY,
    order_number TEXT NOT NULL UNIQUE,
    workspace_id TEXT NOT NULL REFERENCES workspaces(id),
    conversation_id TEXT NOT NULL REFERENCES conversations(id),
    product_id TEXT NOT NULL REFERENCES products(id),
    quantity INTEGER NOT NULL,
    customer_name TEXT NOT NULL,
    customer_phone TEXT NOT NULL,
    customer_address TEXT NOT NULL,
    unit_price TEXT NOT NULL,
    price TEXT NOT NULL,
    status TEXT NOT NULL,
    created_by TEXT NOT NULL,
    turn_key TEXT NOT NULL UNIQUE,
    created_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_orders_conversation ON orders (conversation_id);
"#;

#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

impl Store {
    /// Open (creating if needed) a file-backed database and apply the schema.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| {
                StoreError::InvalidInput(format!(
                    "create database directory {}: {e}",
                    parent.display()
                ))
            })?;
        }
        let conn = Connection::open(path)?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |_| Ok(()))?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.execute_batch(SCHEMA)?;
        tracing::debug!("store schema ready");
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run `f` against the connection on the blocking pool.
    pub(crate) async fn call<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut guard = conn.lock().map_err(|_| StoreError::Poisoned)?;
            f(&mut guard)
        })
        .await
        .map_err(|e| StoreError::Join(e.to_string()))?
    }

    /// Cheap liveness probe for `doctor` and health checks.
    pub async fn ping(&self) -> Result<()> {
        self.call(|conn| {
            conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))?;
            Ok(())
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn file_store_creates_parent_dirs_and_reopens() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("nested").join("inbox.db");
        let store = Store::open(&path).expect("open");
        store.ping().await.expect("ping");
        drop(store);
        let reopened = Store::open(&path).expect("reopen");
        reopened.ping().await.expect("ping after reopen");
    }

    #[tokio::test]
    async fn in_memory_store_applies_schema() {
        let store = Store::open_in_memory().expect("open");
        let tables: i64 = store
            .call(|conn| {
                Ok(conn.query_row(
                    "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table'",
                    [],
                    |row| row.get(0),
                )?)
            })
            .await
            .expect("count tables");
        assert_eq!(tables, 7);
    }
}
