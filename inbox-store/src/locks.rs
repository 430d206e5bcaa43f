use crate::db::Store;
use crate::error::Result;
use crate::models::{ConversationId, Lease, to_millis};
use chrono::{DateTime, Duration, Utc};
use rusqlite::params;
use uuid::Uuid;

impl Store {
    /// Take the per-conversation processing lock if it is free or expired.
    ///
    /// Acquired iff the conditional upsert changed exactly one row. There are
    /// no heartbeats: a crashed holder's lock is taken over after `ttl`.
    pub async fn try_acquire_lock(
        &self,
        conversation_id: ConversationId,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> Result<Option<Lease>> {
        let holder = Uuid::new_v4().to_string();
        let expires_at = now + ttl;
        self.call(move |conn| {
            let changed = conn.execute(
                "INSERT INTO processing_locks (conversation_id, holder, acquired_at, expires_at)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(conversation_id) DO UPDATE SET
                     holder = excluded.holder,
                     acquired_at = excluded.acquired_at,
                     expires_at = excluded.expires_at
                 WHERE processing_locks.expires_at <= excluded.acquired_at",
                params![
                    conversation_id,
                    holder,
                    to_millis(now),
                    to_millis(expires_at)
                ],
            )?;
            Ok((changed == 1).then(|| Lease {
                conversation_id,
                holder,
                expires_at,
            }))
        })
        .await
    }

    /// Deletes the lock only while `lease` still owns it. Returns false when
    /// the lease expired and someone else took over.
    pub async fn release_lock(&self, lease: &Lease) -> Result<bool> {
        let conversation_id = lease.conversation_id;
        let holder = lease.holder.clone();
        self.call(move |conn| {
            let changed = conn.execute(
                "DELETE FROM processing_locks WHERE conversation_id = ?1 AND holder = ?2",
                params![conversation_id, holder],
            )?;
            Ok(changed == 1)
        })
        .await
    }

    pub async fn purge_expired_locks(&self, now: DateTime<Utc>) -> Result<usize> {
        self.call(move |conn| {
            Ok(conn.execute(
                "DELETE FROM processing_locks WHERE expires_at <= ?1",
                params![to_millis(now)],
            )?)
        })
        .await
    }
}
