//! Debounce scheduler. Each sweep picks AI-enabled conversations whose
//! unreplied burst has settled, locks them, and runs their turns as bounded
//! tasks whose outcomes are collected into a [`SweepReport`].

use crate::turn::{TurnEngine, TurnReport};
use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use inbox_store::{Message, ReplyCandidate, Store};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    pub reply_lookback_seconds: i64,
    pub settle_seconds: i64,
    pub lock_ttl: Duration,
    pub max_concurrent_turns: usize,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SweepReport {
    pub started_at: Option<DateTime<Utc>>,
    pub purged_locks: usize,
    /// Outbound rows stuck in `pending` past the lock TTL, now `failed`.
    pub recovered_deliveries: usize,
    pub candidates: usize,
    pub skipped_settling: usize,
    pub skipped_locked: usize,
    /// Answered by someone else between selection and lock acquisition.
    pub skipped_empty: usize,
    /// Selection or lock bookkeeping errors, logged per conversation.
    pub errors: usize,
    pub turns: Vec<TurnReport>,
}

pub struct Scheduler {
    store: Store,
    engine: Arc<TurnEngine>,
    settings: SchedulerSettings,
}

enum Admission {
    Ready(Vec<Message>),
    Settling,
    Empty,
}

impl Scheduler {
    pub fn new(store: Store, engine: Arc<TurnEngine>, settings: SchedulerSettings) -> Self {
        Self {
            store,
            engine,
            settings,
        }
    }

    #[tracing::instrument(level = "info", skip_all)]
    pub async fn sweep(&self, now: DateTime<Utc>) -> Result<SweepReport> {
        let mut report = SweepReport {
            started_at: Some(now),
            ..SweepReport::default()
        };
        // Leases live on the wall clock; `now` only drives selection.
        let wall_clock = Utc::now();
        report.purged_locks = self.store.purge_expired_locks(wall_clock).await?;
        report.recovered_deliveries = self
            .store
            .fail_stale_deliveries(wall_clock - self.settings.lock_ttl)
            .await?;
        if report.recovered_deliveries > 0 {
            tracing::warn!(
                recovered = report.recovered_deliveries,
                "interrupted deliveries marked failed"
            );
        }
        let candidates = self
            .store
            .list_reply_candidates(now, self.settings.reply_lookback_seconds)
            .await?;
        report.candidates = candidates.len();

        let permits = Arc::new(Semaphore::new(self.settings.max_concurrent_turns.max(1)));
        let mut turns = JoinSet::new();
        for candidate in candidates {
            let conversation_id = candidate.conversation.id;
            match self.admit(&candidate, now).await {
                Ok(Admission::Ready(_)) => {}
                Ok(Admission::Settling) => {
                    report.skipped_settling += 1;
                    continue;
                }
                Ok(Admission::Empty) => {
                    report.skipped_empty += 1;
                    continue;
                }
                Err(error) => {
                    tracing::warn!(%conversation_id, error = %format!("{error:#}"), "candidate selection failed");
                    report.errors += 1;
                    continue;
                }
            }

            let permit = Arc::clone(&permits).acquire_owned().await?;
            let lease = match self
                .store
                .try_acquire_lock(conversation_id, Utc::now(), self.settings.lock_ttl)
                .await
            {
                Ok(Some(lease)) => lease,
                Ok(None) => {
                    tracing::debug!(%conversation_id, "conversation locked by another worker");
                    report.skipped_locked += 1;
                    continue;
                }
                Err(error) => {
                    tracing::warn!(%conversation_id, %error, "lock acquisition failed");
                    report.errors += 1;
                    continue;
                }
            };

            // Re-read under the lock: a turn that finished since selection
            // has already marked the earlier batch replied.
            let batch = match self.admit(&candidate, now).await {
                Ok(Admission::Ready(batch)) => batch,
                other => {
                    match other {
                        Ok(Admission::Settling) => report.skipped_settling += 1,
                        Ok(_) => report.skipped_empty += 1,
                        Err(error) => {
                            tracing::warn!(%conversation_id, error = %format!("{error:#}"), "batch reload failed");
                            report.errors += 1;
                        }
                    }
                    if let Err(error) = self.store.release_lock(&lease).await {
                        tracing::warn!(%conversation_id, %error, "lock release failed");
                    }
                    continue;
                }
            };

            let engine = Arc::clone(&self.engine);
            let store = self.store.clone();
            let conversation = candidate.conversation;
            turns.spawn(async move {
                let _permit = permit;
                let turn = engine.run_turn(&conversation, &batch).await;
                match store.release_lock(&lease).await {
                    Ok(true) => {}
                    Ok(false) => tracing::warn!(
                        conversation_id = %conversation.id,
                        "lease expired before the turn finished"
                    ),
                    Err(error) => tracing::warn!(
                        conversation_id = %conversation.id,
                        %error,
                        "lock release failed"
                    ),
                }
                turn
            });
        }

        while let Some(joined) = turns.join_next().await {
            match joined {
                Ok(turn) => report.turns.push(turn),
                Err(error) => {
                    tracing::error!(%error, "turn task join failed");
                    report.errors += 1;
                }
            }
        }

        tracing::info!(
            candidates = report.candidates,
            turns = report.turns.len(),
            skipped_settling = report.skipped_settling,
            skipped_locked = report.skipped_locked,
            skipped_empty = report.skipped_empty,
            errors = report.errors,
            purged_locks = report.purged_locks,
            recovered_deliveries = report.recovered_deliveries,
            "sweep completed"
        );
        Ok(report)
    }

    async fn admit(&self, candidate: &ReplyCandidate, now: DateTime<Utc>) -> Result<Admission> {
        let since = now - Duration::seconds(candidate.lookback_seconds);
        let batch = self
            .store
            .unreplied_batch(candidate.conversation.id, since)
            .await?;
        let Some(newest) = batch.last() else {
            return Ok(Admission::Empty);
        };
        let settle = candidate
            .settle_seconds
            .unwrap_or(self.settings.settle_seconds);
        if now - newest.created_at < Duration::seconds(settle) {
            return Ok(Admission::Settling);
        }
        Ok(Admission::Ready(batch))
    }

    /// Embedded ticker; stops when `shutdown` is cancelled.
    pub async fn run_every(self: Arc<Self>, interval: std::time::Duration, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        tracing::info!(interval_seconds = interval.as_secs(), "embedded sweep ticker started");
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(error) = self.sweep(Utc::now()).await {
                        tracing::error!(error = %format!("{error:#}"), "embedded sweep failed");
                    }
                }
            }
        }
        tracing::info!("embedded sweep ticker stopped");
    }
}
