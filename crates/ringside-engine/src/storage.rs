//! Outcome persistence and the win/loss ledger.
//!
//! The engine talks to storage through [`StatsStore`]. The in-memory
//! implementation backs tests and the demo binary; a database-backed store
//! slots in behind the same trait.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::warn;

use ringside_metrics::MetricsSnapshot;
use ringside_protocol::{ChallengeId, Outcome, SessionId, UserId, Verdict, VoidReason};

#[derive(Debug, Clone, PartialEq, Error)]
pub enum StorageError {
    #[error("storage unavailable: {0}")]
    Unavailable(String),
}

/// Everything worth keeping about a finished fight.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub outcome: Outcome,
    pub challenger: UserId,
    pub challengee: UserId,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: DateTime<Utc>,
}

/// Snapshot written when a session is voided, for operator follow-up.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiagnosticsRecord {
    pub session_id: SessionId,
    pub challenge_id: ChallengeId,
    pub reason: VoidReason,
    pub joined: Vec<UserId>,
    pub metrics: Option<MetricsSnapshot>,
    pub timeline: Vec<String>,
    pub recorded_at: DateTime<Utc>,
}

/// Per-user ledger line.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRecord {
    pub wins: u32,
    pub losses: u32,
    pub draws: u32,
    pub total_fights: u32,
}

#[async_trait]
pub trait StatsStore: Send + Sync {
    /// Number of sessions the user is currently part of.
    async fn active_session_count(&self, user: &UserId) -> Result<u32, StorageError>;

    async fn note_session_started(
        &self,
        session: &SessionId,
        participants: &[UserId],
    ) -> Result<(), StorageError>;

    async fn note_session_closed(&self, session: &SessionId) -> Result<(), StorageError>;

    /// Append the outcome and update the ledger in one transaction.
    async fn record_outcome(&self, record: &SessionRecord) -> Result<(), StorageError>;

    /// Best-effort diagnostics write; losing one is logged, not fatal.
    async fn record_diagnostics(&self, record: &DiagnosticsRecord) -> Result<(), StorageError>;

    async fn user_record(&self, user: &UserId) -> Result<UserRecord, StorageError>;

    /// Top users by wins, ties broken by fewer total fights.
    async fn leaderboard(&self, limit: usize) -> Result<Vec<(UserId, UserRecord)>, StorageError>;
}

#[derive(Default)]
struct StoreInner {
    open_sessions: HashMap<SessionId, Vec<UserId>>,
    outcomes: Vec<SessionRecord>,
    diagnostics: Vec<DiagnosticsRecord>,
    ledger: HashMap<UserId, UserRecord>,
    fail_outcome_writes: u32,
}

/// In-memory [`StatsStore`] with fault injection for persistence tests.
#[derive(Clone, Default)]
pub struct MemoryStatsStore {
    inner: Arc<Mutex<StoreInner>>,
}

impl MemoryStatsStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` outcome writes fail with [`StorageError::Unavailable`].
    pub async fn fail_next_outcome_writes(&self, n: u32) {
        self.inner.lock().await.fail_outcome_writes = n;
    }

    pub async fn outcomes(&self) -> Vec<SessionRecord> {
        self.inner.lock().await.outcomes.clone()
    }

    pub async fn diagnostics(&self) -> Vec<DiagnosticsRecord> {
        self.inner.lock().await.diagnostics.clone()
    }
}

#[async_trait]
impl StatsStore for MemoryStatsStore {
    async fn active_session_count(&self, user: &UserId) -> Result<u32, StorageError> {
        let inner = self.inner.lock().await;
        let count = inner
            .open_sessions
            .values()
            .filter(|participants| participants.contains(user))
            .count();
        Ok(count as u32)
    }

    async fn note_session_started(
        &self,
        session: &SessionId,
        participants: &[UserId],
    ) -> Result<(), StorageError> {
        let mut inner = self.inner.lock().await;
        inner
            .open_sessions
            .insert(session.clone(), participants.to_vec());
        Ok(())
    }

    async fn note_session_closed(&self, session: &SessionId) -> Result<(), StorageError> {
        let mut inner = self.inner.lock().await;
        inner.open_sessions.remove(session);
        Ok(())
    }

    async fn record_outcome(&self, record: &SessionRecord) -> Result<(), StorageError> {
        let mut inner = self.inner.lock().await;
        if inner.fail_outcome_writes > 0 {
            inner.fail_outcome_writes -= 1;
            return Err(StorageError::Unavailable("injected write failure".into()));
        }
        match &record.outcome.verdict {
            Verdict::Winner(winner) => {
                let loser = if *winner == record.challenger {
                    record.challengee.clone()
                } else {
                    record.challenger.clone()
                };
                {
                    let entry = inner.ledger.entry(winner.clone()).or_default();
                    entry.wins += 1;
                    entry.total_fights += 1;
                }
                {
                    let entry = inner.ledger.entry(loser).or_default();
                    entry.losses += 1;
                    entry.total_fights += 1;
                }
            }
            Verdict::Draw => {
                for user in [&record.challenger, &record.challengee] {
                    let entry = inner.ledger.entry(user.clone()).or_default();
                    entry.draws += 1;
                    entry.total_fights += 1;
                }
            }
            Verdict::Void => {}
        }
        inner.outcomes.push(record.clone());
        Ok(())
    }

    async fn record_diagnostics(&self, record: &DiagnosticsRecord) -> Result<(), StorageError> {
        let mut inner = self.inner.lock().await;
        inner.diagnostics.push(record.clone());
        Ok(())
    }

    async fn user_record(&self, user: &UserId) -> Result<UserRecord, StorageError> {
        let inner = self.inner.lock().await;
        Ok(inner.ledger.get(user).copied().unwrap_or_default())
    }

    async fn leaderboard(&self, limit: usize) -> Result<Vec<(UserId, UserRecord)>, StorageError> {
        let inner = self.inner.lock().await;
        let mut rows: Vec<(UserId, UserRecord)> = inner
            .ledger
            .iter()
            .map(|(user, record)| (user.clone(), *record))
            .collect();
        rows.sort_by(|(a_id, a), (b_id, b)| {
            b.wins
                .cmp(&a.wins)
                .then(a.total_fights.cmp(&b.total_fights))
                .then(a_id.cmp(b_id))
        });
        rows.truncate(limit);
        Ok(rows)
    }
}

/// Persist an outcome record, retrying with doubling backoff.
///
/// `max_attempts` counts every attempt, the first included. The final error
/// is returned to the caller once the attempts run out.
pub async fn persist_with_retry(
    store: &dyn StatsStore,
    record: &SessionRecord,
    max_attempts: u32,
    initial_backoff: Duration,
) -> Result<(), StorageError> {
    let mut backoff = initial_backoff;
    let mut attempt = 1;
    loop {
        match store.record_outcome(record).await {
            Ok(()) => return Ok(()),
            Err(err) if attempt < max_attempts => {
                warn!(
                    session_id = %record.outcome.session_id,
                    attempt,
                    error = %err,
                    "outcome write failed, retrying"
                );
                tokio::time::sleep(backoff).await;
                backoff = backoff.saturating_mul(2);
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ringside_protocol::{DecisionBasis, FightKind};

    fn record_with_verdict(verdict: Verdict) -> SessionRecord {
        let session_id = SessionId::generate();
        let challenge_id = ChallengeId::generate();
        let outcome = Outcome::new(
            session_id,
            challenge_id,
            FightKind::Volume,
            verdict,
            DecisionBasis::CompositeScore,
            0.8,
            "test outcome".to_string(),
        );
        SessionRecord {
            outcome,
            challenger: UserId::new("alice"),
            challengee: UserId::new("bob"),
            started_at: Some(Utc::now()),
            ended_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_winner_updates_both_ledger_lines() {
        let store = MemoryStatsStore::new();
        let record = record_with_verdict(Verdict::Winner(UserId::new("alice")));
        store.record_outcome(&record).await.unwrap();

        let alice = store.user_record(&UserId::new("alice")).await.unwrap();
        assert_eq!(alice.wins, 1);
        assert_eq!(alice.total_fights, 1);

        let bob = store.user_record(&UserId::new("bob")).await.unwrap();
        assert_eq!(bob.losses, 1);
        assert_eq!(bob.total_fights, 1);
    }

    #[tokio::test]
    async fn test_draw_credits_both_sides() {
        let store = MemoryStatsStore::new();
        let record = record_with_verdict(Verdict::Draw);
        store.record_outcome(&record).await.unwrap();

        for name in ["alice", "bob"] {
            let user = store.user_record(&UserId::new(name)).await.unwrap();
            assert_eq!(user.draws, 1);
            assert_eq!(user.wins, 0);
            assert_eq!(user.total_fights, 1);
        }
    }

    #[tokio::test]
    async fn test_leaderboard_orders_by_wins_then_efficiency() {
        let store = MemoryStatsStore::new();
        // carol: 2 wins in 2 fights. alice: 2 wins in 3 fights. bob: 1 win.
        for (winner, loser) in [
            ("carol", "dave"),
            ("carol", "dave"),
            ("alice", "bob"),
            ("alice", "dave"),
            ("bob", "alice"),
        ] {
            let mut record = record_with_verdict(Verdict::Winner(UserId::new(winner)));
            record.challenger = UserId::new(winner);
            record.challengee = UserId::new(loser);
            store.record_outcome(&record).await.unwrap();
        }

        let board = store.leaderboard(3).await.unwrap();
        assert_eq!(board.len(), 3);
        assert_eq!(board[0].0, UserId::new("carol"));
        assert_eq!(board[1].0, UserId::new("alice"));
        assert_eq!(board[2].0, UserId::new("bob"));
    }

    #[tokio::test]
    async fn test_active_session_count_tracks_open_and_closed() {
        let store = MemoryStatsStore::new();
        let session = SessionId::generate();
        let alice = UserId::new("alice");
        let bob = UserId::new("bob");

        assert_eq!(store.active_session_count(&alice).await.unwrap(), 0);

        store
            .note_session_started(&session, &[alice.clone(), bob.clone()])
            .await
            .unwrap();
        assert_eq!(store.active_session_count(&alice).await.unwrap(), 1);
        assert_eq!(store.active_session_count(&bob).await.unwrap(), 1);

        store.note_session_closed(&session).await.unwrap();
        assert_eq!(store.active_session_count(&alice).await.unwrap(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_recovers_from_transient_failures() {
        let store = MemoryStatsStore::new();
        store.fail_next_outcome_writes(2).await;
        let record = record_with_verdict(Verdict::Winner(UserId::new("alice")));

        persist_with_retry(&store, &record, 3, Duration::from_millis(100))
            .await
            .unwrap();

        assert_eq!(store.outcomes().await.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_gives_up_after_max_attempts() {
        let store = MemoryStatsStore::new();
        store.fail_next_outcome_writes(5).await;
        let record = record_with_verdict(Verdict::Winner(UserId::new("alice")));

        let err = persist_with_retry(&store, &record, 3, Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::Unavailable(_)));
        assert!(store.outcomes().await.is_empty());
    }
}
