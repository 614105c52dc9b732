//! The challenge coordinator.
//!
//! One coordinator owns every challenge and fight session in the process.
//! All state lives behind a single `RwLock`; deadlines are spawned tasks
//! that re-validate against the stored generation when they fire, so a
//! stale timer is a no-op instead of a race.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use thiserror::Error;
use tokio::sync::{broadcast, watch, RwLock};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use ringside_agents::{AgentError, AgentLease, AgentPool, WatcherAgent};
use ringside_decision::{Decision, FightPolicy, TickDecision};
use ringside_metrics::{MetricsAggregator, MetricsSnapshot};
use ringside_protocol::{
    Challenge, ChallengeId, ChallengeStatus, ChannelRef, DecisionBasis, FightKind, LifecycleEvent,
    Outcome, ProtocolError, Sample, SessionId, SessionState, UserId, Verdict, VoidReason,
};

use crate::config::EngineConfig;
use crate::recording::Recorder;
use crate::session::FightSession;
use crate::storage::{
    persist_with_retry, DiagnosticsRecord, SessionRecord, StatsStore, StorageError,
};

/// Capacity of the lifecycle broadcast. Slow subscribers lag; they never
/// block the engine.
const EVENT_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum EngineError {
    #[error("invalid challenge target: {reason}")]
    InvalidTarget { reason: String },

    #[error("unknown challenge {0}")]
    UnknownChallenge(ChallengeId),

    #[error("unknown session {0}")]
    UnknownSession(SessionId),

    #[error("challenge {challenge_id} is {status}, expected {expected}")]
    WrongChallengeStatus {
        challenge_id: ChallengeId,
        status: ChallengeStatus,
        expected: ChallengeStatus,
    },

    #[error("stale timer for session {session_id} (state {state}, generation {generation})")]
    TimerRace {
        session_id: SessionId,
        state: SessionState,
        generation: u64,
    },

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// What a challenge response amounted to.
#[derive(Debug, Clone, PartialEq)]
pub enum RespondAck {
    Accepted,
    Declined,
    /// The challenge had already left `Pending`; the response changed
    /// nothing. Carries the status the responder raced against.
    Ignored(ChallengeStatus),
}

/// What a user is currently tied up in. At most one engagement per user.
#[derive(Debug, Clone, PartialEq)]
enum Engagement {
    Challenge(ChallengeId),
    Session(SessionId),
}

struct ChallengeEntry {
    challenge: Challenge,
    /// Bumped on every status change; the expiry timer checks it.
    generation: u64,
    expires_at: DateTime<Utc>,
}

#[derive(Default)]
struct EngineState {
    challenges: HashMap<ChallengeId, ChallengeEntry>,
    sessions: HashMap<SessionId, FightSession>,
    engaged: HashMap<UserId, Engagement>,
}

/// How an attempt to seat an agent on a session ended.
enum SeatOutcome {
    /// The session has a watcher, ours or one that got there first.
    Seated,
    /// Channel join failed; the agent was quarantined, try another.
    JoinFailed,
    /// Session terminal or gone; nothing left to seat.
    SessionGone,
}

/// Work for one session collected under the read lock during a tick.
enum TickWork {
    RetryAcquire,
    Poll {
        agent: Arc<dyn WatcherAgent>,
        generation: u64,
    },
}

/// Data carried out of the completion critical section.
struct FinishedSession {
    outcome: Outcome,
    lease: Option<AgentLease>,
    challenger: UserId,
    challengee: UserId,
    channel: ChannelRef,
    started_at: Option<DateTime<Utc>>,
}

/// Data carried out of the voiding critical section.
struct VoidedSession {
    lease: Option<AgentLease>,
    channel: ChannelRef,
    was_active: bool,
    diagnostics: DiagnosticsRecord,
}

/// Orchestrates challenges and fight sessions end to end: issue, respond,
/// convert, watch, decide, persist.
///
/// Clones share the same underlying state; the coordinator is cheap to
/// hand to spawned tasks.
#[derive(Clone)]
pub struct ChallengeCoordinator {
    config: Arc<EngineConfig>,
    state: Arc<RwLock<EngineState>>,
    pool: AgentPool,
    store: Arc<dyn StatsStore>,
    recorder: Arc<dyn Recorder>,
    events: broadcast::Sender<LifecycleEvent>,
}

impl ChallengeCoordinator {
    pub fn new(
        config: EngineConfig,
        pool: AgentPool,
        store: Arc<dyn StatsStore>,
        recorder: Arc<dyn Recorder>,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            config: Arc::new(config),
            state: Arc::new(RwLock::new(EngineState::default())),
            pool,
            store,
            recorder,
            events,
        }
    }

    /// Subscribe to lifecycle events. The engine emits; rendering is the
    /// subscriber's business.
    pub fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.events.subscribe()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    fn emit(&self, event: LifecycleEvent) {
        debug!(event = event.tag(), "lifecycle event");
        let _ = self.events.send(event);
    }

    // ── Challenge operations ──

    /// Issue a challenge from `challenger` to `challengee` in `channel`.
    ///
    /// Rejected when the two are the same user, when either is already
    /// engaged in a pending challenge or live session here, or when the
    /// store reports either as mid-session elsewhere.
    pub async fn issue_challenge(
        &self,
        challenger: UserId,
        challengee: UserId,
        channel: ChannelRef,
    ) -> Result<ChallengeId, EngineError> {
        if challenger == challengee {
            return Err(EngineError::InvalidTarget {
                reason: "cannot challenge yourself".into(),
            });
        }
        for user in [&challenger, &challengee] {
            let active = self.store.active_session_count(user).await?;
            if active > 0 {
                return Err(EngineError::InvalidTarget {
                    reason: format!("{user} is already in an active session"),
                });
            }
        }

        let challenge_id = {
            let mut state = self.state.write().await;
            for user in [&challenger, &challengee] {
                if state.engaged.contains_key(user) {
                    return Err(EngineError::InvalidTarget {
                        reason: format!("{user} is already engaged"),
                    });
                }
            }
            let challenge = Challenge::new(challenger.clone(), challengee.clone(), channel);
            let challenge_id = challenge.challenge_id.clone();
            let expires_at =
                Utc::now() + ChronoDuration::seconds(self.config.accept_timeout_secs as i64);
            state.engaged.insert(
                challenger.clone(),
                Engagement::Challenge(challenge_id.clone()),
            );
            state.engaged.insert(
                challengee.clone(),
                Engagement::Challenge(challenge_id.clone()),
            );
            state.challenges.insert(
                challenge_id.clone(),
                ChallengeEntry {
                    challenge,
                    generation: 0,
                    expires_at,
                },
            );
            info!(
                challenge_id = %challenge_id,
                challenger = %challenger,
                challengee = %challengee,
                "challenge issued"
            );
            self.emit(LifecycleEvent::ChallengeIssued {
                challenge_id: challenge_id.clone(),
                challenger,
                challengee,
                expires_at,
            });
            challenge_id
        };

        self.spawn_challenge_deadline(challenge_id.clone(), 0);
        Ok(challenge_id)
    }

    /// Record the challengee's response. A response that races a deadline
    /// or a rescind is acknowledged as ignored, not treated as an error.
    pub async fn respond(
        &self,
        challenge_id: &ChallengeId,
        responder: &UserId,
        accept: bool,
    ) -> Result<RespondAck, EngineError> {
        let mut state = self.state.write().await;
        let entry = state
            .challenges
            .get_mut(challenge_id)
            .ok_or_else(|| EngineError::UnknownChallenge(challenge_id.clone()))?;
        if entry.challenge.challengee != *responder {
            return Err(EngineError::InvalidTarget {
                reason: format!("{responder} is not the challengee"),
            });
        }
        if entry.challenge.status != ChallengeStatus::Pending {
            debug!(
                challenge_id = %challenge_id,
                status = %entry.challenge.status,
                "response to settled challenge ignored"
            );
            return Ok(RespondAck::Ignored(entry.challenge.status));
        }

        if accept {
            entry.challenge.mark(ChallengeStatus::Accepted)?;
            entry.generation += 1;
            entry.expires_at =
                Utc::now() + ChronoDuration::seconds(self.config.accept_timeout_secs as i64);
            let generation = entry.generation;
            info!(challenge_id = %challenge_id, "challenge accepted");
            self.emit(LifecycleEvent::ChallengeAccepted {
                challenge_id: challenge_id.clone(),
            });
            drop(state);
            // Acceptance opens an equally long window to pick the fight
            // type; the same expiry path enforces it.
            self.spawn_challenge_deadline(challenge_id.clone(), generation);
            Ok(RespondAck::Accepted)
        } else {
            entry.challenge.mark(ChallengeStatus::Declined)?;
            entry.generation += 1;
            let challenger = entry.challenge.challenger.clone();
            let challengee = entry.challenge.challengee.clone();
            info!(challenge_id = %challenge_id, "challenge declined");
            state.engaged.remove(&challenger);
            state.engaged.remove(&challengee);
            self.emit(LifecycleEvent::ChallengeDeclined {
                challenge_id: challenge_id.clone(),
                rescinded: false,
            });
            Ok(RespondAck::Declined)
        }
    }

    /// Withdraw a pending challenge. Only the challenger may rescind, and
    /// only while the challenge is still pending.
    pub async fn rescind(
        &self,
        challenge_id: &ChallengeId,
        challenger: &UserId,
    ) -> Result<(), EngineError> {
        let mut state = self.state.write().await;
        let entry = state
            .challenges
            .get_mut(challenge_id)
            .ok_or_else(|| EngineError::UnknownChallenge(challenge_id.clone()))?;
        if entry.challenge.challenger != *challenger {
            return Err(EngineError::InvalidTarget {
                reason: format!("{challenger} did not issue this challenge"),
            });
        }
        if entry.challenge.status != ChallengeStatus::Pending {
            return Err(EngineError::WrongChallengeStatus {
                challenge_id: challenge_id.clone(),
                status: entry.challenge.status,
                expected: ChallengeStatus::Pending,
            });
        }
        entry.challenge.mark(ChallengeStatus::Declined)?;
        entry.generation += 1;
        let challenger_id = entry.challenge.challenger.clone();
        let challengee = entry.challenge.challengee.clone();
        info!(challenge_id = %challenge_id, "challenge rescinded");
        state.engaged.remove(&challenger_id);
        state.engaged.remove(&challengee);
        self.emit(LifecycleEvent::ChallengeDeclined {
            challenge_id: challenge_id.clone(),
            rescinded: true,
        });
        Ok(())
    }

    /// Convert an accepted challenge into a fight session of the given
    /// kind. Watcher dispatch happens before returning; an empty pool
    /// parks the session rather than failing the call.
    pub async fn select_fight_type(
        &self,
        challenge_id: &ChallengeId,
        kind: FightKind,
    ) -> Result<SessionId, EngineError> {
        let (session_id, participants) = {
            let mut state = self.state.write().await;
            let entry = state
                .challenges
                .get_mut(challenge_id)
                .ok_or_else(|| EngineError::UnknownChallenge(challenge_id.clone()))?;
            if entry.challenge.status != ChallengeStatus::Accepted {
                return Err(EngineError::WrongChallengeStatus {
                    challenge_id: challenge_id.clone(),
                    status: entry.challenge.status,
                    expected: ChallengeStatus::Accepted,
                });
            }
            let session_id = SessionId::generate();
            entry.challenge.convert(session_id.clone())?;
            entry.generation += 1;
            let challenge = entry.challenge.clone();

            let aggregator = MetricsAggregator::new(
                challenge.challenger.clone(),
                challenge.challengee.clone(),
                self.config.aggregator_config(),
            );
            let policy = FightPolicy::for_kind(kind, &self.config.decision_config());
            let mut session =
                FightSession::new(session_id.clone(), &challenge, kind, aggregator, policy);
            session.push_note(format!("selected {kind} fight"));

            state.engaged.insert(
                challenge.challenger.clone(),
                Engagement::Session(session_id.clone()),
            );
            state.engaged.insert(
                challenge.challengee.clone(),
                Engagement::Session(session_id.clone()),
            );
            state.sessions.insert(session_id.clone(), session);
            info!(
                challenge_id = %challenge_id,
                session_id = %session_id,
                kind = %kind,
                "fight type selected"
            );
            self.emit(LifecycleEvent::FightTypeSelected {
                challenge_id: challenge_id.clone(),
                session_id: session_id.clone(),
                kind,
            });
            (
                session_id,
                vec![
                    challenge.challenger.clone(),
                    challenge.challengee.clone(),
                ],
            )
        };

        if let Err(err) = self
            .store
            .note_session_started(&session_id, &participants)
            .await
        {
            warn!(session_id = %session_id, error = %err, "session open not registered");
        }
        self.dispatch_agent(session_id.clone()).await;
        Ok(session_id)
    }

    // ── Queries ──

    pub async fn challenge_status(&self, challenge_id: &ChallengeId) -> Option<ChallengeStatus> {
        let state = self.state.read().await;
        state
            .challenges
            .get(challenge_id)
            .map(|entry| entry.challenge.status)
    }

    pub async fn session_state(&self, session_id: &SessionId) -> Option<SessionState> {
        let state = self.state.read().await;
        state.sessions.get(session_id).map(|session| session.state)
    }

    pub async fn session_outcome(&self, session_id: &SessionId) -> Option<Outcome> {
        let state = self.state.read().await;
        state
            .sessions
            .get(session_id)
            .and_then(|session| session.outcome.clone())
    }

    pub async fn session_snapshot(&self, session_id: &SessionId) -> Option<MetricsSnapshot> {
        let state = self.state.read().await;
        state
            .sessions
            .get(session_id)
            .map(|session| session.aggregator.snapshot())
    }

    pub async fn session_timeline(&self, session_id: &SessionId) -> Option<Vec<String>> {
        let state = self.state.read().await;
        state
            .sessions
            .get(session_id)
            .map(|session| session.timeline.clone())
    }

    // ── Challenge deadline ──

    fn spawn_challenge_deadline(&self, challenge_id: ChallengeId, generation: u64) {
        let coordinator = self.clone();
        let wait = self.config.accept_timeout();
        tokio::spawn(async move {
            tokio::time::sleep(wait).await;
            coordinator
                .fire_challenge_deadline(challenge_id, generation)
                .await;
        });
    }

    async fn fire_challenge_deadline(&self, challenge_id: ChallengeId, generation: u64) {
        let mut state = self.state.write().await;
        let Some(entry) = state.challenges.get_mut(&challenge_id) else {
            return;
        };
        if entry.generation != generation || entry.challenge.is_terminal() {
            debug!(challenge_id = %challenge_id, "stale challenge deadline ignored");
            return;
        }
        let from = entry.challenge.status;
        if let Err(err) = entry.challenge.mark(ChallengeStatus::Expired) {
            warn!(challenge_id = %challenge_id, error = %err, "challenge expiry rejected");
            return;
        }
        entry.generation += 1;
        let challenger = entry.challenge.challenger.clone();
        let challengee = entry.challenge.challengee.clone();
        info!(challenge_id = %challenge_id, from = %from, "challenge expired");
        state.engaged.remove(&challenger);
        state.engaged.remove(&challengee);
        self.emit(LifecycleEvent::ChallengeExpired { challenge_id });
    }

    // ── Watcher dispatch ──

    /// Acquire a watcher and seat it, retrying through agents whose
    /// channel join fails. An empty pool parks the session for one
    /// re-queue; a second miss voids it.
    async fn dispatch_agent(&self, session_id: SessionId) {
        loop {
            match self.pool.acquire().await {
                Ok(lease) => match self.seat_agent(&session_id, lease).await {
                    Ok(SeatOutcome::Seated) | Ok(SeatOutcome::SessionGone) => return,
                    Ok(SeatOutcome::JoinFailed) => continue,
                    Err(err) => {
                        error!(session_id = %session_id, error = %err, "watcher dispatch failed");
                        return;
                    }
                },
                Err(err) => {
                    let should_void = {
                        let mut state = self.state.write().await;
                        let Some(session) = state.sessions.get_mut(&session_id) else {
                            return;
                        };
                        if session.is_terminal() {
                            return;
                        }
                        if session.acquire_retried {
                            true
                        } else {
                            session.awaiting_agent = true;
                            session.acquire_retried = true;
                            session.push_note("agent pool exhausted, waiting for a slot");
                            warn!(
                                session_id = %session_id,
                                error = %err,
                                "no watcher available, session parked"
                            );
                            false
                        }
                    };
                    if should_void {
                        self.void_session(&session_id, VoidReason::NoAgentAvailable)
                            .await;
                    }
                    return;
                }
            }
        }
    }

    /// Join the leased agent to the session's channel and install it.
    async fn seat_agent(
        &self,
        session_id: &SessionId,
        lease: AgentLease,
    ) -> Result<SeatOutcome, EngineError> {
        // Probe the channel without holding the lock across the join call.
        let channel = {
            let state = self.state.read().await;
            state
                .sessions
                .get(session_id)
                .filter(|session| !session.is_terminal())
                .map(|session| session.channel.clone())
        };
        let Some(channel) = channel else {
            self.pool.release(lease).await;
            return Ok(SeatOutcome::SessionGone);
        };

        let watcher_id = lease.watcher_id().clone();
        if let Err(err) = self.bounded("join", lease.agent().join(&channel)).await {
            warn!(
                session_id = %session_id,
                watcher_id = %watcher_id,
                error = %err,
                "watcher failed to join channel"
            );
            self.pool.quarantine(lease).await;
            return Ok(SeatOutcome::JoinFailed);
        }
        let agent = Arc::clone(lease.agent());

        let mut state = self.state.write().await;
        let probe = state
            .sessions
            .get(session_id)
            .map(|session| (session.state, session.agent.is_some()));
        let needs_seat = match probe {
            Some((current, false)) if !current.is_terminal() => current,
            Some((current, true)) if !current.is_terminal() => {
                drop(state);
                // Another dispatch seated an agent first; hand ours back.
                self.return_lease(lease, &channel).await;
                return Ok(SeatOutcome::Seated);
            }
            _ => {
                drop(state);
                self.return_lease(lease, &channel).await;
                return Ok(SeatOutcome::SessionGone);
            }
        };

        let session = state
            .sessions
            .get_mut(session_id)
            .ok_or_else(|| EngineError::UnknownSession(session_id.clone()))?;
        session.awaiting_agent = false;
        let mut join_deadline_generation = None;
        let mut resume_recording = false;
        match needs_seat {
            SessionState::Selected => {
                session.transition(SessionState::Joining)?;
                session.push_note(format!(
                    "watcher {watcher_id} joined, waiting for participants"
                ));
                join_deadline_generation = Some(session.generation);
                info!(
                    session_id = %session_id,
                    watcher_id = %watcher_id,
                    "watcher seated, lobby open"
                );
            }
            SessionState::Joining | SessionState::Active => {
                if let Some(replaced) = session.failed_watcher.take() {
                    session.push_note(format!("watcher {replaced} replaced by {watcher_id}"));
                    self.emit(LifecycleEvent::WatcherSwapped {
                        session_id: session_id.clone(),
                        replaced,
                        substitute: watcher_id.clone(),
                    });
                } else {
                    session.push_note(format!("watcher {watcher_id} joined mid-session"));
                }
                resume_recording = needs_seat == SessionState::Active;
                info!(
                    session_id = %session_id,
                    watcher_id = %watcher_id,
                    state = %needs_seat,
                    "substitute watcher seated"
                );
            }
            SessionState::Completed | SessionState::Voided => {}
        }
        session.agent = Some(lease);
        drop(state);

        if let Some(generation) = join_deadline_generation {
            self.spawn_join_deadline(session_id.clone(), generation);
        }
        if resume_recording {
            if let Err(err) = self
                .bounded("start_recording", agent.start_recording(session_id))
                .await
            {
                warn!(session_id = %session_id, error = %err, "recording restart failed");
            }
        }
        Ok(SeatOutcome::Seated)
    }

    /// Pull an agent out of a channel and hand it back to the pool.
    async fn return_lease(&self, lease: AgentLease, channel: &ChannelRef) {
        if let Err(err) = self.bounded("leave", lease.agent().leave(channel)).await {
            debug!(watcher_id = %lease.watcher_id(), error = %err, "leave on release failed");
        }
        self.pool.release(lease).await;
    }

    /// Bound an agent call by the configured timeout; an elapsed call
    /// counts as an agent failure like any other.
    async fn bounded<T, F>(&self, op: &str, fut: F) -> Result<T, AgentError>
    where
        F: std::future::Future<Output = Result<T, AgentError>>,
    {
        match tokio::time::timeout(self.config.agent_call_timeout(), fut).await {
            Ok(result) => result,
            Err(_) => Err(AgentError::Timeout { op: op.to_string() }),
        }
    }

    // ── Session timers ──

    /// Validate a firing timer against the session it was armed for.
    fn check_timer<'a>(
        state: &'a mut EngineState,
        session_id: &SessionId,
        generation: u64,
        expected: SessionState,
    ) -> Result<&'a mut FightSession, EngineError> {
        let session = state
            .sessions
            .get_mut(session_id)
            .ok_or_else(|| EngineError::UnknownSession(session_id.clone()))?;
        if session.generation != generation || session.state != expected {
            return Err(EngineError::TimerRace {
                session_id: session_id.clone(),
                state: session.state,
                generation: session.generation,
            });
        }
        Ok(session)
    }

    fn spawn_join_deadline(&self, session_id: SessionId, generation: u64) {
        let coordinator = self.clone();
        let wait = self.config.join_timeout();
        tokio::spawn(async move {
            tokio::time::sleep(wait).await;
            if let Err(err) = coordinator.fire_join_deadline(&session_id, generation).await {
                debug!(session_id = %session_id, error = %err, "join deadline dropped");
            }
        });
    }

    async fn fire_join_deadline(
        &self,
        session_id: &SessionId,
        generation: u64,
    ) -> Result<(), EngineError> {
        let mut state = self.state.write().await;
        let session = Self::check_timer(&mut state, session_id, generation, SessionState::Joining)?;
        if session.both_joined() {
            // The activation tick beat the timer; nothing to enforce.
            return Ok(());
        }
        if !self.config.void_on_join_timeout && !session.join_extended {
            session.join_extended = true;
            session.push_note("join deadline extended once");
            info!(session_id = %session_id, "join deadline extended");
            drop(state);
            self.spawn_join_deadline(session_id.clone(), generation);
            return Ok(());
        }
        info!(
            session_id = %session_id,
            joined = session.joined.len(),
            "join deadline missed"
        );
        drop(state);
        self.void_session(session_id, VoidReason::JoinTimeout).await;
        Ok(())
    }

    fn spawn_max_duration(&self, session_id: SessionId, generation: u64) {
        let coordinator = self.clone();
        let wait = self.config.max_fight();
        tokio::spawn(async move {
            tokio::time::sleep(wait).await;
            if let Err(err) = coordinator.fire_max_duration(&session_id, generation).await {
                debug!(session_id = %session_id, error = %err, "max duration deadline dropped");
            }
        });
    }

    async fn fire_max_duration(
        &self,
        session_id: &SessionId,
        generation: u64,
    ) -> Result<(), EngineError> {
        let decision = {
            let mut state = self.state.write().await;
            let session =
                Self::check_timer(&mut state, session_id, generation, SessionState::Active)?;
            let snapshot = session.aggregator.snapshot();
            session.push_note("max duration reached");
            session.policy.on_deadline(&snapshot)
        };
        info!(
            session_id = %session_id,
            verdict = %decision.verdict,
            "max duration reached, deciding"
        );
        self.conclude(session_id, decision).await;
        Ok(())
    }

    fn spawn_grace_deadline(&self, session_id: SessionId, generation: u64) {
        let coordinator = self.clone();
        let wait = self.config.agent_grace();
        tokio::spawn(async move {
            tokio::time::sleep(wait).await;
            if let Err(err) = coordinator.fire_grace_deadline(&session_id, generation).await {
                debug!(session_id = %session_id, error = %err, "grace deadline dropped");
            }
        });
    }

    async fn fire_grace_deadline(
        &self,
        session_id: &SessionId,
        generation: u64,
    ) -> Result<(), EngineError> {
        {
            let state = self.state.read().await;
            let Some(session) = state.sessions.get(session_id) else {
                return Err(EngineError::UnknownSession(session_id.clone()));
            };
            if session.generation != generation || session.is_terminal() {
                return Err(EngineError::TimerRace {
                    session_id: session_id.clone(),
                    state: session.state,
                    generation: session.generation,
                });
            }
            if session.agent.is_some() {
                // A substitute made it in before the window closed.
                return Ok(());
            }
        }

        // Last chance: the pool may have refilled while we waited.
        loop {
            match self.pool.acquire().await {
                Ok(lease) => match self.seat_agent(session_id, lease).await {
                    Ok(SeatOutcome::Seated) | Ok(SeatOutcome::SessionGone) => return Ok(()),
                    Ok(SeatOutcome::JoinFailed) => continue,
                    Err(err) => return Err(err),
                },
                Err(_) => break,
            }
        }

        info!(session_id = %session_id, "no substitute within grace window, voiding");
        self.void_session(session_id, VoidReason::AgentFailure).await;
        Ok(())
    }

    // ── Sampling loop ──

    /// Drive the sampling loop until `shutdown` flips to true or its
    /// sender goes away.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.sample_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(
            interval_secs = self.config.sample_interval_secs,
            "engine loop started"
        );
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.tick().await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("engine loop stopped");
                        return;
                    }
                }
            }
        }
    }

    /// One scheduling pass: poll every watched session and retry parked
    /// acquisitions.
    async fn tick(&self) {
        let work: Vec<(SessionId, TickWork)> = {
            let state = self.state.read().await;
            state
                .sessions
                .values()
                .filter(|session| !session.is_terminal())
                .filter_map(|session| {
                    if session.awaiting_agent {
                        Some((session.session_id.clone(), TickWork::RetryAcquire))
                    } else {
                        session.agent.as_ref().map(|lease| {
                            (
                                session.session_id.clone(),
                                TickWork::Poll {
                                    agent: Arc::clone(lease.agent()),
                                    generation: session.generation,
                                },
                            )
                        })
                    }
                })
                .collect()
        };

        for (session_id, work) in work {
            match work {
                TickWork::RetryAcquire => self.dispatch_agent(session_id).await,
                TickWork::Poll { agent, generation } => {
                    self.poll_session(session_id, agent, generation).await;
                }
            }
        }
    }

    async fn poll_session(
        &self,
        session_id: SessionId,
        agent: Arc<dyn WatcherAgent>,
        generation: u64,
    ) {
        match self.bounded("poll_samples", agent.poll_samples()).await {
            Ok(samples) => {
                if let Err(err) = self.apply_samples(&session_id, generation, samples).await {
                    debug!(session_id = %session_id, error = %err, "tick skipped");
                }
            }
            Err(err) => {
                warn!(session_id = %session_id, error = %err, "watcher poll failed");
                self.handle_agent_failure(&session_id, generation).await;
            }
        }
    }

    /// Fold one poll's samples into the session and act on what changed.
    async fn apply_samples(
        &self,
        session_id: &SessionId,
        generation: u64,
        samples: Vec<Sample>,
    ) -> Result<(), EngineError> {
        let mut followups: Vec<LifecycleEvent> = Vec::new();
        let mut activated = false;
        let mut tick_decision = None;

        {
            let mut state = self.state.write().await;
            let Some(session) = state.sessions.get_mut(session_id) else {
                return Err(EngineError::UnknownSession(session_id.clone()));
            };
            if session.generation != generation || session.is_terminal() {
                return Err(EngineError::TimerRace {
                    session_id: session_id.clone(),
                    state: session.state,
                    generation: session.generation,
                });
            }
            match session.state {
                SessionState::Joining => {
                    for sample in &samples {
                        if !session.expects(&sample.participant) {
                            debug!(
                                session_id = %session_id,
                                participant = %sample.participant,
                                "sample for unexpected participant dropped"
                            );
                            continue;
                        }
                        if sample.present && session.joined.insert(sample.participant.clone()) {
                            info!(
                                session_id = %session_id,
                                participant = %sample.participant,
                                "participant joined"
                            );
                            session
                                .push_note(format!("{} joined the channel", sample.participant));
                            followups.push(LifecycleEvent::ParticipantJoined {
                                session_id: session_id.clone(),
                                participant: sample.participant.clone(),
                            });
                        }
                        if let Err(err) = session.aggregator.ingest(sample) {
                            debug!(session_id = %session_id, error = %err, "lobby sample rejected");
                        }
                    }
                    if session.both_joined() {
                        session.transition(SessionState::Active)?;
                        session.aggregator.activate();
                        let now = Utc::now();
                        let deadline =
                            now + ChronoDuration::seconds(self.config.max_fight_secs as i64);
                        session.activated_at = Some(now);
                        session.deadline_at = Some(deadline);
                        session.push_note("both participants present, fight started");
                        info!(session_id = %session_id, kind = %session.kind, "fight started");
                        followups.push(LifecycleEvent::FightStarted {
                            session_id: session_id.clone(),
                            kind: session.kind,
                            deadline,
                        });
                        activated = true;
                    }
                }
                SessionState::Active => {
                    // The tick counter drives the absence grace; lobby
                    // polls never advance it.
                    session.aggregator.note_tick();
                    session.tick_count += 1;
                    for sample in &samples {
                        if !session.expects(&sample.participant) {
                            debug!(
                                session_id = %session_id,
                                participant = %sample.participant,
                                "sample for unexpected participant dropped"
                            );
                            continue;
                        }
                        if let Err(err) = session.aggregator.ingest(sample) {
                            debug!(session_id = %session_id, error = %err, "sample rejected");
                        }
                    }
                    let snapshot = session.aggregator.snapshot();
                    if let TickDecision::End(decision) = session.policy.on_tick(&snapshot) {
                        tick_decision = Some(decision);
                    }
                }
                SessionState::Selected | SessionState::Completed | SessionState::Voided => {}
            }
        }

        for event in followups {
            self.emit(event);
        }
        if activated {
            self.start_session_recording(session_id).await;
            self.spawn_max_duration(session_id.clone(), generation);
        }
        if let Some(decision) = tick_decision {
            self.conclude(session_id, decision).await;
        }
        Ok(())
    }

    /// Arm recording on both the recorder collaborator and the watcher.
    async fn start_session_recording(&self, session_id: &SessionId) {
        let wiring = {
            let state = self.state.read().await;
            state.sessions.get(session_id).map(|session| {
                (
                    session.channel.clone(),
                    session.agent.as_ref().map(|lease| Arc::clone(lease.agent())),
                )
            })
        };
        let Some((channel, agent)) = wiring else {
            return;
        };
        if let Err(err) = self.recorder.start(session_id, &channel).await {
            warn!(session_id = %session_id, error = %err, "recorder start failed");
        }
        if let Some(agent) = agent {
            if let Err(err) = self
                .bounded("start_recording", agent.start_recording(session_id))
                .await
            {
                warn!(session_id = %session_id, error = %err, "watcher recording start failed");
            }
        }
    }

    // ── Failure handling ──

    /// A watcher call failed: pull the lease, quarantine the agent, and
    /// hunt for a substitute.
    async fn handle_agent_failure(&self, session_id: &SessionId, generation: u64) {
        let lease = {
            let mut state = self.state.write().await;
            let valid = state
                .sessions
                .get(session_id)
                .map(|session| session.generation == generation && !session.is_terminal())
                .unwrap_or(false);
            if !valid {
                debug!(session_id = %session_id, "stale watcher failure ignored");
                return;
            }
            let Some(session) = state.sessions.get_mut(session_id) else {
                return;
            };
            let Some(lease) = session.agent.take() else {
                // A competing path already pulled the agent.
                return;
            };
            let watcher_id = lease.watcher_id().clone();
            session.failed_watcher = Some(watcher_id.clone());
            session.push_note(format!("watcher {watcher_id} failed"));
            warn!(
                session_id = %session_id,
                watcher_id = %watcher_id,
                "watcher failed mid-session"
            );
            lease
        };
        self.pool.quarantine(lease).await;
        self.try_substitute(session_id, generation).await;
    }

    /// Try to seat a replacement immediately; failing that, arm the grace
    /// timer and wait for a slot to open.
    async fn try_substitute(&self, session_id: &SessionId, generation: u64) {
        loop {
            match self.pool.acquire().await {
                Ok(lease) => match self.seat_agent(session_id, lease).await {
                    Ok(SeatOutcome::Seated) | Ok(SeatOutcome::SessionGone) => return,
                    Ok(SeatOutcome::JoinFailed) => continue,
                    Err(err) => {
                        error!(session_id = %session_id, error = %err, "substitute dispatch failed");
                        return;
                    }
                },
                Err(_) => {
                    debug!(session_id = %session_id, "no substitute available, arming grace timer");
                    self.spawn_grace_deadline(session_id.clone(), generation);
                    return;
                }
            }
        }
    }

    // ── Completion ──

    /// Turn a decision into an immutable outcome, or void the session
    /// when the decision says the fight cannot stand.
    async fn conclude(&self, session_id: &SessionId, decision: Decision) {
        if matches!(decision.verdict, Verdict::Void) {
            let reason = if decision.basis == DecisionBasis::SimultaneousDrop {
                VoidReason::SimultaneousDrop
            } else {
                VoidReason::AgentFailure
            };
            {
                let mut state = self.state.write().await;
                if let Some(session) = state.sessions.get_mut(session_id) {
                    session.push_note(decision.summary.clone());
                }
            }
            self.void_session(session_id, reason).await;
            return;
        }

        let finished = {
            let mut state = self.state.write().await;
            let live = state
                .sessions
                .get(session_id)
                .map(|session| !session.is_terminal())
                .unwrap_or(false);
            if !live {
                debug!(session_id = %session_id, "conclusion for finished session ignored");
                return;
            }
            let Some(session) = state.sessions.get_mut(session_id) else {
                return;
            };
            if let Err(err) = session.transition(SessionState::Completed) {
                warn!(session_id = %session_id, error = %err, "completion rejected");
                return;
            }
            session.push_note(decision.summary.clone());
            let outcome = Outcome::new(
                session_id.clone(),
                session.challenge_id.clone(),
                session.kind,
                decision.verdict.clone(),
                decision.basis,
                decision.confidence,
                decision.summary,
            );
            let lease = session.agent.take();
            let challenger = session.challenger.clone();
            let challengee = session.challengee.clone();
            let channel = session.channel.clone();
            let started_at = session.activated_at;
            state.engaged.remove(&challenger);
            state.engaged.remove(&challengee);
            FinishedSession {
                outcome,
                lease,
                challenger,
                challengee,
                channel,
                started_at,
            }
        };

        let mut outcome = finished.outcome;
        match self.recorder.stop(session_id).await {
            Ok(meta) => outcome.attach_recording(meta),
            Err(err) => debug!(session_id = %session_id, error = %err, "no recording metadata"),
        }
        if let Some(lease) = finished.lease {
            if let Err(err) = self
                .bounded("stop_recording", lease.agent().stop_recording(session_id))
                .await
            {
                debug!(session_id = %session_id, error = %err, "watcher recording stop failed");
            }
            self.return_lease(lease, &finished.channel).await;
        }

        {
            // The outcome lives on the session whatever happens to the
            // persistence below.
            let mut state = self.state.write().await;
            if let Some(session) = state.sessions.get_mut(session_id) {
                session.outcome = Some(outcome.clone());
            }
        }

        let record = SessionRecord {
            outcome: outcome.clone(),
            challenger: finished.challenger,
            challengee: finished.challengee,
            started_at: finished.started_at,
            ended_at: Utc::now(),
        };
        if let Err(err) = persist_with_retry(
            self.store.as_ref(),
            &record,
            self.config.persist_retry_max,
            self.config.persist_retry_backoff(),
        )
        .await
        {
            // The outcome stays queryable; only the write was lost.
            error!(session_id = %session_id, error = %err, "outcome persistence failed");
        }
        if let Err(err) = self.store.note_session_closed(session_id).await {
            warn!(session_id = %session_id, error = %err, "session close not registered");
        }
        info!(
            session_id = %session_id,
            verdict = %outcome.verdict,
            basis = %outcome.basis,
            confidence = outcome.confidence,
            "fight completed"
        );
        self.emit(LifecycleEvent::FightEnded {
            session_id: session_id.clone(),
            outcome,
        });
    }

    /// Drive the session to `Voided`, release its resources, and record
    /// diagnostics. Reachable from any live state.
    async fn void_session(&self, session_id: &SessionId, reason: VoidReason) {
        let voided = {
            let mut state = self.state.write().await;
            let live = state
                .sessions
                .get(session_id)
                .map(|session| !session.is_terminal())
                .unwrap_or(false);
            if !live {
                debug!(session_id = %session_id, "void for finished session ignored");
                return;
            }
            let Some(session) = state.sessions.get_mut(session_id) else {
                return;
            };
            if let Err(err) = session.transition(SessionState::Voided) {
                warn!(session_id = %session_id, error = %err, "void transition rejected");
                return;
            }
            session.push_note(format!("session voided: {reason}"));
            let lease = session.agent.take();
            let was_active = session.activated_at.is_some();
            let metrics = if session.activated_at.is_some() {
                Some(session.aggregator.snapshot())
            } else {
                None
            };
            let diagnostics = DiagnosticsRecord {
                session_id: session_id.clone(),
                challenge_id: session.challenge_id.clone(),
                reason,
                joined: session.joined.iter().cloned().collect(),
                metrics,
                timeline: session.timeline.clone(),
                recorded_at: Utc::now(),
            };
            let challenger = session.challenger.clone();
            let challengee = session.challengee.clone();
            let channel = session.channel.clone();
            state.engaged.remove(&challenger);
            state.engaged.remove(&challengee);
            VoidedSession {
                lease,
                channel,
                was_active,
                diagnostics,
            }
        };

        if voided.was_active {
            if let Err(err) = self.recorder.stop(session_id).await {
                debug!(session_id = %session_id, error = %err, "no recording to stop");
            }
        }
        if let Some(lease) = voided.lease {
            if voided.was_active {
                if let Err(err) = self
                    .bounded("stop_recording", lease.agent().stop_recording(session_id))
                    .await
                {
                    debug!(session_id = %session_id, error = %err, "watcher recording stop failed");
                }
            }
            self.return_lease(lease, &voided.channel).await;
        }
        if let Err(err) = self.store.record_diagnostics(&voided.diagnostics).await {
            warn!(session_id = %session_id, error = %err, "diagnostics write failed");
        }
        if let Err(err) = self.store.note_session_closed(session_id).await {
            warn!(session_id = %session_id, error = %err, "session close not registered");
        }
        info!(session_id = %session_id, reason = %reason, "session voided");
        self.emit(LifecycleEvent::SessionVoided {
            session_id: session_id.clone(),
            reason,
        });
    }
}
