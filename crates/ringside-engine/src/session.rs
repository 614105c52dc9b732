//! In-memory fight session state.
//!
//! A [`FightSession`] is owned by the coordinator's state map; all methods
//! here are synchronous and assume the caller already holds the lock.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};

use ringside_agents::AgentLease;
use ringside_decision::FightPolicy;
use ringside_metrics::MetricsAggregator;
use ringside_protocol::{
    Challenge, ChallengeId, ChannelRef, FightKind, Outcome, ProtocolError, SessionId, SessionState,
    UserId, WatcherId, SESSION_TIMELINE_CAP,
};

/// One fight from type selection to its terminal state.
#[derive(Debug)]
pub struct FightSession {
    pub session_id: SessionId,
    pub challenge_id: ChallengeId,
    pub kind: FightKind,
    pub challenger: UserId,
    pub challengee: UserId,
    pub channel: ChannelRef,
    pub state: SessionState,
    /// Bumped on terminal transitions; outstanding timers carry the
    /// generation they were armed under and drop themselves on mismatch.
    pub generation: u64,
    pub created_at: DateTime<Utc>,
    /// Set when the fight goes active.
    pub activated_at: Option<DateTime<Utc>>,
    /// Max-duration deadline, set at activation.
    pub deadline_at: Option<DateTime<Utc>>,
    /// Participants seen in the channel so far.
    pub joined: BTreeSet<UserId>,
    /// True while the session is parked waiting for a pool slot.
    pub awaiting_agent: bool,
    /// A parked session retries acquisition once; the second miss voids it.
    pub acquire_retried: bool,
    /// The join deadline can be extended a single time.
    pub join_extended: bool,
    /// Watcher that failed mid-session, kept for the swap announcement.
    pub failed_watcher: Option<WatcherId>,
    /// Active-phase polls completed.
    pub tick_count: u64,
    /// Human-readable trail of what happened, capped in length.
    pub timeline: Vec<String>,
    pub aggregator: MetricsAggregator,
    pub policy: FightPolicy,
    pub agent: Option<AgentLease>,
    pub outcome: Option<Outcome>,
}

impl FightSession {
    pub fn new(
        session_id: SessionId,
        challenge: &Challenge,
        kind: FightKind,
        aggregator: MetricsAggregator,
        policy: FightPolicy,
    ) -> Self {
        Self {
            session_id,
            challenge_id: challenge.challenge_id.clone(),
            kind,
            challenger: challenge.challenger.clone(),
            challengee: challenge.challengee.clone(),
            channel: challenge.channel.clone(),
            state: SessionState::Selected,
            generation: 0,
            created_at: Utc::now(),
            activated_at: None,
            deadline_at: None,
            joined: BTreeSet::new(),
            awaiting_agent: false,
            acquire_retried: false,
            join_extended: false,
            failed_watcher: None,
            tick_count: 0,
            timeline: Vec::new(),
            aggregator,
            policy,
            agent: None,
            outcome: None,
        }
    }

    pub fn participants(&self) -> [&UserId; 2] {
        [&self.challenger, &self.challengee]
    }

    /// Whether `user` is one of the two fighters.
    pub fn expects(&self, user: &UserId) -> bool {
        self.challenger == *user || self.challengee == *user
    }

    pub fn both_joined(&self) -> bool {
        self.joined.len() == 2
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Move to `next`, enforcing the session lifecycle. Terminal transitions
    /// bump the generation so that stale timers cannot touch the session.
    pub fn transition(&mut self, next: SessionState) -> Result<(), ProtocolError> {
        if !self.state.can_transition_to(next) {
            return Err(ProtocolError::IllegalSessionTransition {
                from: self.state,
                to: next,
            });
        }
        self.state = next;
        if next.is_terminal() {
            self.generation += 1;
        }
        Ok(())
    }

    /// Append a timeline note, dropping the oldest entries past the cap.
    pub fn push_note(&mut self, note: impl Into<String>) {
        self.timeline.push(note.into());
        if self.timeline.len() > SESSION_TIMELINE_CAP {
            let excess = self.timeline.len() - SESSION_TIMELINE_CAP;
            self.timeline.drain(..excess);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ringside_decision::DecisionConfig;
    use ringside_metrics::AggregatorConfig;

    fn session() -> FightSession {
        let challenge = Challenge::new(
            UserId::new("alice"),
            UserId::new("bob"),
            ChannelRef::new("arena"),
        );
        let aggregator = MetricsAggregator::new(
            challenge.challenger.clone(),
            challenge.challengee.clone(),
            AggregatorConfig::default(),
        );
        let policy = FightPolicy::for_kind(FightKind::Volume, &DecisionConfig::default());
        FightSession::new(SessionId::generate(), &challenge, FightKind::Volume, aggregator, policy)
    }

    #[test]
    fn test_transitions_follow_the_lifecycle() {
        let mut s = session();
        assert_eq!(s.state, SessionState::Selected);

        s.transition(SessionState::Joining).unwrap();
        s.transition(SessionState::Active).unwrap();
        assert_eq!(s.generation, 0);

        // Cannot go back to the lobby.
        assert!(s.transition(SessionState::Joining).is_err());

        s.transition(SessionState::Completed).unwrap();
        assert!(s.is_terminal());
        assert_eq!(s.generation, 1);

        assert!(s.transition(SessionState::Active).is_err());
    }

    #[test]
    fn test_generation_bumps_only_on_terminal_transitions() {
        let mut s = session();
        s.transition(SessionState::Joining).unwrap();
        assert_eq!(s.generation, 0);
        s.transition(SessionState::Voided).unwrap();
        assert_eq!(s.generation, 1);
    }

    #[test]
    fn test_void_reachable_from_every_live_state() {
        for advance in 0..3 {
            let mut s = session();
            if advance > 0 {
                s.transition(SessionState::Joining).unwrap();
            }
            if advance > 1 {
                s.transition(SessionState::Active).unwrap();
            }
            s.transition(SessionState::Voided).unwrap();
            assert!(s.is_terminal());
        }
    }

    #[test]
    fn test_expects_and_both_joined() {
        let mut s = session();
        assert!(s.expects(&UserId::new("alice")));
        assert!(s.expects(&UserId::new("bob")));
        assert!(!s.expects(&UserId::new("mallory")));

        assert!(!s.both_joined());
        s.joined.insert(UserId::new("alice"));
        assert!(!s.both_joined());
        s.joined.insert(UserId::new("bob"));
        assert!(s.both_joined());
    }

    #[test]
    fn test_timeline_is_capped() {
        let mut s = session();
        for i in 0..(SESSION_TIMELINE_CAP + 25) {
            s.push_note(format!("note {i}"));
        }
        assert_eq!(s.timeline.len(), SESSION_TIMELINE_CAP);
        assert_eq!(s.timeline[0], "note 25");
        assert_eq!(
            s.timeline.last().map(String::as_str),
            Some(format!("note {}", SESSION_TIMELINE_CAP + 24).as_str())
        );
    }
}
