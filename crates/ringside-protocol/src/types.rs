use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;
use crate::identity::{ChallengeId, ChannelRef, SessionId, UserId};

// ── Challenge lifecycle ──

/// Status of a challenge prior to (and at the point of) session creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum ChallengeStatus {
    #[default]
    /// Issued, waiting for the challengee to respond
    Pending,
    /// Accepted, waiting for a fight type
    Accepted,
    /// Declined by the challengee (or rescinded by the challenger)
    Declined,
    /// Acceptance or fight-type-selection window elapsed without progress
    Expired,
    /// Converted into exactly one fight session
    Converted,
}

impl ChallengeStatus {
    /// Terminal statuses never change again.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ChallengeStatus::Declined | ChallengeStatus::Expired | ChallengeStatus::Converted
        )
    }

    pub fn can_transition_to(&self, next: ChallengeStatus) -> bool {
        use ChallengeStatus::*;
        matches!(
            (self, next),
            (Pending, Accepted)
                | (Pending, Declined)
                | (Pending, Expired)
                | (Accepted, Expired)
                | (Accepted, Converted)
        )
    }
}

impl std::fmt::Display for ChallengeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ChallengeStatus::Pending => "pending",
            ChallengeStatus::Accepted => "accepted",
            ChallengeStatus::Declined => "declined",
            ChallengeStatus::Expired => "expired",
            ChallengeStatus::Converted => "converted",
        };
        write!(f, "{s}")
    }
}

/// A proposal from one user to another to start a fight. Owned exclusively by
/// the coordinator until it terminates or converts into a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Challenge {
    pub challenge_id: ChallengeId,
    pub challenger: UserId,
    pub challengee: UserId,
    /// Voice channel the fight would take place in.
    pub channel: ChannelRef,
    pub status: ChallengeStatus,
    pub created_at: DateTime<Utc>,
    /// Set once the challenge converts; the challenge holds the id only,
    /// never the session itself.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<SessionId>,
}

impl Challenge {
    pub fn new(challenger: UserId, challengee: UserId, channel: ChannelRef) -> Self {
        Self {
            challenge_id: ChallengeId::generate(),
            challenger,
            challengee,
            channel,
            status: ChallengeStatus::Pending,
            created_at: Utc::now(),
            session_id: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Move to `next`, rejecting transitions the lifecycle does not allow.
    pub fn mark(&mut self, next: ChallengeStatus) -> Result<(), ProtocolError> {
        if !self.status.can_transition_to(next) {
            return Err(ProtocolError::IllegalChallengeTransition {
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        Ok(())
    }

    /// Convert an accepted challenge, linking the session it produced.
    pub fn convert(&mut self, session_id: SessionId) -> Result<(), ProtocolError> {
        self.mark(ChallengeStatus::Converted)?;
        self.session_id = Some(session_id);
        Ok(())
    }

    /// Whether `user` is one of the two parties.
    pub fn involves(&self, user: &UserId) -> bool {
        self.challenger == *user || self.challengee == *user
    }
}

// ── Fight sessions ──

/// The two supported fight disciplines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FightKind {
    /// Last one standing in the voice channel wins.
    Timing,
    /// Loudest composite volume score over the full duration wins.
    Volume,
}

impl std::fmt::Display for FightKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            FightKind::Timing => "timing",
            FightKind::Volume => "volume",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for FightKind {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "timing" => Ok(FightKind::Timing),
            "volume" => Ok(FightKind::Volume),
            other => Err(ProtocolError::UnknownFightKind(other.to_string())),
        }
    }
}

/// Lifecycle state of a fight session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SessionState {
    /// Fight type chosen; watcher agent being acquired
    Selected,
    /// Agent in the channel, waiting for both participants
    Joining,
    /// Fight running, samples flowing
    Active,
    /// Ended with an outcome
    Completed,
    /// Discarded without a winner
    Voided,
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Completed | SessionState::Voided)
    }

    pub fn can_transition_to(&self, next: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, next),
            (Selected, Joining)
                | (Selected, Voided)
                | (Joining, Active)
                | (Joining, Voided)
                | (Active, Completed)
                | (Active, Voided)
        )
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SessionState::Selected => "selected",
            SessionState::Joining => "joining",
            SessionState::Active => "active",
            SessionState::Completed => "completed",
            SessionState::Voided => "voided",
        };
        write!(f, "{s}")
    }
}

/// Why a session was voided. Voided sessions never carry a winner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VoidReason {
    /// Agent pool exhausted after the one allowed re-queue
    NoAgentAvailable,
    /// Fewer than two participants in the channel at the join deadline
    JoinTimeout,
    /// Watcher agent failed with no substitute inside the grace window
    AgentFailure,
    /// Both participants dropped in the same tick and draw-on-drop is off
    SimultaneousDrop,
}

impl std::fmt::Display for VoidReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            VoidReason::NoAgentAvailable => "no agent available",
            VoidReason::JoinTimeout => "join timeout",
            VoidReason::AgentFailure => "agent failure",
            VoidReason::SimultaneousDrop => "simultaneous drop",
        };
        write!(f, "{s}")
    }
}

// ── Watcher samples ──

/// One presence/volume observation reported by a watcher agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    pub participant: UserId,
    /// Agent-side capture time, unix milliseconds.
    pub timestamp_ms: i64,
    pub present: bool,
    /// Normalized volume level. Always within [0, 1].
    pub volume: f64,
}

impl Sample {
    pub fn new(participant: UserId, timestamp_ms: i64, present: bool, volume: f64) -> Self {
        Self {
            participant,
            timestamp_ms,
            present,
            volume: volume.clamp(0.0, 1.0),
        }
    }

    pub fn is_speaking(&self) -> bool {
        self.present && self.volume > 0.0
    }
}

// ── Outcomes ──

/// Final result of a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Verdict {
    Winner(UserId),
    Draw,
    Void,
}

impl Verdict {
    pub fn winner(&self) -> Option<&UserId> {
        match self {
            Verdict::Winner(user) => Some(user),
            _ => None,
        }
    }

    pub fn is_draw(&self) -> bool {
        matches!(self, Verdict::Draw)
    }
}

impl std::fmt::Display for Verdict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Verdict::Winner(user) => write!(f, "winner:{user}"),
            Verdict::Draw => write!(f, "draw"),
            Verdict::Void => write!(f, "void"),
        }
    }
}

/// Which rule produced the verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DecisionBasis {
    /// Timing: one participant remained after the other dropped
    LastStanding,
    /// Timing: both participants dropped within the same tick
    SimultaneousDrop,
    /// Timing: max duration elapsed with both still present
    DeadlineDraw,
    /// Timing: max duration elapsed with exactly one participant absent
    DeadlineForfeit,
    /// Volume: composite score comparison
    CompositeScore,
    /// Volume: composite scores landed inside the draw threshold
    ScoreMargin,
}

impl std::fmt::Display for DecisionBasis {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            DecisionBasis::LastStanding => "last standing",
            DecisionBasis::SimultaneousDrop => "simultaneous drop",
            DecisionBasis::DeadlineDraw => "deadline draw",
            DecisionBasis::DeadlineForfeit => "deadline forfeit",
            DecisionBasis::CompositeScore => "composite score",
            DecisionBasis::ScoreMargin => "score margin",
        };
        write!(f, "{s}")
    }
}

/// The immutable result of a completed session. Produced exactly once;
/// never revised afterward.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Outcome {
    pub session_id: SessionId,
    /// Originating challenge, by id only.
    pub challenge_id: ChallengeId,
    pub kind: FightKind,
    pub verdict: Verdict,
    pub basis: DecisionBasis,
    /// Decision confidence in [0, 1].
    pub confidence: f64,
    pub summary: String,
    pub decided_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recording: Option<RecordingMeta>,
}

impl Outcome {
    pub fn new(
        session_id: SessionId,
        challenge_id: ChallengeId,
        kind: FightKind,
        verdict: Verdict,
        basis: DecisionBasis,
        confidence: f64,
        summary: String,
    ) -> Self {
        Self {
            session_id,
            challenge_id,
            kind,
            verdict,
            basis,
            confidence: confidence.clamp(0.0, 1.0),
            summary,
            decided_at: Utc::now(),
            recording: None,
        }
    }

    pub fn attach_recording(&mut self, meta: RecordingMeta) {
        self.recording = Some(meta);
    }
}

/// Metadata handed back by the recording collaborator when a session's
/// recording stops.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordingMeta {
    pub session_id: SessionId,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
    /// Collaborator-defined locator for the captured audio.
    pub file_ref: String,
    pub size_bytes: u64,
    pub format: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn challenge() -> Challenge {
        Challenge::new(
            UserId::new("alice"),
            UserId::new("bob"),
            ChannelRef::new("voice-main"),
        )
    }

    #[test]
    fn test_new_challenge_is_pending() {
        let c = challenge();
        assert_eq!(c.status, ChallengeStatus::Pending);
        assert!(!c.is_terminal());
        assert!(c.session_id.is_none());
    }

    #[test]
    fn test_challenge_accept_then_convert() {
        let mut c = challenge();
        c.mark(ChallengeStatus::Accepted).unwrap();
        let session = SessionId::generate();
        c.convert(session.clone()).unwrap();
        assert_eq!(c.status, ChallengeStatus::Converted);
        assert_eq!(c.session_id, Some(session));
        assert!(c.is_terminal());
    }

    #[test]
    fn test_challenge_rejects_illegal_transitions() {
        let mut c = challenge();
        // Cannot convert straight from pending.
        let err = c.mark(ChallengeStatus::Converted).unwrap_err();
        assert!(matches!(
            err,
            ProtocolError::IllegalChallengeTransition {
                from: ChallengeStatus::Pending,
                to: ChallengeStatus::Converted,
            }
        ));

        c.mark(ChallengeStatus::Declined).unwrap();
        // Terminal challenges never move again.
        assert!(c.mark(ChallengeStatus::Accepted).is_err());
        assert!(c.mark(ChallengeStatus::Expired).is_err());
    }

    #[test]
    fn test_accepted_challenge_can_expire() {
        // A challenge whose selection window runs out expires like an
        // unanswered one.
        let mut c = challenge();
        c.mark(ChallengeStatus::Accepted).unwrap();
        c.mark(ChallengeStatus::Expired).unwrap();
        assert!(c.is_terminal());
        assert!(c.session_id.is_none());
    }

    #[test]
    fn test_challenge_involves_both_parties() {
        let c = challenge();
        assert!(c.involves(&UserId::new("alice")));
        assert!(c.involves(&UserId::new("bob")));
        assert!(!c.involves(&UserId::new("mallory")));
    }

    #[test]
    fn test_challenge_terminal_statuses() {
        for status in [
            ChallengeStatus::Declined,
            ChallengeStatus::Expired,
            ChallengeStatus::Converted,
        ] {
            assert!(status.is_terminal(), "{status} should be terminal");
        }
        assert!(!ChallengeStatus::Pending.is_terminal());
        assert!(!ChallengeStatus::Accepted.is_terminal());
    }

    #[test]
    fn test_session_state_legality_table() {
        use SessionState::*;
        assert!(Selected.can_transition_to(Joining));
        assert!(Joining.can_transition_to(Active));
        assert!(Active.can_transition_to(Completed));
        for state in [Selected, Joining, Active] {
            assert!(state.can_transition_to(Voided), "{state} must be voidable");
        }

        assert!(!Selected.can_transition_to(Active));
        assert!(!Joining.can_transition_to(Completed));
        assert!(!Completed.can_transition_to(Voided));
        assert!(!Voided.can_transition_to(Joining));
    }

    #[test]
    fn test_fight_kind_parsing() {
        assert_eq!(FightKind::from_str("timing").unwrap(), FightKind::Timing);
        assert_eq!(FightKind::from_str(" Volume ").unwrap(), FightKind::Volume);
        let err = FightKind::from_str("karaoke").unwrap_err();
        assert!(matches!(err, ProtocolError::UnknownFightKind(ref k) if k == "karaoke"));
    }

    #[test]
    fn test_sample_clamps_volume() {
        let loud = Sample::new(UserId::new("a"), 1_000, true, 3.2);
        assert_eq!(loud.volume, 1.0);
        let negative = Sample::new(UserId::new("a"), 1_000, true, -0.5);
        assert_eq!(negative.volume, 0.0);
    }

    #[test]
    fn test_sample_speaking_requires_presence() {
        let absent = Sample::new(UserId::new("a"), 1_000, false, 0.8);
        assert!(!absent.is_speaking());
        let silent = Sample::new(UserId::new("a"), 1_000, true, 0.0);
        assert!(!silent.is_speaking());
        let speaking = Sample::new(UserId::new("a"), 1_000, true, 0.4);
        assert!(speaking.is_speaking());
    }

    #[test]
    fn test_outcome_clamps_confidence() {
        let outcome = Outcome::new(
            SessionId::generate(),
            ChallengeId::generate(),
            FightKind::Volume,
            Verdict::Draw,
            DecisionBasis::ScoreMargin,
            1.7,
            "scores too close to call".into(),
        );
        assert_eq!(outcome.confidence, 1.0);
        assert!(outcome.recording.is_none());
    }

    #[test]
    fn test_verdict_winner_helper() {
        let won = Verdict::Winner(UserId::new("bob"));
        assert_eq!(won.winner(), Some(&UserId::new("bob")));
        assert!(Verdict::Draw.winner().is_none());
        assert!(Verdict::Draw.is_draw());
        assert!(!won.is_draw());
    }

    #[test]
    fn test_outcome_serialization_skips_missing_recording() {
        let outcome = Outcome::new(
            SessionId::new("s-1"),
            ChallengeId::new("c-1"),
            FightKind::Timing,
            Verdict::Winner(UserId::new("bob")),
            DecisionBasis::LastStanding,
            1.0,
            "bob outlasted alice".into(),
        );
        let json = serde_json::to_string(&outcome).unwrap();
        assert!(!json.contains("recording"));

        let restored: Outcome = serde_json::from_str(&json).unwrap();
        assert_eq!(restored, outcome);
    }
}
