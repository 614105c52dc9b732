use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::identity::{ChallengeId, SessionId, UserId, WatcherId};
use crate::types::{FightKind, Outcome, VoidReason};

/// Lifecycle notifications emitted by the engine for the UI/notification
/// collaborator. The engine never renders anything itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum LifecycleEvent {
    ChallengeIssued {
        challenge_id: ChallengeId,
        challenger: UserId,
        challengee: UserId,
        expires_at: DateTime<Utc>,
    },
    ChallengeAccepted {
        challenge_id: ChallengeId,
    },
    ChallengeDeclined {
        challenge_id: ChallengeId,
        /// True when the challenger withdrew their own challenge.
        rescinded: bool,
    },
    ChallengeExpired {
        challenge_id: ChallengeId,
    },
    FightTypeSelected {
        challenge_id: ChallengeId,
        session_id: SessionId,
        kind: FightKind,
    },
    ParticipantJoined {
        session_id: SessionId,
        participant: UserId,
    },
    FightStarted {
        session_id: SessionId,
        kind: FightKind,
        deadline: DateTime<Utc>,
    },
    WatcherSwapped {
        session_id: SessionId,
        replaced: WatcherId,
        substitute: WatcherId,
    },
    FightEnded {
        session_id: SessionId,
        outcome: Outcome,
    },
    SessionVoided {
        session_id: SessionId,
        reason: VoidReason,
    },
}

impl LifecycleEvent {
    /// Short tag for structured logs.
    pub fn tag(&self) -> &'static str {
        match self {
            LifecycleEvent::ChallengeIssued { .. } => "challenge_issued",
            LifecycleEvent::ChallengeAccepted { .. } => "challenge_accepted",
            LifecycleEvent::ChallengeDeclined { .. } => "challenge_declined",
            LifecycleEvent::ChallengeExpired { .. } => "challenge_expired",
            LifecycleEvent::FightTypeSelected { .. } => "fight_type_selected",
            LifecycleEvent::ParticipantJoined { .. } => "participant_joined",
            LifecycleEvent::FightStarted { .. } => "fight_started",
            LifecycleEvent::WatcherSwapped { .. } => "watcher_swapped",
            LifecycleEvent::FightEnded { .. } => "fight_ended",
            LifecycleEvent::SessionVoided { .. } => "session_voided",
        }
    }

    /// Session the event concerns, when it concerns one.
    pub fn session_id(&self) -> Option<&SessionId> {
        match self {
            LifecycleEvent::FightTypeSelected { session_id, .. }
            | LifecycleEvent::ParticipantJoined { session_id, .. }
            | LifecycleEvent::FightStarted { session_id, .. }
            | LifecycleEvent::WatcherSwapped { session_id, .. }
            | LifecycleEvent::FightEnded { session_id, .. }
            | LifecycleEvent::SessionVoided { session_id, .. } => Some(session_id),
            _ => None,
        }
    }
}
