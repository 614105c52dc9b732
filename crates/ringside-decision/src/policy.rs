//! Per-fight-kind decision policies.
//!
//! The engine consults the policy at three points:
//! - `on_tick`: after each sampling tick, may end a timing fight early
//! - `on_deadline`: when the max-duration timer fires, always decides
//! - `evaluate`: the pure decision function over a snapshot
//!
//! Decisions are deterministic: the same snapshot and policy always produce
//! the same verdict, basis, confidence, and summary.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use ringside_metrics::{MetricsSnapshot, ParticipantMetrics};
use ringside_protocol::{
    DecisionBasis, FightKind, Verdict, DEFAULT_VOLUME_DRAW_THRESHOLD,
};

use crate::scoring::{composite_score, separation_confidence, ScoreWeights};

/// Confidence attached to draws. A draw is a judgment call, not a blowout.
const DRAW_CONFIDENCE: f64 = 0.5;

/// Configuration shared by both policies.
#[derive(Debug, Clone, Copy)]
pub struct DecisionConfig {
    pub weights: ScoreWeights,
    /// Composite-score gap under which a volume fight is a draw.
    pub draw_threshold: f64,
    /// Whether both participants dropping in the same tick is a draw
    /// (`true`) or voids the session (`false`).
    pub draw_on_simultaneous_drop: bool,
}

impl Default for DecisionConfig {
    fn default() -> Self {
        Self {
            weights: ScoreWeights::default(),
            draw_threshold: DEFAULT_VOLUME_DRAW_THRESHOLD,
            draw_on_simultaneous_drop: true,
        }
    }
}

impl DecisionConfig {
    pub fn validate(&self) -> Result<(), DecisionError> {
        if !(0.0..=1.0).contains(&self.draw_threshold) {
            return Err(DecisionError::InvalidThreshold(self.draw_threshold));
        }
        let w = self.weights;
        if w.duration < 0.0 || w.average < 0.0 || w.peak < 0.0 || w.sum() <= 0.0 {
            return Err(DecisionError::InvalidWeights {
                duration: w.duration,
                average: w.average,
                peak: w.peak,
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum DecisionError {
    #[error("draw threshold {0} outside [0, 1]")]
    InvalidThreshold(f64),
    #[error("score weights must be non-negative with a positive sum (duration={duration}, average={average}, peak={peak})")]
    InvalidWeights {
        duration: f64,
        average: f64,
        peak: f64,
    },
}

/// One decided result. The engine turns this into an immutable outcome, or
/// voids the session when the verdict is `Void`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    pub verdict: Verdict,
    pub basis: DecisionBasis,
    pub confidence: f64,
    pub summary: String,
}

/// What a sampling tick concluded.
#[derive(Debug, Clone, PartialEq)]
pub enum TickDecision {
    Continue,
    End(Decision),
}

/// Closed set of fight policies. Constructed once per session.
#[derive(Debug, Clone)]
pub enum FightPolicy {
    Timing(TimingPolicy),
    Volume(VolumePolicy),
}

impl FightPolicy {
    pub fn for_kind(kind: FightKind, config: &DecisionConfig) -> Self {
        match kind {
            FightKind::Timing => FightPolicy::Timing(TimingPolicy {
                draw_on_drop: config.draw_on_simultaneous_drop,
            }),
            FightKind::Volume => FightPolicy::Volume(VolumePolicy {
                weights: config.weights,
                draw_threshold: config.draw_threshold,
            }),
        }
    }

    pub fn kind(&self) -> FightKind {
        match self {
            FightPolicy::Timing(_) => FightKind::Timing,
            FightPolicy::Volume(_) => FightKind::Volume,
        }
    }

    /// Consulted after each tick's samples have been folded in.
    pub fn on_tick(&self, snapshot: &MetricsSnapshot) -> TickDecision {
        match self {
            FightPolicy::Timing(p) => p.on_tick(snapshot),
            // Volume fights always run to the deadline.
            FightPolicy::Volume(_) => TickDecision::Continue,
        }
    }

    /// Forced end-of-session evaluation when the max-duration timer fires.
    pub fn on_deadline(&self, snapshot: &MetricsSnapshot) -> Decision {
        debug!(kind = %self.kind(), tick = snapshot.tick, "deadline evaluation");
        self.evaluate(snapshot)
    }

    /// Pure decision over a snapshot.
    pub fn evaluate(&self, snapshot: &MetricsSnapshot) -> Decision {
        match self {
            FightPolicy::Timing(p) => p.evaluate(snapshot),
            FightPolicy::Volume(p) => p.evaluate(snapshot),
        }
    }
}

/// Last one standing wins.
#[derive(Debug, Clone)]
pub struct TimingPolicy {
    pub draw_on_drop: bool,
}

impl TimingPolicy {
    fn on_tick(&self, snapshot: &MetricsSnapshot) -> TickDecision {
        let (present, absent) = split_by_presence(snapshot);
        match (present.len(), absent.len()) {
            (1, 1) => TickDecision::End(Decision {
                verdict: Verdict::Winner(present[0].participant.clone()),
                basis: DecisionBasis::LastStanding,
                confidence: 1.0,
                summary: format!(
                    "{} outlasted {} after {} ticks",
                    present[0].participant, absent[0].participant, snapshot.tick
                ),
            }),
            (0, _) => TickDecision::End(self.simultaneous_drop(snapshot)),
            _ => TickDecision::Continue,
        }
    }

    fn simultaneous_drop(&self, snapshot: &MetricsSnapshot) -> Decision {
        let names = participant_names(snapshot);
        if self.draw_on_drop {
            Decision {
                verdict: Verdict::Draw,
                basis: DecisionBasis::SimultaneousDrop,
                confidence: DRAW_CONFIDENCE,
                summary: format!("{names} dropped in the same tick"),
            }
        } else {
            Decision {
                verdict: Verdict::Void,
                basis: DecisionBasis::SimultaneousDrop,
                confidence: 1.0,
                summary: format!("{names} dropped in the same tick; session voided"),
            }
        }
    }

    fn evaluate(&self, snapshot: &MetricsSnapshot) -> Decision {
        let (present, absent) = split_by_presence(snapshot);
        match (present.len(), absent.len()) {
            // Nobody dropped before the deadline.
            (2, 0) => Decision {
                verdict: Verdict::Draw,
                basis: DecisionBasis::DeadlineDraw,
                confidence: DRAW_CONFIDENCE,
                summary: format!("{} went the distance", participant_names(snapshot)),
            },
            (1, 1) => Decision {
                verdict: Verdict::Winner(present[0].participant.clone()),
                basis: DecisionBasis::DeadlineForfeit,
                confidence: 1.0,
                summary: format!(
                    "{} was absent at the deadline; {} wins",
                    absent[0].participant, present[0].participant
                ),
            },
            _ => self.simultaneous_drop(snapshot),
        }
    }
}

/// Highest composite volume score wins.
#[derive(Debug, Clone)]
pub struct VolumePolicy {
    pub weights: ScoreWeights,
    pub draw_threshold: f64,
}

impl VolumePolicy {
    fn evaluate(&self, snapshot: &MetricsSnapshot) -> Decision {
        let Some((first, second)) = snapshot.pair() else {
            warn!(
                participants = snapshot.participants.len(),
                "volume evaluation needs exactly two participants"
            );
            return Decision {
                verdict: Verdict::Void,
                basis: DecisionBasis::ScoreMargin,
                confidence: 0.0,
                summary: "metrics snapshot incomplete".to_string(),
            };
        };

        let a = composite_score(first, snapshot.live_span_ms, &self.weights);
        let b = composite_score(second, snapshot.live_span_ms, &self.weights);
        let diff = (a.score - b.score).abs();

        if diff < self.draw_threshold || a.score == b.score {
            return Decision {
                verdict: Verdict::Draw,
                basis: DecisionBasis::ScoreMargin,
                confidence: DRAW_CONFIDENCE,
                summary: format!(
                    "composite volumes {:.3} and {:.3} within draw threshold {:.3}",
                    a.score, b.score, self.draw_threshold
                ),
            };
        }

        let (winner, loser) = if a.score > b.score { (a, b) } else { (b, a) };
        Decision {
            verdict: Verdict::Winner(winner.participant.clone()),
            basis: DecisionBasis::CompositeScore,
            confidence: separation_confidence(winner.score, loser.score),
            summary: format!(
                "{} wins on composite volume {:.3} vs {:.3}",
                winner.participant, winner.score, loser.score
            ),
        }
    }
}

fn split_by_presence(
    snapshot: &MetricsSnapshot,
) -> (Vec<&ParticipantMetrics>, Vec<&ParticipantMetrics>) {
    snapshot
        .participants
        .values()
        .partition(|m| m.still_present)
}

fn participant_names(snapshot: &MetricsSnapshot) -> String {
    snapshot
        .participants
        .keys()
        .map(|id| id.as_str())
        .collect::<Vec<_>>()
        .join(" and ")
}
