//! Ringside Decision - winner determination
//!
//! Pure, deterministic decision logic over immutable metrics snapshots.
//! Each fight kind carries its own policy object so the engine never
//! branches on the kind itself.

pub mod policy;
pub mod scoring;

pub use policy::{
    Decision, DecisionConfig, DecisionError, FightPolicy, TickDecision, TimingPolicy, VolumePolicy,
};
pub use scoring::{composite_score, separation_confidence, CompositeBreakdown, ScoreWeights};
