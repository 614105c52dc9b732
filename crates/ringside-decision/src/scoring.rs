//! Composite volume scoring.
//!
//! A participant's score is the weighted sum of three normalized components:
//! - speaking fraction: speaking time over the live span of the fight
//! - average volume over speaking samples
//! - peak volume
//!
//! Weights are normalized by their sum, so scores always land in [0, 1].

use ringside_metrics::ParticipantMetrics;
use ringside_protocol::UserId;
use serde::{Deserialize, Serialize};

/// Relative weight of each score component.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScoreWeights {
    pub duration: f64,
    pub average: f64,
    pub peak: f64,
}

impl Default for ScoreWeights {
    fn default() -> Self {
        Self {
            duration: 0.5,
            average: 0.3,
            peak: 0.2,
        }
    }
}

impl ScoreWeights {
    pub fn sum(&self) -> f64 {
        self.duration + self.average + self.peak
    }
}

/// Score of one participant with its components, kept for summaries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompositeBreakdown {
    pub participant: UserId,
    pub speaking_fraction: f64,
    pub average_volume: f64,
    pub peak_volume: f64,
    pub score: f64,
}

/// Compute the composite score for one participant.
///
/// `live_span_ms` is the span the fight actually ran; a non-positive span
/// yields a zero speaking fraction.
pub fn composite_score(
    metrics: &ParticipantMetrics,
    live_span_ms: i64,
    weights: &ScoreWeights,
) -> CompositeBreakdown {
    let speaking_fraction = if live_span_ms > 0 {
        (metrics.speaking_ms as f64 / live_span_ms as f64).clamp(0.0, 1.0)
    } else {
        0.0
    };
    let average_volume = metrics.average_volume();
    let peak_volume = metrics.volume_peak;

    let weight_sum = weights.sum();
    let score = if weight_sum > 0.0 {
        (weights.duration * speaking_fraction
            + weights.average * average_volume
            + weights.peak * peak_volume)
            / weight_sum
    } else {
        0.0
    };

    CompositeBreakdown {
        participant: metrics.participant.clone(),
        speaking_fraction,
        average_volume,
        peak_volume,
        score,
    }
}

/// Confidence from normalized score separation: `2 * |a - b| / (a + b)`,
/// clamped to [0, 1]. Zero when both scores are zero.
pub fn separation_confidence(a: f64, b: f64) -> f64 {
    let total = a + b;
    if total <= 0.0 {
        return 0.0;
    }
    (2.0 * (a - b).abs() / total).clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metrics(speaking_ms: i64, speaking_samples: u64, volume_sum: f64, peak: f64) -> ParticipantMetrics {
        ParticipantMetrics {
            participant: UserId::new("p"),
            presence_ms: speaking_ms,
            speaking_ms,
            sample_count: speaking_samples,
            speaking_samples,
            volume_sum,
            volume_peak: peak,
            last_seen_ms: Some(0),
            still_present: true,
        }
    }

    #[test]
    fn test_score_is_weighted_normalized_sum() {
        let m = metrics(50_000, 5, 3.0, 0.9);
        let b = composite_score(&m, 100_000, &ScoreWeights::default());
        assert!((b.speaking_fraction - 0.5).abs() < 1e-10);
        assert!((b.average_volume - 0.6).abs() < 1e-10);
        let expected = 0.5 * 0.5 + 0.3 * 0.6 + 0.2 * 0.9;
        assert!((b.score - expected).abs() < 1e-10);
    }

    #[test]
    fn test_zero_span_yields_zero_fraction() {
        let m = metrics(50_000, 5, 3.0, 0.9);
        let b = composite_score(&m, 0, &ScoreWeights::default());
        assert_eq!(b.speaking_fraction, 0.0);
        assert!(b.score > 0.0, "volume components still count");
    }

    #[test]
    fn test_fraction_clamped_to_one() {
        // Speaking time can slightly exceed the span with reordered legs.
        let m = metrics(120_000, 5, 3.0, 0.5);
        let b = composite_score(&m, 100_000, &ScoreWeights::default());
        assert_eq!(b.speaking_fraction, 1.0);
    }

    #[test]
    fn test_separation_confidence_bounds() {
        assert_eq!(separation_confidence(0.0, 0.0), 0.0);
        assert_eq!(separation_confidence(0.5, 0.5), 0.0);
        // Complete blowout saturates at 1.0.
        assert_eq!(separation_confidence(0.8, 0.0), 1.0);
        let c = separation_confidence(0.6, 0.4);
        assert!((c - 0.4).abs() < 1e-10);
    }

    #[test]
    fn test_confidence_symmetric() {
        assert_eq!(
            separation_confidence(0.7, 0.2),
            separation_confidence(0.2, 0.7)
        );
    }
}
