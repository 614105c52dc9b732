use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use ringside_protocol::{
    Sample, UserId, DEFAULT_MISSED_TICKS_BEFORE_ABSENT, DEFAULT_SKEW_TOLERANCE_MS,
};

/// Tuning knobs for sample acceptance and presence tracking.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct AggregatorConfig {
    /// Samples older than the newest accepted timestamp minus this tolerance
    /// are discarded.
    pub skew_tolerance_ms: i64,
    /// Ticks without a presence sample before the still-present flag clears.
    pub missed_ticks_before_absent: u32,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            skew_tolerance_ms: DEFAULT_SKEW_TOLERANCE_MS,
            missed_ticks_before_absent: DEFAULT_MISSED_TICKS_BEFORE_ABSENT,
        }
    }
}

/// What happened to one ingested sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestStatus {
    Accepted,
    /// Same timestamp was already accepted for this participant.
    DuplicateIgnored,
    /// Timestamp fell outside the skew window.
    StaleDiscarded,
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum MetricsError {
    #[error("sample for unknown participant {participant}")]
    UnknownParticipant { participant: UserId },
}

/// Running statistics for one participant within one session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParticipantMetrics {
    pub participant: UserId,
    /// Milliseconds covered by consecutive present-to-present samples while
    /// the fight was live.
    pub presence_ms: i64,
    /// Portion of `presence_ms` where the participant had nonzero volume.
    pub speaking_ms: i64,
    /// Accepted samples, lobby and live.
    pub sample_count: u64,
    /// Live samples that contributed volume statistics.
    pub speaking_samples: u64,
    pub volume_sum: f64,
    pub volume_peak: f64,
    /// Newest accepted sample timestamp, unix milliseconds.
    pub last_seen_ms: Option<i64>,
    pub still_present: bool,
}

impl ParticipantMetrics {
    fn new(participant: UserId) -> Self {
        Self {
            participant,
            presence_ms: 0,
            speaking_ms: 0,
            sample_count: 0,
            speaking_samples: 0,
            volume_sum: 0.0,
            volume_peak: 0.0,
            last_seen_ms: None,
            still_present: false,
        }
    }

    /// Mean volume over speaking samples; 0.0 when the participant never
    /// spoke.
    pub fn average_volume(&self) -> f64 {
        if self.speaking_samples == 0 {
            0.0
        } else {
            self.volume_sum / self.speaking_samples as f64
        }
    }
}

/// Read-only view of the aggregated state, handed to the winner decider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    /// Keyed by participant; iteration order is stable.
    pub participants: BTreeMap<UserId, ParticipantMetrics>,
    pub tick: u64,
    /// Span between the first and last in-order live sample, milliseconds.
    pub live_span_ms: i64,
    pub captured_at: DateTime<Utc>,
}

impl MetricsSnapshot {
    pub fn get(&self, participant: &UserId) -> Option<&ParticipantMetrics> {
        self.participants.get(participant)
    }

    /// The two participants in id order. `None` if the snapshot does not
    /// hold exactly two.
    pub fn pair(&self) -> Option<(&ParticipantMetrics, &ParticipantMetrics)> {
        if self.participants.len() != 2 {
            return None;
        }
        let mut iter = self.participants.values();
        Some((iter.next()?, iter.next()?))
    }

    pub fn present_count(&self) -> usize {
        self.participants
            .values()
            .filter(|m| m.still_present)
            .count()
    }
}

#[derive(Debug, Clone)]
struct Track {
    metrics: ParticipantMetrics,
    /// Presence of the newest in-order accepted sample.
    prev_present: bool,
    /// Tick of the last accepted presence sample.
    last_present_tick: Option<u64>,
    /// Accepted timestamps still inside the skew window, for duplicate
    /// detection.
    recent_ts: BTreeSet<i64>,
}

impl Track {
    fn new(participant: UserId) -> Self {
        Self {
            metrics: ParticipantMetrics::new(participant),
            prev_present: false,
            last_present_tick: None,
            recent_ts: BTreeSet::new(),
        }
    }
}

/// Folds watcher samples for one session into per-participant statistics.
///
/// The aggregator runs in two phases. Before `activate` (the lobby, while
/// participants are still joining) it tracks presence flags only. After
/// `activate` it also accumulates durations and volume statistics. Nothing is
/// ever reset, so durations and counts grow monotonically for the whole
/// session.
#[derive(Debug, Clone)]
pub struct MetricsAggregator {
    config: AggregatorConfig,
    tracks: BTreeMap<UserId, Track>,
    tick: u64,
    live: bool,
    first_live_ts: Option<i64>,
    last_live_ts: Option<i64>,
}

impl MetricsAggregator {
    pub fn new(first: UserId, second: UserId, config: AggregatorConfig) -> Self {
        let mut tracks = BTreeMap::new();
        tracks.insert(first.clone(), Track::new(first));
        tracks.insert(second.clone(), Track::new(second));
        Self {
            config,
            tracks,
            tick: 0,
            live: false,
            first_live_ts: None,
            last_live_ts: None,
        }
    }

    pub fn is_live(&self) -> bool {
        self.live
    }

    pub fn current_tick(&self) -> u64 {
        self.tick
    }

    /// Switch from lobby tracking to full accumulation. Called once when the
    /// session goes active. Presence grace restarts from the current tick and
    /// duration legs restart at the first live sample, so lobby time never
    /// leaks into the totals.
    pub fn activate(&mut self) {
        if self.live {
            return;
        }
        self.live = true;
        for track in self.tracks.values_mut() {
            if track.metrics.still_present {
                track.last_present_tick = Some(self.tick);
            }
            track.prev_present = false;
        }
    }

    /// Advance the tick counter and clear presence flags that have gone
    /// unconfirmed for the configured number of ticks. Call at the start of
    /// each sampling tick, before ingesting that tick's batch.
    pub fn note_tick(&mut self) {
        self.tick += 1;
        let threshold = u64::from(self.config.missed_ticks_before_absent);
        for track in self.tracks.values_mut() {
            if !track.metrics.still_present {
                continue;
            }
            let last = track.last_present_tick.unwrap_or(0);
            if self.tick.saturating_sub(last) >= threshold {
                track.metrics.still_present = false;
                debug!(
                    participant = %track.metrics.participant,
                    tick = self.tick,
                    "presence flag cleared after missed ticks"
                );
            }
        }
    }

    /// Fold one sample in. Duplicates at an already-accepted timestamp and
    /// samples older than the skew window change nothing.
    pub fn ingest(&mut self, sample: &Sample) -> Result<IngestStatus, MetricsError> {
        let live = self.live;
        let tick = self.tick;
        let tolerance = self.config.skew_tolerance_ms;
        let track =
            self.tracks
                .get_mut(&sample.participant)
                .ok_or_else(|| MetricsError::UnknownParticipant {
                    participant: sample.participant.clone(),
                })?;

        let ts = sample.timestamp_ms;
        if let Some(last) = track.metrics.last_seen_ms {
            if ts < last - tolerance {
                debug!(
                    participant = %sample.participant,
                    timestamp_ms = ts,
                    newest_ms = last,
                    "stale sample discarded"
                );
                return Ok(IngestStatus::StaleDiscarded);
            }
        }
        if track.recent_ts.contains(&ts) {
            return Ok(IngestStatus::DuplicateIgnored);
        }

        // Serde can hand us raw payloads, so clamp once more on the way in.
        let volume = sample.volume.clamp(0.0, 1.0);
        let in_order = track.metrics.last_seen_ms.map_or(true, |last| ts > last);

        if in_order {
            if live && track.prev_present && sample.present {
                if let Some(last) = track.metrics.last_seen_ms {
                    let delta = ts - last;
                    track.metrics.presence_ms += delta;
                    if volume > 0.0 {
                        track.metrics.speaking_ms += delta;
                    }
                }
            }
            track.metrics.last_seen_ms = Some(ts);
            track.prev_present = sample.present;
            if live {
                if self.first_live_ts.is_none() {
                    self.first_live_ts = Some(ts);
                }
                self.last_live_ts = Some(self.last_live_ts.map_or(ts, |t| t.max(ts)));
            }
        }
        // Out-of-order samples inside the window still count toward volume,
        // never toward durations.

        track.metrics.sample_count += 1;
        if sample.present {
            track.metrics.still_present = true;
            track.last_present_tick = Some(tick);
            if live && volume > 0.0 {
                track.metrics.speaking_samples += 1;
                track.metrics.volume_sum += volume;
                if volume > track.metrics.volume_peak {
                    track.metrics.volume_peak = volume;
                }
            }
        }

        track.recent_ts.insert(ts);
        if let Some(newest) = track.metrics.last_seen_ms {
            let cutoff = newest - tolerance;
            track.recent_ts = track.recent_ts.split_off(&cutoff);
        }

        Ok(IngestStatus::Accepted)
    }

    /// Immutable view of the current statistics.
    pub fn snapshot(&self) -> MetricsSnapshot {
        let participants = self
            .tracks
            .iter()
            .map(|(id, track)| (id.clone(), track.metrics.clone()))
            .collect();
        let live_span_ms = match (self.first_live_ts, self.last_live_ts) {
            (Some(first), Some(last)) => (last - first).max(0),
            _ => 0,
        };
        MetricsSnapshot {
            participants,
            tick: self.tick,
            live_span_ms,
            captured_at: Utc::now(),
        }
    }
}
