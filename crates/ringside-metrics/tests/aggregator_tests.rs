use ringside_metrics::{AggregatorConfig, IngestStatus, MetricsAggregator, MetricsError};
use ringside_protocol::{Sample, UserId};

fn alice() -> UserId {
    UserId::new("alice")
}

fn bob() -> UserId {
    UserId::new("bob")
}

fn aggregator() -> MetricsAggregator {
    MetricsAggregator::new(alice(), bob(), AggregatorConfig::default())
}

fn live_aggregator() -> MetricsAggregator {
    let mut agg = aggregator();
    agg.activate();
    agg
}

fn present(user: UserId, ts: i64, volume: f64) -> Sample {
    Sample::new(user, ts, true, volume)
}

fn absent(user: UserId, ts: i64) -> Sample {
    Sample::new(user, ts, false, 0.0)
}

#[test]
fn test_first_sample_registers_presence() {
    let mut agg = aggregator();
    let status = agg.ingest(&present(alice(), 1_000, 0.0)).unwrap();
    assert_eq!(status, IngestStatus::Accepted);

    let snap = agg.snapshot();
    let m = snap.get(&alice()).unwrap();
    assert!(m.still_present);
    assert_eq!(m.last_seen_ms, Some(1_000));
    assert_eq!(m.sample_count, 1);
    assert_eq!(m.presence_ms, 0, "a single sample spans no time");
}

#[test]
fn test_unknown_participant_rejected() {
    let mut agg = aggregator();
    let err = agg
        .ingest(&present(UserId::new("mallory"), 1_000, 0.5))
        .unwrap_err();
    assert_eq!(
        err,
        MetricsError::UnknownParticipant {
            participant: UserId::new("mallory")
        }
    );
}

#[test]
fn test_duplicate_timestamp_is_idempotent() {
    let mut agg = live_aggregator();
    agg.ingest(&present(alice(), 1_000, 0.6)).unwrap();
    let before = agg.snapshot().get(&alice()).unwrap().clone();

    let status = agg.ingest(&present(alice(), 1_000, 0.6)).unwrap();
    assert_eq!(status, IngestStatus::DuplicateIgnored);

    let after = agg.snapshot().get(&alice()).unwrap().clone();
    assert_eq!(before.sample_count, after.sample_count);
    assert_eq!(before.speaking_samples, after.speaking_samples);
    assert_eq!(before.volume_sum, after.volume_sum);
    assert_eq!(before.presence_ms, after.presence_ms);
}

#[test]
fn test_stale_sample_discarded() {
    let mut agg = live_aggregator();
    agg.ingest(&present(alice(), 30_000, 0.4)).unwrap();

    // 2s default tolerance: 27_000 is 3s behind the newest accepted sample.
    let status = agg.ingest(&present(alice(), 27_000, 0.9)).unwrap();
    assert_eq!(status, IngestStatus::StaleDiscarded);

    let m = agg.snapshot().get(&alice()).unwrap().clone();
    assert_eq!(m.sample_count, 1);
    assert_eq!(m.volume_peak, 0.4);
}

#[test]
fn test_out_of_order_inside_window_counts_volume_only() {
    let mut agg = live_aggregator();
    agg.ingest(&present(alice(), 10_000, 0.2)).unwrap();
    agg.ingest(&present(alice(), 20_000, 0.3)).unwrap();
    let presence_before = agg.snapshot().get(&alice()).unwrap().presence_ms;

    // 19_000 is behind the newest sample but inside the 2s tolerance.
    let status = agg.ingest(&present(alice(), 19_000, 0.9)).unwrap();
    assert_eq!(status, IngestStatus::Accepted);

    let m = agg.snapshot().get(&alice()).unwrap().clone();
    assert_eq!(m.presence_ms, presence_before, "durations ignore reordered samples");
    assert_eq!(m.speaking_samples, 3);
    assert_eq!(m.volume_peak, 0.9);
}

#[test]
fn test_presence_accumulates_between_present_samples() {
    let mut agg = live_aggregator();
    agg.ingest(&present(alice(), 0, 0.5)).unwrap();
    agg.ingest(&present(alice(), 10_000, 0.0)).unwrap();
    agg.ingest(&present(alice(), 20_000, 0.7)).unwrap();

    let m = agg.snapshot().get(&alice()).unwrap().clone();
    assert_eq!(m.presence_ms, 20_000);
    // Only the second leg had nonzero volume on its closing sample.
    assert_eq!(m.speaking_ms, 10_000);
    assert_eq!(m.speaking_samples, 2);
}

#[test]
fn test_absence_gap_not_counted_as_presence() {
    let mut agg = live_aggregator();
    agg.ingest(&present(alice(), 0, 0.5)).unwrap();
    agg.ingest(&absent(alice(), 10_000)).unwrap();
    agg.ingest(&present(alice(), 20_000, 0.5)).unwrap();

    let m = agg.snapshot().get(&alice()).unwrap().clone();
    assert_eq!(
        m.presence_ms, 0,
        "presence only spans present-to-present legs"
    );
}

#[test]
fn test_lobby_tracks_flags_but_not_statistics() {
    let mut agg = aggregator();
    agg.ingest(&present(alice(), 0, 0.8)).unwrap();
    agg.ingest(&present(alice(), 10_000, 0.8)).unwrap();

    let m = agg.snapshot().get(&alice()).unwrap().clone();
    assert!(m.still_present);
    assert_eq!(m.presence_ms, 0);
    assert_eq!(m.speaking_samples, 0);
    assert_eq!(m.volume_sum, 0.0);

    agg.activate();
    agg.ingest(&present(alice(), 20_000, 0.8)).unwrap();
    agg.ingest(&present(alice(), 30_000, 0.8)).unwrap();
    let m = agg.snapshot().get(&alice()).unwrap().clone();
    assert_eq!(m.presence_ms, 10_000, "accumulation starts at activation");
    assert_eq!(m.speaking_samples, 2);
}

#[test]
fn test_flag_clears_after_two_missed_ticks() {
    let mut agg = live_aggregator();

    agg.note_tick();
    agg.ingest(&present(alice(), 10_000, 0.1)).unwrap();
    agg.ingest(&present(bob(), 10_000, 0.1)).unwrap();

    // Alice misses one tick: still inside the grace window.
    agg.note_tick();
    agg.ingest(&present(bob(), 20_000, 0.1)).unwrap();
    assert!(agg.snapshot().get(&alice()).unwrap().still_present);

    // Second consecutive miss clears the flag.
    agg.note_tick();
    agg.ingest(&present(bob(), 30_000, 0.1)).unwrap();
    let snap = agg.snapshot();
    assert!(!snap.get(&alice()).unwrap().still_present);
    assert!(snap.get(&bob()).unwrap().still_present);
    assert_eq!(snap.present_count(), 1);
}

#[test]
fn test_flag_restored_by_fresh_sample() {
    let mut agg = live_aggregator();
    agg.note_tick();
    agg.ingest(&present(alice(), 10_000, 0.1)).unwrap();
    agg.note_tick();
    agg.note_tick();
    assert!(!agg.snapshot().get(&alice()).unwrap().still_present);

    agg.ingest(&present(alice(), 40_000, 0.1)).unwrap();
    assert!(agg.snapshot().get(&alice()).unwrap().still_present);
}

#[test]
fn test_explicit_departure_follows_same_grace_as_silence() {
    let mut agg = live_aggregator();
    agg.note_tick();
    agg.ingest(&present(alice(), 10_000, 0.1)).unwrap();

    // An absent sample does not clear the flag by itself.
    agg.note_tick();
    agg.ingest(&absent(alice(), 20_000)).unwrap();
    assert!(agg.snapshot().get(&alice()).unwrap().still_present);

    agg.note_tick();
    agg.ingest(&absent(alice(), 30_000)).unwrap();
    assert!(!agg.snapshot().get(&alice()).unwrap().still_present);
}

#[test]
fn test_snapshot_orders_participants_by_id() {
    let mut agg = live_aggregator();
    agg.ingest(&present(bob(), 1_000, 0.2)).unwrap();
    agg.ingest(&present(alice(), 1_000, 0.3)).unwrap();

    let snap = agg.snapshot();
    let ids: Vec<_> = snap.participants.keys().cloned().collect();
    assert_eq!(ids, vec![alice(), bob()]);

    let (first, second) = snap.pair().unwrap();
    assert_eq!(first.participant, alice());
    assert_eq!(second.participant, bob());
}

#[test]
fn test_live_span_covers_first_to_last_sample() {
    let mut agg = live_aggregator();
    agg.ingest(&present(alice(), 5_000, 0.2)).unwrap();
    agg.ingest(&present(bob(), 8_000, 0.2)).unwrap();
    agg.ingest(&present(alice(), 45_000, 0.2)).unwrap();

    assert_eq!(agg.snapshot().live_span_ms, 40_000);
}

#[test]
fn test_average_volume_over_speaking_samples() {
    let mut agg = live_aggregator();
    agg.ingest(&present(alice(), 0, 0.4)).unwrap();
    agg.ingest(&present(alice(), 10_000, 0.8)).unwrap();
    agg.ingest(&present(alice(), 20_000, 0.0)).unwrap();

    let m = agg.snapshot().get(&alice()).unwrap().clone();
    assert!((m.average_volume() - 0.6).abs() < 1e-10);
    assert_eq!(agg.snapshot().get(&bob()).unwrap().average_volume(), 0.0);
}

#[test]
fn test_raw_out_of_range_volume_clamped() {
    let mut agg = live_aggregator();
    // Bypass Sample::new clamping the way a deserialized payload could.
    let raw = Sample {
        participant: alice(),
        timestamp_ms: 1_000,
        present: true,
        volume: 4.0,
    };
    agg.ingest(&raw).unwrap();
    let m = agg.snapshot().get(&alice()).unwrap().clone();
    assert_eq!(m.volume_peak, 1.0);
    assert_eq!(m.volume_sum, 1.0);
}

#[test]
fn test_snapshot_serializes_and_restores() {
    let mut agg = live_aggregator();
    agg.ingest(&present(alice(), 0, 0.4)).unwrap();
    agg.ingest(&present(alice(), 10_000, 0.6)).unwrap();
    agg.ingest(&present(bob(), 10_000, 0.2)).unwrap();

    let snap = agg.snapshot();
    let json = serde_json::to_string(&snap).unwrap();
    let restored: ringside_metrics::MetricsSnapshot = serde_json::from_str(&json).unwrap();
    assert_eq!(restored.participants.len(), 2);
    assert_eq!(
        restored.get(&alice()).unwrap().presence_ms,
        snap.get(&alice()).unwrap().presence_ms
    );
    assert_eq!(restored.live_span_ms, snap.live_span_ms);
}
