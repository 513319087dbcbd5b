//! End-to-end flywheel scenarios
//!
//! Drives the full chain in-process over the real bus and sled stores:
//! raw batches -> ingestion -> behavioral aggregation -> correlation ->
//! cluster detection -> pattern matching -> feedback. Workers are stepped
//! synchronously via their drain methods so every test is deterministic.

use std::sync::Arc;
use tagmine::ingest::IngestWorker;
use tagmine::workers::{
    BehaviorWorker, ClusterWorker, CorrelationWorker, FeedbackWorker, MatcherWorker,
};
use tagmine_bus::{topics, MessageBus};
use tagmine_config::TagmineConfig;
use tagmine_core::{
    ConfidenceChange, DataSourceId, FeedbackAction, FeedbackEvent, PatternUpdatedEvent, Point,
    Quality, RawPoint, RawSampleBatch, ScanSource, SuggestionStatus, Value,
};
use tagmine_match::{FeedbackLearner, PatternMatcher};
use tagmine_store::{
    BehaviorCache, CorrelationCache, CurrentValueCache, MetadataStore, TimeSeriesStore,
};

struct Flywheel {
    bus: Arc<MessageBus>,
    meta: Arc<MetadataStore>,
    series: Arc<TimeSeriesStore>,
    current: Arc<CurrentValueCache>,
    behavior_cache: Arc<BehaviorCache>,
    config: TagmineConfig,
    ingest: IngestWorker,
    behavior: BehaviorWorker,
    correlation: CorrelationWorker,
    clusters: ClusterWorker,
    matcher: MatcherWorker,
    feedback: FeedbackWorker,
    _dir: tempfile::TempDir,
}

fn flywheel() -> Flywheel {
    let dir = tempfile::tempdir().unwrap();
    let mut config = TagmineConfig::default();
    config.behavior.min_samples_for_behavior = 100;
    config.behavior.publish_interval_s = 0;
    config.correlation.min_overlap = 50;
    config.correlation.significant_r = 0.7;

    let bus = MessageBus::open(dir.path().join("bus"), 1).unwrap();
    let meta = Arc::new(MetadataStore::open(dir.path().join("meta")).unwrap());
    let series = Arc::new(TimeSeriesStore::open(dir.path().join("series")).unwrap());
    let current = Arc::new(CurrentValueCache::new());
    let behavior_cache = Arc::new(BehaviorCache::new());
    let corr_cache = Arc::new(CorrelationCache::new());
    let ring = Arc::new(tagmine_analysis::SampleRing::new(2048));

    let aggregator = Arc::new(tagmine_analysis::BehaviorAggregator::new(
        behavior_cache.clone(),
        config.behavior.clone(),
    ));
    let engine = Arc::new(tagmine_analysis::CorrelationEngine::new(
        ring.clone(),
        meta.clone(),
        corr_cache.clone(),
        config.correlation.clone(),
    ));
    let detector = Arc::new(tagmine_analysis::ClusterDetector::new(
        corr_cache,
        meta.clone(),
        config.clustering.clone(),
    ));
    let matcher = Arc::new(PatternMatcher::new(
        meta.clone(),
        behavior_cache.clone(),
        config.matching.clone(),
    ));
    let learner = Arc::new(FeedbackLearner::new(meta.clone(), config.feedback.clone()));

    let ingest = IngestWorker::new(
        bus.clone(),
        meta.clone(),
        series.clone(),
        current.clone(),
        &config.ingest,
        vec![0],
    )
    .unwrap();
    let behavior = BehaviorWorker::new(
        bus.clone(),
        meta.clone(),
        aggregator,
        ring,
        vec![0],
    )
    .unwrap();
    let correlation = CorrelationWorker::new(bus.clone(), engine).unwrap();
    let clusters = ClusterWorker::new(bus.clone(), detector, 30).unwrap();
    let matcher = MatcherWorker::new(bus.clone(), matcher).unwrap();
    let feedback = FeedbackWorker::new(bus.clone(), learner).unwrap();

    Flywheel {
        bus,
        meta,
        series,
        current,
        behavior_cache,
        config,
        ingest,
        behavior,
        correlation,
        clusters,
        matcher,
        feedback,
        _dir: dir,
    }
}

fn register_ahu_points(f: &Flywheel) -> (DataSourceId, Vec<Point>) {
    let ds = DataSourceId::new();
    let points = ["hvac.ahu1.sat", "hvac.ahu1.rat", "hvac.ahu1.sf_status"]
        .iter()
        .map(|name| {
            f.meta
                .register_point(tagmine_store::NewPoint {
                    name: name.to_string(),
                    address: name.to_string(),
                    description: None,
                    unit: None,
                    value_kind: tagmine_core::ValueKind::Float64,
                    data_source_id: Some(ds),
                })
                .unwrap()
        })
        .collect();
    (ds, points)
}

fn ahu_pattern(confidence: f64) -> tagmine_core::Pattern {
    let role = |name: &str, patterns: &[&str], order: u32| tagmine_core::PatternRole {
        name: name.to_string(),
        name_patterns: patterns.iter().map(|p| p.to_string()).collect(),
        typical_unit: None,
        typical_min: None,
        typical_max: None,
        typical_update_ms: None,
        required: false,
        sort_order: order,
    };
    tagmine_core::Pattern {
        id: tagmine_core::PatternId::new(),
        name: "Air Handling Unit".to_string(),
        description: None,
        confidence,
        active: true,
        system_defined: true,
        roles: vec![
            role("Supply Air Temperature", &["sat"], 0),
            role("Return Air Temperature", &["rat"], 1),
            role("Supply Fan Status", &["fan.*status", "sf_status"], 2),
        ],
        created_at: chrono::Utc::now(),
        updated_at: chrono::Utc::now(),
    }
}

/// 500 cohesive samples per point: the three signals ride one slow wave
/// with small deterministic perturbations, so pairwise |r| stays high.
fn ingest_cohesive_history(f: &Flywheel, ds: DataSourceId) {
    let t0 = chrono::Utc::now() - chrono::Duration::seconds(500);
    for i in 0..500i64 {
        let wave = (i as f64 * 0.05).sin();
        let jitter = |seed: i64| ((i * seed) % 13) as f64 / 13.0 * 0.05;
        let batch = RawSampleBatch::new(
            ds,
            vec![
                raw("hvac.ahu1.sat", t0, i, 14.0 + 3.0 * wave + jitter(7)),
                raw("hvac.ahu1.rat", t0, i, 22.0 + 2.0 * wave + jitter(11)),
                raw("hvac.ahu1.sf_status", t0, i, 0.5 + 0.5 * wave + jitter(17) * 0.1),
            ],
        );
        f.bus
            .publish(topics::DATAPOINTS_RAW, &ds.to_string(), &batch)
            .unwrap();
    }
}

fn raw(address: &str, t0: chrono::DateTime<chrono::Utc>, offset_s: i64, value: f64) -> RawPoint {
    RawPoint {
        address: address.to_string(),
        name: None,
        timestamp: t0 + chrono::Duration::seconds(offset_s),
        value: Value::Float(value),
        quality: Quality::Good,
        unit: None,
    }
}

/// Step every stage once, in pipeline order
async fn turn(f: &mut Flywheel) {
    f.ingest.process_available().await.unwrap();
    f.behavior.drain().unwrap();
    f.correlation.drain().unwrap();
    f.clusters.drain().unwrap();
    f.clusters.scan_and_publish(ScanSource::Continuous).unwrap();
    f.matcher.drain().unwrap();
    f.feedback.drain().unwrap();
}

fn pattern_updated_events(f: &Flywheel) -> Vec<PatternUpdatedEvent> {
    let mut consumer = f
        .bus
        .consumer_all("test-observer", topics::PATTERNS_UPDATED)
        .unwrap();
    consumer
        .poll(usize::MAX)
        .unwrap()
        .iter()
        .map(|r| r.decode().unwrap())
        .collect()
}

#[tokio::test]
async fn test_single_pattern_match() {
    let mut f = flywheel();
    let (ds, points) = register_ahu_points(&f);
    f.meta.save_pattern(&ahu_pattern(0.75)).unwrap();
    ingest_cohesive_history(&f, ds);

    turn(&mut f).await;

    // Storage got every sample
    for point in &points {
        assert_eq!(f.series.count(point.sequence_id), 500);
        assert!(f.current.get(point.sequence_id).is_some());
        assert!(f.behavior_cache.get(&point.id).is_some());
    }

    // One cohesive cluster over the three points
    let clusters = f.meta.list_clusters().unwrap();
    assert_eq!(clusters.len(), 1);
    let cluster = &clusters[0];
    assert_eq!(cluster.size(), 3);
    assert!(
        cluster.average_cohesion >= 0.85,
        "cohesion {}",
        cluster.average_cohesion
    );
    for point in &points {
        assert!(cluster.contains(&point.id));
    }

    // One suggestion with the expected role assignments
    let suggestions = f.meta.pending_suggestions().unwrap();
    assert_eq!(suggestions.len(), 1);
    let suggestion = &suggestions[0];
    assert!(suggestion.overall >= 0.70, "overall {}", suggestion.overall);
    assert_eq!(
        suggestion.role_assignments.get(&points[0].id).map(String::as_str),
        Some("Supply Air Temperature")
    );
    assert_eq!(
        suggestion.role_assignments.get(&points[1].id).map(String::as_str),
        Some("Return Air Temperature")
    );
    assert_eq!(
        suggestion.role_assignments.get(&points[2].id).map(String::as_str),
        Some("Supply Fan Status")
    );

    // The suggestion event made it onto the bus
    let mut consumer = f
        .bus
        .consumer_all("test-observer", topics::SUGGESTIONS_CREATED)
        .unwrap();
    assert_eq!(consumer.poll(usize::MAX).unwrap().len(), 1);
}

#[tokio::test]
async fn test_approval_updates_confidence_and_creates_bindings() {
    let mut f = flywheel();
    let (ds, points) = register_ahu_points(&f);
    let pattern = ahu_pattern(0.75);
    f.meta.save_pattern(&pattern).unwrap();
    ingest_cohesive_history(&f, ds);
    turn(&mut f).await;

    let suggestion = f.meta.pending_suggestions().unwrap().remove(0);
    f.bus
        .publish(
            topics::PATTERNS_FEEDBACK,
            &suggestion.id.to_string(),
            &FeedbackEvent {
                suggestion_id: suggestion.id,
                action: FeedbackAction::Approved,
                user_id: Some("operator-1".to_string()),
                reason: None,
                confidence_at_action: 0.75,
            },
        )
        .unwrap();
    f.feedback.drain().unwrap();

    let stored_pattern = f.meta.get_pattern(&pattern.id).unwrap().unwrap();
    assert!((stored_pattern.confidence - 0.80).abs() < 1e-12);
    assert_eq!(
        f.meta.get_suggestion(&suggestion.id).unwrap().unwrap().status,
        SuggestionStatus::Applied
    );
    for point in &points {
        assert!(f.meta.binding(&point.id, &pattern.id).unwrap().is_some());
    }
    assert_eq!(f.meta.binding_count(), 3);

    // Exactly one update event, with the right shape
    let updates = pattern_updated_events(&f);
    assert_eq!(updates.len(), 1);
    let update = &updates[0];
    assert_eq!(update.kind, ConfidenceChange::IncreasedConfidence);
    assert!((update.old_confidence - 0.75).abs() < 1e-12);
    assert!((update.new_confidence - 0.80).abs() < 1e-12);
}

#[tokio::test]
async fn test_rejection_decrements_confidence() {
    let mut f = flywheel();
    let (ds, _points) = register_ahu_points(&f);
    let pattern = ahu_pattern(0.80);
    f.meta.save_pattern(&pattern).unwrap();
    ingest_cohesive_history(&f, ds);
    turn(&mut f).await;

    let suggestion = f.meta.pending_suggestions().unwrap().remove(0);
    f.bus
        .publish(
            topics::PATTERNS_FEEDBACK,
            &suggestion.id.to_string(),
            &FeedbackEvent {
                suggestion_id: suggestion.id,
                action: FeedbackAction::Rejected,
                user_id: Some("operator-1".to_string()),
                reason: Some("wrong assignment".to_string()),
                confidence_at_action: 0.80,
            },
        )
        .unwrap();
    f.feedback.drain().unwrap();

    let stored_pattern = f.meta.get_pattern(&pattern.id).unwrap().unwrap();
    assert!((stored_pattern.confidence - 0.70).abs() < 1e-12);
    let stored = f.meta.get_suggestion(&suggestion.id).unwrap().unwrap();
    assert_eq!(stored.status, SuggestionStatus::Rejected);
    assert_eq!(stored.rejection_reason.as_deref(), Some("wrong assignment"));
    assert_eq!(f.meta.binding_count(), 0);

    let updates = pattern_updated_events(&f);
    assert_eq!(updates.len(), 1);
    assert_eq!(updates[0].kind, ConfidenceChange::DecreasedConfidence);
}

#[tokio::test]
async fn test_duplicate_raw_batch_is_idempotent() {
    let mut f = flywheel();
    let (ds, points) = register_ahu_points(&f);

    let t0 = chrono::Utc::now();
    let batch = RawSampleBatch::new(
        ds,
        (0..10)
            .map(|i| raw("hvac.ahu1.sat", t0, i, 20.0 + i as f64))
            .collect(),
    );
    f.bus.publish(topics::DATAPOINTS_RAW, "ds", &batch).unwrap();
    f.ingest.process_available().await.unwrap();
    let rows_after_first = f.series.total_rows();

    f.bus.publish(topics::DATAPOINTS_RAW, "ds", &batch).unwrap();
    f.ingest.process_available().await.unwrap();

    assert!(f.series.total_rows() <= rows_after_first + 10);
    assert_eq!(f.series.total_rows(), rows_after_first);
    let current = f.current.get(points[0].sequence_id).unwrap();
    assert_eq!(current.timestamp, t0 + chrono::Duration::seconds(9));
    assert_eq!(f.current.stats().stale_discarded, 9);
}

#[tokio::test]
async fn test_unknown_point_routed_to_dlq() {
    let mut f = flywheel();
    let ds = DataSourceId::new();
    let t0 = chrono::Utc::now();
    let batch = RawSampleBatch::new(ds, vec![raw("plant/unregistered", t0, 0, 1.0)]);
    f.bus.publish(topics::DATAPOINTS_RAW, "ds", &batch).unwrap();

    // Zero retry window so the deferral expires on the same pass
    let mut config = f.config.clone();
    config.ingest.retry_ttl_s = 0;
    let mut ingest = IngestWorker::new(
        f.bus.clone(),
        f.meta.clone(),
        f.series.clone(),
        f.current.clone(),
        &config.ingest,
        vec![0],
    )
    .unwrap();
    ingest.process_available().await.unwrap();

    assert_eq!(f.series.total_rows(), 0);
    let mut dlq = f.bus.consumer_all("test-observer", topics::DATAPOINTS_DLQ).unwrap();
    let records = dlq.poll(usize::MAX).unwrap();
    assert_eq!(records.len(), 1);
    let envelope: tagmine_bus::DlqEnvelope = records[0].decode().unwrap();
    let original: RawPoint = serde_json::from_slice(&envelope.payload).unwrap();
    assert_eq!(original.address, "plant/unregistered");
}

#[tokio::test]
async fn test_reemission_suppressed_for_unchanged_cluster() {
    let mut f = flywheel();
    let (ds, _points) = register_ahu_points(&f);
    f.meta.save_pattern(&ahu_pattern(0.75)).unwrap();
    ingest_cohesive_history(&f, ds);
    turn(&mut f).await;
    assert_eq!(f.meta.list_clusters().unwrap().len(), 1);
    let suggestions_before = f.meta.pending_suggestions().unwrap().len();

    // Another full turn over the same data changes nothing downstream
    turn(&mut f).await;
    assert_eq!(f.meta.list_clusters().unwrap().len(), 1);
    assert_eq!(f.meta.pending_suggestions().unwrap().len(), suggestions_before);
}
