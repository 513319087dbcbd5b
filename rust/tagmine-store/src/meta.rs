//! Metadata store
//!
//! Long-lived entities in sled trees: points (with the monotone sequence-id
//! counter and address/sequence indexes), data sources, patterns,
//! suggestions, bindings, clusters, the append-only feedback log and the
//! durable correlation rows.
//!
//! Feedback application is the one multi-tree transaction in the system:
//! status check, confidence delta, log append, suggestion transition and
//! binding upserts commit together or not at all.

use chrono::Utc;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use sled::transaction::{ConflictableTransactionError, TransactionError};
use sled::Transactional;
use std::path::Path;
use tagmine_core::{
    Cluster, ClusterId, DataSource, DataSourceId, FeedbackAction, FeedbackEvent, FeedbackRecord,
    PairCorrelation, PairKey, Pattern, PatternBinding, PatternId, Point, PointId, Suggestion,
    SuggestionId, SuggestionStatus, TagmineError, TagmineResult, ValueKind,
};

fn storage(e: sled::Error) -> TagmineError {
    TagmineError::Storage(e.to_string())
}

fn encode<T: Serialize>(value: &T) -> TagmineResult<Vec<u8>> {
    serde_json::to_vec(value).map_err(|e| TagmineError::Storage(format!("encode failed: {}", e)))
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> TagmineResult<T> {
    serde_json::from_slice(bytes).map_err(|e| TagmineError::Storage(format!("decode failed: {}", e)))
}

fn binding_key(point_id: &PointId, pattern_id: &PatternId) -> [u8; 32] {
    let mut key = [0u8; 32];
    key[..16].copy_from_slice(point_id.as_bytes());
    key[16..].copy_from_slice(pattern_id.as_bytes());
    key
}

/// Input to point registration; the store assigns id and sequence id
#[derive(Debug, Clone)]
pub struct NewPoint {
    pub name: String,
    pub address: String,
    pub description: Option<String>,
    pub unit: Option<String>,
    pub value_kind: ValueKind,
    pub data_source_id: Option<DataSourceId>,
}

/// Result of an applied feedback transaction, used to build the
/// `patterns.updated` event after commit
#[derive(Debug, Clone)]
pub struct FeedbackOutcome {
    pub pattern_id: PatternId,
    pub old_confidence: f64,
    pub new_confidence: f64,
    pub example_count: u64,
    pub suggestion: Suggestion,
}

pub struct MetadataStore {
    points: sled::Tree,
    points_by_address: sled::Tree,
    points_by_seq: sled::Tree,
    points_by_source: sled::Tree,
    data_sources: sled::Tree,
    patterns: sled::Tree,
    suggestions: sled::Tree,
    bindings: sled::Tree,
    feedback_log: sled::Tree,
    clusters: sled::Tree,
    clusters_by_members: sled::Tree,
    correlations: sled::Tree,
    meta: sled::Tree,
    /// Serializes registration so a sequence id is assigned exactly once
    register_lock: Mutex<()>,
}

impl MetadataStore {
    pub fn open<P: AsRef<Path>>(path: P) -> TagmineResult<Self> {
        let db = sled::open(path).map_err(storage)?;
        Self::with_db(&db)
    }

    /// Open inside an existing sled database (shared data dir)
    pub fn with_db(db: &sled::Db) -> TagmineResult<Self> {
        let open = |name: &str| db.open_tree(name).map_err(storage);
        Ok(Self {
            points: open("points")?,
            points_by_address: open("points_by_address")?,
            points_by_seq: open("points_by_seq")?,
            points_by_source: open("points_by_source")?,
            data_sources: open("data_sources")?,
            patterns: open("patterns")?,
            suggestions: open("pattern_suggestions")?,
            bindings: open("point_pattern_bindings")?,
            feedback_log: open("pattern_feedback_log")?,
            clusters: open("behavioral_clusters")?,
            clusters_by_members: open("clusters_by_members")?,
            correlations: open("correlation_cache")?,
            meta: open("meta")?,
            register_lock: Mutex::new(()),
        })
    }

    // ---- points ------------------------------------------------------

    /// Register a point, assigning its sequence id exactly once. If the
    /// address is already registered the existing point is returned, which
    /// makes repeated discovery idempotent.
    pub fn register_point(&self, new: NewPoint) -> TagmineResult<Point> {
        if new.address.is_empty() {
            return Err(TagmineError::ContractViolation(
                "point address must not be empty".to_string(),
            ));
        }
        let _guard = self.register_lock.lock();

        if let Some(existing) = self.point_by_address(&new.address)? {
            return Ok(existing);
        }

        let sequence_id = self.next_sequence_id()?;
        let point = Point {
            id: PointId::new(),
            sequence_id,
            name: new.name,
            address: new.address,
            description: new.description,
            unit: new.unit,
            value_kind: new.value_kind,
            data_source_id: new.data_source_id,
            created_at: Utc::now(),
            deleted: false,
        };

        self.points
            .insert(point.id.as_bytes(), encode(&point)?)
            .map_err(storage)?;
        self.points_by_address
            .insert(point.address.as_bytes(), &point.id.as_bytes()[..])
            .map_err(storage)?;
        self.points_by_seq
            .insert(point.sequence_id.to_be_bytes(), &point.id.as_bytes()[..])
            .map_err(storage)?;
        if let Some(ds) = point.data_source_id {
            let mut key = [0u8; 32];
            key[..16].copy_from_slice(ds.as_bytes());
            key[16..].copy_from_slice(point.id.as_bytes());
            self.points_by_source.insert(key, &[][..]).map_err(storage)?;
        }
        Ok(point)
    }

    fn next_sequence_id(&self) -> TagmineResult<u32> {
        let current = self
            .meta
            .get("next_sequence_id")
            .map_err(storage)?
            .map(|v| {
                let mut bytes = [0u8; 4];
                bytes.copy_from_slice(&v[..4]);
                u32::from_be_bytes(bytes)
            })
            .unwrap_or(1);
        self.meta
            .insert("next_sequence_id", &(current + 1).to_be_bytes())
            .map_err(storage)?;
        Ok(current)
    }

    pub fn get_point(&self, id: &PointId) -> TagmineResult<Option<Point>> {
        self.points
            .get(id.as_bytes())
            .map_err(storage)?
            .map(|v| decode(&v))
            .transpose()
    }

    pub fn point_by_address(&self, address: &str) -> TagmineResult<Option<Point>> {
        let Some(id) = self.points_by_address.get(address.as_bytes()).map_err(storage)? else {
            return Ok(None);
        };
        self.points.get(&id).map_err(storage)?.map(|v| decode(&v)).transpose()
    }

    pub fn point_by_sequence(&self, sequence_id: u32) -> TagmineResult<Option<Point>> {
        let Some(id) = self
            .points_by_seq
            .get(sequence_id.to_be_bytes())
            .map_err(storage)?
        else {
            return Ok(None);
        };
        self.points.get(&id).map_err(storage)?.map(|v| decode(&v)).transpose()
    }

    /// Live (not soft-deleted) points attached to a data source
    pub fn points_for_data_source(&self, ds: &DataSourceId) -> TagmineResult<Vec<Point>> {
        let mut points = Vec::new();
        for entry in self.points_by_source.scan_prefix(ds.as_bytes()) {
            let (key, _) = entry.map_err(storage)?;
            if let Some(raw) = self.points.get(&key[16..]).map_err(storage)? {
                let point: Point = decode(&raw)?;
                if !point.deleted {
                    points.push(point);
                }
            }
        }
        Ok(points)
    }

    /// Soft delete: the point and its sequence id stay reserved while
    /// historical rows exist
    pub fn soft_delete_point(&self, id: &PointId) -> TagmineResult<()> {
        let mut point = self
            .get_point(id)?
            .ok_or_else(|| TagmineError::NotFound(format!("point {}", id)))?;
        point.deleted = true;
        self.points
            .insert(point.id.as_bytes(), encode(&point)?)
            .map_err(storage)?;
        Ok(())
    }

    pub fn point_count(&self) -> usize {
        self.points.len()
    }

    // ---- data sources ------------------------------------------------

    pub fn save_data_source(&self, source: &DataSource) -> TagmineResult<()> {
        self.data_sources
            .insert(source.id.as_bytes(), encode(source)?)
            .map_err(storage)?;
        Ok(())
    }

    pub fn get_data_source(&self, id: &DataSourceId) -> TagmineResult<Option<DataSource>> {
        self.data_sources
            .get(id.as_bytes())
            .map_err(storage)?
            .map(|v| decode(&v))
            .transpose()
    }

    pub fn list_data_sources(&self) -> TagmineResult<Vec<DataSource>> {
        self.scan_all(&self.data_sources)
    }

    // ---- patterns ----------------------------------------------------

    pub fn save_pattern(&self, pattern: &Pattern) -> TagmineResult<()> {
        pattern.validate()?;
        self.patterns
            .insert(pattern.id.as_bytes(), encode(pattern)?)
            .map_err(storage)?;
        Ok(())
    }

    pub fn get_pattern(&self, id: &PatternId) -> TagmineResult<Option<Pattern>> {
        self.patterns
            .get(id.as_bytes())
            .map_err(storage)?
            .map(|v| decode(&v))
            .transpose()
    }

    pub fn list_patterns(&self) -> TagmineResult<Vec<Pattern>> {
        self.scan_all(&self.patterns)
    }

    pub fn list_active_patterns(&self) -> TagmineResult<Vec<Pattern>> {
        Ok(self
            .list_patterns()?
            .into_iter()
            .filter(|p| p.active)
            .collect())
    }

    pub fn feedback_count(&self, pattern_id: &PatternId) -> TagmineResult<u64> {
        Ok(self
            .meta
            .get(format!("feedback_count/{}", pattern_id))
            .map_err(storage)?
            .map(|v| {
                let mut bytes = [0u8; 8];
                bytes.copy_from_slice(&v[..8]);
                u64::from_be_bytes(bytes)
            })
            .unwrap_or(0))
    }

    // ---- suggestions -------------------------------------------------

    pub fn save_suggestion(&self, suggestion: &Suggestion) -> TagmineResult<()> {
        suggestion.validate_assignments()?;
        self.suggestions
            .insert(suggestion.id.as_bytes(), encode(suggestion)?)
            .map_err(storage)?;
        Ok(())
    }

    pub fn get_suggestion(&self, id: &SuggestionId) -> TagmineResult<Option<Suggestion>> {
        self.suggestions
            .get(id.as_bytes())
            .map_err(storage)?
            .map(|v| decode(&v))
            .transpose()
    }

    pub fn pending_suggestions(&self) -> TagmineResult<Vec<Suggestion>> {
        Ok(self
            .scan_all::<Suggestion>(&self.suggestions)?
            .into_iter()
            .filter(|s| s.status == SuggestionStatus::Pending)
            .collect())
    }

    /// Expiration policy: pending suggestions older than the cutoff move to
    /// the terminal Expired state. Returns how many were expired.
    pub fn expire_pending_before(
        &self,
        cutoff: chrono::DateTime<Utc>,
    ) -> TagmineResult<usize> {
        let mut expired = 0;
        for mut suggestion in self.pending_suggestions()? {
            if suggestion.created_at < cutoff {
                suggestion.transition(SuggestionStatus::Expired)?;
                self.suggestions
                    .insert(suggestion.id.as_bytes(), encode(&suggestion)?)
                    .map_err(storage)?;
                expired += 1;
            }
        }
        Ok(expired)
    }

    // ---- bindings ----------------------------------------------------

    pub fn binding(
        &self,
        point_id: &PointId,
        pattern_id: &PatternId,
    ) -> TagmineResult<Option<PatternBinding>> {
        self.bindings
            .get(binding_key(point_id, pattern_id))
            .map_err(storage)?
            .map(|v| decode(&v))
            .transpose()
    }

    pub fn bindings_for_point(&self, point_id: &PointId) -> TagmineResult<Vec<PatternBinding>> {
        let mut bindings = Vec::new();
        for entry in self.bindings.scan_prefix(point_id.as_bytes()) {
            let (_, value) = entry.map_err(storage)?;
            bindings.push(decode(&value)?);
        }
        Ok(bindings)
    }

    pub fn bindings_for_pattern(
        &self,
        pattern_id: &PatternId,
    ) -> TagmineResult<Vec<PatternBinding>> {
        Ok(self
            .scan_all::<PatternBinding>(&self.bindings)?
            .into_iter()
            .filter(|b| b.pattern_id == *pattern_id)
            .collect())
    }

    pub fn binding_count(&self) -> usize {
        self.bindings.len()
    }

    // ---- clusters ----------------------------------------------------

    pub fn upsert_cluster(&self, cluster: &Cluster) -> TagmineResult<()> {
        self.clusters
            .insert(cluster.id.as_bytes(), encode(cluster)?)
            .map_err(storage)?;
        self.clusters_by_members
            .insert(cluster.member_key().as_bytes(), &cluster.id.as_bytes()[..])
            .map_err(storage)?;
        Ok(())
    }

    pub fn get_cluster(&self, id: &ClusterId) -> TagmineResult<Option<Cluster>> {
        self.clusters
            .get(id.as_bytes())
            .map_err(storage)?
            .map(|v| decode(&v))
            .transpose()
    }

    /// Prior detection of the same member set, if any
    pub fn cluster_for_members(&self, member_key: &str) -> TagmineResult<Option<Cluster>> {
        let Some(id) = self
            .clusters_by_members
            .get(member_key.as_bytes())
            .map_err(storage)?
        else {
            return Ok(None);
        };
        self.clusters.get(&id).map_err(storage)?.map(|v| decode(&v)).transpose()
    }

    pub fn list_clusters(&self) -> TagmineResult<Vec<Cluster>> {
        self.scan_all(&self.clusters)
    }

    // ---- correlations ------------------------------------------------

    /// Canonical (point_a < point_b) upsert; at most one row per pair
    pub fn upsert_correlation(&self, correlation: &PairCorrelation) -> TagmineResult<()> {
        self.correlations
            .insert(correlation.pair.to_bytes(), encode(correlation)?)
            .map_err(storage)?;
        Ok(())
    }

    pub fn get_correlation(&self, pair: &PairKey) -> TagmineResult<Option<PairCorrelation>> {
        self.correlations
            .get(pair.to_bytes())
            .map_err(storage)?
            .map(|v| decode(&v))
            .transpose()
    }

    pub fn list_correlations(&self) -> TagmineResult<Vec<PairCorrelation>> {
        self.scan_all(&self.correlations)
    }

    // ---- feedback ----------------------------------------------------

    pub fn feedback_records(&self) -> TagmineResult<Vec<FeedbackRecord>> {
        self.scan_all(&self.feedback_log)
    }

    /// Apply an Approved or Rejected decision atomically.
    ///
    /// Within one transaction: load and status-check the suggestion, move
    /// the pattern confidence (clamped to [floor, 1.0]), append the
    /// feedback record, transition the suggestion, and on approval upsert
    /// one binding per role assignment (conflict on (point, pattern)
    /// updates the role). The `patterns.updated` event is the caller's
    /// responsibility, published after this commit returns.
    pub fn apply_feedback(
        &self,
        event: &FeedbackEvent,
        delta_up: f64,
        delta_down: f64,
        confidence_floor: f64,
    ) -> TagmineResult<FeedbackOutcome> {
        if event.action == FeedbackAction::Deferred {
            return Err(TagmineError::ContractViolation(
                "deferred feedback is not applied to the store".to_string(),
            ));
        }

        let trees: &[&sled::Tree] = &[
            &self.patterns,
            &self.suggestions,
            &self.feedback_log,
            &self.bindings,
            &self.meta,
        ];
        let result = trees.transaction(|txn| {
            let patterns_t = &txn[0];
            let suggestions_t = &txn[1];
            let feedback_t = &txn[2];
            let bindings_t = &txn[3];
            let meta_t = &txn[4];
            let abort = |e: TagmineError| ConflictableTransactionError::Abort(e);
            let abort_encode =
                |e: serde_json::Error| ConflictableTransactionError::Abort(TagmineError::Storage(e.to_string()));

            let raw = suggestions_t
                .get(event.suggestion_id.as_bytes())?
                .ok_or_else(|| {
                    abort(TagmineError::NotFound(format!(
                        "suggestion {}",
                        event.suggestion_id
                    )))
                })?;
            let mut suggestion: Suggestion =
                serde_json::from_slice(&raw).map_err(abort_encode)?;
            if suggestion.status != SuggestionStatus::Pending {
                return Err(abort(TagmineError::InvalidTransition {
                    from: format!("{:?}", suggestion.status),
                    to: format!("{:?}", event.action),
                }));
            }

            let raw = patterns_t
                .get(suggestion.pattern_id.as_bytes())?
                .ok_or_else(|| {
                    abort(TagmineError::NotFound(format!(
                        "pattern {}",
                        suggestion.pattern_id
                    )))
                })?;
            let mut pattern: Pattern = serde_json::from_slice(&raw).map_err(abort_encode)?;

            let now = Utc::now();
            let old_confidence = pattern.confidence;
            let new_confidence = match event.action {
                FeedbackAction::Approved => old_confidence + delta_up,
                FeedbackAction::Rejected => old_confidence - delta_down,
                FeedbackAction::Deferred => unreachable!("checked above"),
            }
            .clamp(confidence_floor, 1.0);
            pattern.confidence = new_confidence;
            pattern.updated_at = now;

            match event.action {
                FeedbackAction::Approved => {
                    suggestion.status = SuggestionStatus::Applied;
                    for (point_id, role_name) in &suggestion.role_assignments {
                        let binding = PatternBinding {
                            point_id: *point_id,
                            pattern_id: pattern.id,
                            role_name: role_name.clone(),
                            bound_at: now,
                        };
                        bindings_t.insert(
                            &binding_key(point_id, &pattern.id)[..],
                            serde_json::to_vec(&binding).map_err(abort_encode)?,
                        )?;
                    }
                }
                FeedbackAction::Rejected => {
                    suggestion.status = SuggestionStatus::Rejected;
                    suggestion.rejection_reason = event.reason.clone();
                }
                FeedbackAction::Deferred => unreachable!("checked above"),
            }
            suggestion.decided_at = Some(now);

            let record = FeedbackRecord {
                suggestion_id: suggestion.id,
                pattern_id: pattern.id,
                action: event.action,
                user_id: event.user_id.clone(),
                reason: event.reason.clone(),
                confidence_at_action: old_confidence,
                recorded_at: now,
            };
            let record_id = feedback_t.generate_id()?;
            feedback_t.insert(
                &record_id.to_be_bytes(),
                serde_json::to_vec(&record).map_err(abort_encode)?,
            )?;

            let count_key = format!("feedback_count/{}", pattern.id);
            let example_count = meta_t
                .get(count_key.as_bytes())?
                .map(|v| {
                    let mut bytes = [0u8; 8];
                    bytes.copy_from_slice(&v[..8]);
                    u64::from_be_bytes(bytes)
                })
                .unwrap_or(0)
                + 1;
            meta_t.insert(count_key.as_bytes(), &example_count.to_be_bytes())?;

            patterns_t.insert(
                pattern.id.as_bytes(),
                serde_json::to_vec(&pattern).map_err(abort_encode)?,
            )?;
            suggestions_t.insert(
                suggestion.id.as_bytes(),
                serde_json::to_vec(&suggestion).map_err(abort_encode)?,
            )?;

            Ok(FeedbackOutcome {
                pattern_id: pattern.id,
                old_confidence,
                new_confidence,
                example_count,
                suggestion: suggestion.clone(),
            })
        });

        match result {
            Ok(outcome) => Ok(outcome),
            Err(TransactionError::Abort(e)) => Err(e),
            Err(TransactionError::Storage(e)) => Err(storage(e)),
        }
    }

    // ---- shared ------------------------------------------------------

    fn scan_all<T: DeserializeOwned>(&self, tree: &sled::Tree) -> TagmineResult<Vec<T>> {
        let mut items = Vec::new();
        for entry in tree.iter() {
            let (_, value) = entry.map_err(storage)?;
            items.push(decode(&value)?);
        }
        Ok(items)
    }

    pub fn flush(&self) -> TagmineResult<()> {
        self.points.flush().map_err(storage)?;
        self.suggestions.flush().map_err(storage)?;
        self.patterns.flush().map_err(storage)?;
        Ok(())
    }
}
