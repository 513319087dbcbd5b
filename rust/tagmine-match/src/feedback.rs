//! Feedback learner
//!
//! Consumes operator decisions. Approved and Rejected run through the
//! metadata store's atomic feedback transaction; the `patterns.updated`
//! event is built from the committed outcome and published by the caller
//! AFTER the commit, so a crash in between loses only the notification.
//! Deferred is a no-op beyond logging: the suggestion stays pending.

use chrono::Utc;
use std::sync::Arc;
use tagmine_config::FeedbackConfig;
use tagmine_core::{
    ConfidenceChange, FeedbackAction, FeedbackEvent, PatternUpdatedEvent, TagmineResult,
};
use tagmine_store::MetadataStore;

pub struct FeedbackLearner {
    meta: Arc<MetadataStore>,
    config: FeedbackConfig,
}

impl FeedbackLearner {
    pub fn new(meta: Arc<MetadataStore>, config: FeedbackConfig) -> Self {
        Self { meta, config }
    }

    /// Apply one decision. Returns the update event to publish, or None
    /// for deferrals.
    pub fn handle(&self, event: &FeedbackEvent) -> TagmineResult<Option<PatternUpdatedEvent>> {
        if event.action == FeedbackAction::Deferred {
            tracing::info!(
                suggestion = %event.suggestion_id,
                user = event.user_id.as_deref().unwrap_or("unknown"),
                "suggestion deferred"
            );
            return Ok(None);
        }

        let outcome = self.meta.apply_feedback(
            event,
            self.config.delta_up,
            self.config.delta_down,
            self.config.confidence_floor,
        )?;

        let kind = match event.action {
            FeedbackAction::Approved => ConfidenceChange::IncreasedConfidence,
            FeedbackAction::Rejected => ConfidenceChange::DecreasedConfidence,
            FeedbackAction::Deferred => unreachable!("handled above"),
        };
        tracing::info!(
            suggestion = %event.suggestion_id,
            pattern = %outcome.pattern_id,
            old = outcome.old_confidence,
            new = outcome.new_confidence,
            action = ?event.action,
            "feedback applied"
        );

        Ok(Some(PatternUpdatedEvent {
            pattern_id: outcome.pattern_id,
            kind,
            old_confidence: outcome.old_confidence,
            new_confidence: outcome.new_confidence,
            example_count: outcome.example_count,
            produced_at: Utc::now(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use tagmine_core::{
        ClusterId, Pattern, PatternId, PointId, Suggestion, SuggestionId, SuggestionStatus,
    };

    fn fixture() -> (FeedbackLearner, Arc<MetadataStore>, Suggestion, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let meta = Arc::new(MetadataStore::open(dir.path()).unwrap());
        let pattern = Pattern {
            id: PatternId::new(),
            name: "Air Handling Unit".to_string(),
            description: None,
            confidence: 0.75,
            active: true,
            system_defined: true,
            roles: vec![],
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        meta.save_pattern(&pattern).unwrap();

        let mut role_assignments = BTreeMap::new();
        for role in ["Supply Air Temperature", "Return Air Temperature", "Supply Fan Status"] {
            role_assignments.insert(PointId::new(), role.to_string());
        }
        let suggestion = Suggestion {
            id: SuggestionId::new(),
            cluster_id: ClusterId::new(),
            pattern_id: pattern.id,
            pattern_name: pattern.name.clone(),
            overall: 0.8,
            naming_score: 1.0,
            correlation_score: 0.88,
            range_score: 0.5,
            rate_score: 0.5,
            matched_points: role_assignments.keys().copied().collect(),
            role_assignments,
            evidence: vec![],
            status: SuggestionStatus::Pending,
            rejection_reason: None,
            created_at: Utc::now(),
            decided_at: None,
        };
        meta.save_suggestion(&suggestion).unwrap();

        let learner = FeedbackLearner::new(meta.clone(), FeedbackConfig::default());
        (learner, meta, suggestion, dir)
    }

    fn event(suggestion: &Suggestion, action: FeedbackAction, reason: Option<&str>) -> FeedbackEvent {
        FeedbackEvent {
            suggestion_id: suggestion.id,
            action,
            user_id: Some("operator-3".to_string()),
            reason: reason.map(str::to_string),
            confidence_at_action: 0.75,
        }
    }

    #[test]
    fn test_approval_event_shape() {
        let (learner, meta, suggestion, _dir) = fixture();
        let update = learner
            .handle(&event(&suggestion, FeedbackAction::Approved, None))
            .unwrap()
            .expect("approval produces an update event");

        assert_eq!(update.kind, ConfidenceChange::IncreasedConfidence);
        assert!((update.old_confidence - 0.75).abs() < 1e-12);
        assert!((update.new_confidence - 0.80).abs() < 1e-12);
        assert_eq!(update.example_count, 1);
        assert_eq!(meta.binding_count(), 3);
    }

    #[test]
    fn test_rejection_event_shape() {
        let (learner, meta, suggestion, _dir) = fixture();
        let update = learner
            .handle(&event(&suggestion, FeedbackAction::Rejected, Some("wrong assignment")))
            .unwrap()
            .expect("rejection produces an update event");

        assert_eq!(update.kind, ConfidenceChange::DecreasedConfidence);
        assert!((update.new_confidence - 0.65).abs() < 1e-12);
        assert_eq!(meta.binding_count(), 0);
        let stored = meta.get_suggestion(&suggestion.id).unwrap().unwrap();
        assert_eq!(stored.status, SuggestionStatus::Rejected);
        assert_eq!(stored.rejection_reason.as_deref(), Some("wrong assignment"));
    }

    #[test]
    fn test_deferral_is_noop() {
        let (learner, meta, suggestion, _dir) = fixture();
        let update = learner
            .handle(&event(&suggestion, FeedbackAction::Deferred, None))
            .unwrap();
        assert!(update.is_none());
        // The suggestion stays pending and can still be decided later
        let stored = meta.get_suggestion(&suggestion.id).unwrap().unwrap();
        assert_eq!(stored.status, SuggestionStatus::Pending);
        let late = learner
            .handle(&event(&suggestion, FeedbackAction::Approved, None))
            .unwrap();
        assert!(late.is_some());
    }

    #[test]
    fn test_double_decision_errors() {
        let (learner, _meta, suggestion, _dir) = fixture();
        learner
            .handle(&event(&suggestion, FeedbackAction::Approved, None))
            .unwrap();
        assert!(learner
            .handle(&event(&suggestion, FeedbackAction::Rejected, None))
            .is_err());
    }
}
