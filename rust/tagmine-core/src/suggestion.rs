//! Suggestions, bindings and operator feedback

use crate::error::{TagmineError, TagmineResult};
use crate::ids::{ClusterId, PatternId, PointId, SuggestionId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};

/// Lifecycle of a suggestion: pending moves to exactly one terminal state
/// and never back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SuggestionStatus {
    Pending,
    Applied,
    Rejected,
    Deferred,
    Expired,
}

impl SuggestionStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, SuggestionStatus::Pending)
    }

    pub fn can_transition_to(&self, next: SuggestionStatus) -> bool {
        matches!(self, SuggestionStatus::Pending) && next.is_terminal()
    }
}

/// A scored proposal to bind a cluster to a pattern
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Suggestion {
    pub id: SuggestionId,
    pub cluster_id: ClusterId,
    pub pattern_id: PatternId,
    pub pattern_name: String,
    pub overall: f64,
    pub naming_score: f64,
    pub correlation_score: f64,
    pub range_score: f64,
    pub rate_score: f64,
    pub matched_points: Vec<PointId>,
    /// point -> role name; injective in both directions
    pub role_assignments: BTreeMap<PointId, String>,
    pub evidence: Vec<String>,
    pub status: SuggestionStatus,
    pub rejection_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub decided_at: Option<DateTime<Utc>>,
}

impl Suggestion {
    /// Each point carries at most one role and each role at most one point
    pub fn validate_assignments(&self) -> TagmineResult<()> {
        let mut roles = HashSet::new();
        for role in self.role_assignments.values() {
            if !roles.insert(role.as_str()) {
                return Err(TagmineError::ContractViolation(format!(
                    "suggestion {} assigns role {} to more than one point",
                    self.id, role
                )));
            }
        }
        Ok(())
    }

    /// Attempt a status transition, enforcing monotonicity
    pub fn transition(&mut self, next: SuggestionStatus) -> TagmineResult<()> {
        if !self.status.can_transition_to(next) {
            return Err(TagmineError::InvalidTransition {
                from: format!("{:?}", self.status),
                to: format!("{:?}", next),
            });
        }
        self.status = next;
        self.decided_at = Some(Utc::now());
        Ok(())
    }
}

/// Confirmed (point, pattern, role) link; unique by (point, pattern)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatternBinding {
    pub point_id: PointId,
    pub pattern_id: PatternId,
    pub role_name: String,
    pub bound_at: DateTime<Utc>,
}

/// Operator decision on a suggestion
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FeedbackAction {
    Approved,
    Rejected,
    Deferred,
}

/// Append-only record of one feedback decision
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedbackRecord {
    pub suggestion_id: SuggestionId,
    pub pattern_id: PatternId,
    pub action: FeedbackAction,
    pub user_id: Option<String>,
    pub reason: Option<String>,
    /// Pattern confidence at the moment the decision was taken
    pub confidence_at_action: f64,
    pub recorded_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    fn suggestion() -> Suggestion {
        Suggestion {
            id: SuggestionId::new(),
            cluster_id: ClusterId::new(),
            pattern_id: PatternId::new(),
            pattern_name: "Air Handling Unit".to_string(),
            overall: 0.8,
            naming_score: 0.9,
            correlation_score: 0.85,
            range_score: 0.7,
            rate_score: 0.6,
            matched_points: vec![],
            role_assignments: BTreeMap::new(),
            evidence: vec![],
            status: SuggestionStatus::Pending,
            rejection_reason: None,
            created_at: Utc::now(),
            decided_at: None,
        }
    }

    #[test_case(SuggestionStatus::Applied)]
    #[test_case(SuggestionStatus::Rejected)]
    #[test_case(SuggestionStatus::Deferred)]
    #[test_case(SuggestionStatus::Expired)]
    fn test_pending_to_terminal_allowed(next: SuggestionStatus) {
        let mut s = suggestion();
        assert!(s.transition(next).is_ok());
        assert_eq!(s.status, next);
        assert!(s.decided_at.is_some());
    }

    #[test]
    fn test_terminal_states_are_final() {
        let mut s = suggestion();
        s.transition(SuggestionStatus::Applied).unwrap();
        assert!(s.transition(SuggestionStatus::Rejected).is_err());
        assert!(s.transition(SuggestionStatus::Pending).is_err());
    }

    #[test]
    fn test_duplicate_role_assignment_rejected() {
        let mut s = suggestion();
        s.role_assignments
            .insert(PointId::new(), "Supply Fan Status".to_string());
        s.role_assignments
            .insert(PointId::new(), "Supply Fan Status".to_string());
        assert!(s.validate_assignments().is_err());
    }

    #[test]
    fn test_injective_assignment_accepted() {
        let mut s = suggestion();
        s.role_assignments.insert(PointId::new(), "A".to_string());
        s.role_assignments.insert(PointId::new(), "B".to_string());
        assert!(s.validate_assignments().is_ok());
    }
}
