//! Pattern matcher
//!
//! For each detected cluster: load member metadata and cached behaviors,
//! score every active pattern's roles against the members, assign roles
//! greedily, combine factor scores into an overall confidence and emit the
//! top suggestions. Patterns missing a required role are skipped outright.

use crate::scoring::{assign_roles, score_role, RolePointView, RoleScore};
use chrono::Utc;
use std::collections::BTreeMap;
use std::sync::Arc;
use tagmine_config::MatchingConfig;
use tagmine_core::{
    ClusterCreatedEvent, Pattern, Point, PointBehavior, Suggestion, SuggestionId,
    SuggestionStatus, TagmineResult,
};
use tagmine_store::{BehaviorCache, MetadataStore};

/// Neutral factor value when no member carried the data to score it
const NEUTRAL_FACTOR: f64 = 0.5;

pub struct PatternMatcher {
    meta: Arc<MetadataStore>,
    behavior_cache: Arc<BehaviorCache>,
    config: MatchingConfig,
}

impl PatternMatcher {
    pub fn new(
        meta: Arc<MetadataStore>,
        behavior_cache: Arc<BehaviorCache>,
        config: MatchingConfig,
    ) -> Self {
        Self {
            meta,
            behavior_cache,
            config,
        }
    }

    /// Evaluate one cluster against the active pattern library. Emitted
    /// suggestions are persisted as pending and returned best-first.
    pub fn evaluate_cluster(&self, event: &ClusterCreatedEvent) -> TagmineResult<Vec<Suggestion>> {
        let mut points: Vec<Point> = Vec::with_capacity(event.point_ids.len());
        for point_id in &event.point_ids {
            match self.meta.get_point(point_id)? {
                Some(point) if !point.deleted => points.push(point),
                _ => {
                    tracing::debug!(point = %point_id, "cluster member unknown or deleted, skipping");
                }
            }
        }
        if points.is_empty() {
            return Ok(Vec::new());
        }

        let behaviors: Vec<Option<PointBehavior>> = points
            .iter()
            .map(|p| self.behavior_cache.get(&p.id))
            .collect();
        let views: Vec<RolePointView<'_>> = points
            .iter()
            .zip(behaviors.iter())
            .map(|(point, behavior)| RolePointView {
                point,
                behavior: behavior.as_ref(),
            })
            .collect();

        let mut suggestions = Vec::new();
        for pattern in self.meta.list_active_patterns()? {
            if let Some(suggestion) = self.match_pattern(event, &views, &pattern) {
                suggestions.push(suggestion);
            }
        }

        suggestions.sort_by(|a, b| b.overall.total_cmp(&a.overall));
        suggestions.truncate(self.config.max_per_cluster);
        for suggestion in &suggestions {
            self.meta.save_suggestion(suggestion)?;
        }
        Ok(suggestions)
    }

    fn match_pattern(
        &self,
        event: &ClusterCreatedEvent,
        views: &[RolePointView<'_>],
        pattern: &Pattern,
    ) -> Option<Suggestion> {
        if pattern.roles.is_empty() {
            return None;
        }

        let scores: Vec<Vec<RoleScore>> = views
            .iter()
            .map(|view| {
                pattern
                    .roles
                    .iter()
                    .map(|role| score_role(view, role))
                    .collect()
            })
            .collect();
        let assigned = assign_roles(&scores, self.config.min_role_score);
        if assigned.is_empty() {
            return None;
        }

        // A pattern whose required roles did not all land is not a match
        let assigned_roles: Vec<&str> = assigned
            .iter()
            .map(|&(_, role_idx, _)| pattern.roles[role_idx].name.as_str())
            .collect();
        if pattern
            .required_roles()
            .any(|role| !assigned_roles.contains(&role.name.as_str()))
        {
            return None;
        }

        let naming_score = mean(assigned.iter().map(|(_, _, s)| s.naming));
        let range_mean = mean_opt(assigned.iter().filter_map(|(_, _, s)| s.range));
        let rate_mean = mean_opt(assigned.iter().filter_map(|(_, _, s)| s.rate));
        let correlation_score = event.cohesion;
        let role_match_ratio = assigned.len() as f64 / pattern.roles.len() as f64;

        // Factors nobody could compute (no typical range/rate declared, or
        // no cached behavior) drop out of the weighting instead of dragging
        // the product down
        let mut weighted = self.config.w_naming * naming_score
            + self.config.w_correlation * correlation_score;
        let mut weight_sum = self.config.w_naming + self.config.w_correlation;
        if let Some(range) = range_mean {
            weighted += self.config.w_range * range;
            weight_sum += self.config.w_range;
        }
        if let Some(rate) = rate_mean {
            weighted += self.config.w_rate * rate;
            weight_sum += self.config.w_rate;
        }
        let combined = if weight_sum > 0.0 {
            weighted / weight_sum
        } else {
            0.0
        };
        let overall = combined * (0.5 + 0.5 * role_match_ratio) * pattern.confidence;
        let range_score = range_mean.unwrap_or(NEUTRAL_FACTOR);
        let rate_score = rate_mean.unwrap_or(NEUTRAL_FACTOR);
        if overall < self.config.min_overall {
            return None;
        }

        let mut role_assignments = BTreeMap::new();
        let mut matched_points = Vec::with_capacity(assigned.len());
        let mut evidence = Vec::with_capacity(assigned.len() + 1);
        for &(point_idx, role_idx, score) in &assigned {
            let point = views[point_idx].point;
            let role = &pattern.roles[role_idx];
            role_assignments.insert(point.id, role.name.clone());
            matched_points.push(point.id);
            evidence.push(format!(
                "{} -> {} (naming {:.2}, total {:.2})",
                point.name, role.name, score.naming, score.total
            ));
        }
        evidence.push(format!(
            "cluster cohesion {:.2} over {} members",
            event.cohesion,
            views.len()
        ));

        Some(Suggestion {
            id: SuggestionId::new(),
            cluster_id: event.cluster_id,
            pattern_id: pattern.id,
            pattern_name: pattern.name.clone(),
            overall,
            naming_score,
            correlation_score,
            range_score,
            rate_score,
            matched_points,
            role_assignments,
            evidence,
            status: SuggestionStatus::Pending,
            rejection_reason: None,
            created_at: Utc::now(),
            decided_at: None,
        })
    }
}

fn mean(values: impl Iterator<Item = f64>) -> f64 {
    mean_opt(values).unwrap_or(0.0)
}

fn mean_opt(values: impl Iterator<Item = f64>) -> Option<f64> {
    let mut sum = 0.0;
    let mut n = 0u64;
    for v in values {
        sum += v;
        n += 1;
    }
    if n == 0 {
        None
    } else {
        Some(sum / n as f64)
    }
}
