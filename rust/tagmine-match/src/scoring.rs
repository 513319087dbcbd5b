//! Role scoring and greedy assignment
//!
//! Per (point, role) three factor scores:
//! - naming: 1.0 on a regex hit over name + address + description, else a
//!   partial keyword score (token fraction x 0.6), 0.5 when the role has
//!   no naming rules at all;
//! - range: closeness of the observed span to the typical span, halved
//!   when observations escape a widened envelope, with a unit bonus;
//! - rate: closeness of the observed to the typical update interval.
//!
//! The total is the mean of the factors that could be computed. Assignment
//! is greedy on the total, one role per point and one point per role.

use regex::RegexBuilder;
use tagmine_core::{PatternRole, Point, PointBehavior};

/// What the matcher knows about one cluster member
#[derive(Debug, Clone)]
pub struct RolePointView<'a> {
    pub point: &'a Point,
    pub behavior: Option<&'a PointBehavior>,
}

#[derive(Debug, Clone, Copy)]
pub struct RoleScore {
    pub naming: f64,
    pub range: Option<f64>,
    pub rate: Option<f64>,
    pub total: f64,
}

pub fn score_role(view: &RolePointView<'_>, role: &PatternRole) -> RoleScore {
    let naming = naming_score(view.point, role);
    let range = range_score(view, role);
    let rate = rate_score(view.behavior, role);

    let mut sum = naming;
    let mut n = 1.0;
    if let Some(range) = range {
        sum += range;
        n += 1.0;
    }
    if let Some(rate) = rate {
        sum += rate;
        n += 1.0;
    }
    RoleScore {
        naming,
        range,
        rate,
        total: sum / n,
    }
}

fn naming_score(point: &Point, role: &PatternRole) -> f64 {
    if role.name_patterns.is_empty() {
        return 0.5;
    }
    let text = point.search_text();
    for pattern in &role.name_patterns {
        match RegexBuilder::new(pattern).case_insensitive(true).build() {
            Ok(regex) => {
                if regex.is_match(&text) {
                    return 1.0;
                }
            }
            Err(e) => {
                tracing::warn!(role = %role.name, pattern, error = %e, "bad role regex, skipping");
            }
        }
    }

    // Partial credit: fraction of role-name tokens present in the text
    let text_lower = text.to_lowercase();
    let tokens: Vec<&str> = role.name.split_whitespace().collect();
    if tokens.is_empty() {
        return 0.0;
    }
    let hits = tokens
        .iter()
        .filter(|token| text_lower.contains(&token.to_lowercase()))
        .count();
    hits as f64 / tokens.len() as f64 * 0.6
}

fn range_score(view: &RolePointView<'_>, role: &PatternRole) -> Option<f64> {
    let behavior = view.behavior?;
    let (typical_min, typical_max) = (role.typical_min?, role.typical_max?);
    let typical_range = role.typical_range()?;
    let actual_range = behavior.observed_range();

    let mut score = 1.0 - (1.0 - actual_range / typical_range).abs().min(1.0);

    // Observations escaping the widened envelope halve the score
    let envelope_min = typical_min * 0.5;
    let envelope_max = typical_max * 2.0;
    if behavior.min < envelope_min || behavior.max > envelope_max {
        score *= 0.5;
    }

    if units_equal(view.point.unit.as_deref(), role.typical_unit.as_deref()) {
        score += 0.2;
    }
    Some(score.min(1.0))
}

fn units_equal(a: Option<&str>, b: Option<&str>) -> bool {
    match (a, b) {
        (Some(a), Some(b)) => normalize_unit(a) == normalize_unit(b),
        _ => false,
    }
}

fn normalize_unit(unit: &str) -> String {
    unit.trim()
        .to_lowercase()
        .replace(['°', ' '], "")
        .replace("deg", "")
}

fn rate_score(behavior: Option<&PointBehavior>, role: &PatternRole) -> Option<f64> {
    let behavior = behavior?;
    let typical = role.typical_update_ms?;
    if typical <= 0.0 || behavior.median_interval_ms <= 0.0 {
        return None;
    }
    let actual = behavior.median_interval_ms;
    Some(1.0 - ((1.0 - actual / typical).abs() / 5.0).min(1.0))
}

/// Greedy one-to-one assignment: repeatedly take the highest-scoring
/// (point, role) pair with both sides unassigned, subject to the floor.
/// Returns (point index, role index, score) triples.
pub fn assign_roles(
    scores: &[Vec<RoleScore>],
    min_role_score: f64,
) -> Vec<(usize, usize, RoleScore)> {
    let mut candidates: Vec<(usize, usize, RoleScore)> = Vec::new();
    for (point_idx, row) in scores.iter().enumerate() {
        for (role_idx, score) in row.iter().enumerate() {
            if score.total >= min_role_score {
                candidates.push((point_idx, role_idx, *score));
            }
        }
    }
    // Deterministic order: best total first, then stable by indexes
    candidates.sort_by(|a, b| {
        b.2.total
            .total_cmp(&a.2.total)
            .then(a.0.cmp(&b.0))
            .then(a.1.cmp(&b.1))
    });

    let mut point_taken = vec![false; scores.len()];
    let mut role_taken = vec![false; scores.first().map_or(0, Vec::len)];
    let mut assigned = Vec::new();
    for (point_idx, role_idx, score) in candidates {
        if point_taken[point_idx] || role_taken[role_idx] {
            continue;
        }
        point_taken[point_idx] = true;
        role_taken[role_idx] = true;
        assigned.push((point_idx, role_idx, score));
    }
    assigned
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use tagmine_core::{PointId, ValueKind};

    fn point(name: &str, unit: Option<&str>) -> Point {
        Point {
            id: PointId::new(),
            sequence_id: 1,
            name: name.to_string(),
            address: format!("src/{}", name),
            description: None,
            unit: unit.map(str::to_string),
            value_kind: ValueKind::Float64,
            data_source_id: None,
            created_at: Utc::now(),
            deleted: false,
        }
    }

    fn behavior(min: f64, max: f64, interval_ms: f64) -> PointBehavior {
        PointBehavior {
            point_id: PointId::new(),
            sequence_id: 1,
            sample_count: 500,
            window_start: Utc::now(),
            window_end: Utc::now(),
            mean: (min + max) / 2.0,
            stddev: (max - min) / 4.0,
            min,
            max,
            median_interval_ms: interval_ms,
            p95_interval_ms: interval_ms * 1.5,
            zero_count: 0,
            good_quality_ratio: 1.0,
            change_frequency: 0.9,
        }
    }

    fn role(name: &str, patterns: &[&str]) -> PatternRole {
        PatternRole {
            name: name.to_string(),
            name_patterns: patterns.iter().map(|p| p.to_string()).collect(),
            typical_unit: None,
            typical_min: None,
            typical_max: None,
            typical_update_ms: None,
            required: false,
            sort_order: 0,
        }
    }

    #[test]
    fn test_naming_regex_hit_scores_one() {
        let p = point("hvac.ahu1.sat", None);
        let r = role("Supply Air Temperature", &["sat"]);
        let score = score_role(&RolePointView { point: &p, behavior: None }, &r);
        assert!((score.naming - 1.0).abs() < f64::EPSILON);
        assert!((score.total - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_naming_regex_case_insensitive() {
        let p = point("HVAC.AHU1.SAT", None);
        let r = role("Supply Air Temperature", &["sat"]);
        let score = score_role(&RolePointView { point: &p, behavior: None }, &r);
        assert!((score.naming - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_naming_partial_keyword_credit() {
        let p = point("chiller.supply.temperature", None);
        let r = role("Supply Water Temperature", &["nomatch123"]);
        let score = score_role(&RolePointView { point: &p, behavior: None }, &r);
        // 2 of 3 tokens present, x 0.6
        assert!((score.naming - 2.0 / 3.0 * 0.6).abs() < 1e-12);
    }

    #[test]
    fn test_naming_without_rules_is_neutral() {
        let p = point("anything", None);
        let r = role("Mystery Role", &[]);
        let score = score_role(&RolePointView { point: &p, behavior: None }, &r);
        assert!((score.naming - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn test_range_score_close_match_with_unit_bonus() {
        let p = point("sat", Some("degC"));
        let b = behavior(10.0, 20.0, 1000.0);
        let mut r = role("Supply Air Temperature", &["sat"]);
        r.typical_min = Some(10.0);
        r.typical_max = Some(20.0);
        r.typical_unit = Some("°C".to_string());
        let score = score_role(&RolePointView { point: &p, behavior: Some(&b) }, &r);
        // Perfect span match (1.0) + 0.2 bonus, capped at 1.0
        assert_eq!(score.range, Some(1.0));
    }

    #[test]
    fn test_range_score_halved_outside_envelope() {
        let p = point("sat", None);
        // Observed max 50 escapes 2 x typical_max = 40
        let b = behavior(10.0, 50.0, 1000.0);
        let mut r = role("Supply Air Temperature", &["sat"]);
        r.typical_min = Some(10.0);
        r.typical_max = Some(20.0);
        let score = score_role(&RolePointView { point: &p, behavior: Some(&b) }, &r);
        // actual_range 40 vs typical 10: base 1 - min(1, |1 - 4|) = 0, halved
        assert_eq!(score.range, Some(0.0));

        let b2 = behavior(8.0, 44.0, 1000.0);
        let score2 = score_role(&RolePointView { point: &p, behavior: Some(&b2) }, &r);
        let expected = (1.0 - (1.0f64 - 3.6).abs().min(1.0)) * 0.5;
        assert!((score2.range.unwrap() - expected).abs() < 1e-12);
    }

    #[test]
    fn test_rate_score() {
        let p = point("sat", None);
        let b = behavior(10.0, 20.0, 2000.0);
        let mut r = role("Supply Air Temperature", &["sat"]);
        r.typical_update_ms = Some(1000.0);
        let score = score_role(&RolePointView { point: &p, behavior: Some(&b) }, &r);
        // |1 - 2| / 5 = 0.2 -> 0.8
        assert!((score.rate.unwrap() - 0.8).abs() < 1e-12);
    }

    #[test]
    fn test_total_is_mean_of_available_factors() {
        let p = point("sat", None);
        let b = behavior(10.0, 20.0, 1000.0);
        let mut r = role("Supply Air Temperature", &["sat"]);
        r.typical_min = Some(10.0);
        r.typical_max = Some(20.0);
        r.typical_update_ms = Some(1000.0);
        let score = score_role(&RolePointView { point: &p, behavior: Some(&b) }, &r);
        let expected = (score.naming + score.range.unwrap() + score.rate.unwrap()) / 3.0;
        assert!((score.total - expected).abs() < 1e-12);
    }

    #[test]
    fn test_greedy_assignment_argmax_per_column() {
        // Star-shaped matrix with a unique maximum per column
        let s = |total: f64| RoleScore {
            naming: total,
            range: None,
            rate: None,
            total,
        };
        let scores = vec![
            vec![s(0.9), s(0.4), s(0.3)],
            vec![s(0.5), s(0.8), s(0.2)],
            vec![s(0.4), s(0.3), s(0.7)],
        ];
        let assigned = assign_roles(&scores, 0.3);
        let mut pairs: Vec<(usize, usize)> =
            assigned.iter().map(|(p, r, _)| (*p, *r)).collect();
        pairs.sort();
        assert_eq!(pairs, vec![(0, 0), (1, 1), (2, 2)]);
    }

    #[test]
    fn test_assignment_respects_floor() {
        let s = |total: f64| RoleScore {
            naming: total,
            range: None,
            rate: None,
            total,
        };
        let scores = vec![vec![s(0.29)], vec![s(0.31)]];
        let assigned = assign_roles(&scores, 0.3);
        assert_eq!(assigned.len(), 1);
        assert_eq!(assigned[0].0, 1);
    }

    #[test]
    fn test_assignment_is_injective() {
        let s = |total: f64| RoleScore {
            naming: total,
            range: None,
            rate: None,
            total,
        };
        // Both points prefer role 0; the loser takes role 1
        let scores = vec![vec![s(0.9), s(0.5)], vec![s(0.8), s(0.6)]];
        let assigned = assign_roles(&scores, 0.3);
        assert_eq!(assigned.len(), 2);
        let roles: Vec<usize> = assigned.iter().map(|(_, r, _)| *r).collect();
        assert!(roles.contains(&0) && roles.contains(&1));
        // Point 0 won the contested role
        assert!(assigned.iter().any(|&(p, r, _)| p == 0 && r == 0));
    }
}
