//! Pairwise correlation engine
//!
//! Triggered by behavior events. Candidate partners share a data source and
//! enough co-sampled overlap; series are aligned by timestamp equality with
//! forward-fill to the coarser grid (bounded staleness), then Pearson r is
//! computed, optionally over a small lag search. Significant pairs land in
//! the correlation cache (canonical order) and in the durable correlation
//! rows, and one `correlations.updated` event summarizes the computation.
//!
//! Failures are per pair: a pair that cannot be computed is skipped and
//! logged; the next behavior event will naturally re-enqueue it.

use crate::ring::SampleRing;
use chrono::{TimeZone, Utc};
use std::sync::Arc;
use tagmine_config::CorrelationConfig;
use tagmine_core::{
    BehaviorEvent, CorrelationsUpdatedEvent, PairCorrelation, PairKey, PointId, TagmineResult,
};
use tagmine_store::{CorrelationCache, MetadataStore};
use uuid::Uuid;

/// One timestamp-aligned observation pair
type AlignedPair = (i64, f64, f64);

pub struct CorrelationEngine {
    ring: Arc<SampleRing>,
    meta: Arc<MetadataStore>,
    cache: Arc<CorrelationCache>,
    config: CorrelationConfig,
}

impl CorrelationEngine {
    pub fn new(
        ring: Arc<SampleRing>,
        meta: Arc<MetadataStore>,
        cache: Arc<CorrelationCache>,
        config: CorrelationConfig,
    ) -> Self {
        Self {
            ring,
            meta,
            cache,
            config,
        }
    }

    /// Correlate the newly-behaved point against its candidate partners.
    /// Returns the update event when at least one pair reached significance.
    pub fn on_behavior(
        &self,
        event: &BehaviorEvent,
    ) -> TagmineResult<Option<CorrelationsUpdatedEvent>> {
        let Some(point) = self.meta.get_point(&event.point_id)? else {
            tracing::debug!(point = %event.point_id, "behavior for unknown point, skipping");
            return Ok(None);
        };
        let Some(data_source_id) = point.data_source_id else {
            return Ok(None);
        };
        let Some(base) = self.ring.series(point.sequence_id) else {
            return Ok(None);
        };

        let mut linked: Vec<PointId> = Vec::new();
        let mut strength_sum = 0.0;
        for candidate in self.meta.points_for_data_source(&data_source_id)? {
            if candidate.id == point.id {
                continue;
            }
            let Some(other) = self.ring.series(candidate.sequence_id) else {
                continue;
            };
            let aligned = align(&base, &other, self.config.max_ff_ms);
            if aligned.len() < self.config.min_overlap {
                continue;
            }
            let Some(correlation) =
                self.correlate_pair(point.id, candidate.id, &aligned)
            else {
                tracing::debug!(
                    a = %point.id,
                    b = %candidate.id,
                    "pair correlation undefined, skipping"
                );
                continue;
            };
            if correlation.strength() < self.config.significant_r {
                continue;
            }
            strength_sum += correlation.strength();
            self.cache.upsert(correlation.clone());
            self.meta.upsert_correlation(&correlation)?;
            linked.push(candidate.id);
        }

        if linked.is_empty() {
            return Ok(None);
        }
        let mut points = vec![point.id];
        points.extend(linked.iter().copied());
        Ok(Some(CorrelationsUpdatedEvent {
            batch_id: Uuid::new_v4(),
            average_correlation: strength_sum / linked.len() as f64,
            points,
            produced_at: Utc::now(),
        }))
    }

    fn correlate_pair(
        &self,
        a: PointId,
        b: PointId,
        aligned: &[AlignedPair],
    ) -> Option<PairCorrelation> {
        let (r, lag_steps) = if self.config.max_lag_steps > 0 {
            best_lag(aligned, self.config.max_lag_steps)?
        } else {
            (pearson(aligned.iter().map(|&(_, x, y)| (x, y)))?, 0)
        };

        let start_ms = aligned.first().map(|&(ts, _, _)| ts)?;
        let end_ms = aligned.last().map(|&(ts, _, _)| ts)?;
        let step_ms = median_step(aligned);
        let (lag_ms, leading) = match lag_steps {
            0 => (if self.config.max_lag_steps > 0 { Some(0) } else { None }, None),
            // Positive lag: the candidate trails the triggering point
            steps if steps > 0 => (Some(steps as i64 * step_ms), Some(a)),
            steps => (Some(steps as i64 * step_ms), Some(b)),
        };

        Some(PairCorrelation {
            pair: PairKey::new(a, b),
            r,
            sample_count: aligned.len() as u64,
            window_start: Utc.timestamp_millis_opt(start_ms).single()?,
            window_end: Utc.timestamp_millis_opt(end_ms).single()?,
            lag_ms,
            leading,
            computed_at: Utc::now(),
        })
    }
}

/// Align two series by timestamp. Grid timestamps come from the coarser
/// (shorter) series; the denser one is forward-filled onto the grid with a
/// staleness bound. Exact timestamp equality is the zero-staleness case.
pub fn align(a: &[(i64, f64)], b: &[(i64, f64)], max_ff_ms: i64) -> Vec<AlignedPair> {
    let a_is_grid = a.len() <= b.len();
    let (grid, fill) = if a_is_grid { (a, b) } else { (b, a) };

    let mut pairs = Vec::with_capacity(grid.len());
    let mut j = 0;
    for &(ts, grid_value) in grid {
        while j < fill.len() && fill[j].0 <= ts {
            j += 1;
        }
        if j == 0 {
            continue;
        }
        let (fill_ts, fill_value) = fill[j - 1];
        if ts - fill_ts > max_ff_ms {
            continue;
        }
        let (x, y) = if a_is_grid {
            (grid_value, fill_value)
        } else {
            (fill_value, grid_value)
        };
        pairs.push((ts, x, y));
    }
    pairs
}

/// Pearson r; None when either side is constant (undefined correlation)
pub fn pearson(pairs: impl Iterator<Item = (f64, f64)>) -> Option<f64> {
    let mut n = 0u64;
    let mut sum_x = 0.0;
    let mut sum_y = 0.0;
    let mut sum_xx = 0.0;
    let mut sum_yy = 0.0;
    let mut sum_xy = 0.0;
    for (x, y) in pairs {
        n += 1;
        sum_x += x;
        sum_y += y;
        sum_xx += x * x;
        sum_yy += y * y;
        sum_xy += x * y;
    }
    if n < 2 {
        return None;
    }
    let n = n as f64;
    let cov = sum_xy - sum_x * sum_y / n;
    let var_x = sum_xx - sum_x * sum_x / n;
    let var_y = sum_yy - sum_y * sum_y / n;
    if var_x <= 0.0 || var_y <= 0.0 {
        return None;
    }
    Some((cov / (var_x * var_y).sqrt()).clamp(-1.0, 1.0))
}

/// Search lags in {-max..=+max} steps and keep the one maximizing |r|.
/// Ties prefer the smaller absolute lag, so lag 0 wins on symmetric data.
fn best_lag(aligned: &[AlignedPair], max_steps: usize) -> Option<(f64, i32)> {
    let mut best: Option<(f64, i32)> = None;
    let max = max_steps as i32;
    for lag in -max..=max {
        let shifted = shifted_pairs(aligned, lag);
        let Some(r) = pearson(shifted) else {
            continue;
        };
        let better = match best {
            None => true,
            Some((best_r, best_lag)) => {
                r.abs() > best_r.abs() + f64::EPSILON
                    || (r.abs() >= best_r.abs() - f64::EPSILON && lag.abs() < best_lag.abs())
            }
        };
        if better {
            best = Some((r, lag));
        }
    }
    best
}

fn shifted_pairs(aligned: &[AlignedPair], lag: i32) -> impl Iterator<Item = (f64, f64)> + '_ {
    let n = aligned.len() as i32;
    (0..n).filter_map(move |i| {
        let j = i + lag;
        if j < 0 || j >= n {
            return None;
        }
        Some((aligned[i as usize].1, aligned[j as usize].2))
    })
}

fn median_step(aligned: &[AlignedPair]) -> i64 {
    let mut steps: Vec<i64> = aligned
        .windows(2)
        .map(|w| w[1].0 - w[0].0)
        .filter(|&s| s > 0)
        .collect();
    if steps.is_empty() {
        return 0;
    }
    steps.sort_unstable();
    steps[steps.len() / 2]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pearson_perfect_and_inverse() {
        let xs: Vec<(f64, f64)> = (0..100).map(|i| (i as f64, 2.0 * i as f64 + 5.0)).collect();
        assert!((pearson(xs.iter().copied()).unwrap() - 1.0).abs() < 1e-12);

        let inverse: Vec<(f64, f64)> = (0..100).map(|i| (i as f64, -3.0 * i as f64)).collect();
        assert!((pearson(inverse.iter().copied()).unwrap() + 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_pearson_undefined_for_constant_series() {
        let flat: Vec<(f64, f64)> = (0..50).map(|i| (i as f64, 7.0)).collect();
        assert!(pearson(flat.iter().copied()).is_none());
        assert!(pearson(std::iter::once((1.0, 2.0))).is_none());
    }

    #[test]
    fn test_align_exact_timestamps() {
        let a: Vec<(i64, f64)> = (0..10).map(|i| (i * 1000, i as f64)).collect();
        let b: Vec<(i64, f64)> = (0..10).map(|i| (i * 1000, 10.0 - i as f64)).collect();
        let aligned = align(&a, &b, 0);
        assert_eq!(aligned.len(), 10);
        assert_eq!(aligned[3], (3000, 3.0, 7.0));
    }

    #[test]
    fn test_align_forward_fills_to_coarser_grid() {
        // a at 2 s cadence (coarser), b at 1 s but offset by 500 ms
        let a: Vec<(i64, f64)> = (0..5).map(|i| (i * 2000, i as f64)).collect();
        let b: Vec<(i64, f64)> = (0..10).map(|i| (i * 1000 + 500, 100.0 + i as f64)).collect();
        let aligned = align(&a, &b, 1000);
        // Grid ts 0 has no b sample at or before it; the rest fill from
        // 500 ms staleness
        assert_eq!(aligned.len(), 4);
        assert_eq!(aligned[0], (2000, 1.0, 101.0));
    }

    #[test]
    fn test_align_respects_staleness_bound() {
        let a: Vec<(i64, f64)> = vec![(0, 1.0), (10_000, 2.0)];
        let b: Vec<(i64, f64)> = vec![(0, 5.0), (1000, 6.0)];
        // At grid ts 10 000 the freshest b sample is 9 s stale
        let aligned = align(&a, &b, 5000);
        assert_eq!(aligned.len(), 1);
        assert_eq!(aligned[0].0, 0);
    }

    #[test]
    fn test_align_orientation_preserved() {
        // Whichever series is coarser, x must come from `a`
        let a: Vec<(i64, f64)> = (0..20).map(|i| (i * 1000, i as f64)).collect();
        let b: Vec<(i64, f64)> = (0..5).map(|i| (i * 4000, 1000.0 + i as f64)).collect();
        let aligned = align(&a, &b, 500);
        assert!(!aligned.is_empty());
        for (_, x, y) in aligned {
            assert!(x < 100.0, "x should come from series a, got {}", x);
            assert!(y >= 1000.0, "y should come from series b, got {}", y);
        }
    }

    #[test]
    fn test_best_lag_finds_shift() {
        // y is x delayed by 2 steps
        let signal: Vec<f64> = (0..60).map(|i| ((i as f64) * 0.7).sin()).collect();
        let aligned: Vec<AlignedPair> = (0..58)
            .map(|i| (i as i64 * 1000, signal[i + 2], signal[i]))
            .collect();
        let (r, lag) = best_lag(&aligned, 3).unwrap();
        assert_eq!(lag, 2);
        assert!(r.abs() > 0.99);
    }

    #[test]
    fn test_best_lag_prefers_zero_on_identical() {
        let aligned: Vec<AlignedPair> = (0..50)
            .map(|i| {
                let v = ((i as f64) * 0.3).sin();
                (i as i64 * 1000, v, v)
            })
            .collect();
        let (r, lag) = best_lag(&aligned, 3).unwrap();
        assert_eq!(lag, 0);
        assert!((r - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_engine_links_cohesive_points() {
        let dir = tempfile::tempdir().unwrap();
        let meta = Arc::new(MetadataStore::open(dir.path()).unwrap());
        let cache = Arc::new(CorrelationCache::new());
        let ring = Arc::new(SampleRing::new(1024));
        let ds = tagmine_core::DataSourceId::new();

        let mut points = Vec::new();
        for name in ["sat", "rat", "unrelated"] {
            points.push(
                meta.register_point(tagmine_store::NewPoint {
                    name: name.to_string(),
                    address: format!("hvac/{}", name),
                    description: None,
                    unit: None,
                    value_kind: tagmine_core::ValueKind::Float64,
                    data_source_id: Some(ds),
                })
                .unwrap(),
            );
        }

        // sat and rat follow the same wave; unrelated is a different shape
        for i in 0..200i64 {
            let wave = ((i as f64) * 0.2).sin();
            ring.push(points[0].sequence_id, i * 1000, 20.0 + 2.0 * wave);
            ring.push(points[1].sequence_id, i * 1000, 22.0 + 1.5 * wave);
            ring.push(
                points[2].sequence_id,
                i * 1000,
                if i % 7 < 3 { 1.0 } else { 0.0 },
            );
        }

        let engine = CorrelationEngine::new(
            ring,
            meta.clone(),
            cache.clone(),
            CorrelationConfig {
                min_overlap: 30,
                significant_r: 0.9,
                max_ff_ms: 2000,
                max_lag_steps: 0,
            },
        );

        let behavior = tagmine_core::PointBehavior {
            point_id: points[0].id,
            sequence_id: points[0].sequence_id,
            sample_count: 200,
            window_start: Utc::now(),
            window_end: Utc::now(),
            mean: 20.0,
            stddev: 1.4,
            min: 18.0,
            max: 22.0,
            median_interval_ms: 1000.0,
            p95_interval_ms: 1000.0,
            zero_count: 0,
            good_quality_ratio: 1.0,
            change_frequency: 1.0,
        };
        let event = BehaviorEvent::from(&behavior);
        let update = engine.on_behavior(&event).unwrap().expect("expected links");

        // Only sat-rat is significant; the event lists trigger + partner
        assert_eq!(update.points.len(), 2);
        assert!(update.average_correlation > 0.9);
        let pair = PairKey::new(points[0].id, points[1].id);
        let cached = cache.get(&pair).unwrap();
        assert!(cached.r > 0.9);
        assert!(meta.get_correlation(&pair).unwrap().is_some());
    }
}
