//! Replay adapter
//!
//! Reads timestamped rows from CSV files, rebases them onto the current
//! wall-clock and replays them as a push stream. With interpolation enabled
//! the emitted values are linearly interpolated between source rows, so
//! downstream observers see a steady tick independent of the source
//! sampling cadence. Emitted timestamps are the wall-clock of emission.
//!
//! Row format: `timestamp,address,value` with RFC 3339 timestamps (a
//! `YYYY-MM-DD HH:MM:SS` fallback is read as UTC). A header line starting
//! with `timestamp` is skipped.

use crate::push::{PushSink, PushUpdate};
use crate::{AdapterHealth, Discover, Reading, SourceAdapter, Subscribe};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::time::Duration;
use tagmine_core::{
    DataSourceId, DiscoveredPoint, Quality, TagmineError, TagmineResult, Value, ValueKind,
};

#[derive(Debug, Clone)]
pub struct ReplayOptions {
    /// Emission period of the rebased stream
    pub tick: Duration,
    /// Linear interpolation between source rows; off means step-hold
    pub interpolate: bool,
}

impl Default for ReplayOptions {
    fn default() -> Self {
        Self {
            tick: Duration::from_secs(1),
            interpolate: true,
        }
    }
}

type Series = Vec<(DateTime<Utc>, f64)>;

pub struct ReplayAdapter {
    id: String,
    data_source_id: DataSourceId,
    series: HashMap<String, Series>,
    options: ReplayOptions,
}

impl ReplayAdapter {
    pub fn from_files<P: AsRef<Path>>(
        id: impl Into<String>,
        data_source_id: DataSourceId,
        paths: &[P],
        options: ReplayOptions,
    ) -> TagmineResult<Self> {
        let mut rows = Vec::new();
        for path in paths {
            let content = std::fs::read_to_string(path).map_err(|e| {
                TagmineError::Configuration(format!(
                    "cannot read replay file {}: {}",
                    path.as_ref().display(),
                    e
                ))
            })?;
            rows.extend(parse_rows(&content)?);
        }
        Ok(Self::from_rows(id, data_source_id, rows, options))
    }

    pub fn from_rows(
        id: impl Into<String>,
        data_source_id: DataSourceId,
        rows: Vec<(String, DateTime<Utc>, f64)>,
        options: ReplayOptions,
    ) -> Self {
        let mut series: HashMap<String, Series> = HashMap::new();
        for (address, timestamp, value) in rows {
            series.entry(address).or_default().push((timestamp, value));
        }
        for points in series.values_mut() {
            points.sort_by_key(|(ts, _)| *ts);
        }
        Self {
            id: id.into(),
            data_source_id,
            series,
            options,
        }
    }

    pub fn addresses(&self) -> Vec<String> {
        self.series.keys().cloned().collect()
    }

    fn span(&self) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
        let start = self
            .series
            .values()
            .filter_map(|s| s.first().map(|(ts, _)| *ts))
            .min()?;
        let end = self
            .series
            .values()
            .filter_map(|s| s.last().map(|(ts, _)| *ts))
            .max()?;
        Some((start, end))
    }
}

fn parse_rows(content: &str) -> TagmineResult<Vec<(String, DateTime<Utc>, f64)>> {
    let mut rows = Vec::new();
    for (lineno, line) in content.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || (lineno == 0 && line.to_lowercase().starts_with("timestamp")) {
            continue;
        }
        let mut fields = line.splitn(3, ',');
        let (Some(ts), Some(address), Some(value)) =
            (fields.next(), fields.next(), fields.next())
        else {
            return Err(TagmineError::ContractViolation(format!(
                "replay row {} has fewer than 3 fields",
                lineno + 1
            )));
        };
        let timestamp = parse_timestamp(ts.trim()).ok_or_else(|| {
            TagmineError::ContractViolation(format!(
                "replay row {} has a bad timestamp: {}",
                lineno + 1,
                ts
            ))
        })?;
        let value: f64 = value.trim().parse().map_err(|_| {
            TagmineError::ContractViolation(format!(
                "replay row {} has a non-numeric value: {}",
                lineno + 1,
                value
            ))
        })?;
        rows.push((address.trim().to_string(), timestamp, value));
    }
    Ok(rows)
}

fn parse_timestamp(text: &str) -> Option<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(text) {
        return Some(ts.with_timezone(&Utc));
    }
    // Zone-less source files are declared UTC by the replay contract
    NaiveDateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S")
        .ok()
        .map(|naive| naive.and_utc())
}

/// Value of a series at a source-time cursor. Outside the series span the
/// point is silent.
fn value_at(series: &Series, cursor: DateTime<Utc>, interpolate: bool) -> Option<f64> {
    let first = series.first()?;
    let last = series.last()?;
    if cursor < first.0 || cursor > last.0 {
        return None;
    }
    let next_idx = series.partition_point(|(ts, _)| *ts <= cursor);
    let (t0, v0) = series[next_idx - 1];
    if !interpolate || next_idx == series.len() {
        return Some(v0);
    }
    let (t1, v1) = series[next_idx];
    let span_ms = (t1 - t0).num_milliseconds();
    if span_ms <= 0 {
        return Some(v0);
    }
    let frac = (cursor - t0).num_milliseconds() as f64 / span_ms as f64;
    Some(v0 + (v1 - v0) * frac)
}

impl SourceAdapter for ReplayAdapter {
    fn id(&self) -> &str {
        &self.id
    }

    fn data_source_id(&self) -> DataSourceId {
        self.data_source_id
    }

    fn health(&self) -> AdapterHealth {
        if self.series.is_empty() {
            AdapterHealth::Unhealthy("no replay rows loaded".to_string())
        } else {
            AdapterHealth::Healthy
        }
    }

    fn discovery(&self) -> Option<&dyn Discover> {
        Some(self)
    }

    fn push_source(&self) -> Option<&dyn Subscribe> {
        Some(self)
    }
}

#[async_trait]
impl Discover for ReplayAdapter {
    async fn discover_points(
        &self,
        filter: &str,
        max: usize,
    ) -> TagmineResult<Vec<DiscoveredPoint>> {
        let mut discovered: Vec<DiscoveredPoint> = self
            .series
            .keys()
            .filter(|address| crate::wildcard_match(filter, address))
            .take(max)
            .map(|address| DiscoveredPoint {
                address: address.clone(),
                name: address.clone(),
                description: None,
                unit: None,
                value_kind: ValueKind::Float64,
                attributes: BTreeMap::new(),
            })
            .collect();
        discovered.sort_by(|a, b| a.address.cmp(&b.address));
        Ok(discovered)
    }
}

impl Subscribe for ReplayAdapter {
    fn subscribe(&self, addresses: &[String], sink: PushSink) -> TagmineResult<()> {
        let Some((source_start, source_end)) = self.span() else {
            return Err(TagmineError::Configuration(
                "replay adapter has no rows to play".to_string(),
            ));
        };
        let mut playing: HashMap<String, Series> = if addresses.is_empty() {
            self.series.clone()
        } else {
            self.series
                .iter()
                .filter(|(address, _)| addresses.contains(*address))
                .map(|(address, series)| (address.clone(), series.clone()))
                .collect()
        };
        if playing.is_empty() {
            playing = self.series.clone();
        }

        let id = self.id.clone();
        let tick = self.options.tick;
        let interpolate = self.options.interpolate;
        tokio::spawn(async move {
            let wall_start = Utc::now();
            tracing::info!(
                adapter = %id,
                points = playing.len(),
                span_s = (source_end - source_start).num_seconds(),
                "replay started"
            );
            loop {
                tokio::time::sleep(tick).await;
                let now = Utc::now();
                let cursor = source_start + (now - wall_start);
                if cursor > source_end {
                    tracing::info!(adapter = %id, "replay finished");
                    return;
                }
                for (address, series) in &playing {
                    if let Some(value) = value_at(series, cursor, interpolate) {
                        sink.deliver(PushUpdate {
                            address: address.clone(),
                            reading: Reading {
                                // Rebased: the emission wall-clock, not the
                                // source timestamp
                                timestamp: now,
                                value: Value::Float(value),
                                quality: Quality::Good,
                            },
                        });
                    }
                }
            }
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts(seconds: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + seconds, 0).unwrap()
    }

    #[test]
    fn test_parse_rows_with_header_and_fallback_format() {
        let content = "timestamp,address,value\n\
                       2024-01-01T00:00:00Z,plant/temp,20.5\n\
                       2024-01-01 00:00:10,plant/temp,21.0\n";
        let rows = parse_rows(content).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].0, "plant/temp");
        assert!((rows[1].2 - 21.0).abs() < f64::EPSILON);
        assert_eq!((rows[1].1 - rows[0].1).num_seconds(), 10);
    }

    #[test]
    fn test_parse_rejects_malformed_rows() {
        assert!(parse_rows("2024-01-01T00:00:00Z,plant/temp").is_err());
        assert!(parse_rows("not-a-time,plant/temp,1.0").is_err());
        assert!(parse_rows("2024-01-01T00:00:00Z,plant/temp,warm").is_err());
    }

    #[test]
    fn test_linear_interpolation_between_rows() {
        let series: Series = vec![(ts(0), 10.0), (ts(10), 20.0)];
        assert_eq!(value_at(&series, ts(5), true), Some(15.0));
        assert_eq!(value_at(&series, ts(0), true), Some(10.0));
        assert_eq!(value_at(&series, ts(10), true), Some(20.0));
        // Outside the span the point is silent
        assert_eq!(value_at(&series, ts(-1), true), None);
        assert_eq!(value_at(&series, ts(11), true), None);
    }

    #[test]
    fn test_step_hold_without_interpolation() {
        let series: Series = vec![(ts(0), 10.0), (ts(10), 20.0)];
        assert_eq!(value_at(&series, ts(9), false), Some(10.0));
        assert_eq!(value_at(&series, ts(10), false), Some(20.0));
    }

    #[tokio::test]
    async fn test_replay_emits_rebased_wall_clock() {
        let rows = vec![
            ("plant/temp".to_string(), ts(0), 10.0),
            ("plant/temp".to_string(), ts(100), 110.0),
        ];
        let adapter = ReplayAdapter::from_rows(
            "replay",
            DataSourceId::new(),
            rows,
            ReplayOptions {
                tick: Duration::from_millis(10),
                interpolate: true,
            },
        );

        let queue = std::sync::Arc::new(crate::queue::BoundedQueue::new(
            1024,
            tagmine_config::DropPolicy::Oldest,
        ));
        let sink = PushSink { queue };
        let before = Utc::now();
        adapter.subscribe(&[], sink.clone()).unwrap();
        tokio::time::sleep(Duration::from_millis(80)).await;

        let updates = sink.queue.drain(usize::MAX);
        assert!(!updates.is_empty());
        for update in &updates {
            // Timestamps are emission wall-clock, not the 2023 source times
            assert!(update.reading.timestamp >= before);
            // Values interpolate near the start of the source span
            let v = update.reading.value.as_f64().unwrap();
            assert!((10.0..=12.0).contains(&v), "unexpected value {}", v);
        }
    }
}
