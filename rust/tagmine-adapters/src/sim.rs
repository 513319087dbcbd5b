//! Simulated historian
//!
//! In-memory adapter implementing every pull capability. Each point is a
//! sine wave with optional noise; points sharing a period and phase produce
//! strongly correlated streams, which is what the integration tests and the
//! demo subcommand lean on.

use crate::{AdapterHealth, Discover, ReadCurrent, ReadRange, Reading, SourceAdapter};
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rand::Rng;
use std::collections::{BTreeMap, HashMap};
use tagmine_core::{DataSourceId, DiscoveredPoint, Quality, TagmineResult, Value, ValueKind};

#[derive(Debug, Clone)]
pub struct SimPoint {
    pub address: String,
    pub name: String,
    pub description: Option<String>,
    pub unit: Option<String>,
    pub base: f64,
    pub amplitude: f64,
    pub period_s: f64,
    pub phase: f64,
    pub noise: f64,
}

impl SimPoint {
    /// A smooth analog signal: base + amplitude * sin(t / period)
    pub fn analog(address: &str, base: f64, amplitude: f64, period_s: f64) -> Self {
        Self {
            address: address.to_string(),
            name: address.to_string(),
            description: None,
            unit: None,
            base,
            amplitude,
            period_s,
            phase: 0.0,
            noise: 0.0,
        }
    }

    pub fn with_unit(mut self, unit: &str) -> Self {
        self.unit = Some(unit.to_string());
        self
    }

    pub fn with_description(mut self, description: &str) -> Self {
        self.description = Some(description.to_string());
        self
    }

    pub fn with_phase(mut self, phase: f64) -> Self {
        self.phase = phase;
        self
    }

    pub fn with_noise(mut self, noise: f64) -> Self {
        self.noise = noise;
        self
    }
}

pub struct SimulatedHistorian {
    id: String,
    data_source_id: DataSourceId,
    points: Vec<SimPoint>,
    epoch: DateTime<Utc>,
}

impl SimulatedHistorian {
    pub fn new(id: impl Into<String>, data_source_id: DataSourceId) -> Self {
        Self {
            id: id.into(),
            data_source_id,
            points: Vec::new(),
            epoch: Utc::now(),
        }
    }

    pub fn with_point(mut self, point: SimPoint) -> Self {
        self.points.push(point);
        self
    }

    pub fn points(&self) -> &[SimPoint] {
        &self.points
    }

    fn value(&self, point: &SimPoint, at: DateTime<Utc>) -> f64 {
        let elapsed = (at - self.epoch).num_milliseconds() as f64 / 1000.0;
        let wave = point.base
            + point.amplitude
                * (2.0 * std::f64::consts::PI * elapsed / point.period_s + point.phase).sin();
        if point.noise > 0.0 {
            wave + rand::thread_rng().gen_range(-point.noise..=point.noise)
        } else {
            wave
        }
    }

    fn reading(&self, point: &SimPoint, at: DateTime<Utc>) -> Reading {
        Reading {
            timestamp: at,
            value: Value::Float(self.value(point, at)),
            quality: Quality::Good,
        }
    }
}

impl SourceAdapter for SimulatedHistorian {
    fn id(&self) -> &str {
        &self.id
    }

    fn data_source_id(&self) -> DataSourceId {
        self.data_source_id
    }

    fn health(&self) -> AdapterHealth {
        AdapterHealth::Healthy
    }

    fn discovery(&self) -> Option<&dyn Discover> {
        Some(self)
    }

    fn current_reader(&self) -> Option<&dyn ReadCurrent> {
        Some(self)
    }

    fn range_reader(&self) -> Option<&dyn ReadRange> {
        Some(self)
    }
}

#[async_trait]
impl Discover for SimulatedHistorian {
    async fn discover_points(
        &self,
        filter: &str,
        max: usize,
    ) -> TagmineResult<Vec<DiscoveredPoint>> {
        Ok(self
            .points
            .iter()
            .filter(|p| {
                crate::wildcard_match(filter, &p.address) || crate::wildcard_match(filter, &p.name)
            })
            .take(max)
            .map(|p| DiscoveredPoint {
                address: p.address.clone(),
                name: p.name.clone(),
                description: p.description.clone(),
                unit: p.unit.clone(),
                value_kind: ValueKind::Float64,
                attributes: BTreeMap::new(),
            })
            .collect())
    }
}

#[async_trait]
impl ReadCurrent for SimulatedHistorian {
    async fn read_current(
        &self,
        addresses: &[String],
    ) -> TagmineResult<HashMap<String, Reading>> {
        let now = Utc::now();
        // Unknown addresses are absent from the result: partial success
        Ok(self
            .points
            .iter()
            .filter(|p| addresses.contains(&p.address))
            .map(|p| (p.address.clone(), self.reading(p, now)))
            .collect())
    }
}

#[async_trait]
impl ReadRange for SimulatedHistorian {
    async fn read_range(
        &self,
        address: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> TagmineResult<Vec<Reading>> {
        let Some(point) = self.points.iter().find(|p| p.address == address) else {
            return Ok(Vec::new());
        };
        let mut readings = Vec::new();
        let mut at = from;
        while at <= to {
            readings.push(self.reading(point, at));
            at += ChronoDuration::seconds(1);
        }
        Ok(readings)
    }
}
