//! Raw sample batches, the unit carried on the ingestion bus

use crate::error::{TagmineError, TagmineResult};
use crate::ids::DataSourceId;
use crate::point::{Quality, Value};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One raw observation as emitted by an adapter, addressed by source address
/// because the producer side does not resolve point identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawPoint {
    pub address: String,
    pub name: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub value: Value,
    pub quality: Quality,
    pub unit: Option<String>,
}

/// An ordered, non-empty list of raw observations from one data source.
/// Batches are opaque to the bus; the ingestion consumer resolves identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawSampleBatch {
    pub batch_id: Uuid,
    pub data_source_id: DataSourceId,
    pub produced_at: DateTime<Utc>,
    pub points: Vec<RawPoint>,
}

impl RawSampleBatch {
    pub fn new(data_source_id: DataSourceId, points: Vec<RawPoint>) -> Self {
        Self {
            batch_id: Uuid::new_v4(),
            data_source_id,
            produced_at: Utc::now(),
            points,
        }
    }

    /// Reject batches that violate the ingress contract
    pub fn validate(&self) -> TagmineResult<()> {
        if self.points.is_empty() {
            return Err(TagmineError::ContractViolation(
                "raw sample batch must not be empty".to_string(),
            ));
        }
        for point in &self.points {
            if point.address.is_empty() {
                return Err(TagmineError::ContractViolation(format!(
                    "batch {} carries a sample without an address",
                    self.batch_id
                )));
            }
        }
        Ok(())
    }
}
