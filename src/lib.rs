//! tagmine service runtime
//!
//! Wires the platform together: the ingestion consumer, the analysis-stage
//! workers over the bus, the orchestrator owning component lifecycles, and
//! the scheduled jobs (fallback cluster scans, cache purges, confidence
//! snapshots).

pub mod ingest;
pub mod jobs;
pub mod orchestrator;
pub mod workers;

pub use ingest::{IngestStats, IngestWorker};
pub use orchestrator::{ComponentHealth, Orchestrator};
