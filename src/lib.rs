//! Event insights pipeline: consumes domain events from message queues,
//! persists them as raw facts in SQLite, and continuously compacts them
//! through tiered rollup and retention jobs. A parallel path tracks
//! per-student engagement time via TTL'd in-process counters folded into
//! daily and weekly rollups.

pub mod agent;
pub mod config;
pub mod consumer;
pub mod counter;
pub mod event;
pub mod health;
pub mod ingest;
pub mod migrate;
pub mod plan;
pub mod queue;
pub mod rollup;
pub mod sched;
pub mod store;
