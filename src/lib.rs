//! Incremental benchmark bookkeeping: fingerprint method definitions, find
//! the stale ones, recompute only those, and merge the results into a store
//! that remembers which session produced each of them.

pub mod about;
pub mod bench;
pub mod config;
pub mod dataset;
pub mod definition;
pub mod differ;
pub mod executor;
pub mod fingerprint;
pub mod merge;
pub mod metrics;
pub mod registry;
pub mod report;
pub mod store;

pub use benchkeeper_protocol as protocol;
pub use benchkeeper_protocol::{
    Component, DiffReport, DiffRow, DiffStatus, EngineError, ErrorCode, Fingerprint, Label,
    MethodOutcome, MetricDiffRow, SessionIndex,
};
