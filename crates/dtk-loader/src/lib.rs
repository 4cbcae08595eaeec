//! Metric loader for driftkit
//!
//! Executes the user's query over time slices, normalizes timestamps to
//! the interval grid, gap-fills missing grid instants, captures
//! seasonality columns, and upserts datapoints. Committed slices survive
//! a mid-run failure; the next run resumes from the watermark.

mod loader;

pub use loader::{LoadOutcome, LoadWindow, MetricLoader};
