//! Pipeline orchestration for driftkit
//!
//! One metric at a time: take the task lock, run the selected steps in
//! LOAD -> DETECT -> ALERT order, mirror the metric configuration, and
//! release the lock with the final status on every exit path.

mod orchestrator;

pub use orchestrator::{parse_steps, Pipeline, RunOptions, RunReport, Step};
