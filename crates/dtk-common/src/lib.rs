//! Shared types and utilities for the driftkit monitoring engine
//!
//! This crate provides the error type, interval arithmetic, persisted
//! record types, and declarative configuration used across all driftkit
//! components.

pub mod config;
pub mod error;
pub mod interval;
pub mod types;

pub use config::{
    interpolate_env, AlertDirection, AlertPolicy, ChannelConfig, DetectorConfig, MetricConfig,
    ProfileConfig, ProfilesFile, QueryColumns, SeasonalityColumn, SeasonalityExtract,
    TableOverrides,
};
pub use error::{Error, Result};
pub use interval::{Interval, IntervalRange};
pub use types::*;
