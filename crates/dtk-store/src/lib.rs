//! Database adapter and internal-table store for driftkit
//!
//! All persisted engine state lives in four tables inside the user's
//! analytical database. This crate defines the narrow adapter interface
//! the engine depends on, a SQLite reference implementation, and the
//! typed [`InternalStore`] accessors the pipeline components use.

pub mod adapter;
pub mod sqlite;
pub mod store;
pub mod tables;

pub use adapter::{column, DatabaseAdapter, SqlRow, SqlValue};
pub use sqlite::SqliteAdapter;
pub use store::{InternalStore, WindowPoint};
pub use tables::StoreTables;
