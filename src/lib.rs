#![doc = r#"
tinyflux: Embedded Time-Series Datastore in Rust

This crate provides a small, single-process time-series datastore for Rust applications. It is designed for edge devices, IoT ingestion, and small analytics workflows whose datasets fit comfortably in a single file, with support for:
- Append-only writes in constant time regardless of dataset size
- Predicate queries over time, measurement, tags, and fields
- A lazy in-memory index that accelerates reads and rebuilds after out-of-order writes
- Pluggable storage backends (CSV file and in-memory)
- Measurement-scoped views

See the README for usage examples and more details.
"#]

// Declare modules
pub mod database;
pub mod error;
pub mod index;
pub mod measurement;
pub mod point;
pub mod query;
pub mod storage;
pub mod telemetry;

/// Main entry point for interacting with the datastore.
pub use crate::database::TinyFlux;
/// Configuration options for the engine.
pub use crate::database::Config;
/// Per-attribute update specification for bulk updates.
pub use crate::database::Update;
/// One selected attribute value returned by `select`.
pub use crate::database::AttrValue;
/// Error type for datastore operations.
pub use crate::error::TinyFluxError;
/// The in-memory index over stored rows.
pub use crate::index::Index;
/// Measurement-scoped view over the engine.
pub use crate::measurement::Measurement;
/// A single time-series observation.
pub use crate::point::Point;
/// A typed field value.
pub use crate::point::FieldValue;
/// Tag set attached to a point.
pub use crate::point::TagSet;
/// Field set attached to a point.
pub use crate::point::FieldSet;
/// Measurement used when a point does not specify one.
pub use crate::point::DEFAULT_MEASUREMENT;
/// A composable predicate over points.
pub use crate::query::Query;
/// Query builders over the four attribute dimensions.
pub use crate::query::{FieldQuery, MeasurementQuery, TagQuery, TimeQuery};
/// Storage capability and the provided backends.
pub use crate::storage::{CsvStorage, MemoryStorage, RowIter, Storage};
/// Structured event hook for observability.
pub use crate::telemetry::{DbEvent, EventListener, InvalidationReason, NoopEventListener};
